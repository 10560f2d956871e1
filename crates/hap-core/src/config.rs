//! Accessory configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, ParseError, Result};

/// Default firmware-update content type.
pub const DEFAULT_OTA_CONTENT_TYPE: &str = "application/ota-stream";

/// Runtime configuration for one accessory.
///
/// Every field has a default, so a config file only needs to name the values
/// it changes. Unknown keys are rejected so typos surface at startup.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AccessoryConfig {
    /// Advertised accessory name.
    pub name: String,
    /// Model string (`md` TXT key).
    pub model: String,
    /// Device identifier in `XX:XX:XX:XX:XX:XX` form. Generated when absent.
    pub device_id: Option<String>,
    /// Setup code in `NNN-NN-NNN` form.
    pub setup_code: String,
    /// Accessory category identifier (`ci` TXT key).
    pub category: u16,
    /// Configuration number (`c#` TXT key).
    pub config_number: u32,
    /// TCP listen port. 0 picks an ephemeral port.
    pub port: u16,
    /// Bounded wait for any read that expects data, in seconds.
    pub read_timeout_secs: u64,
    /// Maximum number of stored controller pairings.
    pub max_pairings: usize,
    /// Request header buffer size in bytes.
    pub max_header_size: usize,
    /// Content type whose body is streamed to firmware storage.
    pub ota_content_type: String,
    /// Staging buffer size for firmware bodies.
    pub ota_staging_size: usize,
    /// File holding persisted controller pairings.
    pub pairing_file: PathBuf,
    /// File holding the accessory's long-term identity.
    pub identity_file: PathBuf,
    /// Destination for streamed firmware images.
    pub firmware_file: PathBuf,
}

impl Default for AccessoryConfig {
    fn default() -> Self {
        Self {
            name: "HAP Accessory".to_string(),
            model: "hap-accessory".to_string(),
            device_id: None,
            setup_code: "031-45-154".to_string(),
            category: 1,
            config_number: 1,
            port: 0,
            read_timeout_secs: 20,
            max_pairings: 16,
            max_header_size: 2048,
            ota_content_type: DEFAULT_OTA_CONTENT_TYPE.to_string(),
            ota_staging_size: 4096,
            pairing_file: PathBuf::from("pairings.db"),
            identity_file: PathBuf::from("accessory.id"),
            firmware_file: PathBuf::from("firmware.bin"),
        }
    }
}

impl AccessoryConfig {
    /// Create config with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load config from a JSON file and validate it.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&contents)
            .map_err(|e| ParseError::InvalidFormat(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        tracing::debug!(path = %path.display(), "Loaded accessory config");
        Ok(config)
    }

    /// Reject values the accessory cannot run with.
    pub fn validate(&self) -> Result<()> {
        if !is_valid_setup_code(&self.setup_code) {
            return Err(Error::Param(format!(
                "setup code must look like NNN-NN-NNN, got {:?}",
                self.setup_code
            )));
        }
        if self.read_timeout_secs == 0 {
            return Err(Error::Param("read timeout must be non-zero".to_string()));
        }
        if self.max_pairings == 0 {
            return Err(Error::Param("max pairings must be non-zero".to_string()));
        }
        if self.max_header_size < 64 {
            return Err(Error::Param(format!(
                "header buffer of {} bytes is too small",
                self.max_header_size
            )));
        }
        if self.ota_staging_size == 0 {
            return Err(Error::Param("OTA staging size must be non-zero".to_string()));
        }
        if let Some(id) = &self.device_id {
            if !is_valid_device_id(id) {
                return Err(Error::Param(format!("malformed device id {:?}", id)));
            }
        }
        Ok(())
    }

    /// Bounded read wait as a [`Duration`].
    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    pub fn with_setup_code(mut self, code: impl Into<String>) -> Self {
        self.setup_code = code.into();
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout_secs = timeout.as_secs().max(1);
        self
    }

    pub fn with_max_pairings(mut self, max: usize) -> Self {
        self.max_pairings = max;
        self
    }

    pub fn with_ota_staging_size(mut self, size: usize) -> Self {
        self.ota_staging_size = size;
        self
    }

    pub fn with_device_id(mut self, id: impl Into<String>) -> Self {
        self.device_id = Some(id.into());
        self
    }
}

/// `NNN-NN-NNN`, digits only.
fn is_valid_setup_code(code: &str) -> bool {
    let bytes = code.as_bytes();
    bytes.len() == 10
        && bytes.iter().enumerate().all(|(i, b)| match i {
            3 | 6 => *b == b'-',
            _ => b.is_ascii_digit(),
        })
}

/// Six colon-separated hex octets.
fn is_valid_device_id(id: &str) -> bool {
    let parts: Vec<&str> = id.split(':').collect();
    parts.len() == 6
        && parts
            .iter()
            .all(|p| p.len() == 2 && p.chars().all(|c| c.is_ascii_hexdigit()))
}
