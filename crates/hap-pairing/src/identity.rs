//! The accessory's long-term identity.
//!
//! Pair-setup hands the device identifier and LTPK to the controller in M6,
//! and pair-verify signs with the same key on every session, so the identity
//! must survive restarts.

use std::path::Path;

use hap_core::error::{Error, ParseError, Result};
use hap_crypto::ed25519::LongTermKeyPair;
use rand::{rngs::OsRng, RngCore};

#[derive(Debug, Clone)]
pub struct AccessoryIdentity {
    /// `XX:XX:XX:XX:XX:XX`, also advertised as the `id` TXT key.
    device_id: String,
    keypair: LongTermKeyPair,
}

impl AccessoryIdentity {
    /// Fresh key pair and a random device identifier.
    pub fn generate() -> Self {
        let mut octets = [0u8; 6];
        OsRng.fill_bytes(&mut octets);
        let device_id = octets
            .iter()
            .map(|b| format!("{:02X}", b))
            .collect::<Vec<_>>()
            .join(":");
        Self::new(device_id, LongTermKeyPair::generate())
    }

    pub fn new(device_id: impl Into<String>, keypair: LongTermKeyPair) -> Self {
        Self {
            device_id: device_id.into(),
            keypair,
        }
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn public_key(&self) -> [u8; 32] {
        self.keypair.public_key()
    }

    pub fn sign(&self, message: &[u8]) -> [u8; 64] {
        self.keypair.sign(message)
    }

    /// Line 1: device identifier. Line 2: hex Ed25519 seed.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| Error::Storage(format!("{}: {}", path.display(), e)))?;
        let mut lines = contents.lines();

        let device_id = lines
            .next()
            .filter(|l| !l.is_empty())
            .ok_or(ParseError::MissingField("device id"))?;
        let seed_hex = lines.next().ok_or(ParseError::MissingField("seed"))?;
        let seed: [u8; 32] = hex::decode(seed_hex.trim())
            .ok()
            .and_then(|bytes| bytes.try_into().ok())
            .ok_or_else(|| ParseError::InvalidValue("seed must be 32 hex bytes".to_string()))?;

        Ok(Self::new(device_id, LongTermKeyPair::from_seed(&seed)))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let contents = format!("{}\n{}\n", self.device_id, hex::encode(self.keypair.seed()));
        std::fs::write(path, contents)
            .map_err(|e| Error::Storage(format!("{}: {}", path.display(), e)))
    }

    /// Load from `path`, or generate and save on first start.
    ///
    /// `device_id` overrides the identifier of a newly generated identity.
    pub fn load_or_generate(path: &Path, device_id: Option<&str>) -> Result<Self> {
        if path.exists() {
            return Self::load(path);
        }

        let mut identity = Self::generate();
        if let Some(id) = device_id {
            identity.device_id = id.to_string();
        }
        identity.save(path)?;
        tracing::info!(device_id = %identity.device_id, "Generated accessory identity");
        Ok(identity)
    }
}
