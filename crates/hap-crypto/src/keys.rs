//! Per-direction session keys.

use crate::hkdf::{self, constants};
use hap_core::error::CryptoError;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// 32-byte ChaCha20-Poly1305 key.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct EncryptionKey([u8; 32]);

impl EncryptionKey {
    pub fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl std::fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("EncryptionKey(..)")
    }
}

/// Keys a pair-verify handshake hands to the secure session.
///
/// Named from the holder's point of view: `output_key` seals what this side
/// sends, `input_key` opens what it receives.
#[derive(Debug, ZeroizeOnDrop)]
pub struct SessionKeys {
    pub output_key: EncryptionKey,
    pub input_key: EncryptionKey,
}

impl SessionKeys {
    /// Accessory view: sends under `Control-Read-Encryption-Key`, receives under
    /// `Control-Write-Encryption-Key`.
    pub fn derive_accessory_keys(shared_secret: &[u8]) -> Result<Self, CryptoError> {
        let (read, write) = derive_control_keys(shared_secret)?;
        Ok(Self {
            output_key: read,
            input_key: write,
        })
    }

    /// Controller view, the mirror image of [`derive_accessory_keys`](Self::derive_accessory_keys).
    pub fn derive_controller_keys(shared_secret: &[u8]) -> Result<Self, CryptoError> {
        let (read, write) = derive_control_keys(shared_secret)?;
        Ok(Self {
            output_key: write,
            input_key: read,
        })
    }
}

/// `(read, write)` keys under `Control-Salt`.
fn derive_control_keys(shared_secret: &[u8]) -> Result<(EncryptionKey, EncryptionKey), CryptoError> {
    let read = hkdf::derive_key_32(
        shared_secret,
        constants::CONTROL_SALT,
        constants::CONTROL_READ_KEY_INFO,
    )?;
    let write = hkdf::derive_key_32(
        shared_secret,
        constants::CONTROL_SALT,
        constants::CONTROL_WRITE_KEY_INFO,
    )?;
    Ok((EncryptionKey(read), EncryptionKey(write)))
}
