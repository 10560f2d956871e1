//! HKDF-SHA512 key derivation.

use hap_core::error::CryptoError;

use hkdf::Hkdf;
use sha2::Sha512;

/// Derive a 32-byte key using HKDF-SHA512.
pub fn derive_key_32(ikm: &[u8], salt: &[u8], info: &[u8]) -> Result<[u8; 32], CryptoError> {
    let hk = Hkdf::<Sha512>::new(Some(salt), ikm);
    let mut okm = [0u8; 32];
    hk.expand(info, &mut okm)
        .map_err(|_| CryptoError::KeyDerivation("HKDF expand failed".to_string()))?;
    Ok(okm)
}

/// Salt and info labels used by the pairing protocol.
pub mod constants {
    pub const PAIR_SETUP_ENCRYPT_SALT: &[u8] = b"Pair-Setup-Encrypt-Salt";
    pub const PAIR_SETUP_ENCRYPT_INFO: &[u8] = b"Pair-Setup-Encrypt-Info";

    pub const PAIR_SETUP_CONTROLLER_SIGN_SALT: &[u8] = b"Pair-Setup-Controller-Sign-Salt";
    pub const PAIR_SETUP_CONTROLLER_SIGN_INFO: &[u8] = b"Pair-Setup-Controller-Sign-Info";
    pub const PAIR_SETUP_ACCESSORY_SIGN_SALT: &[u8] = b"Pair-Setup-Accessory-Sign-Salt";
    pub const PAIR_SETUP_ACCESSORY_SIGN_INFO: &[u8] = b"Pair-Setup-Accessory-Sign-Info";

    pub const PAIR_VERIFY_ENCRYPT_SALT: &[u8] = b"Pair-Verify-Encrypt-Salt";
    pub const PAIR_VERIFY_ENCRYPT_INFO: &[u8] = b"Pair-Verify-Encrypt-Info";

    pub const CONTROL_SALT: &[u8] = b"Control-Salt";
    /// Accessory to controller.
    pub const CONTROL_READ_KEY_INFO: &[u8] = b"Control-Read-Encryption-Key";
    /// Controller to accessory.
    pub const CONTROL_WRITE_KEY_INFO: &[u8] = b"Control-Write-Encryption-Key";
}

/// Key sealing the M5/M6 sub-TLVs.
pub fn derive_pair_setup_key(srp_key: &[u8]) -> Result<[u8; 32], CryptoError> {
    derive_key_32(
        srp_key,
        constants::PAIR_SETUP_ENCRYPT_SALT,
        constants::PAIR_SETUP_ENCRYPT_INFO,
    )
}

/// `iOSDeviceX`, prefixed to the controller's signed material in M5.
pub fn derive_controller_sign_key(srp_key: &[u8]) -> Result<[u8; 32], CryptoError> {
    derive_key_32(
        srp_key,
        constants::PAIR_SETUP_CONTROLLER_SIGN_SALT,
        constants::PAIR_SETUP_CONTROLLER_SIGN_INFO,
    )
}

/// `AccessoryX`, prefixed to the accessory's signed material in M6.
pub fn derive_accessory_sign_key(srp_key: &[u8]) -> Result<[u8; 32], CryptoError> {
    derive_key_32(
        srp_key,
        constants::PAIR_SETUP_ACCESSORY_SIGN_SALT,
        constants::PAIR_SETUP_ACCESSORY_SIGN_INFO,
    )
}

/// Key sealing the pair-verify M2/M3 sub-TLVs.
pub fn derive_pair_verify_key(shared_secret: &[u8]) -> Result<[u8; 32], CryptoError> {
    derive_key_32(
        shared_secret,
        constants::PAIR_VERIFY_ENCRYPT_SALT,
        constants::PAIR_VERIFY_ENCRYPT_INFO,
    )
}
