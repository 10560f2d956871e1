//! Ed25519 long-term keys.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use hap_core::error::CryptoError;
use rand::rngs::OsRng;
use zeroize::ZeroizeOnDrop;

/// Signature size.
pub const SIGNATURE_LEN: usize = 64;

/// Long-term Ed25519 key pair (LTSK/LTPK).
///
/// Only the 32-byte seed is kept; it is wiped on drop.
#[derive(Clone, ZeroizeOnDrop)]
pub struct LongTermKeyPair {
    #[zeroize(skip)]
    public: [u8; 32],
    seed: [u8; 32],
}

impl LongTermKeyPair {
    pub fn generate() -> Self {
        Self::from_seed(&SigningKey::generate(&mut OsRng).to_bytes())
    }

    pub fn from_seed(seed: &[u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(seed);
        Self {
            public: signing_key.verifying_key().to_bytes(),
            seed: *seed,
        }
    }

    /// LTPK.
    pub fn public_key(&self) -> [u8; 32] {
        self.public
    }

    pub fn sign(&self, message: &[u8]) -> [u8; SIGNATURE_LEN] {
        SigningKey::from_bytes(&self.seed).sign(message).to_bytes()
    }

    /// Seed bytes for persistence.
    pub fn seed(&self) -> [u8; 32] {
        self.seed
    }
}

impl std::fmt::Debug for LongTermKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LongTermKeyPair")
            .field("public", &self.public)
            .finish_non_exhaustive()
    }
}

/// Verify `signature` over `message` under `public_key`.
///
/// Lengths are checked here since both values come straight from TLV items.
pub fn verify(public_key: &[u8], message: &[u8], signature: &[u8]) -> Result<(), CryptoError> {
    let public: [u8; 32] = public_key
        .try_into()
        .map_err(|_| CryptoError::InvalidKeyLength {
            expected: 32,
            actual: public_key.len(),
        })?;
    let signature: [u8; SIGNATURE_LEN] =
        signature
            .try_into()
            .map_err(|_| CryptoError::InvalidKeyLength {
                expected: SIGNATURE_LEN,
                actual: signature.len(),
            })?;

    let verifying_key = VerifyingKey::from_bytes(&public)
        .map_err(|e| CryptoError::InvalidPublicKey(e.to_string()))?;
    verifying_key
        .verify(message, &Signature::from_bytes(&signature))
        .map_err(|_| CryptoError::BadSignature)
}
