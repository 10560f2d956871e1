//! X25519 ephemeral key agreement for pair-verify.

use hap_core::error::CryptoError;
use rand::rngs::OsRng;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::ZeroizeOnDrop;

/// One side's ephemeral key pair for a single pair-verify handshake.
#[derive(ZeroizeOnDrop)]
pub struct EphemeralKeyPair {
    #[zeroize(skip)]
    public: [u8; 32],
    secret: [u8; 32],
}

impl EphemeralKeyPair {
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        Self {
            public: PublicKey::from(&secret).to_bytes(),
            secret: secret.to_bytes(),
        }
    }

    pub fn from_secret(secret: [u8; 32]) -> Self {
        let static_secret = StaticSecret::from(secret);
        Self {
            public: PublicKey::from(&static_secret).to_bytes(),
            secret,
        }
    }

    pub fn public_key(&self) -> [u8; 32] {
        self.public
    }

    /// Compute the shared secret with `peer_public`.
    ///
    /// Low-order peer points, which force an all-zero result, are rejected.
    pub fn diffie_hellman(&self, peer_public: &[u8]) -> Result<[u8; 32], CryptoError> {
        let peer: [u8; 32] = peer_public
            .try_into()
            .map_err(|_| CryptoError::InvalidKeyLength {
                expected: 32,
                actual: peer_public.len(),
            })?;

        let shared = StaticSecret::from(self.secret)
            .diffie_hellman(&PublicKey::from(peer))
            .to_bytes();
        if shared.iter().all(|&b| b == 0) {
            return Err(CryptoError::InvalidPublicKey(
                "peer X25519 key is a low-order point".to_string(),
            ));
        }
        Ok(shared)
    }
}
