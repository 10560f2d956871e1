//! Setup secret provisioning.

use hap_crypto::srp::{self, SrpServer, PAIR_SETUP_USERNAME, SALT_LEN};
use rand::{rngs::OsRng, RngCore};
use zeroize::Zeroizing;

/// What the accessory knows about its setup code.
///
/// `Verifier` lets a device ship with a precomputed `(salt, verifier)` pair
/// and never hold the code itself.
#[derive(Clone)]
pub enum SetupSecret {
    Code(Zeroizing<String>),
    Verifier {
        salt: [u8; SALT_LEN],
        verifier: Vec<u8>,
    },
}

impl SetupSecret {
    pub fn code(code: impl Into<String>) -> Self {
        SetupSecret::Code(Zeroizing::new(code.into()))
    }

    /// Derive a verifier for `code` under a fresh salt, dropping the code.
    pub fn verifier_from_code(code: &str) -> Self {
        let mut salt = [0u8; SALT_LEN];
        OsRng.fill_bytes(&mut salt);
        SetupSecret::Verifier {
            salt,
            verifier: srp::compute_verifier(PAIR_SETUP_USERNAME, code.as_bytes(), &salt),
        }
    }

    /// SRP server state for one pair-setup attempt.
    pub(crate) fn srp_server(&self) -> SrpServer {
        match self {
            SetupSecret::Code(code) => SrpServer::from_password(PAIR_SETUP_USERNAME, code.as_bytes()),
            SetupSecret::Verifier { salt, verifier } => SrpServer::from_verifier(*salt, verifier),
        }
    }
}

impl std::fmt::Debug for SetupSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SetupSecret::Code(_) => f.write_str("SetupSecret::Code(..)"),
            SetupSecret::Verifier { .. } => f.write_str("SetupSecret::Verifier(..)"),
        }
    }
}
