//! Accessory side of HomeKit pair-verify (M1-M4).
//!
//! ```text
//! M1 {State=1, PublicKey=ctrlEph}   -> M2 {State=2, PublicKey=accEph, EncryptedData}
//! M3 {State=3, EncryptedData}       -> M4 {State=4}
//! ```
//!
//! M2's sealed sub-TLV carries the accessory identifier, LTPK and a signature
//! over `accEph ‖ accessoryId ‖ ctrlEph`. M3 must carry a stored controller
//! identifier and its signature over `ctrlEph ‖ controllerId ‖ accEph`.
//! On success the caller sends M4 in plaintext and only then installs the
//! returned [`SessionKeys`].

use hap_core::error::{Error, PairingError, Result};
use hap_crypto::{
    chacha::{decrypt_with_nonce, encrypt_with_nonce, nonce_from_string},
    ed25519, hkdf,
    keys::SessionKeys,
    tlv::{Tlv8, TlvType},
    EphemeralKeyPair,
};
use zeroize::Zeroizing;

use crate::{PairingContext, PairingRecord, PairingStore};

const PV_MSG02_NONCE: &[u8] = b"PV-Msg02";
const PV_MSG03_NONCE: &[u8] = b"PV-Msg03";

/// Values carried from M2 to M3.
struct Pending {
    shared_secret: Zeroizing<[u8; 32]>,
    verify_key: Zeroizing<[u8; 32]>,
    accessory_public: [u8; 32],
    controller_public: [u8; 32],
}

enum VerifyState {
    Start,
    Finish(Box<Pending>),
    Verified,
    Failed,
}

#[derive(Debug)]
pub enum VerifyOutcome {
    InProgress,
    /// M4 built; install `keys` after it is on the wire.
    Verified {
        keys: SessionKeys,
        controller: PairingRecord,
    },
    Failed(Error),
}

#[derive(Debug)]
pub struct VerifyStep {
    pub response: Tlv8,
    pub outcome: VerifyOutcome,
}

/// One pair-verify exchange, scoped to a single connection.
pub struct PairVerify {
    state: VerifyState,
}

impl Default for PairVerify {
    fn default() -> Self {
        Self::new()
    }
}

impl PairVerify {
    pub fn new() -> Self {
        Self {
            state: VerifyState::Start,
        }
    }

    /// Whether M2 has been sent and M3 is expected next.
    pub fn awaiting_finish(&self) -> bool {
        matches!(self.state, VerifyState::Finish(_))
    }

    pub fn is_verified(&self) -> bool {
        matches!(self.state, VerifyState::Verified)
    }

    /// Process one `/pair-verify` request body.
    pub async fn handle(&mut self, ctx: &PairingContext, body: &[u8]) -> VerifyStep {
        let request = Tlv8::parse(body).map_err(|e| PairingError::TlvParse(e.to_string()));
        let reply_state = request
            .as_ref()
            .ok()
            .and_then(Tlv8::state)
            .map_or(2, |s| s.saturating_add(1));

        match self.step(ctx, request).await {
            Ok(step) => step,
            Err(e) => {
                self.state = VerifyState::Failed;
                tracing::warn!(state = reply_state, error = %e, "Pair-verify rejected");
                VerifyStep {
                    response: Tlv8::error_reply(reply_state, e.tlv_code()),
                    outcome: VerifyOutcome::Failed(e),
                }
            }
        }
    }

    async fn step(
        &mut self,
        ctx: &PairingContext,
        request: std::result::Result<Tlv8, PairingError>,
    ) -> Result<VerifyStep> {
        let request = request?;
        let state = request
            .state()
            .ok_or(PairingError::MissingTlv(TlvType::State as u8))?;

        match (std::mem::replace(&mut self.state, VerifyState::Failed), state) {
            (VerifyState::Start, 1) => self.start(ctx, &request),
            (VerifyState::Finish(pending), 3) => self.finish(ctx, &request, *pending).await,
            (current, actual) => {
                let expected = match current {
                    VerifyState::Finish(_) => 3,
                    _ => 1,
                };
                Err(PairingError::StateMismatch { expected, actual }.into())
            }
        }
    }

    fn start(&mut self, ctx: &PairingContext, request: &Tlv8) -> Result<VerifyStep> {
        let controller_public: [u8; 32] = request
            .require(TlvType::PublicKey)?
            .try_into()
            .map_err(|_| PairingError::Protocol("controller key must be 32 bytes".to_string()))?;

        let ephemeral = EphemeralKeyPair::generate();
        let accessory_public = ephemeral.public_key();
        let shared_secret = Zeroizing::new(ephemeral.diffie_hellman(&controller_public)?);
        let verify_key = Zeroizing::new(hkdf::derive_pair_verify_key(shared_secret.as_slice())?);

        let identity = &ctx.identity;
        let device_id = identity.device_id().as_bytes();
        let mut info = Vec::with_capacity(64 + device_id.len());
        info.extend_from_slice(&accessory_public);
        info.extend_from_slice(device_id);
        info.extend_from_slice(&controller_public);

        let sub = Tlv8::new()
            .with(TlvType::Identifier, device_id)
            .with(TlvType::PublicKey, identity.public_key())
            .with(TlvType::Signature, identity.sign(&info));
        let sealed = encrypt_with_nonce(&verify_key, &nonce_from_string(PV_MSG02_NONCE), &sub.encode())?;

        self.state = VerifyState::Finish(Box::new(Pending {
            shared_secret,
            verify_key,
            accessory_public,
            controller_public,
        }));
        tracing::debug!("Pair-verify M1 -> M2");

        Ok(VerifyStep {
            response: Tlv8::new()
                .with(TlvType::State, [2])
                .with(TlvType::PublicKey, accessory_public)
                .with(TlvType::EncryptedData, sealed),
            outcome: VerifyOutcome::InProgress,
        })
    }

    async fn finish(
        &mut self,
        ctx: &PairingContext,
        request: &Tlv8,
        pending: Pending,
    ) -> Result<VerifyStep> {
        let sealed = request.require(TlvType::EncryptedData)?;
        let plaintext = Zeroizing::new(decrypt_with_nonce(
            &pending.verify_key,
            &nonce_from_string(PV_MSG03_NONCE),
            sealed,
        )?);
        let sub = Tlv8::parse(&plaintext).map_err(|e| PairingError::TlvParse(e.to_string()))?;

        let identifier = std::str::from_utf8(sub.require(TlvType::Identifier)?)
            .map_err(|_| PairingError::TlvParse("controller identifier is not UTF-8".to_string()))?;
        let signature = sub.require(TlvType::Signature)?;

        let controller = ctx
            .store
            .get(identifier)
            .await?
            .ok_or_else(|| PairingError::UnknownController(identifier.to_string()))?;

        let mut info = Vec::with_capacity(64 + identifier.len());
        info.extend_from_slice(&pending.controller_public);
        info.extend_from_slice(identifier.as_bytes());
        info.extend_from_slice(&pending.accessory_public);
        ed25519::verify(&controller.public_key, &info, signature)
            .map_err(|_| PairingError::SignatureInvalid)?;

        let keys = SessionKeys::derive_accessory_keys(pending.shared_secret.as_slice())?;
        self.state = VerifyState::Verified;
        tracing::info!(controller = %controller.identifier, "Pair-verify complete");

        Ok(VerifyStep {
            response: Tlv8::new().with(TlvType::State, [4]),
            outcome: VerifyOutcome::Verified { keys, controller },
        })
    }
}
