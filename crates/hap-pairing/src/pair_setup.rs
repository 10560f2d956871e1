//! Accessory side of HomeKit pair-setup (M1-M6).
//!
//! ```text
//! M1 {State=1, Method=0}                 -> M2 {State=2, Salt, PublicKey=B}
//! M3 {State=3, PublicKey=A, Proof=M1}    -> M4 {State=4, Proof=M2}
//! M5 {State=5, EncryptedData}            -> M6 {State=6, EncryptedData}
//! ```
//!
//! A failed step answers `{State, Error}` and leaves the engine in
//! [`PairSetupState::Failed`]; nothing is persisted unless M5 verifies.

use hap_core::error::{Error, PairingError, Result};
use hap_crypto::{
    chacha::{decrypt_with_nonce, encrypt_with_nonce, nonce_from_string},
    ed25519, hkdf,
    srp::{SrpServer, PAIR_SETUP_USERNAME},
    tlv::{methods, Tlv8, TlvType},
};
use zeroize::Zeroizing;

use crate::{PairingContext, PairingRecord, PairingStore};

const PS_MSG05_NONCE: &[u8] = b"PS-Msg05";
const PS_MSG06_NONCE: &[u8] = b"PS-Msg06";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairSetupState {
    AwaitingStart,
    AwaitingProof,
    AwaitingExchange,
    Complete,
    Failed,
}

impl PairSetupState {
    /// `State` value of the request this state accepts.
    fn expected_request(self) -> u8 {
        match self {
            PairSetupState::AwaitingProof => 3,
            PairSetupState::AwaitingExchange => 5,
            PairSetupState::AwaitingStart | PairSetupState::Complete | PairSetupState::Failed => 1,
        }
    }
}

/// How a pair-setup step ended.
#[derive(Debug)]
pub enum SetupOutcome {
    InProgress,
    /// M6 sent; the controller is now stored as an admin.
    Paired(PairingRecord),
    Failed(Error),
}

/// Reply to send plus the step's outcome.
#[derive(Debug)]
pub struct SetupStep {
    pub response: Tlv8,
    pub outcome: SetupOutcome,
}

/// One pair-setup exchange, scoped to a single connection.
pub struct PairSetup {
    state: PairSetupState,
    srp: Option<SrpServer>,
    srp_key: Option<Zeroizing<Vec<u8>>>,
    setup_key: Option<Zeroizing<[u8; 32]>>,
    pair_list_full: bool,
}

impl Default for PairSetup {
    fn default() -> Self {
        Self::new()
    }
}

impl PairSetup {
    pub fn new() -> Self {
        Self {
            state: PairSetupState::AwaitingStart,
            srp: None,
            srp_key: None,
            setup_key: None,
            pair_list_full: false,
        }
    }

    pub fn state(&self) -> PairSetupState {
        self.state
    }

    /// Set when M5 could not be stored because the pairing list is full.
    pub fn pair_list_full(&self) -> bool {
        self.pair_list_full
    }

    /// Process one `/pair-setup` request body.
    pub async fn handle(&mut self, ctx: &PairingContext, body: &[u8]) -> SetupStep {
        let request = Tlv8::parse(body).map_err(|e| PairingError::TlvParse(e.to_string()));
        let reply_state = request
            .as_ref()
            .ok()
            .and_then(Tlv8::state)
            .map_or(2, |s| s.saturating_add(1));

        match self.step(ctx, request).await {
            Ok((response, outcome)) => SetupStep { response, outcome },
            Err(e) => {
                self.fail();
                tracing::warn!(state = reply_state, error = %e, "Pair-setup rejected");
                SetupStep {
                    response: Tlv8::error_reply(reply_state, e.tlv_code()),
                    outcome: SetupOutcome::Failed(e),
                }
            }
        }
    }

    async fn step(
        &mut self,
        ctx: &PairingContext,
        request: std::result::Result<Tlv8, PairingError>,
    ) -> Result<(Tlv8, SetupOutcome)> {
        let request = request?;
        let state = request
            .state()
            .ok_or(PairingError::MissingTlv(TlvType::State as u8))?;

        match (self.state, state) {
            // A fresh M1 always restarts the exchange.
            (_, 1) => self.start(ctx, &request),
            (PairSetupState::AwaitingProof, 3) => self.verify(&request),
            (PairSetupState::AwaitingExchange, 5) => self.exchange(ctx, &request).await,
            (current, actual) => Err(PairingError::StateMismatch {
                expected: current.expected_request(),
                actual,
            }
            .into()),
        }
    }

    fn start(&mut self, ctx: &PairingContext, request: &Tlv8) -> Result<(Tlv8, SetupOutcome)> {
        *self = Self::new();

        let method = request
            .method()
            .ok_or(PairingError::MissingTlv(TlvType::Method as u8))?;
        if method != methods::PAIR_SETUP {
            return Err(PairingError::UnsupportedMethod(method).into());
        }

        let srp = ctx.secret.srp_server();
        let response = Tlv8::new()
            .with(TlvType::State, [2])
            .with(TlvType::Salt, srp.salt())
            .with(TlvType::PublicKey, srp.public_key());

        self.srp = Some(srp);
        self.state = PairSetupState::AwaitingProof;
        tracing::debug!("Pair-setup M1 -> M2");
        Ok((response, SetupOutcome::InProgress))
    }

    fn verify(&mut self, request: &Tlv8) -> Result<(Tlv8, SetupOutcome)> {
        let client_public = request.require(TlvType::PublicKey)?;
        let client_proof = request.require(TlvType::Proof)?;
        let srp = self
            .srp
            .take()
            .ok_or_else(|| PairingError::Protocol("no SRP state for M3".to_string()))?;

        let verified = srp
            .verify_client(PAIR_SETUP_USERNAME, client_public, client_proof)
            .map_err(|e| match e {
                hap_core::CryptoError::BadSignature => Error::from(PairingError::InvalidSetupCode),
                other => Error::from(other),
            })?;

        self.setup_key = Some(Zeroizing::new(hkdf::derive_pair_setup_key(
            &verified.shared_secret,
        )?));
        self.srp_key = Some(Zeroizing::new(verified.shared_secret.clone()));
        self.state = PairSetupState::AwaitingExchange;
        tracing::debug!("Pair-setup M3 -> M4");

        let response = Tlv8::new()
            .with(TlvType::State, [4])
            .with(TlvType::Proof, verified.server_proof.clone());
        Ok((response, SetupOutcome::InProgress))
    }

    async fn exchange(
        &mut self,
        ctx: &PairingContext,
        request: &Tlv8,
    ) -> Result<(Tlv8, SetupOutcome)> {
        let (Some(setup_key), Some(srp_key)) = (self.setup_key.take(), self.srp_key.take()) else {
            return Err(PairingError::Protocol("no session key for M5".to_string()).into());
        };

        let sealed = request.require(TlvType::EncryptedData)?;
        let plaintext = Zeroizing::new(decrypt_with_nonce(
            &setup_key,
            &nonce_from_string(PS_MSG05_NONCE),
            sealed,
        )?);
        let sub = Tlv8::parse(&plaintext).map_err(|e| PairingError::TlvParse(e.to_string()))?;

        let identifier = std::str::from_utf8(sub.require(TlvType::Identifier)?)
            .map_err(|_| PairingError::TlvParse("controller identifier is not UTF-8".to_string()))?
            .to_string();
        let ltpk: [u8; 32] = sub
            .require(TlvType::PublicKey)?
            .try_into()
            .map_err(|_| PairingError::Protocol("controller LTPK must be 32 bytes".to_string()))?;
        let signature = sub.require(TlvType::Signature)?;

        let controller_x = Zeroizing::new(hkdf::derive_controller_sign_key(&srp_key)?);
        let mut signed = Vec::with_capacity(32 + identifier.len() + 32);
        signed.extend_from_slice(controller_x.as_slice());
        signed.extend_from_slice(identifier.as_bytes());
        signed.extend_from_slice(&ltpk);
        ed25519::verify(&ltpk, &signed, signature).map_err(|_| PairingError::SignatureInvalid)?;

        let response = accessory_info_reply(ctx, &srp_key, &setup_key)?;

        // a known identifier keeps its key; re-pairing goes through removal first
        let record = PairingRecord::new(identifier, ltpk, true);
        match ctx.store.insert(record.clone()).await {
            Ok(()) => {}
            Err(Error::StorageFull) => {
                self.pair_list_full = true;
                return Err(PairingError::MaxPeers.into());
            }
            Err(e) => return Err(e),
        }

        self.state = PairSetupState::Complete;
        tracing::info!(controller = %record.identifier, "Pair-setup complete");
        Ok((response, SetupOutcome::Paired(record)))
    }

    fn fail(&mut self) {
        self.state = PairSetupState::Failed;
        self.srp = None;
        self.srp_key = None;
        self.setup_key = None;
    }
}

/// M6: accessory identifier, LTPK and signature over `AccessoryX ‖ id ‖ LTPK`.
fn accessory_info_reply(ctx: &PairingContext, srp_key: &[u8], setup_key: &[u8; 32]) -> Result<Tlv8> {
    let identity = &ctx.identity;
    let accessory_x = Zeroizing::new(hkdf::derive_accessory_sign_key(srp_key)?);
    let device_id = identity.device_id().as_bytes();
    let ltpk = identity.public_key();

    let mut info = Vec::with_capacity(32 + device_id.len() + 32);
    info.extend_from_slice(accessory_x.as_slice());
    info.extend_from_slice(device_id);
    info.extend_from_slice(&ltpk);

    let sub = Tlv8::new()
        .with(TlvType::Identifier, device_id)
        .with(TlvType::PublicKey, ltpk)
        .with(TlvType::Signature, identity.sign(&info));
    let sealed = encrypt_with_nonce(setup_key, &nonce_from_string(PS_MSG06_NONCE), &sub.encode())?;

    Ok(Tlv8::new()
        .with(TlvType::State, [6])
        .with(TlvType::EncryptedData, sealed))
}
