//! `/pairings` add and remove, answered for an admin controller over a
//! verified session.

use hap_core::error::{Error, PairingError, Result};
use hap_crypto::tlv::{methods, Tlv8, TlvType, PERMISSION_ADMIN};

use crate::{PairingContext, PairingRecord, PairingStore};

#[derive(Debug)]
pub enum PairingsOutcome {
    Added(PairingRecord),
    /// `own` is set when the requesting controller removed itself; the
    /// connection closes once the reply is sent.
    Removed { identifier: String, own: bool },
    Failed(Error),
}

#[derive(Debug)]
pub struct PairingsStep {
    pub response: Tlv8,
    pub outcome: PairingsOutcome,
}

/// Process one `/pairings` request body.
///
/// `controller` is the record the session was verified against, `None` when
/// the connection has no verified session.
pub async fn handle_pairings(
    ctx: &PairingContext,
    controller: Option<&PairingRecord>,
    body: &[u8],
) -> PairingsStep {
    match dispatch(ctx, controller, body).await {
        Ok((response, outcome)) => PairingsStep { response, outcome },
        Err(e) => {
            tracing::warn!(error = %e, "Pairings request rejected");
            PairingsStep {
                response: Tlv8::error_reply(2, e.tlv_code()),
                outcome: PairingsOutcome::Failed(e),
            }
        }
    }
}

async fn dispatch(
    ctx: &PairingContext,
    controller: Option<&PairingRecord>,
    body: &[u8],
) -> Result<(Tlv8, PairingsOutcome)> {
    let controller = controller.ok_or(Error::NotEstablished)?;
    if !controller.admin {
        return Err(PairingError::NotAdmin.into());
    }

    let request = Tlv8::parse(body).map_err(|e| PairingError::TlvParse(e.to_string()))?;
    match request.state() {
        Some(1) => {}
        Some(actual) => return Err(PairingError::StateMismatch { expected: 1, actual }.into()),
        None => return Err(PairingError::MissingTlv(TlvType::State as u8).into()),
    }

    let method = request
        .method()
        .ok_or(PairingError::MissingTlv(TlvType::Method as u8))?;
    let identifier = std::str::from_utf8(request.require(TlvType::Identifier)?)
        .map_err(|_| PairingError::TlvParse("identifier is not UTF-8".to_string()))?
        .to_string();

    let outcome = match method {
        methods::ADD_PAIRING => add(ctx, &request, identifier).await?,
        methods::REMOVE_PAIRING => {
            let existed = ctx.store.remove(&identifier).await?;
            let own = identifier == controller.identifier;
            tracing::info!(%identifier, existed, own, "Pairing removed");
            PairingsOutcome::Removed { identifier, own }
        }
        other => return Err(PairingError::UnsupportedMethod(other).into()),
    };

    Ok((Tlv8::new().with(TlvType::State, [2]), outcome))
}

async fn add(ctx: &PairingContext, request: &Tlv8, identifier: String) -> Result<PairingsOutcome> {
    let ltpk: [u8; 32] = request
        .require(TlvType::PublicKey)?
        .try_into()
        .map_err(|_| PairingError::Protocol("LTPK must be 32 bytes".to_string()))?;
    let admin = request.get_u8(TlvType::Permissions).unwrap_or(0) & PERMISSION_ADMIN != 0;

    if let Some(existing) = ctx.store.get(&identifier).await? {
        if existing.public_key != ltpk {
            return Err(Error::Param(format!(
                "{} is already paired with a different key",
                identifier
            )));
        }
    }

    let record = PairingRecord::new(identifier, ltpk, admin);
    ctx.store.add(record.clone()).await.map_err(|e| match e {
        Error::StorageFull => PairingError::MaxPeers.into(),
        other => other,
    })?;
    tracing::info!(identifier = %record.identifier, admin, "Pairing added");
    Ok(PairingsOutcome::Added(record))
}
