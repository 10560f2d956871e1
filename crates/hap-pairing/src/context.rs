use std::sync::Arc;

use crate::{AccessoryIdentity, PairingStore, SetupSecret};

/// Accessory-wide state the pairing engines read from.
///
/// One instance is shared by every connection.
#[derive(Clone)]
pub struct PairingContext {
    pub identity: Arc<AccessoryIdentity>,
    pub secret: Arc<SetupSecret>,
    pub store: Arc<dyn PairingStore>,
}

impl PairingContext {
    pub fn new(
        identity: AccessoryIdentity,
        secret: SetupSecret,
        store: Arc<dyn PairingStore>,
    ) -> Self {
        Self {
            identity: Arc::new(identity),
            secret: Arc::new(secret),
            store,
        }
    }
}
