//! # hap-pairing
//!
//! Accessory side of the HomeKit pairing protocols.
//!
//! This crate provides:
//! - Pair-setup (SRP, M1-M6) and pair-verify (X25519/Ed25519, M1-M4) engines
//! - `/pairings` add and remove
//! - Pairing storage, the accessory identity and setup secret provisioning
//!
//! Engines never touch the network. Each step takes a request body and returns
//! the TLV8 reply together with an outcome the connection acts on.

mod context;
mod identity;
mod pair_setup;
mod pair_verify;
mod pairings;
mod secret;
pub mod store;

#[cfg(test)]
mod test_support;

pub use context::PairingContext;
pub use identity::AccessoryIdentity;
pub use pair_setup::{PairSetup, PairSetupState, SetupOutcome, SetupStep};
pub use pair_verify::{PairVerify, VerifyOutcome, VerifyStep};
pub use pairings::{handle_pairings, PairingsOutcome, PairingsStep};
pub use secret::SetupSecret;
pub use store::{FilePairingStore, MemoryPairingStore, PairingRecord, PairingStore};
