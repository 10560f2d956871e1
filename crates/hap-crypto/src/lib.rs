//! # hap-crypto
//!
//! Cryptographic building blocks for accessory pairing and the secure session.
//!
//! This crate provides:
//! - SRP-6a (3072-bit) server and client for pair-setup
//! - X25519 ephemeral key agreement for pair-verify
//! - Ed25519 long-term keys
//! - ChaCha20-Poly1305 frame and message sealing
//! - HKDF-SHA512 key derivation
//! - TLV8 codec
//!
//! Secret material is zeroized on drop.

pub mod chacha;
pub mod curve25519;
pub mod ed25519;
pub mod hkdf;
pub mod keys;
pub mod srp;
pub mod tlv;

pub use chacha::FrameCipher;
pub use curve25519::EphemeralKeyPair;
pub use ed25519::LongTermKeyPair;
pub use keys::{EncryptionKey, SessionKeys};
pub use tlv::{Tlv8, TlvType};
