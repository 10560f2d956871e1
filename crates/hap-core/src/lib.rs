//! # hap-core
//!
//! Core types and error definitions shared across the accessory crates.
//!
//! This crate provides:
//! - The accessory configuration
//! - Common error types and their classification

pub mod config;
pub mod error;

pub use config::AccessoryConfig;
pub use error::{CryptoError, Error, ErrorKind, PairingError, ParseError, Result};
