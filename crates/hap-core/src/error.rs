//! Error types for the accessory.

use thiserror::Error;

/// Primary error type for all accessory operations.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid parameter: {0}")]
    Param(String),

    #[error("Allocation failed: {0}")]
    NoMemory(String),

    #[error("Connection error: {0}")]
    Connection(#[from] std::io::Error),

    #[error("Operation timed out")]
    Timeout,

    #[error("Pairing error: {0}")]
    Pairing(#[from] PairingError),

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Parse error: {0}")]
    Parse(#[from] ParseError),

    #[error("Security session not established")]
    NotEstablished,

    #[error("Pairing storage is full")]
    StorageFull,

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Unsupported: {0}")]
    Unsupported(String),

    #[error("Size error: {0}")]
    Size(String),
}

/// Coarse classification of an [`Error`].
///
/// Callers decide how to react (close the connection, answer with an error
/// TLV, keep going) from the kind rather than from the concrete variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Param,
    NoMemory,
    Connection,
    Timeout,
    Authentication,
    Encryption,
    StorageFull,
    Storage,
    Unsupported,
    Size,
}

/// Errors raised by the pair-setup, pair-verify and pairings engines.
#[derive(Error, Debug)]
pub enum PairingError {
    #[error("SRP proof mismatch (wrong setup code)")]
    InvalidSetupCode,

    #[error("Signature verification failed")]
    SignatureInvalid,

    #[error("Unknown controller: {0}")]
    UnknownController(String),

    #[error("Controller lacks admin permission")]
    NotAdmin,

    #[error("Maximum number of pairings reached")]
    MaxPeers,

    #[error("Pairing unavailable: {0}")]
    Unavailable(String),

    #[error("Pairing state mismatch: expected {expected}, got {actual}")]
    StateMismatch { expected: u8, actual: u8 },

    #[error("Unsupported pairing method: {0}")]
    UnsupportedMethod(u8),

    #[error("TLV parsing error: {0}")]
    TlvParse(String),

    #[error("Missing required TLV type: {0}")]
    MissingTlv(u8),

    #[error("Protocol error: {0}")]
    Protocol(String),
}

/// Cryptographic operation errors.
#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("Encryption failed: {0}")]
    Encryption(String),

    #[error("Decryption failed: {0}")]
    Decryption(String),

    #[error("Key derivation failed: {0}")]
    KeyDerivation(String),

    #[error("Invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },

    #[error("Invalid public key: {0}")]
    InvalidPublicKey(String),

    #[error("Signature verification failed")]
    BadSignature,

    #[error("Crypto buffer allocation failed: {0}")]
    NoMemory(String),
}

/// Parsing errors for wire and file formats.
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("Invalid format: {0}")]
    InvalidFormat(String),

    #[error("Missing required field: {0}")]
    MissingField(&'static str),

    #[error("Invalid value: {0}")]
    InvalidValue(String),
}

impl Error {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Param(_) => ErrorKind::Param,
            Error::NoMemory(_) => ErrorKind::NoMemory,
            Error::Connection(_) => ErrorKind::Connection,
            Error::Timeout => ErrorKind::Timeout,
            Error::Pairing(e) => e.kind(),
            Error::Crypto(e) => e.kind(),
            Error::Parse(_) => ErrorKind::Unsupported,
            Error::NotEstablished => ErrorKind::Authentication,
            Error::StorageFull => ErrorKind::StorageFull,
            Error::Storage(_) => ErrorKind::Storage,
            Error::Unsupported(_) => ErrorKind::Unsupported,
            Error::Size(_) => ErrorKind::Size,
        }
    }

    /// Whether the connection that produced this error can no longer be used.
    pub fn is_fatal_to_connection(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Connection
                | ErrorKind::Timeout
                | ErrorKind::Storage
                | ErrorKind::NoMemory
                | ErrorKind::Size
        ) || matches!(self, Error::Crypto(_))
    }

    /// TLV8 error code to report to the controller for this error.
    pub fn tlv_code(&self) -> u8 {
        match self {
            Error::Pairing(e) => e.tlv_code(),
            Error::StorageFull => tlv_codes::MAX_PEERS,
            other => match other.kind() {
                ErrorKind::Authentication => tlv_codes::AUTHENTICATION,
                _ => tlv_codes::UNKNOWN,
            },
        }
    }

    /// Shorthand for a closed or truncated stream.
    pub fn closed(context: &str) -> Self {
        Error::Connection(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            context.to_string(),
        ))
    }
}

/// TLV8 `Error` item values.
pub mod tlv_codes {
    pub const UNKNOWN: u8 = 0x01;
    pub const AUTHENTICATION: u8 = 0x02;
    pub const BACKOFF: u8 = 0x03;
    pub const MAX_PEERS: u8 = 0x04;
    pub const MAX_TRIES: u8 = 0x05;
    pub const UNAVAILABLE: u8 = 0x06;
    pub const BUSY: u8 = 0x07;
}

impl PairingError {
    pub fn tlv_code(&self) -> u8 {
        match self {
            PairingError::MaxPeers => tlv_codes::MAX_PEERS,
            PairingError::Unavailable(_) => tlv_codes::UNAVAILABLE,
            other if other.kind() == ErrorKind::Authentication => tlv_codes::AUTHENTICATION,
            _ => tlv_codes::UNKNOWN,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            PairingError::InvalidSetupCode
            | PairingError::SignatureInvalid
            | PairingError::UnknownController(_)
            | PairingError::NotAdmin => ErrorKind::Authentication,
            PairingError::MaxPeers => ErrorKind::StorageFull,
            PairingError::Unavailable(_)
            | PairingError::StateMismatch { .. }
            | PairingError::UnsupportedMethod(_)
            | PairingError::TlvParse(_)
            | PairingError::MissingTlv(_)
            | PairingError::Protocol(_) => ErrorKind::Unsupported,
        }
    }
}

impl CryptoError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CryptoError::Encryption(_) | CryptoError::KeyDerivation(_) => ErrorKind::Encryption,
            CryptoError::Decryption(_)
            | CryptoError::InvalidPublicKey(_)
            | CryptoError::BadSignature => ErrorKind::Authentication,
            CryptoError::InvalidKeyLength { .. } => ErrorKind::Param,
            CryptoError::NoMemory(_) => ErrorKind::NoMemory,
        }
    }
}

/// Convenience Result type.
pub type Result<T> = std::result::Result<T, Error>;
