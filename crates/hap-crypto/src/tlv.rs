//! TLV8 codec for pairing messages.
//!
//! Each item is `[type: 1][length: 1][value: 0..=255]`. Longer values are
//! split into consecutive items of the same type and joined again on parse.

use hap_core::error::{PairingError, ParseError};

/// Item types used by pairing messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TlvType {
    Method = 0x00,
    Identifier = 0x01,
    Salt = 0x02,
    PublicKey = 0x03,
    Proof = 0x04,
    EncryptedData = 0x05,
    State = 0x06,
    Error = 0x07,
    RetryDelay = 0x08,
    Certificate = 0x09,
    Signature = 0x0A,
    Permissions = 0x0B,
    FragmentData = 0x0C,
    FragmentLast = 0x0D,
    Flags = 0x13,
    Separator = 0xFF,
}

/// `Method` item values.
pub mod methods {
    pub const PAIR_SETUP: u8 = 0x00;
    pub const PAIR_SETUP_WITH_AUTH: u8 = 0x01;
    pub const PAIR_VERIFY: u8 = 0x02;
    pub const ADD_PAIRING: u8 = 0x03;
    pub const REMOVE_PAIRING: u8 = 0x04;
    pub const LIST_PAIRINGS: u8 = 0x05;
}

/// `Permissions` bit for admin controllers.
pub const PERMISSION_ADMIN: u8 = 0x01;

/// Longest value a single item can carry.
const MAX_ITEM_LEN: usize = 255;

/// A TLV8 message. Items keep insertion order on encode.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Tlv8 {
    items: Vec<(u8, Vec<u8>)>,
}

impl Tlv8 {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a message, joining fragments of the same type that appear back to back.
    pub fn parse(data: &[u8]) -> Result<Self, ParseError> {
        let mut items: Vec<(u8, Vec<u8>)> = Vec::new();
        let mut rest = data;

        while !rest.is_empty() {
            let [typ, len, tail @ ..] = rest else {
                return Err(ParseError::InvalidFormat(
                    "TLV8: truncated header".to_string(),
                ));
            };
            let len = *len as usize;
            if tail.len() < len {
                return Err(ParseError::InvalidFormat(format!(
                    "TLV8: item 0x{:02x} wants {} bytes, {} left",
                    typ,
                    len,
                    tail.len()
                )));
            }
            let (value, next) = tail.split_at(len);

            match items.last_mut() {
                Some((last, existing)) if last == typ => existing.extend_from_slice(value),
                _ => items.push((*typ, value.to_vec())),
            }
            rest = next;
        }

        Ok(Self { items })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for (typ, value) in &self.items {
            if value.is_empty() {
                out.extend_from_slice(&[*typ, 0]);
                continue;
            }
            for chunk in value.chunks(MAX_ITEM_LEN) {
                out.push(*typ);
                out.push(chunk.len() as u8);
                out.extend_from_slice(chunk);
            }
        }
        out
    }

    /// First value of `typ`.
    pub fn get(&self, typ: TlvType) -> Option<&[u8]> {
        let raw = typ as u8;
        self.items
            .iter()
            .find(|(t, _)| *t == raw)
            .map(|(_, v)| v.as_slice())
    }

    /// Like [`get`](Self::get), but a missing item is a protocol error.
    pub fn require(&self, typ: TlvType) -> Result<&[u8], PairingError> {
        self.get(typ).ok_or(PairingError::MissingTlv(typ as u8))
    }

    /// Single-byte value of `typ`.
    pub fn get_u8(&self, typ: TlvType) -> Option<u8> {
        self.get(typ).and_then(|v| v.first().copied())
    }

    /// Replace the value of `typ`, or append it.
    pub fn set(&mut self, typ: TlvType, value: impl Into<Vec<u8>>) {
        let raw = typ as u8;
        let value = value.into();
        match self.items.iter_mut().find(|(t, _)| *t == raw) {
            Some((_, existing)) => *existing = value,
            None => self.items.push((raw, value)),
        }
    }

    /// Builder form of [`set`](Self::set).
    pub fn with(mut self, typ: TlvType, value: impl Into<Vec<u8>>) -> Self {
        self.set(typ, value);
        self
    }

    pub fn contains(&self, typ: TlvType) -> bool {
        self.get(typ).is_some()
    }

    pub fn state(&self) -> Option<u8> {
        self.get_u8(TlvType::State)
    }

    pub fn method(&self) -> Option<u8> {
        self.get_u8(TlvType::Method)
    }

    pub fn error(&self) -> Option<u8> {
        self.get_u8(TlvType::Error)
    }

    /// `{State, Error}` reply.
    pub fn error_reply(state: u8, code: u8) -> Self {
        Self::new()
            .with(TlvType::State, [state])
            .with(TlvType::Error, [code])
    }
}
