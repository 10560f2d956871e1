//! ChaCha20-Poly1305 AEAD for session frames and pairing messages.

use chacha20poly1305::{
    aead::{Aead, AeadInPlace, KeyInit, Payload},
    ChaCha20Poly1305, Nonce,
};
use hap_core::error::CryptoError;
use zeroize::ZeroizeOnDrop;

/// Largest plaintext carried by one session frame.
pub const MAX_FRAME_LEN: usize = 0x400;

/// Length prefix size of a session frame.
pub const LENGTH_LEN: usize = 2;

/// Poly1305 tag size.
pub const TAG_LEN: usize = 16;

/// One direction of a secure session.
///
/// Holds the key and the sequence counter used as the nonce. The counter only
/// moves forward: it is consumed by every successful seal or open and is never
/// rewound, so a nonce is never used twice under the same key.
///
/// The cipher instance is cached so each frame avoids key setup.
#[derive(ZeroizeOnDrop)]
pub struct FrameCipher {
    key: [u8; 32],
    #[zeroize(skip)]
    cipher: ChaCha20Poly1305,
    #[zeroize(skip)]
    counter: u64,
}

impl FrameCipher {
    pub fn new(key: [u8; 32]) -> Self {
        let cipher = ChaCha20Poly1305::new(&key.into());
        Self {
            key,
            cipher,
            counter: 0,
        }
    }

    /// Seal one frame: `[u16_le len][ciphertext][tag]`, AAD = len.
    ///
    /// `plaintext` must be 1..=[`MAX_FRAME_LEN`] bytes. The counter advances
    /// only when sealing succeeds.
    pub fn seal_frame(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if plaintext.is_empty() || plaintext.len() > MAX_FRAME_LEN {
            return Err(CryptoError::Encryption(format!(
                "frame payload of {} bytes out of range",
                plaintext.len()
            )));
        }

        // sealed in place, so this is the only allocation
        let mut out = frame_buffer(LENGTH_LEN + plaintext.len() + TAG_LEN)?;
        let aad = (plaintext.len() as u16).to_le_bytes();
        out.extend_from_slice(&aad);
        out.extend_from_slice(plaintext);

        let nonce = build_nonce_from_counter(self.counter);
        let tag = self
            .cipher
            .encrypt_in_place_detached(Nonce::from_slice(&nonce), &aad, &mut out[LENGTH_LEN..])
            .map_err(|e| CryptoError::Encryption(format!("frame seal failed: {}", e)))?;
        self.counter += 1;
        out.extend_from_slice(&tag);
        Ok(out)
    }

    /// Open one frame body (`ciphertext ‖ tag`) whose length prefix was `length`.
    ///
    /// The counter advances only when the tag verifies.
    pub fn open_frame(&mut self, length: u16, body: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if body.len() != length as usize + TAG_LEN {
            return Err(CryptoError::Decryption(format!(
                "frame body is {} bytes, length prefix says {}",
                body.len(),
                length as usize + TAG_LEN
            )));
        }

        let aad = length.to_le_bytes();
        let nonce = build_nonce_from_counter(self.counter);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(&nonce), Payload { msg: body, aad: &aad })
            .map_err(|_| CryptoError::Decryption("frame authentication failed".to_string()))?;
        self.counter += 1;
        Ok(plaintext)
    }

    /// Next sequence number this cipher will use.
    pub fn counter(&self) -> u64 {
        self.counter
    }
}

/// Empty buffer with room for exactly `capacity` bytes.
fn frame_buffer(capacity: usize) -> Result<Vec<u8>, CryptoError> {
    let mut buf = Vec::new();
    buf.try_reserve_exact(capacity)
        .map_err(|_| CryptoError::NoMemory(format!("{} byte frame buffer", capacity)))?;
    Ok(buf)
}

/// Nonce for a session frame: four zero bytes then the counter, little-endian.
pub fn build_nonce_from_counter(counter: u64) -> [u8; 12] {
    let mut nonce = [0u8; 12];
    nonce[4..12].copy_from_slice(&counter.to_le_bytes());
    nonce
}

/// Create a 12-byte nonce from a label, right-aligned.
///
/// `"PS-Msg05"` becomes `\x00\x00\x00\x00PS-Msg05`.
pub fn nonce_from_string(s: &[u8]) -> [u8; 12] {
    let mut nonce = [0u8; 12];
    let len = s.len().min(12);
    nonce[12 - len..].copy_from_slice(&s[..len]);
    nonce
}

/// Seal a pairing sub-TLV under a labelled nonce. Returns `ciphertext ‖ tag`.
pub fn encrypt_with_nonce(
    key: &[u8; 32],
    nonce: &[u8; 12],
    plaintext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    ChaCha20Poly1305::new(key.into())
        .encrypt(Nonce::from_slice(nonce), plaintext)
        .map_err(|e| CryptoError::Encryption(format!("seal failed: {}", e)))
}

/// Open a pairing sub-TLV sealed with [`encrypt_with_nonce`].
pub fn decrypt_with_nonce(
    key: &[u8; 32],
    nonce: &[u8; 12],
    ciphertext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    if ciphertext.len() < TAG_LEN {
        return Err(CryptoError::Decryption(
            "ciphertext shorter than tag".to_string(),
        ));
    }

    ChaCha20Poly1305::new(key.into())
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| CryptoError::Decryption("authentication failed".to_string()))
}
