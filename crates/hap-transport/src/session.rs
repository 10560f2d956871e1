//! Per-connection security session.
//!
//! Before pair-verify completes, bytes pass through untouched. Afterwards every
//! write is split into frames of at most [`MAX_FRAME_LEN`] plaintext bytes:
//!
//! ```text
//! [u16_le len][ChaCha20-Poly1305(payload, aad = len)][tag: 16]
//! ```
//!
//! Each direction has its own key and 64-bit counter used as the nonce.

use std::time::Duration;

use hap_core::error::{Error, Result};
use hap_crypto::{
    chacha::{LENGTH_LEN, MAX_FRAME_LEN, TAG_LEN},
    FrameCipher, SessionKeys,
};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;

/// Decrypted bytes the caller has not consumed yet.
///
/// Holds the remainder of at most one frame. A new frame is only decrypted
/// once this is empty.
#[derive(Debug, Default)]
pub struct PendingPlaintext {
    buf: Vec<u8>,
    pos: usize,
}

impl PendingPlaintext {
    pub fn is_empty(&self) -> bool {
        self.pos >= self.buf.len()
    }

    pub fn len(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// Queue the undelivered tail of a frame.
    pub fn append(&mut self, remainder: Vec<u8>) -> Result<()> {
        if !self.is_empty() {
            return Err(Error::Param(
                "pending plaintext already holds a frame".to_string(),
            ));
        }
        self.buf = remainder;
        self.pos = 0;
        Ok(())
    }

    /// Copy as much as fits into `out`, dropping the storage once drained.
    pub fn consume_into(&mut self, out: &mut [u8]) -> usize {
        let n = out.len().min(self.len());
        out[..n].copy_from_slice(&self.buf[self.pos..self.pos + n]);
        self.pos += n;
        if self.is_empty() {
            self.buf = Vec::new();
            self.pos = 0;
        }
        n
    }
}

/// Directional ciphers, installed once.
struct Ciphers {
    output: FrameCipher,
    input: FrameCipher,
}

pub struct SecuritySession {
    ciphers: Option<Ciphers>,
    pending: PendingPlaintext,
    read_timeout: Duration,
}

impl SecuritySession {
    pub fn new(read_timeout: Duration) -> Self {
        Self {
            ciphers: None,
            pending: PendingPlaintext::default(),
            read_timeout,
        }
    }

    pub fn is_established(&self) -> bool {
        self.ciphers.is_some()
    }

    /// Switch to encrypted framing. Keys are never replaced once installed.
    pub fn install_keys(&mut self, keys: SessionKeys) -> Result<()> {
        if self.ciphers.is_some() {
            return Err(Error::Param("session keys already installed".to_string()));
        }
        self.ciphers = Some(Ciphers {
            output: FrameCipher::new(*keys.output_key.as_bytes()),
            input: FrameCipher::new(*keys.input_key.as_bytes()),
        });
        tracing::debug!("Security session established");
        Ok(())
    }

    /// `(output, input)` counters, once established.
    pub fn counters(&self) -> Option<(u64, u64)> {
        self.ciphers
            .as_ref()
            .map(|c| (c.output.counter(), c.input.counter()))
    }

    /// Bytes decrypted but not yet handed to the caller.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Write `data`, framing and sealing it when established.
    ///
    /// A frame's counter value is spent as soon as it is sealed, so a failed
    /// write never causes a nonce to be reused.
    pub async fn send<W>(&mut self, stream: &mut W, data: &[u8]) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let Some(ciphers) = self.ciphers.as_mut() else {
            stream.write_all(data).await?;
            stream.flush().await?;
            return Ok(());
        };

        for chunk in data.chunks(MAX_FRAME_LEN) {
            let frame = ciphers.output.seal_frame(chunk)?;
            stream.write_all(&frame).await?;
        }
        stream.flush().await?;
        tracing::trace!(
            len = data.len(),
            counter = ciphers.output.counter(),
            "Sent encrypted frames"
        );
        Ok(())
    }

    /// Read into `buf`, returning how many bytes were delivered.
    ///
    /// Established sessions deliver queued plaintext first, then decrypt exactly
    /// one frame. Every wait is bounded by the read timeout.
    pub async fn receive<R>(&mut self, stream: &mut R, buf: &mut [u8]) -> Result<usize>
    where
        R: AsyncRead + Unpin,
    {
        if buf.is_empty() {
            return Ok(0);
        }
        if !self.pending.is_empty() {
            return Ok(self.pending.consume_into(buf));
        }

        let read_timeout = self.read_timeout;
        let Some(ciphers) = self.ciphers.as_mut() else {
            let n = timeout(read_timeout, stream.read(buf))
                .await
                .map_err(|_| Error::Timeout)??;
            if n == 0 {
                return Err(Error::closed("peer closed the connection"));
            }
            return Ok(n);
        };

        let mut len_bytes = [0u8; LENGTH_LEN];
        read_exact_bounded(stream, &mut len_bytes, read_timeout).await?;
        let length = u16::from_le_bytes(len_bytes);

        let body_len = length as usize + TAG_LEN;
        let mut body = Vec::new();
        body.try_reserve_exact(body_len)
            .map_err(|_| Error::NoMemory(format!("{} byte frame", body_len)))?;
        body.resize(body_len, 0);
        read_exact_bounded(stream, &mut body, read_timeout).await?;

        let mut plaintext = ciphers.input.open_frame(length, &body)?;
        tracing::trace!(len = length, counter = ciphers.input.counter(), "Received frame");

        let n = buf.len().min(plaintext.len());
        buf[..n].copy_from_slice(&plaintext[..n]);
        if n < plaintext.len() {
            self.pending.append(plaintext.split_off(n))?;
        }
        Ok(n)
    }
}

async fn read_exact_bounded<R>(stream: &mut R, buf: &mut [u8], limit: Duration) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    match timeout(limit, stream.read_exact(buf)).await {
        Err(_) => Err(Error::Timeout),
        Ok(Err(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            Err(Error::closed("stream ended inside a frame"))
        }
        Ok(Err(e)) => Err(e.into()),
        Ok(Ok(_)) => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hap_core::error::ErrorKind;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use tokio::io::{duplex, AsyncWriteExt};

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn established_pair() -> (SecuritySession, SecuritySession) {
        let shared = [0x42u8; 32];
        let mut accessory = SecuritySession::new(TIMEOUT);
        let mut controller = SecuritySession::new(TIMEOUT);
        accessory
            .install_keys(SessionKeys::derive_accessory_keys(&shared).unwrap())
            .unwrap();
        controller
            .install_keys(SessionKeys::derive_controller_keys(&shared).unwrap())
            .unwrap();
        (accessory, controller)
    }

    /// Writer that fails every write.
    struct BrokenPipe;

    impl AsyncWrite for BrokenPipe {
        fn poll_write(self: Pin<&mut Self>, _: &mut Context<'_>, _: &[u8]) -> Poll<std::io::Result<usize>> {
            Poll::Ready(Err(std::io::ErrorKind::BrokenPipe.into()))
        }

        fn poll_flush(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    mod pending {
        use super::*;

        #[test]
        fn drains_in_pieces_then_releases() {
            let mut pending = PendingPlaintext::default();
            pending.append(b"abcdef".to_vec()).unwrap();

            let mut out = [0u8; 4];
            assert_eq!(pending.consume_into(&mut out), 4);
            assert_eq!(&out, b"abcd");
            assert_eq!(pending.len(), 2);
            assert_eq!(pending.consume_into(&mut out), 2);
            assert_eq!(&out[..2], b"ef");
            assert!(pending.is_empty());
            assert_eq!(pending.buf.capacity(), 0);
        }

        #[test]
        fn refuses_second_frame() {
            let mut pending = PendingPlaintext::default();
            pending.append(b"abc".to_vec()).unwrap();
            assert!(matches!(pending.append(b"def".to_vec()), Err(Error::Param(_))));
        }
    }

    mod plaintext {
        use super::*;

        #[tokio::test]
        async fn passes_bytes_through() {
            let (mut a, mut b) = duplex(64);
            let mut session = SecuritySession::new(TIMEOUT);
            session.send(&mut a, b"POST /pair-setup").await.unwrap();

            let mut buf = [0u8; 64];
            let n = SecuritySession::new(TIMEOUT).receive(&mut b, &mut buf).await.unwrap();
            assert_eq!(&buf[..n], b"POST /pair-setup");
        }

        #[tokio::test]
        async fn closed_peer_is_connection_error() {
            let (a, mut b) = duplex(64);
            drop(a);
            let mut buf = [0u8; 8];
            let err = SecuritySession::new(TIMEOUT)
                .receive(&mut b, &mut buf)
                .await
                .unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Connection);
        }

        #[tokio::test]
        async fn silent_peer_times_out() {
            let (_a, mut b) = duplex(64);
            let mut session = SecuritySession::new(Duration::from_millis(20));
            let mut buf = [0u8; 8];
            let err = session.receive(&mut b, &mut buf).await.unwrap_err();
            assert!(matches!(err, Error::Timeout));
        }
    }

    mod framing {
        use super::*;

        #[tokio::test]
        async fn round_trip_splits_at_frame_limit() {
            let (mut acc, mut controller) = established_pair();
            let (mut a, mut b) = duplex(8192);

            let data: Vec<u8> = (0..2500u32).map(|i| i as u8).collect();
            acc.send(&mut a, &data).await.unwrap();
            assert_eq!(acc.counters().unwrap().0, 3);

            let mut received = Vec::new();
            let mut buf = [0u8; 4096];
            while received.len() < data.len() {
                let n = controller.receive(&mut b, &mut buf).await.unwrap();
                received.extend_from_slice(&buf[..n]);
            }
            assert_eq!(received, data);
            assert_eq!(controller.counters().unwrap().1, 3);
        }

        #[tokio::test]
        async fn wire_format_is_le_length_then_sealed() {
            let (mut acc, _) = established_pair();
            let (mut a, mut b) = duplex(4096);
            acc.send(&mut a, b"hello").await.unwrap();
            drop(a);

            let mut wire = Vec::new();
            b.read_to_end(&mut wire).await.unwrap();
            assert_eq!(wire.len(), LENGTH_LEN + 5 + TAG_LEN);
            assert_eq!(&wire[..2], &[5, 0]);
        }

        #[tokio::test]
        async fn small_reads_drain_queue_before_next_frame() {
            let (mut acc, mut controller) = established_pair();
            let (mut a, mut b) = duplex(4096);
            acc.send(&mut a, b"first-frame").await.unwrap();
            acc.send(&mut a, b"second").await.unwrap();

            let mut buf = [0u8; 4];
            let n = controller.receive(&mut b, &mut buf).await.unwrap();
            assert_eq!(&buf[..n], b"firs");
            assert_eq!(controller.pending_len(), 7);

            let mut rest = Vec::new();
            while controller.pending_len() > 0 {
                let n = controller.receive(&mut b, &mut buf).await.unwrap();
                rest.extend_from_slice(&buf[..n]);
            }
            assert_eq!(rest, b"t-frame");
            // second frame not touched until the queue drained
            assert_eq!(controller.counters().unwrap().1, 1);

            let mut buf = [0u8; 16];
            let n = controller.receive(&mut b, &mut buf).await.unwrap();
            assert_eq!(&buf[..n], b"second");
        }

        #[tokio::test]
        async fn trickled_frame_reassembles() {
            let (mut acc, mut controller) = established_pair();
            let (mut a, mut wire_in) = duplex(4096);
            acc.send(&mut a, b"one byte at a time").await.unwrap();
            drop(a);
            let mut wire = Vec::new();
            wire_in.read_to_end(&mut wire).await.unwrap();

            let (mut tx, mut rx) = duplex(1);
            let writer = tokio::spawn(async move {
                for byte in wire {
                    tx.write_all(&[byte]).await.unwrap();
                }
            });

            let mut buf = [0u8; 64];
            let n = controller.receive(&mut rx, &mut buf).await.unwrap();
            assert_eq!(&buf[..n], b"one byte at a time");
            writer.await.unwrap();
        }

        #[tokio::test]
        async fn tampered_frame_is_authentication_and_keeps_counter() {
            let (mut acc, mut controller) = established_pair();
            let (mut a, mut wire_in) = duplex(4096);
            acc.send(&mut a, b"payload").await.unwrap();
            drop(a);
            let mut wire = Vec::new();
            wire_in.read_to_end(&mut wire).await.unwrap();
            wire[4] ^= 0x01;

            let mut buf = [0u8; 64];
            let err = controller
                .receive(&mut wire.as_slice(), &mut buf)
                .await
                .unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Authentication);
            assert_eq!(controller.counters().unwrap().1, 0);
        }

        #[tokio::test]
        async fn truncated_frame_is_connection_error() {
            let (mut acc, mut controller) = established_pair();
            let (mut a, mut wire_in) = duplex(4096);
            acc.send(&mut a, b"payload").await.unwrap();
            drop(a);
            let mut wire = Vec::new();
            wire_in.read_to_end(&mut wire).await.unwrap();
            wire.truncate(wire.len() - 3);

            let mut buf = [0u8; 64];
            let err = controller
                .receive(&mut wire.as_slice(), &mut buf)
                .await
                .unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Connection);
        }
    }

    mod nonces {
        use super::*;

        #[tokio::test]
        async fn failed_write_still_spends_counter() {
            let (mut acc, mut controller) = established_pair();

            let err = acc.send(&mut BrokenPipe, b"lost").await.unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Connection);
            assert_eq!(acc.counters().unwrap().0, 1);

            // the next frame uses counter 1, which the peer cannot open at 0
            let (mut a, mut b) = duplex(4096);
            acc.send(&mut a, b"next").await.unwrap();
            assert_eq!(acc.counters().unwrap().0, 2);
            let mut buf = [0u8; 16];
            assert!(controller.receive(&mut b, &mut buf).await.is_err());
        }

        #[tokio::test]
        async fn swapped_keys_fail_first_decrypt() {
            let shared = [0x42u8; 32];
            let mut acc = SecuritySession::new(TIMEOUT);
            let mut wrong = SecuritySession::new(TIMEOUT);
            acc.install_keys(SessionKeys::derive_accessory_keys(&shared).unwrap())
                .unwrap();
            wrong
                .install_keys(SessionKeys::derive_accessory_keys(&shared).unwrap())
                .unwrap();

            let (mut a, mut b) = duplex(4096);
            acc.send(&mut a, b"hello").await.unwrap();
            let mut buf = [0u8; 16];
            let err = wrong.receive(&mut b, &mut buf).await.unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Authentication);
        }

        #[test]
        fn keys_install_once() {
            let (mut acc, _) = established_pair();
            let again = SessionKeys::derive_accessory_keys(&[1u8; 32]).unwrap();
            assert!(matches!(acc.install_keys(again), Err(Error::Param(_))));
        }
    }
}
