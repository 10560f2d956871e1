//! Request reader on top of the security session.
//!
//! Headers accumulate in a bounded buffer until the blank line. Bodies are
//! either collected into one exactly sized buffer or, for the firmware content
//! type, streamed through a fixed staging buffer into a [`FirmwareSink`].
//! Bytes that arrive past the end of a request are kept for the next one.

use std::sync::Arc;

use hap_core::error::{Error, Result};
use hap_core::AccessoryConfig;
use tokio::io::AsyncRead;

use crate::http::{Request, RequestBody, RequestHead};
use crate::ota::FirmwareSink;
use crate::session::SecuritySession;

const HEADER_TERMINATOR: &[u8] = b"\r\n\r\n";

/// Reader limits.
#[derive(Debug, Clone)]
pub struct ReaderConfig {
    pub max_header_size: usize,
    pub ota_content_type: String,
    pub ota_staging_size: usize,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self::from(&AccessoryConfig::default())
    }
}

impl From<&AccessoryConfig> for ReaderConfig {
    fn from(config: &AccessoryConfig) -> Self {
        Self {
            max_header_size: config.max_header_size,
            ota_content_type: config.ota_content_type.clone(),
            ota_staging_size: config.ota_staging_size,
        }
    }
}

pub struct FramedReader {
    config: ReaderConfig,
    sink: Option<Arc<dyn FirmwareSink>>,
    /// Bytes read past the end of the previous request.
    carry: Vec<u8>,
    /// Next firmware write offset. Reset at the start of every upload.
    cursor: u32,
}

impl FramedReader {
    pub fn new(config: ReaderConfig, sink: Option<Arc<dyn FirmwareSink>>) -> Self {
        Self {
            config,
            sink,
            carry: Vec::new(),
            cursor: 0,
        }
    }

    /// Whether bytes of a following request are already buffered.
    pub fn has_buffered(&self) -> bool {
        !self.carry.is_empty()
    }

    pub fn cursor(&self) -> u32 {
        self.cursor
    }

    /// Read one complete request.
    ///
    /// An error after the head was parsed leaves the stream mid-body; the
    /// connection cannot be used afterwards.
    pub async fn read_request<R>(
        &mut self,
        session: &mut SecuritySession,
        stream: &mut R,
    ) -> Result<Request>
    where
        R: AsyncRead + Unpin,
    {
        let (head, mut extra) = self.read_head(session, stream).await?;
        let content_length = head.content_length()?;

        let is_firmware = head
            .content_type()
            .is_some_and(|ct| ct.eq_ignore_ascii_case(&self.config.ota_content_type));

        let body = if is_firmware {
            if !session.is_established() {
                return Err(Error::NotEstablished);
            }
            let sink = self
                .sink
                .clone()
                .ok_or_else(|| Error::Unsupported("no firmware sink configured".to_string()))?;
            self.stream_firmware(session, stream, sink.as_ref(), content_length, &mut extra)
                .await?;
            RequestBody::Firmware { len: content_length }
        } else {
            RequestBody::Bytes(
                self.read_body(session, stream, content_length, &mut extra)
                    .await?,
            )
        };

        self.carry = extra;
        tracing::debug!(
            method = %head.method,
            path = %head.path,
            len = content_length,
            "Request read"
        );
        Ok(Request { head, body })
    }

    /// Accumulate until `\r\n\r\n`. Returns the parsed head and any bytes after it.
    async fn read_head<R>(
        &mut self,
        session: &mut SecuritySession,
        stream: &mut R,
    ) -> Result<(RequestHead, Vec<u8>)>
    where
        R: AsyncRead + Unpin,
    {
        let max = self.config.max_header_size;
        let mut buf = std::mem::take(&mut self.carry);
        let mut scanned: usize = 0;
        let mut chunk = vec![0u8; max];

        let end = loop {
            let from = scanned.saturating_sub(HEADER_TERMINATOR.len() - 1);
            if let Some(pos) = find_terminator(&buf[from..]) {
                break from + pos;
            }
            scanned = buf.len();

            if buf.len() >= max {
                return Err(Error::Size(format!("request head exceeds {} bytes", max)));
            }
            let room = max - buf.len();
            let n = session.receive(stream, &mut chunk[..room]).await?;
            buf.extend_from_slice(&chunk[..n]);
        };

        if end + HEADER_TERMINATOR.len() > max {
            return Err(Error::Size(format!("request head exceeds {} bytes", max)));
        }

        let head = RequestHead::parse(&buf[..end])?;
        let extra = buf.split_off(end + HEADER_TERMINATOR.len());
        Ok((head, extra))
    }

    async fn read_body<R>(
        &mut self,
        session: &mut SecuritySession,
        stream: &mut R,
        len: usize,
        extra: &mut Vec<u8>,
    ) -> Result<Vec<u8>>
    where
        R: AsyncRead + Unpin,
    {
        let mut body = Vec::new();
        body.try_reserve_exact(len)
            .map_err(|_| Error::NoMemory(format!("{} byte request body", len)))?;

        let from_extra = len.min(extra.len());
        body.extend(extra.drain(..from_extra));

        body.resize(len, 0);
        let mut filled = from_extra;
        while filled < len {
            filled += session.receive(stream, &mut body[filled..]).await?;
        }
        Ok(body)
    }

    async fn stream_firmware<R>(
        &mut self,
        session: &mut SecuritySession,
        stream: &mut R,
        sink: &dyn FirmwareSink,
        len: usize,
        extra: &mut Vec<u8>,
    ) -> Result<()>
    where
        R: AsyncRead + Unpin,
    {
        let size = self.config.ota_staging_size;
        if size == 0 {
            return Err(Error::Param("firmware staging buffer must be non-zero".to_string()));
        }
        let mut staging = Vec::new();
        staging
            .try_reserve_exact(size)
            .map_err(|_| Error::NoMemory(format!("{} byte firmware staging buffer", size)))?;
        staging.resize(size, 0);

        self.cursor = 0;
        tracing::info!(len, "Receiving firmware image");

        let mut received = 0;
        let mut filled = 0;
        while received < len {
            let want = (len - received).min(size - filled);
            let n = if extra.is_empty() {
                session
                    .receive(stream, &mut staging[filled..filled + want])
                    .await?
            } else {
                let n = want.min(extra.len());
                staging[filled..filled + n].copy_from_slice(&extra[..n]);
                extra.drain(..n);
                n
            };
            filled += n;
            received += n;

            if filled == size {
                sink.write(&mut self.cursor, &staging).await?;
                filled = 0;
            }
        }
        if filled > 0 {
            sink.write(&mut self.cursor, &staging[..filled]).await?;
        }

        tracing::info!(written = self.cursor, "Firmware image stored");
        Ok(())
    }
}

fn find_terminator(buf: &[u8]) -> Option<usize> {
    buf.windows(HEADER_TERMINATOR.len())
        .position(|w| w == HEADER_TERMINATOR)
}
