//! Request heads, responses and event messages.

use hap_core::error::{Error, ParseError, Result};
use tokio::io::AsyncWrite;

use crate::session::SecuritySession;

pub const CONTENT_TYPE_HAP_JSON: &str = "application/hap+json";
pub const CONTENT_TYPE_PAIRING_TLV8: &str = "application/pairing+tlv8";

/// Parsed request line and headers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    pub method: String,
    pub path: String,
    pub headers: Vec<(String, String)>,
}

impl RequestHead {
    /// Parse the bytes before the blank line.
    ///
    /// ```text
    /// POST /pair-setup HTTP/1.1\r\n
    /// Content-Length: 6\r\n
    /// ```
    pub fn parse(head: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(head)
            .map_err(|_| ParseError::InvalidFormat("request head is not UTF-8".to_string()))?;
        let mut lines = text.split("\r\n");

        let request_line = lines
            .next()
            .filter(|l| !l.is_empty())
            .ok_or(ParseError::MissingField("request line"))?;
        let mut parts = request_line.split(' ');
        let (Some(method), Some(path), Some(version)) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(ParseError::InvalidFormat(format!(
                "malformed request line: {}",
                request_line
            ))
            .into());
        };
        if !version.starts_with("HTTP/") {
            return Err(ParseError::InvalidFormat(format!("unknown version: {}", version)).into());
        }

        let mut headers = Vec::new();
        for line in lines.filter(|l| !l.is_empty()) {
            let (key, value) = line
                .split_once(':')
                .ok_or_else(|| ParseError::InvalidFormat(format!("malformed header: {}", line)))?;
            headers.push((key.trim().to_string(), value.trim().to_string()));
        }

        Ok(Self {
            method: method.to_string(),
            path: path.to_string(),
            headers,
        })
    }

    /// Header value (case-insensitive).
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Declared body length, zero when absent.
    pub fn content_length(&self) -> Result<usize> {
        match self.header("Content-Length") {
            None => Ok(0),
            Some(v) => v.parse().map_err(|_| {
                ParseError::InvalidValue(format!("Content-Length: {}", v)).into()
            }),
        }
    }

    pub fn content_type(&self) -> Option<&str> {
        self.header("Content-Type")
    }
}

/// Body of a complete request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestBody {
    Bytes(Vec<u8>),
    /// Streamed to the firmware sink; only the length is kept.
    Firmware { len: usize },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub head: RequestHead,
    pub body: RequestBody,
}

impl Request {
    pub fn path(&self) -> &str {
        &self.head.path
    }

    /// In-memory body, empty for firmware uploads.
    pub fn bytes(&self) -> &[u8] {
        match &self.body {
            RequestBody::Bytes(b) => b,
            RequestBody::Firmware { .. } => &[],
        }
    }
}

/// A response to hand back to the controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status: u16,
    pub content_type: String,
    pub body: Vec<u8>,
}

impl Response {
    pub fn new(status: u16, content_type: impl Into<String>, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            content_type: content_type.into(),
            body: body.into(),
        }
    }

    /// Status without a body.
    pub fn empty(status: u16) -> Self {
        Self::new(status, CONTENT_TYPE_HAP_JSON, Vec::new())
    }

    pub fn json(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self::new(status, CONTENT_TYPE_HAP_JSON, body)
    }

    pub fn tlv8(body: impl Into<Vec<u8>>) -> Self {
        Self::new(200, CONTENT_TYPE_PAIRING_TLV8, body)
    }

    pub fn encode(&self) -> Vec<u8> {
        encode_response(self.status, &self.content_type, &self.body)
    }
}

pub fn reason_phrase(status: u16) -> &'static str {
    match status {
        200 => "OK",
        204 => "No Content",
        207 => "Multi-Status",
        400 => "Bad Request",
        404 => "Not Found",
        405 => "Method Not Allowed",
        413 => "Payload Too Large",
        422 => "Unprocessable Entity",
        429 => "Too Many Requests",
        470 => "Connection Authorization Required",
        500 => "Internal Server Error",
        503 => "Service Unavailable",
        _ => "Unknown",
    }
}

pub fn encode_response(status: u16, content_type: &str, body: &[u8]) -> Vec<u8> {
    let mut head = format!("HTTP/1.1 {} {}\r\n", status, reason_phrase(status));
    if !body.is_empty() {
        head.push_str(&format!("Content-Type: {}\r\n", content_type));
    }
    head.push_str(&format!("Content-Length: {}\r\n\r\n", body.len()));

    let mut out = head.into_bytes();
    out.extend_from_slice(body);
    out
}

/// `EVENT/1.0 200 OK`, with the JSON headers only when there is a payload.
pub fn encode_event(payload: &[u8]) -> Vec<u8> {
    if payload.is_empty() {
        return b"EVENT/1.0 200 OK\r\n\r\n".to_vec();
    }
    let mut out = format!(
        "EVENT/1.0 200 OK\r\nContent-Type: {}\r\nContent-Length: {}\r\n\r\n",
        CONTENT_TYPE_HAP_JSON,
        payload.len()
    )
    .into_bytes();
    out.extend_from_slice(payload);
    out
}

pub async fn send_response<W>(
    session: &mut SecuritySession,
    stream: &mut W,
    status: u16,
    content_type: &str,
    body: &[u8],
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    tracing::debug!(status, len = body.len(), "Sending response");
    session
        .send(stream, &encode_response(status, content_type, body))
        .await
}

/// Push an unsolicited event. Refused, with nothing written, before the
/// session is established.
pub async fn send_event<W>(session: &mut SecuritySession, stream: &mut W, payload: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    if !session.is_established() {
        return Err(Error::NotEstablished);
    }
    tracing::debug!(len = payload.len(), "Sending event");
    session.send(stream, &encode_event(payload)).await
}
