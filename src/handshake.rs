//! # Opening Handshake
//!
//! Upgrades a plain TCP connection to a WebSocket by answering the client's HTTP
//! `GET` with `101 Switching Protocols`.
//!
//! ## Steps:
//! 1. **Read** the request header block, up to the configured buffer size
//! 2. **Parse** `Key: Value` lines (the request line is skipped)
//! 3. **Derive** `Sec-WebSocket-Accept` = base64(sha1(key + GUID))
//! 4. **Reply** with the fixed 101 response
//!
//! Only `Sec-WebSocket-Key` is required. Header names keep the case they were
//! sent in; lookups try the exact spelling first. No routing, sub-protocol or
//! extension negotiation takes place.

use crate::error::HandshakeError;
use base64::{engine::general_purpose::STANDARD, Engine};
use sha1::{Digest, Sha1};
use std::collections::HashMap;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Fixed GUID appended to the client key (RFC 6455 section 1.3).
pub const WEBSOCKET_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

pub const KEY_HEADER: &str = "Sec-WebSocket-Key";

/// Request headers, keyed exactly as the client spelled them.
pub type Headers = HashMap<String, String>;

/// Transient state of one upgrade exchange.
#[derive(Debug, Clone)]
pub struct Handshake {
    pub headers: Headers,
    pub accept_key: String,
}

impl Handshake {
    /// The full 101 response for this exchange.
    pub fn response(&self) -> String {
        build_response(&self.accept_key)
    }
}

/// Parse the header lines of an HTTP request.
///
/// The first line is the request line and is skipped. Lines without a colon are
/// ignored, and a repeated key keeps its last value. Whitespace around both the
/// name and the value is dropped; the name's case is kept.
pub fn parse_headers(request: &str) -> Headers {
    request
        .lines()
        .skip(1)
        .filter_map(|line| line.split_once(':'))
        .map(|(key, value)| (key.trim().to_string(), value.trim().to_string()))
        .collect()
}

/// Derive `Sec-WebSocket-Accept` from the client's `Sec-WebSocket-Key`.
pub fn compute_accept_key(client_key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(client_key.as_bytes());
    hasher.update(WEBSOCKET_GUID.as_bytes());
    STANDARD.encode(hasher.finalize())
}

pub fn build_response(accept_key: &str) -> String {
    format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {accept_key}\r\n\r\n"
    )
}

/// Look up a header by its exact spelling, falling back to an ASCII
/// case-insensitive match since HTTP field names are case-insensitive.
pub fn find_header<'a>(headers: &'a Headers, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .or_else(|| {
            headers
                .iter()
                .find(|(key, _)| key.eq_ignore_ascii_case(name))
                .map(|(_, value)| value)
        })
        .map(String::as_str)
}

/// Validate an upgrade request and derive its accept key.
pub fn negotiate(request: &str) -> Result<Handshake, HandshakeError> {
    let request_line = request.lines().next().unwrap_or_default();
    if request_line.trim().is_empty() {
        return Err(HandshakeError::Malformed("missing request line".to_string()));
    }

    let headers = parse_headers(request);
    let accept_key = match find_header(&headers, KEY_HEADER) {
        Some(key) if !key.is_empty() => compute_accept_key(key),
        _ => return Err(HandshakeError::MissingKey),
    };

    Ok(Handshake { headers, accept_key })
}

/// Read one request header block (through the blank line) from `reader`.
///
/// At most `limit` bytes are consumed. Anything the client sent after the blank
/// line stays buffered in `reader` for the frame reader.
pub async fn read_request<R>(reader: &mut R, limit: usize) -> Result<String, HandshakeError>
where
    R: AsyncBufRead + Unpin,
{
    let mut limited = (&mut *reader).take(limit as u64);
    let mut request = String::new();

    loop {
        let mut line = Vec::new();
        if limited.read_until(b'\n', &mut line).await? == 0 {
            if limited.limit() == 0 {
                return Err(HandshakeError::RequestTooLarge { limit });
            }
            return Err(HandshakeError::ConnectionClosed);
        }

        let line = String::from_utf8(line)
            .map_err(|_| HandshakeError::Malformed("request is not valid UTF-8".to_string()))?;
        let blank = line == "\r\n" || line == "\n";
        request.push_str(&line);
        if blank {
            return Ok(request);
        }
    }
}

/// Run the whole exchange: read, negotiate, and send the 101 response.
pub async fn perform_handshake<R, W>(reader: &mut R, writer: &mut W, limit: usize) -> Result<Handshake, HandshakeError>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let request = read_request(reader, limit).await?;
    let handshake = negotiate(&request)?;

    writer.write_all(handshake.response().as_bytes()).await?;
    writer.flush().await?;

    Ok(handshake)
}
