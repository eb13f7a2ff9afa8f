//! # WebSocket Frame Codec
//!
//! Pure functions that turn raw bytes into frames and back. Nothing in this module
//! touches shared state; the only I/O is [`read_frame`], which pulls exactly one
//! frame's worth of bytes off a stream and hands them to the pure decoder.
//!
//! ## Wire Layout:
//! ```text
//!  byte 0      byte 1        extended length     mask        payload
//! +--------+--------------+-------------------+-----------+-------------+
//! |FIN|op  |MASK| len (7) | 0, 2 or 8 bytes   | 4 bytes   | len bytes   |
//! +--------+--------------+-------------------+-----------+-------------+
//! ```
//! The 7-bit length field selects the size class:
//! - **0..=125**: the length itself, mask at bytes 2..6, payload from byte 6
//! - **126**: 16-bit big-endian length at 2..4, mask at 4..8, payload from byte 8
//! - **127**: 64-bit big-endian length at 2..10, mask at 10..14, payload from byte 14
//!
//! Client frames are always masked, so the mask position is taken from the size
//! class alone; the MASK bit is not consulted. Server frames are never masked.
//!
//! ## Opcodes:
//! Only text frames carry messages. Close ends the session, Ping/Pong are ignored
//! by the connection handler, and everything else (binary, continuation, reserved)
//! is rejected. Fragmented messages are not reassembled.

use crate::error::FrameDecodeError;
use byteorder::{BigEndian, ByteOrder};
use tokio::io::{AsyncRead, AsyncReadExt};

/// Largest payload that fits the single-byte length form.
pub const MAX_SHORT_PAYLOAD: usize = 125;

/// Largest payload that fits the 16-bit extended length form.
pub const MAX_MEDIUM_PAYLOAD: usize = 65_535;

/// Longest possible client frame header: 2 + 8 extended length + 4 mask.
pub const MAX_HEADER_LEN: usize = 14;

const FIN_BIT: u8 = 0x80;
const MASK_BIT: u8 = 0x80;

/// Close status sent to peers when the server shuts down.
pub const CLOSE_GOING_AWAY: u16 = 1001;

/// Frame opcode (low nibble of byte 0).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
    Reserved(u8),
}

impl Opcode {
    pub fn from_byte(byte: u8) -> Self {
        match byte & 0x0F {
            0x0 => Opcode::Continuation,
            0x1 => Opcode::Text,
            0x2 => Opcode::Binary,
            0x8 => Opcode::Close,
            0x9 => Opcode::Ping,
            0xA => Opcode::Pong,
            other => Opcode::Reserved(other),
        }
    }

    pub fn as_byte(self) -> u8 {
        match self {
            Opcode::Continuation => 0x0,
            Opcode::Text => 0x1,
            Opcode::Binary => 0x2,
            Opcode::Close => 0x8,
            Opcode::Ping => 0x9,
            Opcode::Pong => 0xA,
            Opcode::Reserved(other) => other,
        }
    }

    /// Control frames (close, ping, pong) never carry application data.
    pub fn is_control(self) -> bool {
        matches!(self, Opcode::Close | Opcode::Ping | Opcode::Pong)
    }
}

/// Parsed fixed part of a client frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub fin: bool,
    pub opcode: Opcode,
    pub payload_len: u64,
    pub mask: [u8; 4],
    /// Bytes before the payload: 6, 8 or 14.
    pub header_len: usize,
}

/// One decoded frame with its payload already unmasked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub opcode: Opcode,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn payload_len(&self) -> usize {
        self.payload.len()
    }

    /// Interpret the frame as a text message.
    ///
    /// ## Returns:
    /// - **Ok(text)** for a text frame with valid UTF-8
    /// - **Err(ConnectionClosed)** for a close frame
    /// - **Err(UnsupportedOpcode)** for anything else
    pub fn into_text(self) -> Result<String, FrameDecodeError> {
        match self.opcode {
            Opcode::Text => String::from_utf8(self.payload).map_err(FrameDecodeError::InvalidUtf8),
            Opcode::Close => Err(FrameDecodeError::ConnectionClosed),
            other => Err(FrameDecodeError::UnsupportedOpcode(other.as_byte())),
        }
    }
}

/// Header length implied by the 7-bit length field of a masked client frame.
pub fn header_len_for(len_field: u8) -> usize {
    match len_field & 0x7F {
        126 => 8,
        127 => MAX_HEADER_LEN,
        _ => 6,
    }
}

/// Parse the header of a client frame.
///
/// Only the bytes the header needs are examined; the payload may or may not
/// be present in `buf`.
pub fn parse_header(buf: &[u8]) -> Result<FrameHeader, FrameDecodeError> {
    if buf.is_empty() {
        return Err(FrameDecodeError::ConnectionClosed);
    }
    if buf.len() < 2 {
        return Err(FrameDecodeError::Truncated { needed: 2, available: buf.len() });
    }

    let len_field = buf[1] & 0x7F;
    let header_len = header_len_for(len_field);
    if buf.len() < header_len {
        return Err(FrameDecodeError::Truncated { needed: header_len, available: buf.len() });
    }

    let (payload_len, mask_at) = match len_field {
        126 => (u64::from(BigEndian::read_u16(&buf[2..4])), 4),
        127 => (BigEndian::read_u64(&buf[2..10]), 10),
        short => (u64::from(short), 2),
    };

    let mut mask = [0u8; 4];
    mask.copy_from_slice(&buf[mask_at..mask_at + 4]);

    Ok(FrameHeader {
        fin: buf[0] & FIN_BIT != 0,
        opcode: Opcode::from_byte(buf[0]),
        payload_len,
        mask,
        header_len,
    })
}

/// XOR every byte with `mask[i % 4]`. Applying it twice restores the input.
pub fn apply_mask(payload: &mut [u8], mask: [u8; 4]) {
    for (i, byte) in payload.iter_mut().enumerate() {
        *byte ^= mask[i % 4];
    }
}

/// Decode one client frame from `buf`.
///
/// Bytes after the declared payload are ignored.
pub fn decode_frame(buf: &[u8]) -> Result<Frame, FrameDecodeError> {
    let header = parse_header(buf)?;

    let payload_len = usize::try_from(header.payload_len).map_err(|_| FrameDecodeError::FrameTooLarge {
        declared: header.payload_len,
        limit: usize::MAX,
    })?;
    let end = header
        .header_len
        .checked_add(payload_len)
        .ok_or(FrameDecodeError::FrameTooLarge { declared: header.payload_len, limit: usize::MAX })?;
    if buf.len() < end {
        return Err(FrameDecodeError::Truncated { needed: end, available: buf.len() });
    }

    let mut payload = buf[header.header_len..end].to_vec();
    apply_mask(&mut payload, header.mask);

    Ok(Frame { opcode: header.opcode, payload })
}

/// Decode a client text frame into its message.
pub fn decode(buf: &[u8]) -> Result<String, FrameDecodeError> {
    decode_frame(buf)?.into_text()
}

/// Append byte 1 (with `mask_bit`) and any extended length for `len`.
fn push_length(out: &mut Vec<u8>, len: usize, mask_bit: u8) {
    if len <= MAX_SHORT_PAYLOAD {
        out.push(mask_bit | len as u8);
    } else if len <= MAX_MEDIUM_PAYLOAD {
        let mut ext = [0u8; 2];
        BigEndian::write_u16(&mut ext, len as u16);
        out.push(mask_bit | 126);
        out.extend_from_slice(&ext);
    } else {
        let mut ext = [0u8; 8];
        BigEndian::write_u64(&mut ext, len as u64);
        out.push(mask_bit | 127);
        out.extend_from_slice(&ext);
    }
}

fn encode_unmasked(opcode: Opcode, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 10);
    out.push(FIN_BIT | opcode.as_byte());
    push_length(&mut out, payload.len(), 0);
    out.extend_from_slice(payload);
    out
}

/// Encode a server-to-client text frame: `0x81`, length, unmasked payload.
pub fn encode(text: &str) -> Vec<u8> {
    encode_unmasked(Opcode::Text, text.as_bytes())
}

/// Encode a server close frame, optionally carrying a status code.
pub fn encode_close(code: Option<u16>) -> Vec<u8> {
    match code {
        Some(code) => {
            let mut status = [0u8; 2];
            BigEndian::write_u16(&mut status, code);
            encode_unmasked(Opcode::Close, &status)
        }
        None => encode_unmasked(Opcode::Close, &[]),
    }
}

/// Encode a masked client-to-server text frame.
pub fn encode_masked(text: &str, mask: [u8; 4]) -> Vec<u8> {
    let payload = text.as_bytes();
    let mut out = Vec::with_capacity(payload.len() + MAX_HEADER_LEN);
    out.push(FIN_BIT | Opcode::Text.as_byte());
    push_length(&mut out, payload.len(), MASK_BIT);
    out.extend_from_slice(&mask);

    let start = out.len();
    out.extend_from_slice(payload);
    apply_mask(&mut out[start..], mask);
    out
}

/// Read exactly one client frame from `reader` and decode it.
///
/// A zero-length read before the first byte is an orderly close. Frames whose
/// declared payload exceeds `max_frame_size` are rejected before the payload is
/// read.
pub async fn read_frame<R>(reader: &mut R, max_frame_size: usize) -> Result<Frame, FrameDecodeError>
where
    R: AsyncRead + Unpin,
{
    let mut head = [0u8; MAX_HEADER_LEN];
    if reader.read(&mut head[..1]).await? == 0 {
        return Err(FrameDecodeError::ConnectionClosed);
    }
    reader.read_exact(&mut head[1..2]).await?;

    let header_len = header_len_for(head[1]);
    reader.read_exact(&mut head[2..header_len]).await?;
    let header = parse_header(&head[..header_len])?;

    if header.payload_len > max_frame_size as u64 {
        return Err(FrameDecodeError::FrameTooLarge { declared: header.payload_len, limit: max_frame_size });
    }
    let payload_len = header.payload_len as usize;

    let mut raw = Vec::with_capacity(header_len + payload_len);
    raw.extend_from_slice(&head[..header_len]);
    raw.resize(header_len + payload_len, 0);
    reader.read_exact(&mut raw[header_len..]).await?;

    decode_frame(&raw)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MASK: [u8; 4] = [0x37, 0xfa, 0x21, 0x3d];

    #[test]
    fn test_rfc_single_frame_masked_hello() {
        // Example from RFC 6455 section 5.7.
        let raw = [0x81, 0x85, 0x37, 0xfa, 0x21, 0x3d, 0x7f, 0x9f, 0x4d, 0x51, 0x58];
        assert_eq!(decode(&raw).unwrap(), "Hello");
        assert_eq!(encode_masked("Hello", MASK), raw.to_vec());
    }

    #[test]
    fn test_encode_unmasked_hello() {
        assert_eq!(encode("Hello"), vec![0x81, 0x05, b'H', b'e', b'l', b'l', b'o']);
        assert_eq!(encode(""), vec![0x81, 0x00]);
    }

    #[test]
    fn test_length_class_boundaries() {
        for (len, marker, header_len) in [
            (0usize, 0u8, 2usize),
            (125, 125, 2),
            (126, 126, 4),
            (127, 126, 4),
            (65_535, 126, 4),
            (65_536, 127, 10),
        ] {
            let text = "a".repeat(len);

            let server = encode(&text);
            assert_eq!(server[0], 0x81);
            assert_eq!(server[1], marker, "server marker for len {len}");
            assert_eq!(server.len(), header_len + len);

            let client = encode_masked(&text, MASK);
            assert_eq!(client[1] & 0x7F, marker, "client marker for len {len}");
            assert_eq!(client[1] & 0x80, 0x80);
            let header = parse_header(&client).unwrap();
            assert_eq!(header.payload_len, len as u64);
            assert_eq!(header.header_len, header_len + 4);
            assert_eq!(decode(&client).unwrap(), text);
        }
    }

    #[test]
    fn test_extended_length_is_big_endian() {
        let frame = encode(&"x".repeat(300));
        assert_eq!(&frame[2..4], &[0x01, 0x2C]);

        let frame = encode(&"x".repeat(70_000));
        assert_eq!(&frame[2..10], &[0, 0, 0, 0, 0, 0x01, 0x11, 0x70]);
    }

    #[test]
    fn test_masked_round_trip_multibyte() {
        let samples = [
            String::new(),
            "plain ascii".to_string(),
            "héllo wörld ✓ 日本語 🦀".to_string(),
            "ü".repeat(40_000),
        ];
        for mask in [[0, 0, 0, 0], MASK, [0xff, 0x01, 0x80, 0x7f]] {
            for text in &samples {
                assert_eq!(&decode(&encode_masked(text, mask)).unwrap(), text);
            }
        }
    }

    #[test]
    fn test_mask_bit_not_consulted() {
        let mut raw = encode_masked("hi", MASK);
        raw[1] &= 0x7F;
        assert_eq!(decode(&raw).unwrap(), "hi");
    }

    #[test]
    fn test_trailing_bytes_ignored() {
        let mut raw = encode_masked("one", MASK);
        raw.extend_from_slice(&encode_masked("two", MASK));
        assert_eq!(decode(&raw).unwrap(), "one");
    }

    #[test]
    fn test_empty_buffer_is_connection_closed() {
        assert!(matches!(decode(&[]), Err(FrameDecodeError::ConnectionClosed)));
    }

    #[test]
    fn test_truncated_frames() {
        assert!(matches!(decode(&[0x81]), Err(FrameDecodeError::Truncated { needed: 2, available: 1 })));

        // 126 marker but no room for extended length and mask.
        assert!(matches!(
            decode(&[0x81, 0xFE, 0x00]),
            Err(FrameDecodeError::Truncated { needed: 8, available: 3 })
        ));

        let raw = encode_masked("truncate me", MASK);
        assert!(matches!(
            decode(&raw[..raw.len() - 3]),
            Err(FrameDecodeError::Truncated { .. })
        ));
    }

    #[test]
    fn test_opcode_handling() {
        let mut raw = encode_masked("bin", MASK);
        raw[0] = 0x82;
        assert!(matches!(decode(&raw), Err(FrameDecodeError::UnsupportedOpcode(0x2))));

        raw[0] = 0x88;
        assert!(matches!(decode(&raw), Err(FrameDecodeError::ConnectionClosed)));

        raw[0] = 0x89;
        let frame = decode_frame(&raw).unwrap();
        assert_eq!(frame.opcode, Opcode::Ping);
        assert!(frame.opcode.is_control());
        assert_eq!(frame.payload, b"bin");

        assert_eq!(Opcode::from_byte(0x83), Opcode::Reserved(0x3));
    }

    #[test]
    fn test_invalid_utf8() {
        let mut raw = vec![0x81, 0x82, 0, 0, 0, 0];
        raw.extend_from_slice(&[0xC3, 0x28]);
        assert!(matches!(decode(&raw), Err(FrameDecodeError::InvalidUtf8(_))));
    }

    #[test]
    fn test_encode_close() {
        assert_eq!(encode_close(None), vec![0x88, 0x00]);
        assert_eq!(encode_close(Some(CLOSE_GOING_AWAY)), vec![0x88, 0x02, 0x03, 0xE9]);
    }

    #[tokio::test]
    async fn test_read_frame_sequence_from_stream() {
        let mut wire = encode_masked("first", MASK);
        wire.extend_from_slice(&encode_masked(&"é".repeat(100), MASK));
        wire.extend_from_slice(&encode_masked("last", [1, 2, 3, 4]));

        let mut reader: &[u8] = &wire;
        assert_eq!(read_frame(&mut reader, 1 << 20).await.unwrap().into_text().unwrap(), "first");
        assert_eq!(read_frame(&mut reader, 1 << 20).await.unwrap().into_text().unwrap(), "é".repeat(100));
        assert_eq!(read_frame(&mut reader, 1 << 20).await.unwrap().into_text().unwrap(), "last");
        assert!(read_frame(&mut reader, 1 << 20).await.unwrap_err().is_peer_closed());
    }

    #[tokio::test]
    async fn test_read_frame_split_across_writes() {
        let (mut client, mut server) = tokio::io::duplex(64);
        let wire = encode_masked(&"z".repeat(500), MASK);

        let writer = tokio::spawn(async move {
            use tokio::io::AsyncWriteExt;
            for chunk in wire.chunks(7) {
                client.write_all(chunk).await.unwrap();
            }
        });

        let frame = read_frame(&mut server, 1 << 20).await.unwrap();
        assert_eq!(frame.payload_len(), 500);
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn test_read_frame_rejects_oversized() {
        let wire = encode_masked(&"a".repeat(200), MASK);
        let mut reader: &[u8] = &wire;
        assert!(matches!(
            read_frame(&mut reader, 100).await,
            Err(FrameDecodeError::FrameTooLarge { declared: 200, limit: 100 })
        ));
    }

    #[tokio::test]
    async fn test_read_frame_eof_mid_frame() {
        let wire = encode_masked("cut short", MASK);
        let mut reader: &[u8] = &wire[..8];
        assert!(read_frame(&mut reader, 1024).await.unwrap_err().is_peer_closed());
    }
}
