//! Engine.IO v4 wire codec.
//!
//! Three encodings share the same packet model:
//!
//! - **Text frame**: one type digit `0`..`6` followed by the UTF-8 body.
//!   Binary bodies on a text-only carrier become `b` + base-64, with no
//!   type digit (`MESSAGE` is implied).
//! - **Payload** (long-polling): text frames joined with the U+001E
//!   record separator.
//! - **Stream frame** (length-prefixed carriers): a header byte holding
//!   a binary flag and a 7-bit length, with 126/127 escapes selecting a
//!   16-bit or 64-bit big-endian extended length, followed by the frame
//!   body.
//!
//! Raw binary frames (WebSocket binary messages, stream frames with the
//! binary flag) decode to a binary `MESSAGE` packet.

// ============================================================================
// Imports
// ============================================================================

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use bytes::Bytes;

use crate::error::{Error, Result};
use crate::packet::{Packet, PacketType, RawData};

// ============================================================================
// Constants
// ============================================================================

/// Record separator between packets in a polling payload.
pub const RECORD_SEPARATOR: char = '\u{1e}';

/// Marker prefix for base-64 encoded binary bodies in text frames.
const BASE64_PREFIX: char = 'b';

// ============================================================================
// Packet Encoding
// ============================================================================

/// Encodes a single packet for a carrier that frames packets itself
/// (WebSocket messages, stream frames).
///
/// With `supports_binary`, binary bodies pass through as raw bytes and
/// the type is implied; otherwise they are base-64 encoded into a text
/// frame.
#[must_use]
pub fn encode_packet(packet: &Packet, supports_binary: bool) -> RawData {
    match &packet.data {
        Some(RawData::Binary(bytes)) if supports_binary => RawData::Binary(bytes.clone()),
        Some(RawData::Binary(bytes)) => {
            let mut out = String::with_capacity(2 + bytes.len().div_ceil(3) * 4);
            out.push(BASE64_PREFIX);
            BASE64.encode_string(bytes, &mut out);
            RawData::Text(out)
        }
        Some(RawData::Text(text)) => {
            let mut out = String::with_capacity(1 + text.len());
            out.push(packet.ptype.code() as char);
            out.push_str(text);
            RawData::Text(out)
        }
        None => RawData::Text((packet.ptype.code() as char).to_string()),
    }
}

/// Decodes a single frame into a packet.
///
/// Raw binary frames always decode to a binary `MESSAGE`.
pub fn decode_packet(frame: RawData) -> Result<Packet> {
    match frame {
        RawData::Binary(bytes) => Ok(Packet::new(PacketType::Message, bytes)),
        RawData::Text(text) => decode_text_frame(&text),
    }
}

fn decode_text_frame(frame: &str) -> Result<Packet> {
    let mut chars = frame.chars();
    let tag = chars
        .next()
        .ok_or_else(|| Error::decode("empty frame"))?;

    if tag == BASE64_PREFIX {
        let bytes = BASE64
            .decode(chars.as_str())
            .map_err(|e| Error::decode(format!("invalid base64 body: {e}")))?;
        return Ok(Packet::new(PacketType::Message, Bytes::from(bytes)));
    }

    let ptype = PacketType::from_code(tag as u8)
        .ok_or_else(|| Error::decode(format!("unknown packet type {tag:?}")))?;
    let rest = chars.as_str();

    Ok(if rest.is_empty() {
        Packet::empty(ptype)
    } else {
        Packet::new(ptype, rest)
    })
}

// ============================================================================
// Payload Encoding
// ============================================================================

/// Encodes a batch of packets into a polling payload.
///
/// Polling is a text-only carrier, so binary bodies go through the
/// base-64 path.
#[must_use]
pub fn encode_payload(packets: &[Packet]) -> String {
    let mut out = String::new();
    for (i, packet) in packets.iter().enumerate() {
        if i > 0 {
            out.push(RECORD_SEPARATOR);
        }
        match encode_packet(packet, false) {
            RawData::Text(text) => out.push_str(&text),
            // unreachable with supports_binary = false
            RawData::Binary(_) => {}
        }
    }
    out
}

/// Decodes a polling payload into its packet sequence.
pub fn decode_payload(payload: &str) -> Result<Vec<Packet>> {
    if payload.is_empty() {
        return Ok(Vec::new());
    }

    payload
        .split(RECORD_SEPARATOR)
        .map(decode_text_frame)
        .collect()
}

// ============================================================================
// Stream Frames
// ============================================================================

/// Parsed stream frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// The frame body is binary.
    pub binary: bool,
    /// Extended length encoding selected by the first byte.
    pub length: FrameLength,
}

/// Length field of a stream frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameLength {
    /// Length fits the 7 low bits of the header byte.
    Short(u8),
    /// Followed by a 16-bit big-endian length.
    Extended16,
    /// Followed by a 64-bit big-endian length.
    Extended64,
}

/// Encodes the body of a packet for a length-prefixed stream.
///
/// Text frames become their UTF-8 bytes; binary message bodies stay raw.
/// Returns the body and whether the binary flag must be set.
#[must_use]
pub fn encode_frame_body(packet: &Packet) -> (Bytes, bool) {
    match encode_packet(packet, true) {
        RawData::Binary(bytes) => (bytes, true),
        RawData::Text(text) => (Bytes::from(text.into_bytes()), false),
    }
}

/// Encodes a stream frame header for a body of `len` bytes.
#[must_use]
pub fn encode_frame_header(len: usize, binary: bool) -> Vec<u8> {
    let flag = if binary { 0x80u8 } else { 0x00 };
    if len < 126 {
        vec![flag | len as u8]
    } else if len < 65536 {
        let mut header = vec![flag | 126];
        header.extend_from_slice(&(len as u16).to_be_bytes());
        header
    } else {
        let mut header = vec![flag | 127];
        header.extend_from_slice(&(len as u64).to_be_bytes());
        header
    }
}

/// Parses the first byte of a stream frame header.
#[must_use]
pub fn decode_frame_header(byte: u8) -> FrameHeader {
    let binary = byte & 0x80 != 0;
    let length = match byte & 0x7f {
        126 => FrameLength::Extended16,
        127 => FrameLength::Extended64,
        n => FrameLength::Short(n),
    };
    FrameHeader { binary, length }
}

/// Decodes a stream frame body read off the wire.
pub fn decode_frame_body(body: Bytes, binary: bool) -> Result<Packet> {
    if binary {
        return Ok(Packet::new(PacketType::Message, body));
    }
    let text = String::from_utf8(body.to_vec())
        .map_err(|e| Error::decode(format!("invalid utf-8 frame: {e}")))?;
    decode_text_frame(&text)
}

// ============================================================================
// Tests
// ============================================================================
