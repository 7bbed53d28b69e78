//! Engine.IO packet types.
//!
//! A [`Packet`] is the unit of exchange on every transport: a type tag,
//! an optional text or binary body, and per-packet write options.
//!
//! # Packet Types
//!
//! | Type | Code | Direction | Purpose |
//! |------|------|-----------|---------|
//! | `Open` | 0 | server → client | handshake payload |
//! | `Close` | 1 | both | session teardown |
//! | `Ping` | 2 | server → client (client → server while probing) | liveness |
//! | `Pong` | 3 | client → server (server → client while probing) | liveness reply |
//! | `Message` | 4 | both | application data |
//! | `Upgrade` | 5 | client → server | transport hand-over marker |
//! | `Noop` | 6 | server → client | polling cycle release |

// ============================================================================
// Imports
// ============================================================================

use std::fmt;

use bytes::Bytes;
use serde::Deserialize;

// ============================================================================
// PacketType
// ============================================================================

/// Engine.IO v4 packet type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketType {
    /// Handshake packet carrying [`HandshakeData`].
    Open,
    /// Session close.
    Close,
    /// Liveness probe.
    Ping,
    /// Liveness reply.
    Pong,
    /// Application data.
    Message,
    /// Transport upgrade marker.
    Upgrade,
    /// No-op filler, used by the server to release a held poll.
    Noop,
}

impl PacketType {
    /// Returns the wire digit for this packet type.
    #[inline]
    #[must_use]
    pub const fn code(self) -> u8 {
        match self {
            Self::Open => b'0',
            Self::Close => b'1',
            Self::Ping => b'2',
            Self::Pong => b'3',
            Self::Message => b'4',
            Self::Upgrade => b'5',
            Self::Noop => b'6',
        }
    }

    /// Parses a wire digit into a packet type.
    #[inline]
    #[must_use]
    pub const fn from_code(code: u8) -> Option<Self> {
        match code {
            b'0' => Some(Self::Open),
            b'1' => Some(Self::Close),
            b'2' => Some(Self::Ping),
            b'3' => Some(Self::Pong),
            b'4' => Some(Self::Message),
            b'5' => Some(Self::Upgrade),
            b'6' => Some(Self::Noop),
            _ => None,
        }
    }
}

impl fmt::Display for PacketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Open => "open",
            Self::Close => "close",
            Self::Ping => "ping",
            Self::Pong => "pong",
            Self::Message => "message",
            Self::Upgrade => "upgrade",
            Self::Noop => "noop",
        };
        f.write_str(name)
    }
}

// ============================================================================
// RawData
// ============================================================================

/// A packet body: a text stream or a binary stream.
///
/// Binary vs. text is a property of the carried stream and decides the
/// wire framing (binary WebSocket frame vs. text frame, base-64 fallback
/// on text-only carriers).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawData {
    /// UTF-8 text body.
    Text(String),
    /// Opaque binary body.
    Binary(Bytes),
}

impl RawData {
    /// Returns `true` for a binary body.
    #[inline]
    #[must_use]
    pub const fn is_binary(&self) -> bool {
        matches!(self, Self::Binary(_))
    }

    /// Returns the body length in bytes.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Text(text) => text.len(),
            Self::Binary(bytes) => bytes.len(),
        }
    }

    /// Returns `true` when the body is empty.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the text content, if this is a text body.
    #[inline]
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            Self::Binary(_) => None,
        }
    }
}

impl From<&str> for RawData {
    fn from(value: &str) -> Self {
        Self::Text(value.to_owned())
    }
}

impl From<String> for RawData {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<Bytes> for RawData {
    fn from(value: Bytes) -> Self {
        Self::Binary(value)
    }
}

impl From<Vec<u8>> for RawData {
    fn from(value: Vec<u8>) -> Self {
        Self::Binary(Bytes::from(value))
    }
}

// ============================================================================
// PacketOptions
// ============================================================================

/// Per-packet write options.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PacketOptions {
    /// Request per-message compression for this packet.
    ///
    /// Honored only when the connection negotiated per-message-deflate
    /// and the payload meets the configured threshold.
    pub compress: bool,

    /// Pre-encoded frame to write verbatim.
    ///
    /// Fast path for callers that encode once and fan out to many
    /// sockets. Used only when per-message-deflate is off.
    pub pre_encoded_frame: Option<RawData>,
}

// ============================================================================
// Packet
// ============================================================================

/// One Engine.IO packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Packet type tag.
    pub ptype: PacketType,
    /// Optional body.
    pub data: Option<RawData>,
    /// Optional write options.
    pub options: Option<PacketOptions>,
}

impl Packet {
    /// Creates a packet with a body.
    #[inline]
    #[must_use]
    pub fn new(ptype: PacketType, data: impl Into<RawData>) -> Self {
        Self {
            ptype,
            data: Some(data.into()),
            options: None,
        }
    }

    /// Creates a bodyless packet.
    #[inline]
    #[must_use]
    pub const fn empty(ptype: PacketType) -> Self {
        Self {
            ptype,
            data: None,
            options: None,
        }
    }

    /// Creates a MESSAGE packet.
    #[inline]
    #[must_use]
    pub fn message(data: impl Into<RawData>) -> Self {
        Self::new(PacketType::Message, data)
    }

    /// Creates the PING packet used to probe a candidate transport.
    #[inline]
    #[must_use]
    pub fn probe_ping() -> Self {
        Self::new(PacketType::Ping, "probe")
    }

    /// Creates the UPGRADE packet that concludes a transport hand-over.
    #[inline]
    #[must_use]
    pub const fn upgrade() -> Self {
        Self::empty(PacketType::Upgrade)
    }

    /// Returns `true` if this packet is a PONG carrying the probe body.
    #[inline]
    #[must_use]
    pub fn is_probe_pong(&self) -> bool {
        self.ptype == PacketType::Pong
            && self.data.as_ref().and_then(RawData::as_text) == Some("probe")
    }
}

// ============================================================================
// HandshakeData
// ============================================================================

/// Session parameters delivered in the first OPEN packet.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandshakeData {
    /// Server-assigned session id.
    pub sid: String,

    /// Transports the server is willing to upgrade this session to.
    pub upgrades: Vec<String>,

    /// Interval between server PINGs, in milliseconds.
    pub ping_interval: u64,

    /// Grace period after a missed PING, in milliseconds.
    pub ping_timeout: u64,

    /// Largest payload the server accepts, in bytes.
    #[serde(default)]
    pub max_payload: u64,
}

// ============================================================================
// Tests
// ============================================================================
