//! Engine.IO socket.
//!
//! The [`Socket`] presents a uniform packetized channel to application
//! code while internally negotiating, multiplexing and dynamically
//! upgrading one of several wire transports.
//!
//! # Connection Lifecycle
//!
//! 1. [`Socket::connect`] parses the URL, picks the initial transport
//!    and starts opening it.
//! 2. The server's OPEN packet delivers the session parameters; the
//!    socket emits [`SocketEvent::Open`].
//! 3. When the server offers better transports, the socket probes them
//!    in parallel and atomically swaps the winner in.
//! 4. Server PINGs keep the session alive; a missed PING closes the
//!    socket with reason `"ping timeout"`.
//!
//! # Example
//!
//! ```no_run
//! use engineio_client::{Socket, SocketEvent, SocketOptions};
//!
//! #[tokio::main]
//! async fn main() -> engineio_client::Result<()> {
//!     let (socket, mut events) = Socket::connect("http://localhost:8080", SocketOptions::new())?;
//!
//!     while let Some(event) = events.recv().await {
//!         match event {
//!             SocketEvent::Open => socket.send("hello"),
//!             SocketEvent::Message(data) => println!("received {data:?}"),
//!             SocketEvent::Close { reason } => {
//!                 println!("closed: {reason}");
//!                 break;
//!             }
//!             _ => {}
//!         }
//!     }
//!     Ok(())
//! }
//! ```

// ============================================================================
// Submodules
// ============================================================================

/// Handshake, liveness, buffering and flush.
pub(crate) mod core;

/// Transport upgrade probes.
pub(crate) mod upgrade;

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::error::{Error, Result};
use crate::options::SocketOptions;
use crate::packet::{Packet, PacketOptions, PacketType, RawData};
use crate::transport::TransportKind;

use self::core::SocketCore;

// ============================================================================
// Types
// ============================================================================

/// Callback fired when the packet it was queued with is handed to the
/// transport.
pub type FlushCallback = Box<dyn FnOnce() + Send + 'static>;

/// Stream of socket events, one receiver per socket.
pub type EventReceiver = mpsc::UnboundedReceiver<SocketEvent>;

// ============================================================================
// SocketState
// ============================================================================

/// Lifecycle state of a socket.
///
/// Moves monotonically along `Opening → Open → Closing → Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SocketState {
    /// Waiting for the handshake.
    Opening = 0,
    /// Session established.
    Open = 1,
    /// Close requested, draining in-flight work.
    Closing = 2,
    /// Session over.
    Closed = 3,
}

impl SocketState {
    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Opening,
            1 => Self::Open,
            2 => Self::Closing,
            _ => Self::Closed,
        }
    }
}

impl fmt::Display for SocketState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Opening => "opening",
            Self::Open => "open",
            Self::Closing => "closing",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

// ============================================================================
// SocketEvent
// ============================================================================

/// Event emitted by a socket to the application.
#[derive(Debug)]
pub enum SocketEvent {
    /// The handshake completed and the session is usable.
    Open,
    /// An application message arrived.
    Message(RawData),
    /// Any packet arrived (including the ones handled internally).
    Packet(Packet),
    /// The server pinged the session.
    Ping,
    /// The answering pong was queued.
    Pong,
    /// The write buffer fully drained to the wire.
    Drain,
    /// A batch was handed to the active transport.
    Flush,
    /// A probe succeeded and the hand-over started.
    Upgrading(TransportKind),
    /// The hand-over completed; the named transport is now active.
    Upgrade(TransportKind),
    /// A probe failed; the socket keeps its current transport.
    UpgradeError(Error),
    /// A fatal failure; followed by `Close`.
    Error(Error),
    /// The session is over.
    Close {
        /// Why the socket closed, e.g. `"ping timeout"` or
        /// `"forced close"`.
        reason: String,
    },
}

// ============================================================================
// Socket
// ============================================================================

/// An Engine.IO client session.
///
/// Cheap to clone; all clones drive the same session.
#[derive(Clone)]
pub struct Socket {
    core: Arc<SocketCore>,
}

impl Socket {
    /// Connects to an Engine.IO server.
    ///
    /// Returns the socket handle and the stream of [`SocketEvent`]s.
    /// Must be called within a tokio runtime; the connection proceeds in
    /// the background and completion is reported as
    /// [`SocketEvent::Open`].
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidUrl`] if the URL cannot be parsed
    /// - [`Error::NoTransports`] if the transport list is empty
    pub fn connect(url: &str, options: SocketOptions) -> Result<(Self, EventReceiver)> {
        let (core, events, transport_rx) = SocketCore::create(url, options)?;
        tokio::spawn(SocketCore::run(Arc::clone(&core), transport_rx));
        SocketCore::open_initial(&core);
        Ok((Self { core }, events))
    }

    /// Returns the server-assigned session id.
    ///
    /// Empty until the handshake completes.
    #[must_use]
    pub fn id(&self) -> String {
        self.core.id()
    }

    /// Returns the current lifecycle state.
    #[must_use]
    pub fn ready_state(&self) -> SocketState {
        self.core.state()
    }

    /// Returns the kind of the active transport.
    #[must_use]
    pub fn transport_kind(&self) -> Option<TransportKind> {
        self.core.transport().map(|transport| transport.kind())
    }

    /// Returns `true` while a transport hand-over is in progress.
    #[must_use]
    pub fn upgrading(&self) -> bool {
        self.core.is_upgrading()
    }

    /// Returns `true` when the server has been silent past the liveness
    /// deadline.
    ///
    /// Lets callers detect a silently dead connection between events.
    #[must_use]
    pub fn has_ping_expired(&self) -> bool {
        self.core.has_ping_expired()
    }

    /// Sends an application message.
    ///
    /// Silently dropped once the socket is closing or closed.
    pub fn send(&self, data: impl Into<RawData>) {
        self.core
            .send_packet(PacketType::Message, Some(data.into()), None, None);
    }

    /// Sends an application message with per-packet options and an
    /// optional callback fired when the packet is flushed.
    pub fn send_with(
        &self,
        data: impl Into<RawData>,
        options: PacketOptions,
        callback: Option<FlushCallback>,
    ) {
        self.core
            .send_packet(PacketType::Message, Some(data.into()), Some(options), callback);
    }

    /// Closes the socket.
    ///
    /// Waits for buffered packets to drain and for an in-flight upgrade
    /// to settle, then releases the transport and emits
    /// [`SocketEvent::Close`].
    pub fn close(&self) {
        SocketCore::close(&self.core);
    }
}

impl fmt::Debug for Socket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Socket")
            .field("id", &self.id())
            .field("ready_state", &self.ready_state())
            .field("transport", &self.transport_kind())
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_socket_state_display() {
        assert_eq!(SocketState::Opening.to_string(), "opening");
        assert_eq!(SocketState::Open.to_string(), "open");
        assert_eq!(SocketState::Closing.to_string(), "closing");
        assert_eq!(SocketState::Closed.to_string(), "closed");
    }

    #[test]
    fn test_socket_state_from_u8() {
        assert_eq!(SocketState::from_u8(0), SocketState::Opening);
        assert_eq!(SocketState::from_u8(3), SocketState::Closed);
        assert_eq!(SocketState::from_u8(42), SocketState::Closed);
    }

    #[tokio::test]
    async fn test_connect_rejects_bad_url() {
        let result = Socket::connect("not a url", SocketOptions::new());
        assert!(matches!(result, Err(Error::InvalidUrl { .. })));
    }

    #[tokio::test]
    async fn test_connect_rejects_empty_transports() {
        let result = Socket::connect(
            "http://localhost",
            SocketOptions::new().with_transports(Vec::new()),
        );
        assert!(matches!(result, Err(Error::NoTransports)));
    }
}
