//! Engine.IO v4 client.
//!
//! This library provides the transport layer beneath Socket.IO: a
//! reliable, bidirectional, message-oriented channel between a client
//! and a server over a choice of carriers (HTTP long-polling,
//! WebSocket, WebTransport).
//!
//! # Architecture
//!
//! The [`Socket`] presents a uniform packetized channel while internally
//! negotiating and dynamically upgrading one of several wire transports:
//!
//! - Connections start on the first configured transport (polling by
//!   default) and complete a handshake that delivers the session id,
//!   liveness deadlines and the server's upgrade offers.
//! - Offered transports are probed in parallel; the first PING/PONG
//!   `"probe"` exchange to succeed atomically swaps the better transport
//!   in without dropping a packet.
//! - Server PINGs drive a liveness timer; outbound packets buffer until
//!   the active transport drains them.
//!
//! # Quick Start
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
//!             SocketEvent::Open => {
//!                 println!("connected as {}", socket.id());
//!                 socket.send("hello");
//!             }
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
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`socket`] | Socket state machine, events, transport upgrades |
//! | [`transport`] | Wire carriers: polling, WebSocket, WebTransport |
//! | [`packet`] | Packet model and handshake data |
//! | [`parser`] | Engine.IO v4 wire codec |
//! | [`options`] | Socket configuration |
//! | [`error`] | Error types and [`Result`] alias |

// ============================================================================
// Modules
// ============================================================================

/// Error types and result aliases.
pub mod error;

/// Socket configuration options.
pub mod options;

/// Engine.IO packet types.
pub mod packet;

/// Engine.IO v4 wire codec.
pub mod parser;

/// Socket state machine and events.
pub mod socket;

/// Wire transports.
pub mod transport;

pub(crate) mod util;

// ============================================================================
// Re-exports
// ============================================================================

// Socket types
pub use socket::{EventReceiver, FlushCallback, Socket, SocketEvent, SocketState};

// Transport types
pub use transport::{
    PollingTransport, Transport, TransportEvent, TransportKind, TransportState,
    WebSocketTransport, WebTransportTransport,
};

// Packet types
pub use packet::{HandshakeData, Packet, PacketOptions, PacketType, RawData};

// Configuration
pub use options::{PerMessageDeflate, SocketOptions};

// Error types
pub use error::{Error, Result, TransportError};
