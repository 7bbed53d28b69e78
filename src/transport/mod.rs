//! Wire transports.
//!
//! A transport is a concrete carrier exchanging framed packets with the
//! server. The socket owns exactly one active transport at a time and
//! may swap it mid-session through the upgrade mechanism.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                        Socket                            │
//! │   write buffer ──► Transport::send ──► wire              │
//! │   event loop   ◄── TransportEvent  ◄── read loop         │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! Each transport owns its background I/O tasks and reports everything
//! through a swappable event sink: an unbounded channel installed by
//! whoever currently owns the transport (the socket, or a probe during
//! an upgrade attempt).
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `polling` | HTTP long-poll GET/POST loop |
//! | `websocket` | full-duplex framed connection |
//! | `webtransport` | QUIC bidirectional stream |

// ============================================================================
// Submodules
// ============================================================================

/// HTTP long-polling transport.
pub mod polling;

/// WebSocket transport.
pub mod websocket;

/// WebTransport (QUIC) transport.
pub mod webtransport;

// ============================================================================
// Imports
// ============================================================================

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::trace;
use url::Url;

use crate::error::{Error, Result, TransportError};
use crate::options::SocketOptions;
use crate::packet::Packet;
use crate::util::timestamp_token;

// ============================================================================
// Re-exports
// ============================================================================

pub use polling::PollingTransport;
pub use websocket::WebSocketTransport;
pub use webtransport::WebTransportTransport;

// ============================================================================
// TransportKind
// ============================================================================

/// Identifier of a concrete transport implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    /// HTTP long-polling.
    Polling,
    /// WebSocket.
    Websocket,
    /// WebTransport over QUIC.
    Webtransport,
}

impl TransportKind {
    /// Returns the wire name of the transport.
    #[inline]
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Polling => "polling",
            Self::Websocket => "websocket",
            Self::Webtransport => "webtransport",
        }
    }

    /// Parses a wire name into a transport kind.
    #[inline]
    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "polling" => Some(Self::Polling),
            "websocket" => Some(Self::Websocket),
            "webtransport" => Some(Self::Webtransport),
            _ => None,
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ============================================================================
// TransportState
// ============================================================================

/// Lifecycle state of a transport.
///
/// `Pausing` and `Paused` are reached only by the polling transport
/// during an upgrade hand-over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TransportState {
    /// Connection attempt in progress.
    Opening = 0,
    /// Connected and exchanging packets.
    Open = 1,
    /// Connection released; the transport is done.
    Closed = 2,
    /// Quiescing in-flight polling requests.
    Pausing = 3,
    /// Quiesced; no request is in flight.
    Paused = 4,
}

impl TransportState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Opening,
            1 => Self::Open,
            2 => Self::Closed,
            3 => Self::Pausing,
            _ => Self::Paused,
        }
    }
}

impl fmt::Display for TransportState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Opening => "opening",
            Self::Open => "open",
            Self::Closed => "closed",
            Self::Pausing => "pausing",
            Self::Paused => "paused",
        };
        f.write_str(name)
    }
}

// ============================================================================
// TransportEvent
// ============================================================================

/// Event reported by a transport to its current owner.
#[derive(Debug)]
pub enum TransportEvent {
    /// The carrier is connected and writable.
    Open,
    /// A packet arrived.
    Packet(Packet),
    /// The pending write batch was flushed to the wire.
    Drain,
    /// A long-poll cycle completed (polling only).
    PollComplete,
    /// The transport failed.
    Error(TransportError),
    /// The transport is closed, with the failure that caused it if any.
    Close(Option<TransportError>),
}

/// Callback invoked once a transport has fully paused.
pub type PauseCallback = Box<dyn FnOnce() + Send + 'static>;

// ============================================================================
// Transport Trait
// ============================================================================

/// Capability interface of a wire transport.
///
/// Implementations spawn their own I/O tasks on `open` and report
/// everything through the bound event sink. All methods are
/// non-blocking.
pub trait Transport: Send + Sync {
    /// Returns the transport identifier.
    fn kind(&self) -> TransportKind;

    /// Returns the current lifecycle state.
    fn state(&self) -> TransportState;

    /// Returns `true` when the transport can accept a write batch.
    fn writable(&self) -> bool;

    /// Installs the event sink. Replaces any previous sink.
    fn bind(&self, sink: mpsc::UnboundedSender<TransportEvent>);

    /// Removes the event sink. Subsequent events are dropped.
    fn unbind(&self);

    /// Sets a query parameter on every future request URI.
    fn set_query(&self, key: &str, value: &str);

    /// Starts the connection attempt.
    fn open(&self);

    /// Releases the connection. Idempotent once closed.
    fn close(&self);

    /// Sends a batch of packets.
    ///
    /// Silently discards the batch (with a debug log) unless the
    /// transport is open.
    fn send(&self, packets: Vec<Packet>);

    /// Quiesces the transport and invokes `on_pause` once no request is
    /// in flight.
    ///
    /// Only polling has real work to do here; stream transports are
    /// always quiescent between messages and invoke the callback
    /// immediately.
    fn pause(&self, on_pause: PauseCallback);
}

// ============================================================================
// Endpoint
// ============================================================================

/// Server endpoint parsed from the connection URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    /// TLS / QUIC carriers.
    pub secure: bool,
    /// Host, without IPv6 brackets.
    pub hostname: String,
    /// Explicit port, when not the scheme default.
    pub port: Option<u16>,
    /// Request path of the Engine.IO endpoint.
    pub path: String,
}

impl Endpoint {
    /// Parses a connection URL.
    ///
    /// Accepts `http`, `https`, `ws` and `wss` schemes. The request path
    /// comes from `path` (the URL path is ignored, matching the
    /// protocol's convention); query parameters found in the URL are
    /// returned for merging into the per-transport query.
    pub fn parse(raw: &str, path: &str) -> Result<(Self, BTreeMap<String, String>)> {
        let url = Url::parse(raw).map_err(|e| Error::invalid_url(raw, e.to_string()))?;

        let secure = match url.scheme() {
            "https" | "wss" => true,
            "http" | "ws" => false,
            other => {
                return Err(Error::invalid_url(raw, format!("unsupported scheme {other:?}")))
            }
        };

        let hostname = match url.host() {
            Some(url::Host::Ipv6(addr)) => addr.to_string(),
            Some(host) => host.to_string(),
            None => return Err(Error::invalid_url(raw, "missing host")),
        };

        let query = url
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();

        Ok((
            Self {
                secure,
                hostname,
                port: url.port(),
                path: path.to_owned(),
            },
            query,
        ))
    }

    /// Returns the effective port, filling in the scheme default.
    #[inline]
    #[must_use]
    pub fn effective_port(&self) -> u16 {
        self.port.unwrap_or(if self.secure { 443 } else { 80 })
    }
}

// ============================================================================
// TransportCore
// ============================================================================

/// State and behavior shared by every transport implementation.
///
/// Concrete transports embed an `Arc<TransportCore>` and delegate
/// lifecycle bookkeeping, event emission, error shaping and URI
/// synthesis to it.
pub(crate) struct TransportCore {
    /// Socket options handle.
    pub(crate) opts: Arc<SocketOptions>,
    /// Server endpoint.
    pub(crate) endpoint: Arc<Endpoint>,
    /// Query parameters for request URIs.
    query: Mutex<BTreeMap<String, String>>,
    /// Lifecycle state.
    state: AtomicU8,
    /// Flow-control flag, observed by the socket's flush path.
    writable: watch::Sender<bool>,
    /// Binary framing support (off when base-64 is forced).
    pub(crate) supports_binary: bool,
    /// Destination for transport events.
    sink: Mutex<Option<mpsc::UnboundedSender<TransportEvent>>>,
    /// Cancels in-flight I/O on close.
    pub(crate) cancel: CancellationToken,
}

impl TransportCore {
    /// Creates the shared core for a new transport.
    pub(crate) fn new(
        opts: Arc<SocketOptions>,
        endpoint: Arc<Endpoint>,
        query: BTreeMap<String, String>,
    ) -> Self {
        let supports_binary = !opts.force_base64;
        Self {
            opts,
            endpoint,
            query: Mutex::new(query),
            state: AtomicU8::new(TransportState::Opening as u8),
            writable: watch::Sender::new(false),
            supports_binary,
            sink: Mutex::new(None),
            cancel: CancellationToken::new(),
        }
    }

    // ------------------------------------------------------------------------
    // State
    // ------------------------------------------------------------------------

    pub(crate) fn state(&self) -> TransportState {
        TransportState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub(crate) fn set_state(&self, state: TransportState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    pub(crate) fn writable(&self) -> bool {
        *self.writable.borrow()
    }

    pub(crate) fn set_writable(&self, writable: bool) {
        self.writable.send_replace(writable);
    }

    /// Subscribes to writability changes (used by the pause barrier).
    pub(crate) fn writable_changes(&self) -> watch::Receiver<bool> {
        self.writable.subscribe()
    }

    // ------------------------------------------------------------------------
    // Event Sink
    // ------------------------------------------------------------------------

    pub(crate) fn bind(&self, sink: mpsc::UnboundedSender<TransportEvent>) {
        *self.sink.lock() = Some(sink);
    }

    pub(crate) fn unbind(&self) {
        *self.sink.lock() = None;
    }

    /// Emits an event to the current sink, dropping it when unbound.
    pub(crate) fn emit(&self, event: TransportEvent) {
        if let Some(sink) = self.sink.lock().as_ref() {
            let _ = sink.send(event);
        }
    }

    // ------------------------------------------------------------------------
    // Lifecycle Handlers
    // ------------------------------------------------------------------------

    /// Marks the transport open and writable, and reports it.
    pub(crate) fn on_open(&self) {
        self.set_state(TransportState::Open);
        self.set_writable(true);
        self.emit(TransportEvent::Open);
    }

    /// Reports a decoded packet.
    pub(crate) fn on_packet(&self, packet: Packet) {
        self.emit(TransportEvent::Packet(packet));
    }

    /// Marks the transport closed and reports it.
    pub(crate) fn on_close(&self, error: Option<TransportError>) {
        self.set_state(TransportState::Closed);
        self.cancel.cancel();
        self.emit(TransportEvent::Close(error));
    }

    /// Shapes and reports a transport failure.
    pub(crate) fn on_error(
        &self,
        reason: &str,
        cause: Option<String>,
        context: Option<String>,
    ) {
        let error = TransportError {
            message: reason.to_owned(),
            description: cause,
            context,
        };
        self.emit(TransportEvent::Error(error));
    }

    // ------------------------------------------------------------------------
    // URI Synthesis
    // ------------------------------------------------------------------------

    /// Sets a query parameter for future request URIs.
    pub(crate) fn set_query(&self, key: &str, value: &str) {
        self.query.lock().insert(key.to_owned(), value.to_owned());
    }

    /// Returns the value of a query parameter, when present.
    pub(crate) fn query_get(&self, key: &str) -> Option<String> {
        self.query.lock().get(key).cloned()
    }

    /// Returns a snapshot of the query, with the cache-buster injected
    /// when timestamped requests are enabled.
    pub(crate) fn query_snapshot(&self) -> BTreeMap<String, String> {
        let mut query = self.query.lock().clone();
        if self.opts.timestamp_requests {
            query.insert(self.opts.timestamp_param.clone(), timestamp_token());
        }
        query
    }

    /// Builds a request URI: `scheme://host[:port]/path?query`.
    ///
    /// The port is omitted when it matches the scheme default; IPv6
    /// hosts are bracketed; the query is URL-encoded.
    pub(crate) fn create_uri(&self, schema: &str, query: &BTreeMap<String, String>) -> String {
        let endpoint = &self.endpoint;

        let host = if endpoint.hostname.contains(':') {
            format!("[{}]", endpoint.hostname)
        } else {
            endpoint.hostname.clone()
        };

        let port = match endpoint.port {
            Some(port)
                if (endpoint.secure && port != 443) || (!endpoint.secure && port != 80) =>
            {
                format!(":{port}")
            }
            _ => String::new(),
        };

        let mut uri = format!("{schema}://{host}{port}{}", endpoint.path);
        if !query.is_empty() {
            let encoded = url::form_urlencoded::Serializer::new(String::new())
                .extend_pairs(query.iter())
                .finish();
            uri.push('?');
            uri.push_str(&encoded);
        }

        trace!(uri = %uri, "created transport uri");
        uri
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn core_for(url: &str, opts: SocketOptions) -> TransportCore {
        let opts = Arc::new(opts);
        let (endpoint, query) = Endpoint::parse(url, &opts.path).expect("url should parse");
        TransportCore::new(opts, Arc::new(endpoint), query)
    }

    #[test]
    fn test_endpoint_parse_http() {
        let (endpoint, query) =
            Endpoint::parse("http://example.com:8080/ignored?token=x", "/engine.io/").unwrap();

        assert!(!endpoint.secure);
        assert_eq!(endpoint.hostname, "example.com");
        assert_eq!(endpoint.port, Some(8080));
        assert_eq!(endpoint.path, "/engine.io/");
        assert_eq!(query.get("token").map(String::as_str), Some("x"));
    }

    #[test]
    fn test_endpoint_parse_secure_schemes() {
        for url in ["https://example.com", "wss://example.com"] {
            let (endpoint, _) = Endpoint::parse(url, "/engine.io/").unwrap();
            assert!(endpoint.secure, "{url} should be secure");
        }
        for url in ["http://example.com", "ws://example.com"] {
            let (endpoint, _) = Endpoint::parse(url, "/engine.io/").unwrap();
            assert!(!endpoint.secure, "{url} should not be secure");
        }
    }

    #[test]
    fn test_endpoint_parse_ipv6() {
        let (endpoint, _) = Endpoint::parse("http://[::1]:3000", "/engine.io/").unwrap();
        assert_eq!(endpoint.hostname, "::1");
        assert_eq!(endpoint.port, Some(3000));
    }

    #[test]
    fn test_endpoint_parse_rejects_garbage() {
        assert!(Endpoint::parse("not a url", "/engine.io/").is_err());
        assert!(Endpoint::parse("ftp://example.com", "/engine.io/").is_err());
    }

    #[test]
    fn test_endpoint_effective_port() {
        let (endpoint, _) = Endpoint::parse("https://example.com", "/engine.io/").unwrap();
        assert_eq!(endpoint.effective_port(), 443);

        let (endpoint, _) = Endpoint::parse("http://example.com", "/engine.io/").unwrap();
        assert_eq!(endpoint.effective_port(), 80);

        let (endpoint, _) = Endpoint::parse("http://example.com:8080", "/engine.io/").unwrap();
        assert_eq!(endpoint.effective_port(), 8080);
    }

    #[test]
    fn test_create_uri_port_elision() {
        let core = core_for("http://example.com:80", SocketOptions::new());
        let uri = core.create_uri("http", &BTreeMap::new());
        // the url crate normalizes default ports away
        assert_eq!(uri, "http://example.com/engine.io/");

        let core = core_for("http://example.com:8080", SocketOptions::new());
        let uri = core.create_uri("http", &BTreeMap::new());
        assert_eq!(uri, "http://example.com:8080/engine.io/");
    }

    #[test]
    fn test_create_uri_ipv6_brackets() {
        let core = core_for("http://[::1]:3000", SocketOptions::new());
        let uri = core.create_uri("http", &BTreeMap::new());
        assert_eq!(uri, "http://[::1]:3000/engine.io/");
    }

    #[test]
    fn test_create_uri_query_encoding() {
        let core = core_for("http://example.com", SocketOptions::new());
        let mut query = BTreeMap::new();
        query.insert("EIO".to_owned(), "4".to_owned());
        query.insert("transport".to_owned(), "polling".to_owned());
        query.insert("token".to_owned(), "a b".to_owned());

        let uri = core.create_uri("http", &query);
        assert_eq!(
            uri,
            "http://example.com/engine.io/?EIO=4&token=a+b&transport=polling"
        );
    }

    #[test]
    fn test_query_snapshot_injects_timestamp() {
        let core = core_for(
            "http://example.com",
            SocketOptions::new().with_timestamp_requests(),
        );
        let query = core.query_snapshot();
        assert!(query.contains_key("t"));

        let core = core_for("http://example.com", SocketOptions::new());
        assert!(!core.query_snapshot().contains_key("t"));
    }

    #[test]
    fn test_state_transitions() {
        let core = core_for("http://example.com", SocketOptions::new());
        assert_eq!(core.state(), TransportState::Opening);
        assert!(!core.writable());

        core.on_open();
        assert_eq!(core.state(), TransportState::Open);
        assert!(core.writable());

        core.on_close(None);
        assert_eq!(core.state(), TransportState::Closed);
        assert!(core.cancel.is_cancelled());
    }

    #[test]
    fn test_events_dropped_when_unbound() {
        let core = core_for("http://example.com", SocketOptions::new());

        let (tx, mut rx) = mpsc::unbounded_channel();
        core.bind(tx);
        core.on_packet(Packet::message("hi"));
        assert!(matches!(
            rx.try_recv(),
            Ok(TransportEvent::Packet(_))
        ));

        core.unbind();
        core.on_packet(Packet::message("dropped"));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_transport_kind_names() {
        assert_eq!(TransportKind::Polling.name(), "polling");
        assert_eq!(TransportKind::Websocket.name(), "websocket");
        assert_eq!(TransportKind::Webtransport.name(), "webtransport");

        assert_eq!(TransportKind::parse("websocket"), Some(TransportKind::Websocket));
        assert_eq!(TransportKind::parse("carrier-pigeon"), None);
    }
}
