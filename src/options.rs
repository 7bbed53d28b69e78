//! Socket configuration options.
//!
//! Provides a type-safe interface for configuring a [`crate::Socket`]:
//! candidate transports, upgrade behavior, URI parameters, timeouts and
//! carrier-specific settings.
//!
//! # Example
//!
//! ```ignore
//! use engineio_client::{SocketOptions, TransportKind};
//!
//! let options = SocketOptions::new()
//!     .with_transports(vec![TransportKind::Polling, TransportKind::Websocket])
//!     .with_path("/engine.io/")
//!     .with_timestamp_requests()
//!     .with_request_timeout(std::time::Duration::from_secs(10));
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use reqwest::cookie::Jar;

use crate::transport::TransportKind;

// ============================================================================
// Constants
// ============================================================================

/// Default request path for the Engine.IO endpoint.
pub const DEFAULT_PATH: &str = "/engine.io/";

/// Default cache-buster query parameter name.
pub const DEFAULT_TIMESTAMP_PARAM: &str = "t";

/// Default HTTP request deadline.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

// ============================================================================
// PerMessageDeflate
// ============================================================================

/// Per-message-deflate settings for the WebSocket transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PerMessageDeflate {
    /// Payloads below this size are never compressed.
    pub threshold: usize,
}

impl Default for PerMessageDeflate {
    fn default() -> Self {
        Self { threshold: 1024 }
    }
}

// ============================================================================
// SocketOptions
// ============================================================================

/// Socket configuration.
///
/// All fields have working defaults; the zero-config path is
/// `SocketOptions::new()`.
#[derive(Debug, Clone)]
pub struct SocketOptions {
    /// Ordered candidate transports.
    pub transports: Vec<TransportKind>,

    /// Probe for better transports after the handshake.
    pub upgrade: bool,

    /// Start on WebSocket when a prior session upgraded successfully.
    pub remember_upgrade: bool,

    /// Request path of the Engine.IO endpoint.
    pub path: String,

    /// Extra query parameters appended to every request.
    pub query: BTreeMap<String, String>,

    /// Extra headers sent on polling requests and the WebSocket dial.
    pub extra_headers: Vec<(String, String)>,

    /// Inject a cache-buster parameter into every request URI.
    pub timestamp_requests: bool,

    /// Name of the cache-buster parameter.
    pub timestamp_param: String,

    /// Disable binary framing and force base-64 text frames.
    pub force_base64: bool,

    /// HTTP client deadline for polling requests.
    pub request_timeout: Duration,

    /// Per-message-deflate settings, or `None` to leave compression off.
    pub per_message_deflate: Option<PerMessageDeflate>,

    /// WebSocket subprotocols offered on the dial.
    pub protocols: Vec<String>,

    /// TLS client configuration for WebSocket and QUIC carriers.
    pub tls_config: Option<Arc<rustls::ClientConfig>>,

    /// Cookie jar shared by all transports of the socket.
    ///
    /// Sticky-session cookies set during polling carry into WebSocket
    /// upgrades.
    pub cookie_jar: Option<Arc<Jar>>,
}

impl Default for SocketOptions {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Constructors
// ============================================================================

impl SocketOptions {
    /// Creates options with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self {
            transports: vec![
                TransportKind::Polling,
                TransportKind::Websocket,
                TransportKind::Webtransport,
            ],
            upgrade: true,
            remember_upgrade: false,
            path: DEFAULT_PATH.to_owned(),
            query: BTreeMap::new(),
            extra_headers: Vec::new(),
            timestamp_requests: false,
            timestamp_param: DEFAULT_TIMESTAMP_PARAM.to_owned(),
            force_base64: false,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            per_message_deflate: None,
            protocols: Vec::new(),
            tls_config: None,
            cookie_jar: None,
        }
    }
}

// ============================================================================
// Builder Methods
// ============================================================================

impl SocketOptions {
    /// Sets the ordered candidate transports.
    #[inline]
    #[must_use]
    pub fn with_transports(mut self, transports: Vec<TransportKind>) -> Self {
        self.transports = transports;
        self
    }

    /// Disables the transport upgrade mechanism.
    #[inline]
    #[must_use]
    pub fn without_upgrade(mut self) -> Self {
        self.upgrade = false;
        self
    }

    /// Prefers WebSocket on the first try after a prior successful
    /// upgrade.
    #[inline]
    #[must_use]
    pub fn with_remember_upgrade(mut self) -> Self {
        self.remember_upgrade = true;
        self
    }

    /// Sets the request path.
    #[inline]
    #[must_use]
    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    /// Adds a query parameter sent with every request.
    #[inline]
    #[must_use]
    pub fn with_query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.insert(key.into(), value.into());
        self
    }

    /// Adds an extra request header.
    #[inline]
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra_headers.push((name.into(), value.into()));
        self
    }

    /// Enables the cache-buster parameter.
    #[inline]
    #[must_use]
    pub fn with_timestamp_requests(mut self) -> Self {
        self.timestamp_requests = true;
        self
    }

    /// Renames the cache-buster parameter.
    #[inline]
    #[must_use]
    pub fn with_timestamp_param(mut self, name: impl Into<String>) -> Self {
        self.timestamp_param = name.into();
        self
    }

    /// Forces base-64 text framing on all carriers.
    #[inline]
    #[must_use]
    pub fn with_force_base64(mut self) -> Self {
        self.force_base64 = true;
        self
    }

    /// Sets the HTTP request deadline.
    #[inline]
    #[must_use]
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Enables per-message-deflate with the given settings.
    #[inline]
    #[must_use]
    pub fn with_per_message_deflate(mut self, settings: PerMessageDeflate) -> Self {
        self.per_message_deflate = Some(settings);
        self
    }

    /// Offers WebSocket subprotocols on the dial.
    #[inline]
    #[must_use]
    pub fn with_protocols(mut self, protocols: Vec<String>) -> Self {
        self.protocols = protocols;
        self
    }

    /// Sets the TLS client configuration.
    #[inline]
    #[must_use]
    pub fn with_tls_config(mut self, config: Arc<rustls::ClientConfig>) -> Self {
        self.tls_config = Some(config);
        self
    }

    /// Sets the shared cookie jar.
    #[inline]
    #[must_use]
    pub fn with_cookie_jar(mut self, jar: Arc<Jar>) -> Self {
        self.cookie_jar = Some(jar);
        self
    }
}

// ============================================================================
// Tests
// ============================================================================
