//! Error types for the Engine.IO client.
//!
//! This module defines all error types used throughout the crate.
//!
//! # Usage
//!
//! All fallible operations return [`Result<T>`] which uses [`Error`]:
//!
//! ```ignore
//! use engineio_client::{Socket, SocketOptions, Result};
//!
//! fn example() -> Result<()> {
//!     let (socket, events) = Socket::connect("http://localhost:8080", SocketOptions::new())?;
//!     socket.send("hello");
//!     Ok(())
//! }
//! ```
//!
//! # Error Categories
//!
//! | Category | Variants |
//! |----------|----------|
//! | Connection | [`Error::Transport`] |
//! | Upgrade | [`Error::Probe`] |
//! | Protocol | [`Error::Handshake`], [`Error::Decode`] |
//! | Configuration | [`Error::InvalidUrl`], [`Error::NoTransports`] |
//! | External | [`Error::Json`] |

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::result::Result as StdResult;

use thiserror::Error;

// ============================================================================
// Result Alias
// ============================================================================

/// Result type alias using crate [`enum@Error`].
///
/// All fallible operations in this crate return this type.
pub type Result<T> = StdResult<T, Error>;

// ============================================================================
// TransportError
// ============================================================================

/// A failure raised by a transport and surfaced through the socket's
/// `error` event.
///
/// Carries the failure reason, the underlying cause when one exists, and
/// request context (typically the URI that was being fetched).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportError {
    /// Human-readable failure reason, e.g. `"fetch read error"`.
    pub message: String,

    /// Rendering of the underlying cause, if any.
    pub description: Option<String>,

    /// Request context, e.g. the URI or HTTP status involved.
    pub context: Option<String>,
}

impl TransportError {
    /// Creates a transport error with only a reason.
    #[inline]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            description: None,
            context: None,
        }
    }

    /// Creates a transport error with a reason and an underlying cause.
    #[inline]
    pub fn with_cause(message: impl Into<String>, cause: impl fmt::Display) -> Self {
        Self {
            message: message.into(),
            description: Some(cause.to_string()),
            context: None,
        }
    }

    /// Attaches request context to the error.
    #[inline]
    #[must_use]
    pub fn context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.description {
            Some(description) => write!(f, "{}: {}", self.message, description),
            None => f.write_str(&self.message),
        }
    }
}

impl std::error::Error for TransportError {}

// ============================================================================
// Error Enum
// ============================================================================

/// Main error type for the crate.
///
/// Each variant includes relevant context for debugging.
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // Connection Errors
    // ========================================================================
    /// Transport-level failure (connect, read or write).
    ///
    /// Fatal to the socket: surfaced as an `error` event followed by
    /// `close`.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    // ========================================================================
    // Upgrade Errors
    // ========================================================================
    /// A transport upgrade probe failed.
    ///
    /// Local to the probe: surfaced as an `upgradeError` event while the
    /// socket keeps running on its current transport.
    #[error("[{transport}] {message}")]
    Probe {
        /// Name of the probed transport.
        transport: &'static str,
        /// Description of the probe failure.
        message: String,
    },

    // ========================================================================
    // Protocol Errors
    // ========================================================================
    /// The server's handshake payload was malformed.
    #[error("handshake error: {message}")]
    Handshake {
        /// Description of the handshake failure.
        message: String,
    },

    /// A wire frame could not be decoded.
    #[error("decode error: {message}")]
    Decode {
        /// Description of the malformed frame.
        message: String,
    },

    // ========================================================================
    // Configuration Errors
    // ========================================================================
    /// The connection URL could not be parsed.
    #[error("invalid url {url}: {message}")]
    InvalidUrl {
        /// The offending URL.
        url: String,
        /// Description of the parse failure.
        message: String,
    },

    /// No transports were configured.
    #[error("no transports configured")]
    NoTransports,

    // ========================================================================
    // External Errors
    // ========================================================================
    /// JSON deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

// ============================================================================
// Error Constructors
// ============================================================================

impl Error {
    /// Creates a probe error for the given transport name.
    #[inline]
    pub fn probe(transport: &'static str, message: impl Into<String>) -> Self {
        Self::Probe {
            transport,
            message: message.into(),
        }
    }

    /// Creates a handshake error.
    #[inline]
    pub fn handshake(message: impl Into<String>) -> Self {
        Self::Handshake {
            message: message.into(),
        }
    }

    /// Creates a decode error.
    #[inline]
    pub fn decode(message: impl Into<String>) -> Self {
        Self::Decode {
            message: message.into(),
        }
    }

    /// Creates an invalid URL error.
    #[inline]
    pub fn invalid_url(url: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidUrl {
            url: url.into(),
            message: message.into(),
        }
    }
}

// ============================================================================
// Error Predicates
// ============================================================================

impl Error {
    /// Returns `true` if this error is fatal to the socket.
    ///
    /// Probe errors are local to the failed probe; everything else tears
    /// the socket down.
    #[inline]
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::Probe { .. })
    }

    /// Returns `true` if this is a transport-level failure.
    #[inline]
    #[must_use]
    pub fn is_transport_error(&self) -> bool {
        matches!(self, Self::Transport(_))
    }

    /// Returns `true` if this is an upgrade probe failure.
    #[inline]
    #[must_use]
    pub fn is_probe_error(&self) -> bool {
        matches!(self, Self::Probe { .. })
    }
}

// ============================================================================
// Tests
// ============================================================================
