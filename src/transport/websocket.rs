//! WebSocket transport.
//!
//! A single persistent full-duplex connection carrying one Engine.IO
//! packet per WebSocket message: text frames for text packets, binary
//! frames for binary bodies (unless base-64 is forced).
//!
//! The read side is a dedicated task blocking on incoming messages. The
//! write side is serialized through an async mutex so concurrent send
//! batches cannot interleave frames.

// ============================================================================
// Imports
// ============================================================================

use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use reqwest::cookie::CookieStore;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::{COOKIE, SEC_WEBSOCKET_PROTOCOL};
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async_tls_with_config, Connector, MaybeTlsStream, WebSocketStream};
use tracing::{debug, trace, warn};
use url::Url;

use crate::error::TransportError;
use crate::options::{PerMessageDeflate, SocketOptions};
use crate::packet::{Packet, RawData};
use crate::parser;
use crate::transport::{
    Endpoint, PauseCallback, Transport, TransportCore, TransportEvent, TransportKind,
    TransportState,
};

// ============================================================================
// Types
// ============================================================================

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

// ============================================================================
// WebSocketTransport
// ============================================================================

/// WebSocket transport.
pub struct WebSocketTransport {
    inner: Arc<WsInner>,
}

struct WsInner {
    core: TransportCore,
    /// Write half of the connection; the mutex serializes writers.
    writer: Mutex<Option<SplitSink<WsStream, Message>>>,
}

impl WebSocketTransport {
    /// Creates a WebSocket transport for the given endpoint.
    pub(crate) fn new(
        opts: Arc<SocketOptions>,
        endpoint: Arc<Endpoint>,
        query: BTreeMap<String, String>,
    ) -> Self {
        Self {
            inner: Arc::new(WsInner {
                core: TransportCore::new(opts, endpoint, query),
                writer: Mutex::new(None),
            }),
        }
    }
}

// ============================================================================
// Transport Impl
// ============================================================================

impl Transport for WebSocketTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Websocket
    }

    fn state(&self) -> TransportState {
        self.inner.core.state()
    }

    fn writable(&self) -> bool {
        self.inner.core.writable()
    }

    fn bind(&self, sink: tokio::sync::mpsc::UnboundedSender<TransportEvent>) {
        self.inner.core.bind(sink);
    }

    fn unbind(&self) {
        self.inner.core.unbind();
    }

    fn set_query(&self, key: &str, value: &str) {
        self.inner.core.set_query(key, value);
    }

    fn open(&self) {
        self.inner.core.set_state(TransportState::Opening);
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            WsInner::do_open(inner).await;
        });
    }

    fn close(&self) {
        let state = self.inner.core.state();
        if state != TransportState::Opening && state != TransportState::Open {
            return;
        }

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            if let Some(mut writer) = inner.writer.lock().await.take() {
                let _ = writer.close().await;
            }
        });

        self.inner.core.on_close(None);
    }

    fn send(&self, packets: Vec<Packet>) {
        if self.inner.core.state() != TransportState::Open {
            debug!("transport is not open, discarding packets");
            return;
        }

        self.inner.core.set_writable(false);
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            WsInner::do_send(inner, packets).await;
        });
    }

    fn pause(&self, on_pause: PauseCallback) {
        // a stream transport is quiescent between messages
        on_pause();
    }
}

// ============================================================================
// Connection
// ============================================================================

impl WsInner {
    async fn do_open(this: Arc<Self>) {
        let uri = this.uri();

        let mut request = match uri.clone().into_client_request() {
            Ok(request) => request,
            Err(e) => {
                this.core
                    .on_error("websocket error", Some(e.to_string()), Some(uri));
                return;
            }
        };

        for (name, value) in &this.core.opts.extra_headers {
            let name = match name.parse::<tokio_tungstenite::tungstenite::http::HeaderName>() {
                Ok(name) => name,
                Err(_) => continue,
            };
            if let Ok(value) = HeaderValue::from_str(value) {
                request.headers_mut().insert(name, value);
            }
        }

        if !this.core.opts.protocols.is_empty() {
            if let Ok(value) = HeaderValue::from_str(&this.core.opts.protocols.join(", ")) {
                request.headers_mut().insert(SEC_WEBSOCKET_PROTOCOL, value);
            }
        }

        // sticky-session cookies collected during polling ride along
        if let Some(header) = this.cookie_header() {
            request.headers_mut().insert(COOKIE, header);
        }

        let connector = this
            .core
            .opts
            .tls_config
            .clone()
            .map(Connector::Rustls);

        match connect_async_tls_with_config(request, None, false, connector).await {
            Ok((stream, _response)) => {
                let (writer, reader) = stream.split();
                *this.writer.lock().await = Some(writer);
                this.core.on_open();
                WsInner::read_loop(this, reader).await;
            }
            Err(e) => {
                this.core
                    .on_error("websocket error", Some(e.to_string()), Some(uri));
            }
        }
    }

    /// Synthesizes the `Cookie` header from the shared jar.
    fn cookie_header(&self) -> Option<HeaderValue> {
        let jar = self.core.opts.cookie_jar.as_ref()?;
        let schema = if self.core.endpoint.secure { "https" } else { "http" };
        let lookup = self.core.create_uri(schema, &BTreeMap::new());
        let url = Url::parse(&lookup).ok()?;
        let value = jar.cookies(&url)?;
        HeaderValue::from_bytes(value.as_bytes()).ok()
    }

    // ------------------------------------------------------------------------
    // Read Loop
    // ------------------------------------------------------------------------

    async fn read_loop(this: Arc<Self>, mut reader: SplitStream<WsStream>) {
        loop {
            let message = tokio::select! {
                _ = this.core.cancel.cancelled() => return,
                message = reader.next() => message,
            };

            match message {
                Some(Ok(Message::Text(text))) => this.on_frame(RawData::Text(text)),
                Some(Ok(Message::Binary(data))) => {
                    this.on_frame(RawData::Binary(Bytes::from(data)));
                }
                Some(Ok(Message::Close(_))) | None => {
                    this.core
                        .on_close(Some(TransportError::new("websocket connection closed")));
                    return;
                }
                // control frames are handled by the library
                Some(Ok(_)) => {}
                Some(Err(WsError::ConnectionClosed | WsError::AlreadyClosed)) => {
                    this.core
                        .on_close(Some(TransportError::new("websocket connection closed")));
                    return;
                }
                Some(Err(e)) => {
                    this.core
                        .on_error("websocket error", Some(e.to_string()), None);
                    return;
                }
            }
        }
    }

    fn on_frame(&self, frame: RawData) {
        match parser::decode_packet(frame) {
            Ok(packet) => self.core.on_packet(packet),
            Err(e) => warn!(error = %e, "discarding undecodable frame"),
        }
    }

    // ------------------------------------------------------------------------
    // Write Side
    // ------------------------------------------------------------------------

    async fn do_send(this: Arc<Self>, packets: Vec<Packet>) {
        {
            let mut guard = this.writer.lock().await;
            if let Some(writer) = guard.as_mut() {
                for packet in &packets {
                    let message = this.prepare_message(packet);
                    if let Err(e) = writer.send(message).await {
                        match e {
                            WsError::ConnectionClosed | WsError::AlreadyClosed => {
                                this.core.on_close(Some(TransportError::new(
                                    "websocket connection closed",
                                )));
                            }
                            e => {
                                this.core
                                    .on_error("websocket error", Some(e.to_string()), None);
                            }
                        }
                        break;
                    }
                }
            }
        }

        // the batch is off the buffer either way; a failed connection is
        // torn down through the error path above
        this.core.set_writable(true);
        this.core.emit(TransportEvent::Drain);
    }

    /// Builds the wire message for one packet, honoring the pre-encoded
    /// fast path and the compression policy.
    fn prepare_message(&self, packet: &Packet) -> Message {
        let deflate = self.core.opts.per_message_deflate;

        if deflate.is_none() {
            if let Some(frame) = packet
                .options
                .as_ref()
                .and_then(|options| options.pre_encoded_frame.as_ref())
            {
                return match frame {
                    RawData::Text(text) => Message::Text(text.clone()),
                    RawData::Binary(bytes) => Message::Binary(bytes.to_vec()),
                };
            }
        }

        let encoded = parser::encode_packet(packet, self.core.supports_binary);
        let requested = packet
            .options
            .as_ref()
            .is_some_and(|options| options.compress);
        let compress = effective_compress(deflate, encoded.len(), requested);
        trace!(len = encoded.len(), compress, "writing frame");

        match encoded {
            RawData::Text(text) => Message::Text(text),
            RawData::Binary(bytes) => Message::Binary(bytes.to_vec()),
        }
    }

    // ------------------------------------------------------------------------
    // URI
    // ------------------------------------------------------------------------

    fn uri(&self) -> String {
        let schema = if self.core.endpoint.secure { "wss" } else { "ws" };

        let mut query = self.core.query_snapshot();
        if !self.core.supports_binary {
            query.insert("b64".to_owned(), "1".to_owned());
        }

        self.core.create_uri(schema, &query)
    }
}

// ============================================================================
// Compression Policy
// ============================================================================

/// A packet's `compress` request is honored only when per-message-deflate
/// is configured and the payload meets the threshold.
fn effective_compress(
    deflate: Option<PerMessageDeflate>,
    len: usize,
    requested: bool,
) -> bool {
    match deflate {
        Some(settings) => requested && len >= settings.threshold,
        None => false,
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use crate::packet::PacketOptions;

    fn transport_for(url: &str, opts: SocketOptions) -> WebSocketTransport {
        let opts = Arc::new(opts);
        let (endpoint, mut query) = Endpoint::parse(url, &opts.path).expect("url should parse");
        query.insert("EIO".to_owned(), "4".to_owned());
        query.insert("transport".to_owned(), "websocket".to_owned());
        WebSocketTransport::new(opts, Arc::new(endpoint), query)
    }

    #[test]
    fn test_uri_scheme() {
        let transport = transport_for("http://example.com:8080", SocketOptions::new());
        assert!(transport.inner.uri().starts_with("ws://example.com:8080/engine.io/?"));

        let transport = transport_for("https://example.com", SocketOptions::new());
        assert!(transport.inner.uri().starts_with("wss://example.com/engine.io/?"));
    }

    #[test]
    fn test_uri_b64_when_binary_unsupported() {
        let transport = transport_for(
            "http://example.com",
            SocketOptions::new().with_force_base64(),
        );
        assert!(transport.inner.uri().contains("b64=1"));

        // unlike polling, the parameter stays after the session starts
        transport.set_query("sid", "abc");
        assert!(transport.inner.uri().contains("b64=1"));
    }

    #[test]
    fn test_effective_compress_policy() {
        let deflate = Some(PerMessageDeflate { threshold: 10 });

        assert!(effective_compress(deflate, 10, true));
        assert!(effective_compress(deflate, 100, true));
        assert!(!effective_compress(deflate, 9, true));
        assert!(!effective_compress(deflate, 100, false));
        assert!(!effective_compress(None, 1000, true));
    }

    #[test]
    fn test_prepare_message_fast_path() {
        let transport = transport_for("http://example.com", SocketOptions::new());

        let mut packet = Packet::message("slowpath");
        packet.options = Some(PacketOptions {
            compress: false,
            pre_encoded_frame: Some(RawData::Text("4fastpath".into())),
        });

        match transport.inner.prepare_message(&packet) {
            Message::Text(text) => assert_eq!(text, "4fastpath"),
            other => panic!("expected text message, got {other:?}"),
        }
    }

    #[test]
    fn test_prepare_message_fast_path_disabled_by_deflate() {
        let transport = transport_for(
            "http://example.com",
            SocketOptions::new().with_per_message_deflate(PerMessageDeflate::default()),
        );

        let mut packet = Packet::message("slowpath");
        packet.options = Some(PacketOptions {
            compress: false,
            pre_encoded_frame: Some(RawData::Text("4fastpath".into())),
        });

        match transport.inner.prepare_message(&packet) {
            Message::Text(text) => assert_eq!(text, "4slowpath"),
            other => panic!("expected text message, got {other:?}"),
        }
    }

    #[test]
    fn test_prepare_message_base64_framing() {
        let transport = transport_for(
            "http://example.com",
            SocketOptions::new().with_force_base64(),
        );

        let packet = Packet::message(vec![1u8, 2, 3]);
        match transport.inner.prepare_message(&packet) {
            Message::Text(text) => assert!(text.starts_with('b')),
            other => panic!("expected base64 text message, got {other:?}"),
        }
    }

    #[test]
    fn test_send_discarded_when_not_open() {
        let transport = transport_for("http://example.com", SocketOptions::new());
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        transport.bind(tx);

        transport.send(vec![Packet::message("dropped")]);
        assert!(rx.try_recv().is_err());
    }
}
