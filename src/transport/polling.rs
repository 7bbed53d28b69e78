//! HTTP long-polling transport.
//!
//! Implements the packet channel over plain HTTP by alternating
//! long-poll GET requests (read side) and POST requests (write side).
//!
//! # Request Cycle
//!
//! 1. `open` issues the first GET. The server holds it until packets are
//!    available, then responds with a payload.
//! 2. The payload is decoded and each packet reported; while the state
//!    is open a new GET is issued immediately.
//! 3. Writes encode the batch into a payload and POST it; the transport
//!    is not writable again until the POST succeeds.
//!
//! # Pause
//!
//! During a transport upgrade the socket pauses polling: no new GET is
//! issued and the pause completes only once neither a GET nor a POST is
//! in flight, so no packet can be lost across the hand-over.

// ============================================================================
// Imports
// ============================================================================

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use reqwest::Client;
use tokio::sync::watch;
use tracing::{debug, trace, warn};

use crate::error::TransportError;
use crate::options::SocketOptions;
use crate::packet::{Packet, PacketType};
use crate::parser;
use crate::transport::{
    Endpoint, PauseCallback, Transport, TransportCore, TransportEvent, TransportKind,
    TransportState,
};

// ============================================================================
// PollingTransport
// ============================================================================

/// HTTP long-polling transport.
pub struct PollingTransport {
    inner: Arc<PollingInner>,
}

struct PollingInner {
    core: TransportCore,
    /// HTTP client shared by the GET and POST sides.
    client: Client,
    /// A long-poll GET is in flight.
    polling: watch::Sender<bool>,
    /// A close was requested before the transport finished opening.
    close_on_open: AtomicBool,
}

impl PollingTransport {
    /// Creates a polling transport for the given endpoint.
    pub(crate) fn new(
        opts: Arc<SocketOptions>,
        endpoint: Arc<Endpoint>,
        query: BTreeMap<String, String>,
    ) -> Self {
        let mut builder = Client::builder().timeout(opts.request_timeout);
        if let Some(jar) = &opts.cookie_jar {
            builder = builder.cookie_provider(Arc::clone(jar));
        }
        let client = builder.build().unwrap_or_default();

        Self {
            inner: Arc::new(PollingInner {
                core: TransportCore::new(opts, endpoint, query),
                client,
                polling: watch::Sender::new(false),
                close_on_open: AtomicBool::new(false),
            }),
        }
    }
}

// ============================================================================
// Transport Impl
// ============================================================================

impl Transport for PollingTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Polling
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
        PollingInner::spawn_poll(&self.inner);
    }

    fn close(&self) {
        let state = self.inner.core.state();
        if state != TransportState::Opening && state != TransportState::Open {
            return;
        }

        if state == TransportState::Open {
            debug!("transport open - closing");
            PollingInner::spawn_write(&self.inner, vec![Packet::empty(PacketType::Close)]);
        } else {
            // close requested while the handshake is still in flight
            debug!("transport not open - deferring close");
            self.inner.close_on_open.store(true, Ordering::SeqCst);
        }

        self.inner.core.on_close(None);
    }

    fn send(&self, packets: Vec<Packet>) {
        if self.inner.core.state() != TransportState::Open {
            debug!("transport is not open, discarding packets");
            return;
        }
        self.inner.core.set_writable(false);
        PollingInner::spawn_write(&self.inner, packets);
    }

    fn pause(&self, on_pause: PauseCallback) {
        self.inner.core.set_state(TransportState::Pausing);

        let in_poll = *self.inner.polling.borrow();
        let writable = self.inner.core.writable();

        if !in_poll && writable {
            debug!("paused");
            self.inner.core.set_state(TransportState::Paused);
            on_pause();
            return;
        }

        let mut poll_rx = self.inner.polling.subscribe();
        let mut writable_rx = self.inner.core.writable_changes();
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            if in_poll {
                debug!("we are currently polling - waiting to pause");
                let _ = poll_rx.wait_for(|polling| !*polling).await;
            }
            if !writable {
                debug!("we are currently writing - waiting to pause");
                let _ = writable_rx.wait_for(|writable| *writable).await;
            }
            debug!("paused");
            inner.core.set_state(TransportState::Paused);
            on_pause();
        });
    }
}

// ============================================================================
// Poll Loop
// ============================================================================

impl PollingInner {
    /// Starts one long-poll GET.
    fn spawn_poll(this: &Arc<Self>) {
        debug!("polling");
        this.polling.send_replace(true);
        let inner = Arc::clone(this);
        tokio::spawn(async move {
            PollingInner::do_poll(inner).await;
        });
    }

    async fn do_poll(this: Arc<Self>) {
        let uri = this.uri();

        let mut request = this.client.get(uri.as_str());
        for (name, value) in &this.core.opts.extra_headers {
            request = request.header(name.as_str(), value.as_str());
        }

        let response = tokio::select! {
            _ = this.core.cancel.cancelled() => return,
            response = request.send() => response,
        };

        let response = match response {
            Ok(response) => response,
            Err(e) => {
                this.core
                    .on_error("fetch read error", Some(e.to_string()), Some(uri));
                return;
            }
        };

        if !response.status().is_success() {
            this.core.on_error(
                "fetch read error",
                Some(format!("unexpected status {}", response.status())),
                Some(uri),
            );
            return;
        }

        match response.text().await {
            Ok(body) => PollingInner::on_data(&this, &body),
            Err(e) => {
                this.core
                    .on_error("fetch read error", Some(e.to_string()), Some(uri));
            }
        }
    }

    /// Feeds one long-poll response body through the payload decoder.
    fn on_data(this: &Arc<Self>, data: &str) {
        trace!(len = data.len(), "polling got data");

        let packets = match parser::decode_payload(data) {
            Ok(packets) => packets,
            Err(e) => {
                warn!(error = %e, "discarding undecodable payload");
                Vec::new()
            }
        };

        for packet in packets {
            PollingInner::handle_packet(this, packet);
        }

        if this.core.state() != TransportState::Closed {
            this.polling.send_replace(false);
            this.core.emit(TransportEvent::PollComplete);

            let state = this.core.state();
            if state == TransportState::Open {
                PollingInner::spawn_poll(this);
            } else {
                debug!(state = %state, "ignoring poll");
            }
        }
    }

    fn handle_packet(this: &Arc<Self>, packet: Packet) {
        // the first packet while opening completes the transport open
        if this.core.state() == TransportState::Opening && packet.ptype == PacketType::Open {
            this.core.on_open();
            if this.close_on_open.swap(false, Ordering::SeqCst) {
                PollingInner::spawn_write(this, vec![Packet::empty(PacketType::Close)]);
            }
        }

        if packet.ptype == PacketType::Close {
            this.core
                .on_close(Some(TransportError::new("transport closed by the server")));
            return;
        }

        this.core.on_packet(packet);
    }

    // ------------------------------------------------------------------------
    // Write Side
    // ------------------------------------------------------------------------

    /// Encodes and POSTs a batch. Marks the transport writable again and
    /// reports `drain` once the POST succeeds.
    fn spawn_write(this: &Arc<Self>, packets: Vec<Packet>) {
        let payload = parser::encode_payload(&packets);
        let inner = Arc::clone(this);
        tokio::spawn(async move {
            if PollingInner::do_write(&inner, payload).await {
                inner.core.set_writable(true);
                inner.core.emit(TransportEvent::Drain);
            }
        });
    }

    async fn do_write(this: &Arc<Self>, payload: String) -> bool {
        let uri = this.uri();

        let mut request = this
            .client
            .post(uri.as_str())
            .header("Content-Type", "text/plain;charset=UTF-8")
            .body(payload);
        for (name, value) in &this.core.opts.extra_headers {
            request = request.header(name.as_str(), value.as_str());
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => {
                this.core
                    .on_error("fetch write error", Some(e.to_string()), Some(uri));
                return false;
            }
        };

        if !response.status().is_success() {
            this.core.on_error(
                "fetch write error",
                Some(format!("unexpected status {}", response.status())),
                Some(uri),
            );
            return false;
        }

        true
    }

    // ------------------------------------------------------------------------
    // URI
    // ------------------------------------------------------------------------

    fn uri(&self) -> String {
        let schema = if self.core.endpoint.secure { "https" } else { "http" };

        let mut query = self.core.query_snapshot();
        if !self.core.supports_binary && !query.contains_key("sid") {
            query.insert("b64".to_owned(), "1".to_owned());
        }

        self.core.create_uri(schema, &query)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use tokio::sync::{mpsc, oneshot};

    fn transport_for(url: &str, opts: SocketOptions) -> PollingTransport {
        let opts = Arc::new(opts);
        let (endpoint, mut query) = Endpoint::parse(url, &opts.path).expect("url should parse");
        query.insert("EIO".to_owned(), "4".to_owned());
        query.insert("transport".to_owned(), "polling".to_owned());
        PollingTransport::new(opts, Arc::new(endpoint), query)
    }

    #[test]
    fn test_uri_scheme_follows_endpoint() {
        let transport = transport_for("http://example.com:8080", SocketOptions::new());
        assert!(transport.inner.uri().starts_with("http://example.com:8080/engine.io/?"));

        let transport = transport_for("https://example.com", SocketOptions::new());
        assert!(transport.inner.uri().starts_with("https://example.com/engine.io/?"));
    }

    #[test]
    fn test_uri_b64_before_session_only() {
        let transport = transport_for(
            "http://example.com",
            SocketOptions::new().with_force_base64(),
        );
        assert!(transport.inner.uri().contains("b64=1"));

        // once a session id is present the parameter disappears
        transport.set_query("sid", "abc");
        let uri = transport.inner.uri();
        assert!(uri.contains("sid=abc"));
        assert!(!uri.contains("b64=1"));
    }

    #[test]
    fn test_uri_no_b64_with_binary_support() {
        let transport = transport_for("http://example.com", SocketOptions::new());
        assert!(!transport.inner.uri().contains("b64=1"));
    }

    #[test]
    fn test_send_discarded_when_not_open() {
        let transport = transport_for("http://example.com", SocketOptions::new());
        let (tx, mut rx) = mpsc::unbounded_channel();
        transport.bind(tx);

        transport.send(vec![Packet::message("dropped")]);
        assert!(rx.try_recv().is_err());
        assert_eq!(transport.state(), TransportState::Opening);
    }

    #[tokio::test]
    async fn test_pause_immediate_when_quiet() {
        let transport = transport_for("http://example.com", SocketOptions::new());
        transport.inner.core.set_state(TransportState::Open);
        transport.inner.core.set_writable(true);

        let (tx, rx) = oneshot::channel();
        transport.pause(Box::new(move || {
            let _ = tx.send(());
        }));

        rx.await.expect("pause should complete immediately");
        assert_eq!(transport.state(), TransportState::Paused);
    }

    #[tokio::test]
    async fn test_pause_waits_for_poll_and_write() {
        let transport = transport_for("http://example.com", SocketOptions::new());
        transport.inner.core.set_state(TransportState::Open);

        // simulate a poll and a write both in flight
        transport.inner.polling.send_replace(true);
        transport.inner.core.set_writable(false);

        let (tx, mut rx) = oneshot::channel();
        transport.pause(Box::new(move || {
            let _ = tx.send(());
        }));

        tokio::task::yield_now().await;
        assert_eq!(transport.state(), TransportState::Pausing);
        assert!(rx.try_recv().is_err());

        // poll completes; the write is still pending
        transport.inner.polling.send_replace(false);
        tokio::task::yield_now().await;
        assert!(rx.try_recv().is_err());

        // write drains; the pause can now complete
        transport.inner.core.set_writable(true);
        rx.await.expect("pause should complete");
        assert_eq!(transport.state(), TransportState::Paused);
    }

    #[test]
    fn test_close_while_opening_defers() {
        let transport = transport_for("http://example.com", SocketOptions::new());
        let (tx, mut rx) = mpsc::unbounded_channel();
        transport.bind(tx);

        transport.close();

        assert!(transport.inner.close_on_open.load(Ordering::SeqCst));
        assert_eq!(transport.state(), TransportState::Closed);
        assert!(matches!(rx.try_recv(), Ok(TransportEvent::Close(None))));

        // a second close is a no-op
        transport.close();
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_server_close_packet_closes_transport() {
        let transport = transport_for("http://example.com", SocketOptions::new());
        let (tx, mut rx) = mpsc::unbounded_channel();
        transport.bind(tx);
        transport.inner.core.set_state(TransportState::Open);

        PollingInner::handle_packet(&transport.inner, Packet::empty(PacketType::Close));

        assert_eq!(transport.state(), TransportState::Closed);
        match rx.try_recv() {
            Ok(TransportEvent::Close(Some(err))) => {
                assert_eq!(err.message, "transport closed by the server");
            }
            other => panic!("expected close event, got {other:?}"),
        }
    }
}
