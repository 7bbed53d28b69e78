//! Socket state machine.
//!
//! Owns the handshake, the liveness timer, the write buffer and the
//! flush path, and dispatches everything the active transport reports.
//!
//! # Event Dispatch
//!
//! All transport events funnel through one unbounded channel consumed by
//! [`SocketCore::run`], so buffer mutation and state transitions are
//! serialized regardless of which I/O task produced the event. Scalar
//! state observed from other tasks (`ready_state`, `upgrading`) lives in
//! atomics.
//!
//! # Write Path
//!
//! ```text
//! send ──► write buffer ──► flush ──► transport.send(batch)
//!              ▲                           │
//!              └────────── drain ◄─────────┘
//! ```
//!
//! Entries leave the buffer only after the transport reports `drain` for
//! the batch that contained them.

// ============================================================================
// Imports
// ============================================================================

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::error::{Error, Result, TransportError};
use crate::options::SocketOptions;
use crate::packet::{HandshakeData, Packet, PacketOptions, PacketType, RawData};
use crate::socket::{upgrade, FlushCallback, SocketEvent, SocketState};
use crate::transport::{
    Endpoint, PollingTransport, Transport, TransportEvent, TransportKind, WebSocketTransport,
    WebTransportTransport,
};

// ============================================================================
// Constants
// ============================================================================

/// Engine.IO protocol revision spoken by this client.
pub(crate) const PROTOCOL: &str = "4";

/// WebSocket success is remembered across sockets so `rememberUpgrade`
/// can skip polling on reconnection.
static PRIOR_WEBSOCKET_SUCCESS: AtomicBool = AtomicBool::new(false);

pub(crate) fn prior_websocket_success() -> bool {
    PRIOR_WEBSOCKET_SUCCESS.load(Ordering::SeqCst)
}

pub(crate) fn set_prior_websocket_success(value: bool) {
    PRIOR_WEBSOCKET_SUCCESS.store(value, Ordering::SeqCst);
}

// ============================================================================
// Signal
// ============================================================================

/// Internal coordination signals, fanned out to probes and to pending
/// `close()` calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Signal {
    /// A probe won and the hand-over started.
    Upgrading(TransportKind),
    /// The hand-over settled (success or failure).
    UpgradeDone,
    /// The write buffer fully drained.
    Drained,
    /// The socket closed.
    Closed,
}

// ============================================================================
// Write Buffer
// ============================================================================

struct QueuedPacket {
    packet: Packet,
    callback: Option<FlushCallback>,
}

#[derive(Default)]
struct WriteBuffer {
    queue: VecDeque<QueuedPacket>,
    /// Packets already handed to the transport in the current flush.
    prev_len: usize,
}

// ============================================================================
// SocketCore
// ============================================================================

/// Shared state behind a [`crate::Socket`] handle.
pub(crate) struct SocketCore {
    pub(crate) opts: Arc<SocketOptions>,
    endpoint: Arc<Endpoint>,
    /// User query parameters, merged from the URL and the options.
    base_query: BTreeMap<String, String>,

    id: Mutex<String>,
    state: AtomicU8,
    upgrading: AtomicBool,
    /// Server-offered upgrades intersected with the configured set.
    upgrades: Mutex<Vec<TransportKind>>,

    buffer: Mutex<WriteBuffer>,

    ping_interval: AtomicU64,
    ping_timeout: AtomicU64,
    max_payload: AtomicU64,
    last_ping: Mutex<Option<Instant>>,
    ping_timer: Mutex<Option<JoinHandle<()>>>,

    transport: Mutex<Option<Arc<dyn Transport>>>,
    /// Sink installed on the active transport.
    transport_tx: mpsc::UnboundedSender<TransportEvent>,
    /// Stream of events to the application.
    events: mpsc::UnboundedSender<SocketEvent>,
    signals: broadcast::Sender<Signal>,
}

impl SocketCore {
    /// Parses the URL and assembles the shared state.
    ///
    /// Returns the core together with the application event receiver and
    /// the transport event receiver that [`SocketCore::run`] consumes.
    pub(crate) fn create(
        url: &str,
        options: SocketOptions,
    ) -> Result<(
        Arc<Self>,
        mpsc::UnboundedReceiver<SocketEvent>,
        mpsc::UnboundedReceiver<TransportEvent>,
    )> {
        if options.transports.is_empty() {
            return Err(Error::NoTransports);
        }

        let opts = Arc::new(options);
        let (endpoint, url_query) = Endpoint::parse(url, &opts.path)?;

        let mut base_query = opts.query.clone();
        base_query.extend(url_query);

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (transport_tx, transport_rx) = mpsc::unbounded_channel();
        let (signals, _) = broadcast::channel(16);

        let core = Arc::new(Self {
            opts,
            endpoint: Arc::new(endpoint),
            base_query,
            id: Mutex::new(String::new()),
            state: AtomicU8::new(SocketState::Opening as u8),
            upgrading: AtomicBool::new(false),
            upgrades: Mutex::new(Vec::new()),
            buffer: Mutex::new(WriteBuffer::default()),
            ping_interval: AtomicU64::new(0),
            ping_timeout: AtomicU64::new(0),
            max_payload: AtomicU64::new(0),
            last_ping: Mutex::new(None),
            ping_timer: Mutex::new(None),
            transport: Mutex::new(None),
            transport_tx,
            events: event_tx,
            signals,
        });

        Ok((core, event_rx, transport_rx))
    }

    /// Resolves and opens the initial transport.
    pub(crate) fn open_initial(this: &Arc<Self>) {
        let kind = if this.opts.remember_upgrade
            && prior_websocket_success()
            && this.opts.transports.contains(&TransportKind::Websocket)
        {
            TransportKind::Websocket
        } else {
            this.opts.transports[0]
        };

        debug!(transport = kind.name(), "opening socket");
        let transport = this.create_transport(kind);
        this.set_transport(Arc::clone(&transport));
        transport.open();
    }

    /// Dispatch loop; consumes everything the active transport reports.
    pub(crate) async fn run(
        this: Arc<Self>,
        mut transport_rx: mpsc::UnboundedReceiver<TransportEvent>,
    ) {
        while let Some(event) = transport_rx.recv().await {
            match event {
                TransportEvent::Packet(packet) => SocketCore::on_packet(&this, packet),
                TransportEvent::Drain => this.on_drain(),
                TransportEvent::Error(error) => this.on_transport_error(error),
                TransportEvent::Close(error) => this.on_transport_close(error),
                TransportEvent::Open | TransportEvent::PollComplete => {}
            }

            if this.state() == SocketState::Closed {
                break;
            }
        }

        trace!("socket dispatch loop terminated");
    }

    // ------------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------------

    pub(crate) fn id(&self) -> String {
        self.id.lock().clone()
    }

    pub(crate) fn state(&self) -> SocketState {
        SocketState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, state: SocketState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    pub(crate) fn is_upgrading(&self) -> bool {
        self.upgrading.load(Ordering::SeqCst)
    }

    /// Claims the single hand-over slot. Only one probe can win.
    pub(crate) fn try_begin_upgrade(&self) -> bool {
        self.upgrading
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Releases the hand-over slot and wakes anything waiting on it.
    pub(crate) fn end_upgrade(&self) {
        self.upgrading.store(false, Ordering::SeqCst);
        self.signal(Signal::UpgradeDone);
    }

    pub(crate) fn upgrades_contain(&self, kind: TransportKind) -> bool {
        self.upgrades.lock().contains(&kind)
    }

    pub(crate) fn transport(&self) -> Option<Arc<dyn Transport>> {
        self.transport.lock().clone()
    }

    pub(crate) fn emit(&self, event: SocketEvent) {
        let _ = self.events.send(event);
    }

    pub(crate) fn signal(&self, signal: Signal) {
        let _ = self.signals.send(signal);
    }

    pub(crate) fn signals_subscribe(&self) -> broadcast::Receiver<Signal> {
        self.signals.subscribe()
    }

    // ------------------------------------------------------------------------
    // Transport Management
    // ------------------------------------------------------------------------

    /// Builds a transport of the given kind, carrying the session query.
    pub(crate) fn create_transport(&self, kind: TransportKind) -> Arc<dyn Transport> {
        let mut query = self.base_query.clone();
        query.insert("EIO".to_owned(), PROTOCOL.to_owned());
        query.insert("transport".to_owned(), kind.name().to_owned());

        let id = self.id.lock();
        if !id.is_empty() {
            query.insert("sid".to_owned(), id.clone());
        }
        drop(id);

        let opts = Arc::clone(&self.opts);
        let endpoint = Arc::clone(&self.endpoint);
        match kind {
            TransportKind::Polling => Arc::new(PollingTransport::new(opts, endpoint, query)),
            TransportKind::Websocket => Arc::new(WebSocketTransport::new(opts, endpoint, query)),
            TransportKind::Webtransport => {
                Arc::new(WebTransportTransport::new(opts, endpoint, query))
            }
        }
    }

    /// Installs a transport as the active one.
    ///
    /// The swap is atomic with respect to the send path: flush snapshots
    /// the pointer under the same lock.
    pub(crate) fn set_transport(&self, transport: Arc<dyn Transport>) {
        debug!(transport = transport.kind().name(), "setting transport");

        let mut guard = self.transport.lock();
        if let Some(old) = guard.take() {
            old.unbind();
        }
        transport.bind(self.transport_tx.clone());
        *guard = Some(transport);
    }

    // ------------------------------------------------------------------------
    // Inbound Dispatch
    // ------------------------------------------------------------------------

    pub(crate) fn on_packet(this: &Arc<Self>, packet: Packet) {
        let state = this.state();
        if !matches!(
            state,
            SocketState::Opening | SocketState::Open | SocketState::Closing
        ) {
            trace!(state = %state, "packet received with closed socket");
            return;
        }

        trace!(ptype = %packet.ptype, "socket receive");
        this.emit(SocketEvent::Packet(packet.clone()));

        match packet.ptype {
            PacketType::Open => {
                let parsed = packet
                    .data
                    .as_ref()
                    .and_then(RawData::as_text)
                    .map(serde_json::from_str::<HandshakeData>);
                match parsed {
                    Some(Ok(handshake)) => SocketCore::on_handshake(this, handshake),
                    _ => {
                        this.emit(SocketEvent::Error(Error::handshake(
                            "malformed handshake payload",
                        )));
                        this.on_close("parse error", None);
                    }
                }
            }
            PacketType::Ping => {
                SocketCore::reset_ping_timer(this);
                this.send_packet(PacketType::Pong, None, None, None);
                this.emit(SocketEvent::Ping);
                this.emit(SocketEvent::Pong);
            }
            PacketType::Message => {
                let data = packet.data.unwrap_or_else(|| RawData::Text(String::new()));
                this.emit(SocketEvent::Message(data));
            }
            PacketType::Close => {
                this.on_close("transport closed by the server", None);
            }
            // PONGs answer probe PINGs on the candidate, not here; the
            // server never sends UPGRADE or a bare NOOP that needs action
            PacketType::Pong | PacketType::Upgrade | PacketType::Noop => {}
        }
    }

    fn on_handshake(this: &Arc<Self>, handshake: HandshakeData) {
        debug!(sid = %handshake.sid, "handshake completed");

        *this.upgrades.lock() =
            upgrade::filter_upgrades(&handshake.upgrades, &this.opts.transports);
        *this.id.lock() = handshake.sid.clone();
        if let Some(transport) = this.transport() {
            transport.set_query("sid", &handshake.sid);
        }

        this.ping_interval
            .store(handshake.ping_interval, Ordering::SeqCst);
        this.ping_timeout
            .store(handshake.ping_timeout, Ordering::SeqCst);
        this.max_payload
            .store(handshake.max_payload, Ordering::SeqCst);

        if this.state() == SocketState::Opening {
            SocketCore::on_open(this);
        }
        if this.state() == SocketState::Closed {
            return;
        }
        SocketCore::reset_ping_timer(this);
    }

    fn on_open(this: &Arc<Self>) {
        debug!("socket open");
        this.set_state(SocketState::Open);

        let on_websocket = this.transport().map(|transport| transport.kind())
            == Some(TransportKind::Websocket);
        set_prior_websocket_success(on_websocket);

        this.emit(SocketEvent::Open);
        this.flush();

        if this.opts.upgrade {
            for kind in this.upgrades.lock().clone() {
                upgrade::probe(Arc::clone(this), kind);
            }
        }
    }

    // ------------------------------------------------------------------------
    // Liveness
    // ------------------------------------------------------------------------

    /// Rearms the liveness deadline after a handshake or a PING.
    fn reset_ping_timer(this: &Arc<Self>) {
        let delay = Duration::from_millis(
            this.ping_interval.load(Ordering::SeqCst) + this.ping_timeout.load(Ordering::SeqCst),
        );
        *this.last_ping.lock() = Some(Instant::now());

        let mut timer = this.ping_timer.lock();
        if let Some(handle) = timer.take() {
            handle.abort();
        }

        let core = Arc::clone(this);
        *timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            debug!("ping timeout");
            core.on_close("ping timeout", None);
        }));
    }

    /// Returns `true` once the server has been silent past
    /// `pingInterval + pingTimeout`.
    pub(crate) fn has_ping_expired(&self) -> bool {
        let deadline = Duration::from_millis(
            self.ping_interval.load(Ordering::SeqCst) + self.ping_timeout.load(Ordering::SeqCst),
        );
        match *self.last_ping.lock() {
            Some(last) => last.elapsed() > deadline,
            None => false,
        }
    }

    // ------------------------------------------------------------------------
    // Write Path
    // ------------------------------------------------------------------------

    /// Appends a packet to the write buffer and flushes.
    ///
    /// Dropped silently once the socket is closing or closed.
    pub(crate) fn send_packet(
        &self,
        ptype: PacketType,
        data: Option<RawData>,
        options: Option<PacketOptions>,
        callback: Option<FlushCallback>,
    ) {
        if matches!(self.state(), SocketState::Closing | SocketState::Closed) {
            return;
        }

        let packet = Packet {
            ptype,
            data,
            options,
        };
        self.buffer
            .lock()
            .queue
            .push_back(QueuedPacket { packet, callback });
        self.flush();
    }

    /// Hands the writable prefix of the buffer to the active transport.
    pub(crate) fn flush(&self) {
        if self.state() == SocketState::Closed || self.is_upgrading() {
            return;
        }
        let Some(transport) = self.transport() else {
            return;
        };
        if !transport.writable() {
            return;
        }

        let callbacks: Vec<FlushCallback> = {
            let mut buffer = self.buffer.lock();
            if buffer.queue.is_empty() {
                return;
            }

            let n = writable_batch_len(
                &buffer.queue,
                self.max_payload.load(Ordering::SeqCst),
                transport.kind(),
            );
            buffer.prev_len = n;

            let batch: Vec<Packet> = buffer
                .queue
                .iter()
                .take(n)
                .map(|queued| queued.packet.clone())
                .collect();
            let callbacks = buffer
                .queue
                .iter_mut()
                .take(n)
                .filter_map(|queued| queued.callback.take())
                .collect();

            debug!(count = n, "flushing packets");
            transport.send(batch);
            callbacks
        };

        self.emit(SocketEvent::Flush);
        for callback in callbacks {
            callback();
        }
    }

    /// The transport flushed a batch: drop it from the buffer and keep
    /// going.
    fn on_drain(&self) {
        let empty = {
            let mut buffer = self.buffer.lock();
            let n = buffer.prev_len.min(buffer.queue.len());
            buffer.queue.drain(..n);
            buffer.prev_len = 0;
            buffer.queue.is_empty()
        };

        if empty {
            self.emit(SocketEvent::Drain);
            self.signal(Signal::Drained);
        } else {
            self.flush();
        }
    }

    // ------------------------------------------------------------------------
    // Teardown
    // ------------------------------------------------------------------------

    fn on_transport_error(&self, error: TransportError) {
        warn!(error = %error, "transport error");
        set_prior_websocket_success(false);
        self.emit(SocketEvent::Error(Error::Transport(error.clone())));
        self.on_close("transport error", Some(error));
    }

    fn on_transport_close(&self, error: Option<TransportError>) {
        self.on_close("transport close", error);
    }

    /// Tears the socket down exactly once.
    pub(crate) fn on_close(&self, reason: &str, description: Option<TransportError>) {
        let state = self.state();
        if !matches!(
            state,
            SocketState::Opening | SocketState::Open | SocketState::Closing
        ) {
            return;
        }

        debug!(reason, description = ?description, "socket close");

        if let Some(handle) = self.ping_timer.lock().take() {
            handle.abort();
        }

        if let Some(transport) = self.transport.lock().as_ref() {
            transport.unbind();
            transport.close();
        }

        self.set_state(SocketState::Closed);
        self.id.lock().clear();

        self.emit(SocketEvent::Close {
            reason: reason.to_owned(),
        });
        self.signal(Signal::Closed);

        let mut buffer = self.buffer.lock();
        buffer.queue.clear();
        buffer.prev_len = 0;
    }

    /// Orderly close: drain buffered packets and let an in-flight
    /// upgrade settle before releasing the transport.
    pub(crate) fn close(this: &Arc<Self>) {
        if !matches!(this.state(), SocketState::Opening | SocketState::Open) {
            return;
        }
        this.set_state(SocketState::Closing);

        // subscribe before re-checking so a racing drain cannot be missed
        let mut signals = this.signals_subscribe();
        let buffered = !this.buffer.lock().queue.is_empty();

        let core = Arc::clone(this);
        tokio::spawn(async move {
            if buffered {
                loop {
                    match signals.recv().await {
                        Ok(Signal::Drained) => break,
                        Ok(Signal::Closed) | Err(broadcast::error::RecvError::Closed) => return,
                        Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                    }
                }
            }

            if core.is_upgrading() {
                loop {
                    match signals.recv().await {
                        Ok(Signal::UpgradeDone) => break,
                        Ok(Signal::Closed) | Err(broadcast::error::RecvError::Closed) => return,
                        Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                    }
                }
            }

            core.on_close("forced close", None);
        });
    }
}

// ============================================================================
// Batch Sizing
// ============================================================================

/// Number of buffered packets that fit the next payload.
///
/// Only polling concatenates packets into one payload, so only there
/// does `maxPayload` bound the batch; a batch always contains at least
/// one packet.
fn writable_batch_len(
    queue: &VecDeque<QueuedPacket>,
    max_payload: u64,
    kind: TransportKind,
) -> usize {
    if max_payload == 0 || kind != TransportKind::Polling || queue.len() <= 1 {
        return queue.len();
    }

    let mut payload_size: u64 = 1;
    for (i, queued) in queue.iter().enumerate() {
        if let Some(data) = &queued.packet.data {
            payload_size += wire_size(data);
        }
        if i > 0 && payload_size > max_payload {
            return i;
        }
        // separator plus the next packet's type digit
        payload_size += 2;
    }
    queue.len()
}

fn wire_size(data: &RawData) -> u64 {
    match data {
        RawData::Text(text) => text.len() as u64,
        // base-64 expansion
        RawData::Binary(bytes) => (bytes.len() as u64 * 4).div_ceil(3),
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::AtomicUsize;

    use crate::transport::TransportState;

    const HANDSHAKE: &str = r#"{"sid":"abc","upgrades":[],"pingInterval":25000,"pingTimeout":20000,"maxPayload":1000000}"#;

    // ------------------------------------------------------------------------
    // Mock Transport
    // ------------------------------------------------------------------------

    struct MockTransport {
        kind: TransportKind,
        writable: AtomicBool,
        closed: AtomicUsize,
        sent: Mutex<Vec<Vec<Packet>>>,
        query: Mutex<BTreeMap<String, String>>,
    }

    impl MockTransport {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                kind: TransportKind::Polling,
                writable: AtomicBool::new(true),
                closed: AtomicUsize::new(0),
                sent: Mutex::new(Vec::new()),
                query: Mutex::new(BTreeMap::new()),
            })
        }

        fn sent_batches(&self) -> Vec<Vec<Packet>> {
            self.sent.lock().clone()
        }
    }

    impl Transport for MockTransport {
        fn kind(&self) -> TransportKind {
            self.kind
        }

        fn state(&self) -> TransportState {
            TransportState::Open
        }

        fn writable(&self) -> bool {
            self.writable.load(Ordering::SeqCst)
        }

        fn bind(&self, _sink: mpsc::UnboundedSender<TransportEvent>) {}

        fn unbind(&self) {}

        fn set_query(&self, key: &str, value: &str) {
            self.query.lock().insert(key.to_owned(), value.to_owned());
        }

        fn open(&self) {}

        fn close(&self) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }

        fn send(&self, packets: Vec<Packet>) {
            self.writable.store(false, Ordering::SeqCst);
            self.sent.lock().push(packets);
            self.writable.store(true, Ordering::SeqCst);
        }

        fn pause(&self, on_pause: crate::transport::PauseCallback) {
            on_pause();
        }
    }

    // ------------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------------

    fn test_core() -> (
        Arc<SocketCore>,
        mpsc::UnboundedReceiver<SocketEvent>,
        Arc<MockTransport>,
    ) {
        let (core, events, _transport_rx) =
            SocketCore::create("http://example.com", SocketOptions::new().without_upgrade())
                .expect("core should build");
        let mock = MockTransport::new();
        core.set_transport(mock.clone());
        (core, events, mock)
    }

    fn drain_events(rx: &mut mpsc::UnboundedReceiver<SocketEvent>) -> Vec<SocketEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn open_packet() -> Packet {
        Packet::new(PacketType::Open, HANDSHAKE)
    }

    async fn settle(core: &Arc<SocketCore>, want: SocketState) {
        for _ in 0..100 {
            if core.state() == want {
                return;
            }
            tokio::task::yield_now().await;
        }
        panic!("socket never reached {want}");
    }

    // ------------------------------------------------------------------------
    // Handshake
    // ------------------------------------------------------------------------

    #[tokio::test]
    async fn test_handshake_opens_socket() {
        let (core, mut events, mock) = test_core();

        SocketCore::on_packet(&core, open_packet());

        assert_eq!(core.state(), SocketState::Open);
        assert_eq!(core.id(), "abc");
        assert!(core.upgrades.lock().is_empty());
        assert_eq!(core.ping_interval.load(Ordering::SeqCst), 25000);
        assert_eq!(core.ping_timeout.load(Ordering::SeqCst), 20000);
        assert_eq!(core.max_payload.load(Ordering::SeqCst), 1000000);

        // the session id rides on every future transport request
        assert_eq!(mock.query.lock().get("sid").map(String::as_str), Some("abc"));

        let events = drain_events(&mut events);
        assert!(matches!(events[0], SocketEvent::Packet(_)));
        assert!(matches!(events[1], SocketEvent::Open));
    }

    #[tokio::test]
    async fn test_handshake_filters_upgrades() {
        let (core, _events, _mock) = test_core();

        SocketCore::on_packet(
            &core,
            Packet::new(
                PacketType::Open,
                r#"{"sid":"abc","upgrades":["websocket","carrier-pigeon"],"pingInterval":25000,"pingTimeout":20000,"maxPayload":1000000}"#,
            ),
        );

        assert_eq!(*core.upgrades.lock(), vec![TransportKind::Websocket]);
    }

    #[tokio::test]
    async fn test_malformed_handshake_is_fatal() {
        let (core, mut events, _mock) = test_core();

        SocketCore::on_packet(&core, Packet::new(PacketType::Open, "not json"));

        assert_eq!(core.state(), SocketState::Closed);
        let events = drain_events(&mut events);
        assert!(events
            .iter()
            .any(|event| matches!(event, SocketEvent::Error(Error::Handshake { .. }))));
        assert!(events
            .iter()
            .any(|event| matches!(event, SocketEvent::Close { reason } if reason == "parse error")));
    }

    // ------------------------------------------------------------------------
    // Liveness
    // ------------------------------------------------------------------------

    #[tokio::test]
    async fn test_ping_answered_with_pong() {
        let (core, mut events, mock) = test_core();
        SocketCore::on_packet(&core, open_packet());
        drain_events(&mut events);

        SocketCore::on_packet(&core, Packet::empty(PacketType::Ping));

        let batches = mock.sent_batches();
        let last = batches.last().expect("pong should be flushed");
        assert_eq!(last.len(), 1);
        assert_eq!(last[0].ptype, PacketType::Pong);

        let events = drain_events(&mut events);
        assert!(matches!(events[0], SocketEvent::Packet(_)));
        assert!(matches!(events[1], SocketEvent::Flush));
        assert!(matches!(events[2], SocketEvent::Ping));
        assert!(matches!(events[3], SocketEvent::Pong));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ping_timeout_closes_socket() {
        let (core, mut events, _mock) = test_core();
        SocketCore::on_packet(&core, open_packet());
        drain_events(&mut events);

        // no PING ever arrives; the timer fires after interval + timeout
        tokio::time::sleep(Duration::from_millis(45_100)).await;

        assert_eq!(core.state(), SocketState::Closed);
        let events = drain_events(&mut events);
        assert!(events
            .iter()
            .any(|event| matches!(event, SocketEvent::Close { reason } if reason == "ping timeout")));
        assert!(!events
            .iter()
            .any(|event| matches!(event, SocketEvent::Drain)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_has_ping_expired() {
        let (core, mut events, _mock) = test_core();
        SocketCore::on_packet(&core, open_packet());
        drain_events(&mut events);

        assert!(!core.has_ping_expired());

        // stop the close timer so only the predicate is under test
        if let Some(handle) = core.ping_timer.lock().take() {
            handle.abort();
        }
        tokio::time::sleep(Duration::from_millis(45_100)).await;

        assert!(core.has_ping_expired());
    }

    // ------------------------------------------------------------------------
    // Write Path
    // ------------------------------------------------------------------------

    #[tokio::test]
    async fn test_sends_buffer_until_writable() {
        let (core, mut events, mock) = test_core();
        SocketCore::on_packet(&core, open_packet());
        drain_events(&mut events);

        mock.writable.store(false, Ordering::SeqCst);
        core.send_packet(PacketType::Message, Some("one".into()), None, None);
        core.send_packet(PacketType::Message, Some("two".into()), None, None);
        assert!(mock.sent_batches().is_empty());
        assert_eq!(core.buffer.lock().queue.len(), 2);

        mock.writable.store(true, Ordering::SeqCst);
        core.flush();

        let batches = mock.sent_batches();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].len(), 2);
        assert_eq!(core.buffer.lock().prev_len, 2);
    }

    #[tokio::test]
    async fn test_flush_callback_fires() {
        let (core, mut events, _mock) = test_core();
        SocketCore::on_packet(&core, open_packet());
        drain_events(&mut events);

        let fired = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&fired);
        core.send_packet(
            PacketType::Message,
            Some("hi".into()),
            None,
            Some(Box::new(move || {
                flag.store(true, Ordering::SeqCst);
            })),
        );

        assert!(fired.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_drain_slices_buffer() {
        let (core, mut events, mock) = test_core();
        SocketCore::on_packet(&core, open_packet());
        drain_events(&mut events);

        core.send_packet(PacketType::Message, Some("hi".into()), None, None);
        assert_eq!(mock.sent_batches().len(), 1);
        assert_eq!(core.buffer.lock().queue.len(), 1);

        core.on_drain();

        assert!(core.buffer.lock().queue.is_empty());
        assert_eq!(core.buffer.lock().prev_len, 0);
        let events = drain_events(&mut events);
        assert!(events
            .iter()
            .any(|event| matches!(event, SocketEvent::Drain)));
    }

    #[tokio::test]
    async fn test_send_dropped_when_closing() {
        let (core, mut events, mock) = test_core();
        SocketCore::on_packet(&core, open_packet());
        drain_events(&mut events);

        core.set_state(SocketState::Closing);
        core.send_packet(PacketType::Message, Some("late".into()), None, None);

        assert!(core.buffer.lock().queue.is_empty());
        assert!(mock.sent_batches().is_empty());
    }

    #[tokio::test]
    async fn test_flush_skipped_while_upgrading() {
        let (core, mut events, mock) = test_core();
        SocketCore::on_packet(&core, open_packet());
        drain_events(&mut events);

        assert!(core.try_begin_upgrade());
        core.send_packet(PacketType::Message, Some("held".into()), None, None);

        assert!(mock.sent_batches().is_empty());
        assert_eq!(core.buffer.lock().queue.len(), 1);

        core.end_upgrade();
        core.flush();
        assert_eq!(mock.sent_batches().len(), 1);
    }

    #[test]
    fn test_writable_batch_len_respects_max_payload() {
        let mut queue = VecDeque::new();
        for _ in 0..3 {
            queue.push_back(QueuedPacket {
                packet: Packet::message("x".repeat(500)),
                callback: None,
            });
        }

        // two 500-byte bodies overflow a 1000-byte payload
        assert_eq!(
            writable_batch_len(&queue, 1000, TransportKind::Polling),
            1
        );
        // a large limit fits everything
        assert_eq!(
            writable_batch_len(&queue, 10_000, TransportKind::Polling),
            3
        );
        // stream transports frame per packet and ignore the limit
        assert_eq!(
            writable_batch_len(&queue, 1000, TransportKind::Websocket),
            3
        );
        // no advertised limit
        assert_eq!(writable_batch_len(&queue, 0, TransportKind::Polling), 3);
    }

    #[test]
    fn test_writable_batch_len_single_packet_always_fits() {
        let mut queue = VecDeque::new();
        queue.push_back(QueuedPacket {
            packet: Packet::message("x".repeat(5000)),
            callback: None,
        });
        assert_eq!(writable_batch_len(&queue, 100, TransportKind::Polling), 1);
    }

    #[test]
    fn test_wire_size_binary_expansion() {
        assert_eq!(wire_size(&RawData::from("abcd")), 4);
        assert_eq!(wire_size(&RawData::from(vec![0u8; 3])), 4);
        assert_eq!(wire_size(&RawData::from(vec![0u8; 4])), 6);
    }

    // ------------------------------------------------------------------------
    // Teardown
    // ------------------------------------------------------------------------

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (core, mut events, mock) = test_core();
        SocketCore::on_packet(&core, open_packet());
        drain_events(&mut events);

        core.on_close("transport error", None);
        core.on_close("transport error", None);

        assert_eq!(core.state(), SocketState::Closed);
        assert_eq!(core.id(), "");
        assert_eq!(mock.closed.load(Ordering::SeqCst), 1);

        let events = drain_events(&mut events);
        let closes = events
            .iter()
            .filter(|event| matches!(event, SocketEvent::Close { .. }))
            .count();
        assert_eq!(closes, 1);
    }

    #[tokio::test]
    async fn test_no_events_after_close() {
        let (core, mut events, _mock) = test_core();
        SocketCore::on_packet(&core, open_packet());
        core.on_close("transport error", None);
        drain_events(&mut events);

        SocketCore::on_packet(&core, Packet::message("late"));
        core.on_drain();

        assert!(drain_events(&mut events).is_empty());
    }

    #[tokio::test]
    async fn test_transport_error_is_fatal() {
        let (core, mut events, _mock) = test_core();
        SocketCore::on_packet(&core, open_packet());
        drain_events(&mut events);
        set_prior_websocket_success(true);

        core.on_transport_error(TransportError::new("fetch read error"));

        assert_eq!(core.state(), SocketState::Closed);
        assert!(!prior_websocket_success());
        let events = drain_events(&mut events);
        assert!(matches!(events[0], SocketEvent::Error(_)));
        assert!(
            matches!(&events[1], SocketEvent::Close { reason } if reason == "transport error")
        );
    }

    #[tokio::test]
    async fn test_close_waits_for_drain() {
        let (core, mut events, mock) = test_core();
        SocketCore::on_packet(&core, open_packet());
        drain_events(&mut events);

        // a batch is in flight and another packet is buffered behind it
        core.send_packet(PacketType::Message, Some("in flight".into()), None, None);
        assert_eq!(core.buffer.lock().queue.len(), 1);

        SocketCore::close(&core);
        tokio::task::yield_now().await;
        assert_eq!(core.state(), SocketState::Closing);

        // the transport reports the batch written
        core.on_drain();
        settle(&core, SocketState::Closed).await;

        assert_eq!(mock.closed.load(Ordering::SeqCst), 1);
        let events = drain_events(&mut events);
        assert!(events
            .iter()
            .any(|event| matches!(event, SocketEvent::Close { reason } if reason == "forced close")));
    }

    #[tokio::test]
    async fn test_close_waits_for_upgrade() {
        let (core, mut events, mock) = test_core();
        SocketCore::on_packet(&core, open_packet());
        drain_events(&mut events);

        assert!(core.try_begin_upgrade());

        SocketCore::close(&core);
        tokio::task::yield_now().await;
        assert_eq!(core.state(), SocketState::Closing);
        assert!(drain_events(&mut events).is_empty());

        core.end_upgrade();
        settle(&core, SocketState::Closed).await;

        assert_eq!(mock.closed.load(Ordering::SeqCst), 1);
        let events = drain_events(&mut events);
        let closes = events
            .iter()
            .filter(|event| matches!(event, SocketEvent::Close { .. }))
            .count();
        assert_eq!(closes, 1);
    }

    #[tokio::test]
    async fn test_close_immediate_when_idle() {
        let (core, mut events, _mock) = test_core();
        SocketCore::on_packet(&core, open_packet());
        drain_events(&mut events);

        SocketCore::close(&core);
        settle(&core, SocketState::Closed).await;

        let events = drain_events(&mut events);
        assert!(events
            .iter()
            .any(|event| matches!(event, SocketEvent::Close { reason } if reason == "forced close")));
    }

    // ------------------------------------------------------------------------
    // Messages
    // ------------------------------------------------------------------------

    #[tokio::test]
    async fn test_message_dispatch() {
        let (core, mut events, _mock) = test_core();
        SocketCore::on_packet(&core, open_packet());
        drain_events(&mut events);

        SocketCore::on_packet(&core, Packet::message("hello"));

        let events = drain_events(&mut events);
        assert!(events.iter().any(|event| matches!(
            event,
            SocketEvent::Message(RawData::Text(text)) if text == "hello"
        )));
    }

    #[tokio::test]
    async fn test_server_close_packet() {
        let (core, mut events, _mock) = test_core();
        SocketCore::on_packet(&core, open_packet());
        drain_events(&mut events);

        SocketCore::on_packet(&core, Packet::empty(PacketType::Close));

        assert_eq!(core.state(), SocketState::Closed);
        let events = drain_events(&mut events);
        assert!(events.iter().any(|event| matches!(
            event,
            SocketEvent::Close { reason } if reason == "transport closed by the server"
        )));
    }
}
