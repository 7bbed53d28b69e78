//! WebTransport (QUIC) transport.
//!
//! Establishes a QUIC session to the server and carries packets over a
//! single bidirectional stream. Each packet travels as a length-prefixed
//! frame: the same body a WebSocket message would carry, preceded by an
//! explicit length header so framing survives inside the byte stream.
//!
//! After the stream opens, a session that already has an id (an upgrade
//! probe) announces it in-band with an OPEN frame carrying
//! `{"sid":"..."}`, since the stream itself has no query string.

// ============================================================================
// Imports
// ============================================================================

use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex as SyncMutex;
use quinn::crypto::rustls::QuicClientConfig;
use quinn::{Connection, RecvStream, SendStream};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::TransportError;
use crate::options::SocketOptions;
use crate::packet::{Packet, PacketType};
use crate::parser::{self, FrameLength};
use crate::transport::{
    Endpoint, PauseCallback, Transport, TransportCore, TransportEvent, TransportKind,
    TransportState,
};

// ============================================================================
// Constants
// ============================================================================

/// Hard ceiling on a single inbound frame; real frames are bounded well
/// below this by the server's advertised `maxPayload`.
const MAX_FRAME_LENGTH: u64 = 16 * 1024 * 1024;

/// ALPN offered on the QUIC handshake.
const ALPN_H3: &[u8] = b"h3";

// ============================================================================
// WebTransportTransport
// ============================================================================

/// WebTransport transport over a QUIC bidirectional stream.
pub struct WebTransportTransport {
    inner: Arc<WtInner>,
}

struct WtInner {
    core: TransportCore,
    /// Send half of the bidirectional stream; the mutex serializes
    /// writers.
    writer: Mutex<Option<SendStream>>,
    /// QUIC connection handle, kept for teardown.
    connection: SyncMutex<Option<Connection>>,
}

impl WebTransportTransport {
    /// Creates a WebTransport transport for the given endpoint.
    pub(crate) fn new(
        opts: Arc<SocketOptions>,
        endpoint: Arc<Endpoint>,
        query: BTreeMap<String, String>,
    ) -> Self {
        Self {
            inner: Arc::new(WtInner {
                core: TransportCore::new(opts, endpoint, query),
                writer: Mutex::new(None),
                connection: SyncMutex::new(None),
            }),
        }
    }
}

// ============================================================================
// Transport Impl
// ============================================================================

impl Transport for WebTransportTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Webtransport
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
            WtInner::do_open(inner).await;
        });
    }

    fn close(&self) {
        let state = self.inner.core.state();
        if state != TransportState::Opening && state != TransportState::Open {
            return;
        }

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            if let Some(mut send) = inner.writer.lock().await.take() {
                let _ = send.finish();
            }
            if let Some(connection) = inner.connection.lock().take() {
                connection.close(0u32.into(), b"done");
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
            WtInner::do_send(inner, packets).await;
        });
    }

    fn pause(&self, on_pause: PauseCallback) {
        // a stream transport is quiescent between frames
        on_pause();
    }
}

// ============================================================================
// Session Setup
// ============================================================================

impl WtInner {
    async fn do_open(this: Arc<Self>) {
        let uri = this.uri();
        let hostname = this.core.endpoint.hostname.clone();
        let port = this.core.endpoint.effective_port();

        let addr = match resolve(&hostname, port).await {
            Some(addr) => addr,
            None => {
                this.core.on_error(
                    "webtransport error",
                    Some(format!("failed to resolve {hostname}:{port}")),
                    Some(uri),
                );
                return;
            }
        };

        let bind = if addr.is_ipv6() {
            SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0)
        } else {
            SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0)
        };

        let mut endpoint = match quinn::Endpoint::client(bind) {
            Ok(endpoint) => endpoint,
            Err(e) => {
                this.core
                    .on_error("webtransport error", Some(e.to_string()), Some(uri));
                return;
            }
        };

        let client_config = match this.client_config() {
            Ok(config) => config,
            Err(message) => {
                this.core
                    .on_error("webtransport error", Some(message), Some(uri));
                return;
            }
        };
        endpoint.set_default_client_config(client_config);

        let connecting = match endpoint.connect(addr, &hostname) {
            Ok(connecting) => connecting,
            Err(e) => {
                this.core
                    .on_error("webtransport error", Some(e.to_string()), Some(uri));
                return;
            }
        };

        let connection = match connecting.await {
            Ok(connection) => connection,
            Err(e) => {
                this.core
                    .on_error("webtransport error", Some(e.to_string()), Some(uri));
                return;
            }
        };

        let (mut send, recv) = match connection.open_bi().await {
            Ok(stream) => stream,
            Err(e) => {
                this.core
                    .on_error("webtransport error", Some(e.to_string()), Some(uri));
                return;
            }
        };

        // associate the stream with an existing session before anything
        // else travels on it
        if let Some(sid) = this.core.query_get("sid") {
            if let Err(e) = write_frame(&mut send, &session_packet(&sid)).await {
                this.core
                    .on_error("webtransport error", Some(e.to_string()), Some(uri));
                return;
            }
        }

        *this.connection.lock() = Some(connection);
        *this.writer.lock().await = Some(send);
        this.core.on_open();

        WtInner::read_loop(this, recv).await;
    }

    fn client_config(&self) -> Result<quinn::ClientConfig, String> {
        let mut tls = match &self.core.opts.tls_config {
            Some(config) => config.as_ref().clone(),
            None => {
                let mut roots = rustls::RootCertStore::empty();
                roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
                rustls::ClientConfig::builder()
                    .with_root_certificates(roots)
                    .with_no_client_auth()
            }
        };
        tls.alpn_protocols = vec![ALPN_H3.to_vec()];

        let quic = QuicClientConfig::try_from(tls).map_err(|e| e.to_string())?;
        Ok(quinn::ClientConfig::new(Arc::new(quic)))
    }

    // ------------------------------------------------------------------------
    // Read Loop
    // ------------------------------------------------------------------------

    async fn read_loop(this: Arc<Self>, mut recv: RecvStream) {
        loop {
            let frame = tokio::select! {
                _ = this.core.cancel.cancelled() => return,
                frame = read_frame(&mut recv) => frame,
            };

            match frame {
                Ok(packet) => match packet {
                    Some(packet) => this.core.on_packet(packet),
                    // tolerate a frame that decodes to garbage
                    None => {}
                },
                Err(ReadFailure::Finished) => {
                    this.core
                        .on_close(Some(TransportError::new("webtransport connection closed")));
                    return;
                }
                Err(ReadFailure::Failed(description)) => {
                    this.core
                        .on_error("webtransport error", Some(description), None);
                    return;
                }
            }
        }
    }

    // ------------------------------------------------------------------------
    // Write Side
    // ------------------------------------------------------------------------

    async fn do_send(this: Arc<Self>, packets: Vec<Packet>) {
        {
            let mut guard = this.writer.lock().await;
            if let Some(send) = guard.as_mut() {
                for packet in &packets {
                    if let Err(e) = write_frame(send, packet).await {
                        this.core
                            .on_error("webtransport error", Some(e.to_string()), None);
                        break;
                    }
                }
            }
        }

        this.core.set_writable(true);
        this.core.emit(TransportEvent::Drain);
    }

    // ------------------------------------------------------------------------
    // URI
    // ------------------------------------------------------------------------

    /// Session URI, kept for logging and error context; the QUIC dial
    /// itself uses the resolved address and hostname.
    fn uri(&self) -> String {
        let query = self.core.query_snapshot();
        self.core.create_uri("https", &query)
    }
}

// ============================================================================
// Framing
// ============================================================================

enum ReadFailure {
    /// The peer finished the stream.
    Finished,
    /// The stream failed.
    Failed(String),
}

impl From<quinn::ReadExactError> for ReadFailure {
    fn from(value: quinn::ReadExactError) -> Self {
        match value {
            quinn::ReadExactError::FinishedEarly(_) => Self::Finished,
            quinn::ReadExactError::ReadError(e) => Self::Failed(e.to_string()),
        }
    }
}

/// Reads one length-prefixed frame. Returns `None` for a frame whose
/// body fails to decode.
async fn read_frame(recv: &mut RecvStream) -> Result<Option<Packet>, ReadFailure> {
    let mut first = [0u8; 1];
    recv.read_exact(&mut first).await?;
    let header = parser::decode_frame_header(first[0]);

    let len = match header.length {
        FrameLength::Short(n) => u64::from(n),
        FrameLength::Extended16 => {
            let mut ext = [0u8; 2];
            recv.read_exact(&mut ext).await?;
            u64::from(u16::from_be_bytes(ext))
        }
        FrameLength::Extended64 => {
            let mut ext = [0u8; 8];
            recv.read_exact(&mut ext).await?;
            u64::from_be_bytes(ext)
        }
    };

    if len > MAX_FRAME_LENGTH {
        return Err(ReadFailure::Failed(format!("frame of {len} bytes exceeds limit")));
    }

    let mut body = vec![0u8; len as usize];
    recv.read_exact(&mut body).await?;

    match parser::decode_frame_body(Bytes::from(body), header.binary) {
        Ok(packet) => Ok(Some(packet)),
        Err(e) => {
            warn!(error = %e, "discarding undecodable frame");
            Ok(None)
        }
    }
}

/// Writes one length-prefixed frame.
async fn write_frame(send: &mut SendStream, packet: &Packet) -> Result<(), quinn::WriteError> {
    let (body, binary) = parser::encode_frame_body(packet);
    let header = parser::encode_frame_header(body.len(), binary);
    send.write_all(&header).await?;
    send.write_all(&body).await?;
    Ok(())
}

/// OPEN frame announcing the session id on a fresh stream.
fn session_packet(sid: &str) -> Packet {
    Packet::new(PacketType::Open, format!("{{\"sid\":\"{sid}\"}}"))
}

async fn resolve(hostname: &str, port: u16) -> Option<SocketAddr> {
    tokio::net::lookup_host((hostname, port))
        .await
        .ok()
        .and_then(|mut addrs| addrs.next())
}

// ============================================================================
// Tests
// ============================================================================
