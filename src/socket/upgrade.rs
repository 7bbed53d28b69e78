//! Transport upgrade probes.
//!
//! After the handshake, every server-offered transport the client also
//! supports gets an independent probe: open a candidate transport, send
//! a PING with body `"probe"`, and expect the matching PONG. The first
//! probe to succeed pauses the current transport, swaps the candidate
//! in, and concludes with an UPGRADE packet; every other probe observes
//! the hand-over and freezes.
//!
//! # Abort Paths
//!
//! A probe dies without touching the socket when:
//!
//! - its candidate fails to open, errors, or closes,
//! - the probe reply is not a `"probe"` PONG,
//! - the socket closes,
//! - another probe wins first.
//!
//! Once a probe has claimed the hand-over slot, any late failure also
//! releases the slot so a pending `close()` can proceed.

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::debug;

use crate::error::Error;
use crate::packet::Packet;
use crate::socket::core::{set_prior_websocket_success, Signal, SocketCore};
use crate::socket::{SocketEvent, SocketState};
use crate::transport::{Transport, TransportEvent, TransportKind};

// ============================================================================
// Constants
// ============================================================================

/// Head start granted to WebTransport before a competing probe opens.
const WEBTRANSPORT_HEAD_START: Duration = Duration::from_millis(200);

// ============================================================================
// Upgrade Filtering
// ============================================================================

/// Intersects the server-offered upgrade names with the configured
/// transport set, preserving the server's order.
pub(crate) fn filter_upgrades(
    offered: &[String],
    configured: &[TransportKind],
) -> Vec<TransportKind> {
    offered
        .iter()
        .filter_map(|name| TransportKind::parse(name))
        .filter(|kind| configured.contains(kind))
        .collect()
}

// ============================================================================
// Probe
// ============================================================================

/// Starts an independent probe for one candidate transport.
pub(crate) fn probe(core: Arc<SocketCore>, kind: TransportKind) {
    tokio::spawn(run_probe(core, kind));
}

/// Why a probe must stop before finishing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Abort {
    /// The socket closed underneath the probe.
    SocketClosed,
    /// Another probe completed its hand-over first.
    OtherUpgraded,
}

async fn run_probe(core: Arc<SocketCore>, kind: TransportKind) {
    debug!(transport = kind.name(), "probing transport");
    let mut signals = core.signals_subscribe();

    // WebTransport is preferred: a competing probe waits so it can win
    if kind != TransportKind::Webtransport && core.upgrades_contain(TransportKind::Webtransport) {
        tokio::select! {
            _ = tokio::time::sleep(WEBTRANSPORT_HEAD_START) => {}
            abort = wait_abort(&mut signals, kind) => {
                if abort == Abort::SocketClosed {
                    fail(&core, kind, "probe error: socket closed");
                } else {
                    debug!(transport = kind.name(), "aborting probe, upgrade already done");
                }
                return;
            }
        }
    }

    let candidate = core.create_transport(kind);
    let (tx, mut rx) = mpsc::unbounded_channel();
    candidate.bind(tx);
    set_prior_websocket_success(false);
    candidate.open();

    // wait for the candidate carrier
    loop {
        tokio::select! {
            event = rx.recv() => match event {
                Some(TransportEvent::Open) => break,
                Some(TransportEvent::Error(e)) => {
                    freeze(&candidate);
                    fail(&core, kind, format!("probe error: {e}"));
                    return;
                }
                Some(TransportEvent::Close(_)) | None => {
                    freeze(&candidate);
                    fail(&core, kind, "probe error: transport closed");
                    return;
                }
                Some(_) => {}
            },
            abort = wait_abort(&mut signals, kind) => {
                freeze(&candidate);
                if abort == Abort::SocketClosed {
                    fail(&core, kind, "probe error: socket closed");
                }
                return;
            }
        }
    }

    debug!(transport = kind.name(), "probe transport opened");
    candidate.send(vec![Packet::probe_ping()]);

    // wait for the probe reply
    let reply = loop {
        tokio::select! {
            event = rx.recv() => match event {
                Some(TransportEvent::Packet(packet)) => break packet,
                Some(TransportEvent::Error(e)) => {
                    freeze(&candidate);
                    fail(&core, kind, format!("probe error: {e}"));
                    return;
                }
                Some(TransportEvent::Close(_)) | None => {
                    freeze(&candidate);
                    fail(&core, kind, "probe error: transport closed");
                    return;
                }
                Some(_) => {}
            },
            abort = wait_abort(&mut signals, kind) => {
                freeze(&candidate);
                if abort == Abort::SocketClosed {
                    fail(&core, kind, "probe error: socket closed");
                }
                return;
            }
        }
    };

    if !reply.is_probe_pong() {
        debug!(transport = kind.name(), "probe failed");
        freeze(&candidate);
        fail(&core, kind, "probe error");
        return;
    }

    // this probe won; at most one gets past the claim
    if !core.try_begin_upgrade() {
        debug!(transport = kind.name(), "another probe already upgrading");
        freeze(&candidate);
        return;
    }

    debug!(transport = kind.name(), "probe pong");
    core.emit(SocketEvent::Upgrading(kind));
    core.signal(Signal::Upgrading(kind));
    set_prior_websocket_success(kind == TransportKind::Websocket);

    let Some(current) = core.transport() else {
        freeze(&candidate);
        fail_after_claim(&core, kind, "probe error: socket closed");
        return;
    };

    debug!(current = current.kind().name(), "pausing current transport");
    let (paused_tx, mut paused_rx) = oneshot::channel();
    current.pause(Box::new(move || {
        let _ = paused_tx.send(());
    }));

    // the candidate can still die while polling quiesces
    loop {
        tokio::select! {
            _ = &mut paused_rx => break,
            event = rx.recv() => match event {
                Some(TransportEvent::Error(e)) => {
                    freeze(&candidate);
                    fail_after_claim(&core, kind, format!("probe error: {e}"));
                    return;
                }
                Some(TransportEvent::Close(_)) | None => {
                    freeze(&candidate);
                    fail_after_claim(&core, kind, "probe error: transport closed");
                    return;
                }
                Some(_) => {}
            },
            abort = wait_abort(&mut signals, kind) => {
                freeze(&candidate);
                if abort == Abort::SocketClosed {
                    fail_after_claim(&core, kind, "probe error: socket closed");
                } else {
                    core.end_upgrade();
                }
                return;
            }
        }
    }

    if core.state() == SocketState::Closed {
        freeze(&candidate);
        fail_after_claim(&core, kind, "probe error: socket closed");
        return;
    }

    debug!("changing transport and sending upgrade packet");
    candidate.unbind();
    core.set_transport(Arc::clone(&candidate));
    candidate.send(vec![Packet::upgrade()]);

    core.emit(SocketEvent::Upgrade(kind));
    core.end_upgrade();
    core.flush();
}

// ============================================================================
// Probe Teardown
// ============================================================================

/// Waits for a signal that ends this probe.
async fn wait_abort(signals: &mut broadcast::Receiver<Signal>, kind: TransportKind) -> Abort {
    loop {
        match signals.recv().await {
            Ok(Signal::Closed) | Err(broadcast::error::RecvError::Closed) => {
                return Abort::SocketClosed;
            }
            Ok(Signal::Upgrading(winner)) if winner != kind => {
                return Abort::OtherUpgraded;
            }
            _ => {}
        }
    }
}

/// Detaches and releases a candidate; later carrier events go nowhere.
fn freeze(candidate: &Arc<dyn Transport>) {
    candidate.unbind();
    candidate.close();
}

/// Reports a failed probe.
fn fail(core: &SocketCore, kind: TransportKind, message: impl Into<String>) {
    let error = Error::probe(kind.name(), message);
    debug!(error = %error, "probe failed");
    core.emit(SocketEvent::UpgradeError(error));
}

/// Reports a failed probe that had already claimed the hand-over slot,
/// releasing the slot so flushes and a pending close can continue.
fn fail_after_claim(core: &SocketCore, kind: TransportKind, message: impl Into<String>) {
    fail(core, kind, message);
    core.end_upgrade();
    core.flush();
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use crate::options::SocketOptions;
    use crate::packet::{PacketType, RawData};

    fn upgrade_list(offered: &[&str]) -> Vec<String> {
        offered.iter().map(|s| (*s).to_owned()).collect()
    }

    #[test]
    fn test_filter_upgrades_intersects() {
        let configured = vec![TransportKind::Polling, TransportKind::Websocket];

        let filtered = filter_upgrades(
            &upgrade_list(&["websocket", "webtransport"]),
            &configured,
        );
        assert_eq!(filtered, vec![TransportKind::Websocket]);
    }

    #[test]
    fn test_filter_upgrades_ignores_unknown_names() {
        let configured = vec![
            TransportKind::Polling,
            TransportKind::Websocket,
            TransportKind::Webtransport,
        ];

        let filtered = filter_upgrades(
            &upgrade_list(&["carrier-pigeon", "webtransport", "websocket"]),
            &configured,
        );
        assert_eq!(
            filtered,
            vec![TransportKind::Webtransport, TransportKind::Websocket]
        );
    }

    #[test]
    fn test_filter_upgrades_empty_offer() {
        assert!(filter_upgrades(&[], &[TransportKind::Websocket]).is_empty());
    }

    // ------------------------------------------------------------------------
    // Probe Aborts
    // ------------------------------------------------------------------------

    fn probe_core() -> (
        Arc<SocketCore>,
        tokio::sync::mpsc::UnboundedReceiver<SocketEvent>,
    ) {
        // upgrade probing stays manual in these tests
        let (core, events, _transport_rx) =
            SocketCore::create("http://example.com", SocketOptions::new().without_upgrade())
                .expect("core should build");
        SocketCore::on_packet(
            &core,
            Packet::new(
                PacketType::Open,
                r#"{"sid":"abc","upgrades":["websocket","webtransport"],"pingInterval":25000,"pingTimeout":20000,"maxPayload":1000000}"#,
            ),
        );
        (core, events)
    }

    fn drain(rx: &mut tokio::sync::mpsc::UnboundedReceiver<SocketEvent>) -> Vec<SocketEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_skipped_when_webtransport_wins_head_start() {
        let (core, mut events) = probe_core();
        drain(&mut events);

        // a websocket probe defers to the preferred webtransport
        probe(Arc::clone(&core), TransportKind::Websocket);
        tokio::task::yield_now().await;

        core.signal(Signal::Upgrading(TransportKind::Webtransport));
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }

        // frozen silently: no upgrade error, slot untouched
        assert!(!core.is_upgrading());
        assert!(!drain(&mut events)
            .iter()
            .any(|event| matches!(event, SocketEvent::UpgradeError(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_reports_socket_close_during_head_start() {
        let (core, mut events) = probe_core();
        drain(&mut events);

        probe(Arc::clone(&core), TransportKind::Websocket);
        tokio::task::yield_now().await;

        core.signal(Signal::Closed);
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }

        let events = drain(&mut events);
        assert!(events.iter().any(|event| matches!(
            event,
            SocketEvent::UpgradeError(Error::Probe { transport, message })
                if *transport == "websocket" && message == "probe error: socket closed"
        )));
    }

    #[tokio::test]
    async fn test_probe_pong_recognition() {
        // the literal bodies exchanged during a probe
        let ping = Packet::probe_ping();
        assert_eq!(ping.data.as_ref().and_then(RawData::as_text), Some("probe"));

        assert!(Packet::new(PacketType::Pong, "probe").is_probe_pong());
        assert!(!Packet::new(PacketType::Pong, "other").is_probe_pong());
        assert!(!Packet::message("probe").is_probe_pong());
    }
}
