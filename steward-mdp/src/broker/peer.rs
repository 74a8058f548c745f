//! Per-connection peer actor.
//!
//! One actor == one accepted socket.
//!
//! Responsibilities:
//! - Own the socket and its framed `Connection`
//! - Drain outbound commands, then poll the socket for inbound messages
//! - Tag inbound messages with the transport-assigned identity
//! - Emit lifecycle events (up / message / gone) to the hub
//! - Never contain routing logic (delegated to the hub)

use bytes::Bytes;
use compio::io::{AsyncRead, AsyncWrite};
use flume::{Receiver, Sender};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, trace};

use crate::connection::Connection;
use steward_core::config::FabricConfig;

static PEER_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Allocate the next transport identity.
///
/// Identities are opaque to everything above the transport; peers compare
/// them byte-wise and never parse them.
pub(crate) fn next_identity() -> Bytes {
    let peer_id = PEER_ID_COUNTER.fetch_add(1, Ordering::Relaxed);
    Bytes::from(format!("peer-{}", peer_id))
}

/// Commands sent from hub -> peer actor
#[derive(Debug)]
pub(crate) enum PeerCmd {
    Send(Vec<Bytes>),
    Close,
}

/// Events sent from peer actor -> hub
#[derive(Debug)]
pub(crate) enum PeerEvent {
    Up {
        identity: Bytes,
        tx: Sender<PeerCmd>,
    },
    Message {
        identity: Bytes,
        frames: Vec<Bytes>,
    },
    Gone {
        identity: Bytes,
    },
}

/// How long one inbound poll blocks before outbound commands are drained
/// again. Bounds the latency of hub-originated sends on a quiet socket.
const OUTBOUND_POLL: Duration = Duration::from_millis(10);

/// Run the actor loop for one peer connection.
///
/// Alternates between draining the outbound command queue and polling the
/// socket for inbound messages, so neither direction can starve the other.
/// Exits on EOF, transport error, or a `Close` command; always emits `Gone`.
pub(crate) async fn run_peer<S>(
    identity: Bytes,
    stream: S,
    config: FabricConfig,
    events: Sender<PeerEvent>,
    cmd_rx: Receiver<PeerCmd>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut conn = Connection::new(stream, &config);
    debug!("[BROKER] Peer {:?} connected", identity);

    'outer: loop {
        // Outbound first, so dispatches queued by the hub are never starved
        // by a blocked read.
        while let Ok(cmd) = cmd_rx.try_recv() {
            match cmd {
                PeerCmd::Send(frames) => {
                    if let Err(e) = conn.send(&frames).await {
                        debug!("[BROKER] Send to peer {:?} failed: {}", identity, e);
                        break 'outer;
                    }
                }
                PeerCmd::Close => {
                    trace!("[BROKER] Peer {:?} closed by hub", identity);
                    break 'outer;
                }
            }
        }

        match conn.recv_timeout(OUTBOUND_POLL).await {
            Ok(Some(frames)) => {
                let event = PeerEvent::Message {
                    identity: identity.clone(),
                    frames,
                };
                if events.send(event).is_err() {
                    break; // hub gone
                }
            }
            Ok(None) => {
                trace!("[BROKER] Peer {:?} disconnected (EOF)", identity);
                break;
            }
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {}
            Err(e) => {
                debug!("[BROKER] Peer {:?} transport error: {}", identity, e);
                break;
            }
        }
    }

    let _ = events.send(PeerEvent::Gone { identity });
}
