//! Outbound dispatch.
//!
//! A single task drains the send queue and writes each frame to its
//! destination connections in queue order, so every peer sees messages in
//! the order they were enqueued. Writes never hold the registry lock.

use crate::connection::{Connection, PeerId};
use crate::protocol::MessageKind;
use crate::state::BusState;
use crate::IpcError;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Where an outbound message goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Destination {
    /// Every connected peer (a client has exactly one).
    All,
    /// One peer by id.
    Peer(PeerId),
}

/// A queued, already-encoded message.
#[derive(Debug, Clone)]
pub struct Outbound {
    pub id: String,
    pub kind: MessageKind,
    pub channel: String,
    pub frame: Bytes,
    pub destination: Destination,
}

pub(crate) async fn run_dispatcher(
    mut queue: mpsc::Receiver<Outbound>,
    state: Arc<BusState>,
    io_timeout: Duration,
    shutdown: CancellationToken,
) {
    debug!("Dispatcher started");
    loop {
        let outbound = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            next = queue.recv() => match next {
                Some(outbound) => outbound,
                None => break,
            },
        };
        deliver(&state, outbound, io_timeout).await;
    }

    let abandoned = drain(&mut queue);
    if abandoned > 0 {
        info!("Dispatcher stopped with {} queued message(s) unsent", abandoned);
    } else {
        debug!("Dispatcher stopped");
    }
}

/// Discard whatever is still queued.
fn drain(queue: &mut mpsc::Receiver<Outbound>) -> usize {
    queue.close();
    let mut count = 0;
    while let Ok(_outbound) = queue.try_recv() {
        count += 1;
    }
    count
}

async fn deliver(state: &BusState, outbound: Outbound, io_timeout: Duration) {
    let targets: Vec<Arc<Connection>> = match outbound.destination {
        Destination::All => state.registry.active(),
        Destination::Peer(peer) => state.registry.get(peer).into_iter().collect(),
    };

    if targets.is_empty() {
        match outbound.destination {
            Destination::Peer(peer) => {
                warn!("Dropping {} on {}: peer {} is gone", outbound.kind, outbound.channel, peer);
                state
                    .callbacks
                    .report("Failed to send message", &IpcError::PeerNotFound(peer));
            }
            Destination::All => {
                debug!("Dropping {} on {}: no connected peers", outbound.kind, outbound.channel);
            }
        }
        state.stats.record_dropped();
        fail_request(state, &outbound);
        return;
    }

    let mut delivered = 0usize;
    for conn in targets {
        match conn.write_frame(&outbound.frame, io_timeout).await {
            Ok(()) => {
                state.stats.record_sent(outbound.frame.len());
                delivered += 1;
            }
            Err(e) => {
                // A partial write leaves the stream mid-frame; the peer can never resync.
                warn!(
                    "Failed to send {} to peer {}, closing connection: {}",
                    outbound.channel,
                    conn.peer_id(),
                    e
                );
                state.registry.remove_if_same(&conn);
                state.callbacks.report("Failed to send message", &e);
            }
        }
    }

    if delivered == 0 {
        state.stats.record_dropped();
        fail_request(state, &outbound);
    }
}

fn fail_request(state: &BusState, outbound: &Outbound) {
    if outbound.kind == MessageKind::Request && state.router.pending().fail_undeliverable(&outbound.id) {
        debug!("Request {} failed early: undeliverable", outbound.id);
    }
}
