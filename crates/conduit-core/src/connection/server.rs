//! Server-side acceptor.
//!
//! Binds the endpoint, accepts peers up to `max_peers`, and runs one reader
//! task per peer. All reader tasks are joined before the acceptor returns.

use super::reader::serve_connection;
use super::{Connection, LinkState};
use crate::config::IpcConfig;
use crate::state::BusState;
use crate::transport::{Accepted, Listener};
use crate::IpcError;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub(crate) async fn run_acceptor(
    state: Arc<BusState>,
    config: Arc<IpcConfig>,
    shutdown: CancellationToken,
) {
    let mut readers = JoinSet::new();
    let mut listener: Option<Listener> = None;

    loop {
        while let Some(joined) = readers.try_join_next() {
            log_reader_exit(joined);
        }

        if listener.is_none() {
            match Listener::bind(&config.address, config.max_peers, config.buffer_size).await {
                Ok(bound) => {
                    state.set_local_address(Some(bound.local_address().clone()));
                    state.set_link_state(LinkState::Listening);
                    info!("Waiting for peers on {}", bound.local_address());
                    listener = Some(bound);
                }
                Err(e) => {
                    error!("Failed to create IPC endpoint: {}", e);
                    state.callbacks.report("Failed to create IPC endpoint", &e);
                    if !backoff(&shutdown, config.accept_backoff).await {
                        break;
                    }
                    continue;
                }
            }
        }
        let Some(bound) = listener.as_mut() else {
            continue;
        };

        let accepted = tokio::select! {
            biased;
            _ = shutdown.cancelled() => {
                info!("IPC server shutting down");
                break;
            }
            accepted = bound.accept() => accepted,
        };

        match accepted {
            Ok(accepted) => admit(accepted, &state, &config, &shutdown, &mut readers).await,
            Err(e) => {
                error!("IPC accept error: {}", e);
                state.callbacks.report("Failed to accept peer", &e);
                if !backoff(&shutdown, config.accept_backoff).await {
                    break;
                }
            }
        }
    }

    drop(listener);
    state.set_local_address(None);

    let closed = state.registry.close_all();
    if !closed.is_empty() {
        debug!("Closing {} peer connection(s)", closed.len());
    }
    while let Some(joined) = readers.join_next().await {
        log_reader_exit(joined);
    }
}

async fn admit(
    accepted: Accepted,
    state: &Arc<BusState>,
    config: &IpcConfig,
    shutdown: &CancellationToken,
    readers: &mut JoinSet<()>,
) {
    let (read_half, write_half) = tokio::io::split(accepted.stream);
    let peer_id = state.registry.next_peer_id();
    let conn = Arc::new(Connection::new(
        peer_id,
        accepted.process_id,
        accepted.description.clone(),
        write_half,
        shutdown.child_token(),
    ));

    if !state.registry.try_insert(conn.clone(), config.max_peers) {
        warn!(
            "Rejecting IPC connection from {}: at max capacity ({})",
            accepted.description, config.max_peers
        );
        let err = IpcError::PeerLimitReached {
            max: config.max_peers,
            description: accepted.description,
        };
        state.callbacks.report("Refused peer", &err);
        conn.shutdown_writer().await;
        return;
    }

    info!("Peer {} connected: {}", peer_id, accepted.description);
    state.callbacks.connection_changed(peer_id, true);

    let state = state.clone();
    let max_frame = config.buffer_size;
    readers.spawn(async move {
        serve_connection(conn, read_half, state, max_frame).await;
    });
}

/// Sleep for `delay` unless shutdown comes first. Returns false on shutdown.
pub(crate) async fn backoff(shutdown: &CancellationToken, delay: Duration) -> bool {
    tokio::select! {
        biased;
        _ = shutdown.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

fn log_reader_exit(joined: Result<(), tokio::task::JoinError>) {
    if let Err(e) = joined {
        if e.is_panic() {
            error!("Peer reader task panicked: {}", e);
        }
    }
}
