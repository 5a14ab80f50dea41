//! Client-side connector.
//!
//! Keeps one connection to the server alive. A failed connection attempt
//! counts against `max_reconnect_attempts`; a connection that was established
//! and later lost starts the count over.

use super::reader::serve_connection;
use super::server::backoff;
use super::{Connection, LinkState};
use crate::config::IpcConfig;
use crate::state::BusState;
use crate::transport;
use crate::IpcError;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

pub(crate) async fn run_connector(
    state: Arc<BusState>,
    config: Arc<IpcConfig>,
    shutdown: CancellationToken,
) {
    let self_id = state.self_id();
    let mut failures: u32 = 0;
    let mut retry: u32 = 0;

    loop {
        state.set_link_state(if retry == 0 {
            LinkState::Connecting
        } else {
            LinkState::Reconnecting { attempt: retry }
        });

        let opened = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            opened = transport::connect(&config.address, config.io_timeout) => opened,
        };

        match opened {
            Ok(stream) => {
                failures = 0;
                retry = 0;

                let (read_half, write_half) = tokio::io::split(stream);
                let conn = Arc::new(Connection::new(
                    self_id,
                    None,
                    config.address.to_string(),
                    write_half,
                    shutdown.child_token(),
                ));
                if !state.registry.try_insert(conn.clone(), 1) {
                    // A stale entry from the previous link is still registered.
                    state.registry.remove(self_id);
                    state.registry.try_insert(conn.clone(), 1);
                }

                state.set_link_state(LinkState::Connected);
                info!("Connected to IPC server at {}", config.address);
                state.callbacks.connection_changed(self_id, true);

                let reason = serve_connection(conn, read_half, state.clone(), config.buffer_size).await;

                if shutdown.is_cancelled() {
                    break;
                }
                state.set_link_state(LinkState::Disconnected);
                warn!("Connection to IPC server lost: {}", reason);

                if !config.reconnect_enabled || config.max_reconnect_attempts == 0 {
                    let err = IpcError::ConnectionLost {
                        message: format!("{} and reconnection is disabled", reason),
                    };
                    error!("{}", err);
                    state.callbacks.report("Connection to server lost", &err);
                    state.set_link_state(LinkState::Failed);
                    break;
                }
            }
            Err(e) => {
                state.stats.record_connection_failed();
                failures += 1;
                warn!("Failed to connect to IPC server (attempt {}): {}", failures, e);
                state.callbacks.report("Failed to connect to server", &e);

                if !config.reconnect_enabled || failures >= config.max_reconnect_attempts {
                    let err = IpcError::ReconnectExhausted {
                        address: config.address.to_string(),
                        attempts: failures,
                    };
                    error!("{}", err);
                    state.callbacks.report("Giving up on server", &err);
                    state.set_link_state(LinkState::Failed);
                    break;
                }
            }
        }

        if !backoff(&shutdown, config.reconnect_delay).await {
            break;
        }
        state.stats.record_reconnect_attempt();
        retry += 1;
    }
}
