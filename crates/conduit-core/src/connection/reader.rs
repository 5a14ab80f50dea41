//! Per-connection inbound loop.

use super::Connection;
use crate::protocol::{read_frame, Message, FRAME_HEADER_LEN};
use crate::routing::RouteOutcome;
use crate::state::BusState;
use crate::transport::BoxedStream;
use crate::IpcError;
use std::sync::Arc;
use tokio::io::ReadHalf;
use tracing::{debug, info, warn};

/// Why a reader stopped.
#[derive(Debug)]
pub(crate) enum DisconnectReason {
    /// The peer closed its end.
    PeerClosed,
    /// We retired the connection (stop, disconnect_peer, shutdown).
    Closed,
    /// Reading failed at the transport level.
    ReadFailed(IpcError),
}

impl std::fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DisconnectReason::PeerClosed => f.write_str("peer closed the connection"),
            DisconnectReason::Closed => f.write_str("closed locally"),
            DisconnectReason::ReadFailed(e) => write!(f, "{}", e),
        }
    }
}

/// Read frames from `conn` until it ends, then retire it and announce the
/// disconnect. Runs exactly once per connection.
pub(crate) async fn serve_connection(
    conn: Arc<Connection>,
    mut read_half: ReadHalf<BoxedStream>,
    state: Arc<BusState>,
    max_frame: usize,
) -> DisconnectReason {
    let peer = conn.peer_id();
    debug!("Reader started for peer {}", peer);

    let reason = read_loop(&conn, &mut read_half, &state, max_frame).await;

    match &reason {
        DisconnectReason::PeerClosed => info!("Peer {} disconnected", peer),
        DisconnectReason::Closed => debug!("Connection to peer {} closed locally", peer),
        DisconnectReason::ReadFailed(e) => {
            warn!("Connection to peer {} lost: {}", peer, e);
            state.callbacks.report("Failed to read from peer", e);
        }
    }

    state.registry.remove_if_same(&conn);
    conn.shutdown_writer().await;
    drop(read_half);
    state.callbacks.connection_changed(peer, false);

    reason
}

async fn read_loop(
    conn: &Connection,
    reader: &mut ReadHalf<BoxedStream>,
    state: &BusState,
    max_frame: usize,
) -> DisconnectReason {
    let peer = conn.peer_id();
    loop {
        let frame = tokio::select! {
            biased;
            _ = conn.closed() => return DisconnectReason::Closed,
            frame = read_frame(reader, max_frame) => frame,
        };

        let body = match frame {
            Ok(Some(body)) => body,
            Ok(None) => return DisconnectReason::PeerClosed,
            Err(e) if !e.is_connection_fatal() => {
                warn!("Dropping frame from peer {}: {}", peer, e);
                state.stats.record_dropped();
                state.callbacks.report("Dropped inbound frame", &e);
                continue;
            }
            Err(e) => return DisconnectReason::ReadFailed(e),
        };

        conn.touch();

        let mut message = match Message::decode(&body) {
            Ok(message) => message,
            Err(e) => {
                warn!("Dropping undecodable frame from peer {}: {}", peer, e);
                state.stats.record_dropped();
                state.callbacks.report("Dropped inbound frame", &e);
                continue;
            }
        };
        message.origin = Some(peer);
        state.stats.record_received(FRAME_HEADER_LEN + body.len());

        if let RouteOutcome::HandlerFailed(reason) = state.router.route(&message) {
            state.stats.record_handler_failure();
            let err = IpcError::HandlerFailed {
                channel: message.channel.clone(),
                message: reason,
            };
            state.callbacks.report("Message handler failed", &err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{encode_frame, write_frame};
    use crate::routing::MessageHandler;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;
    use tokio_util::sync::CancellationToken;

    fn start_reader(
        state: &Arc<BusState>,
    ) -> (
        Arc<Connection>,
        tokio::io::DuplexStream,
        tokio::task::JoinHandle<DisconnectReason>,
    ) {
        let (local, remote) = tokio::io::duplex(8192);
        let stream: BoxedStream = Box::new(local);
        let (read_half, write_half) = tokio::io::split(stream);
        let peer = state.registry.next_peer_id();
        let conn = Arc::new(Connection::new(
            peer,
            None,
            "duplex",
            write_half,
            CancellationToken::new(),
        ));
        assert!(state.registry.try_insert(conn.clone(), 10));
        let task = tokio::spawn(serve_connection(conn.clone(), read_half, state.clone(), 1024));
        (conn, remote, task)
    }

    #[tokio::test]
    async fn test_reader_routes_and_tags_origin() {
        let state = Arc::new(BusState::new());
        let seen = Arc::new(AtomicUsize::new(0));
        let sink = seen.clone();
        let handler: MessageHandler = Arc::new(move |msg: &Message| -> anyhow::Result<()> {
            assert!(msg.origin.is_some());
            sink.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        state.router.register("ch", handler);

        let (_conn, mut remote, task) = start_reader(&state);
        let frame = encode_frame(&Message::notification("ch", "hi"), 1024).unwrap();
        write_frame(&mut remote, &frame).await.unwrap();
        drop(remote);

        let reason = task.await.unwrap();
        assert!(matches!(reason, DisconnectReason::PeerClosed));
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert_eq!(state.stats.snapshot().messages_received, 1);
        assert!(state.registry.is_empty());
    }

    #[tokio::test]
    async fn test_garbage_frame_is_dropped_not_fatal() {
        let state = Arc::new(BusState::new());
        let hits = Arc::new(AtomicUsize::new(0));
        let sink = hits.clone();
        state.router.register(
            "ch",
            Arc::new(move |_msg: &Message| -> anyhow::Result<()> {
                sink.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        );

        let (conn, mut remote, _task) = start_reader(&state);

        // Length-prefixed junk, then an oversized header with its body.
        remote.write_all(&5u32.to_be_bytes()).await.unwrap();
        remote.write_all(b"{nope").await.unwrap();
        remote.write_all(&2000u32.to_be_bytes()).await.unwrap();
        remote.write_all(&[b'x'; 2000]).await.unwrap();

        let frame = encode_frame(&Message::notification("ch", "after"), 1024).unwrap();
        write_frame(&mut remote, &frame).await.unwrap();

        tokio::time::timeout(Duration::from_secs(1), async {
            while hits.load(Ordering::SeqCst) == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("valid frame after garbage should be routed");

        assert!(conn.is_active());
        assert_eq!(state.stats.snapshot().messages_dropped, 2);
    }

    #[tokio::test]
    async fn test_retiring_connection_stops_reader_and_fires_callback() {
        let state = Arc::new(BusState::new());
        let disconnected = Arc::new(AtomicBool::new(false));
        let flag = disconnected.clone();
        state.callbacks.set_connection(Arc::new(move |_peer: crate::connection::PeerId, connected: bool| {
            if !connected {
                flag.store(true, Ordering::SeqCst);
            }
        }));

        let (conn, _remote, task) = start_reader(&state);
        state.registry.remove(conn.peer_id());

        let reason = tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("reader should stop")
            .unwrap();
        assert!(matches!(reason, DisconnectReason::Closed));
        assert!(disconnected.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_failing_handler_is_counted() {
        let state = Arc::new(BusState::new());
        state
            .router
            .register("bad", Arc::new(|_msg: &Message| -> anyhow::Result<()> { anyhow::bail!("nope") }));

        let (_conn, mut remote, task) = start_reader(&state);
        let frame = encode_frame(&Message::notification("bad", ""), 1024).unwrap();
        write_frame(&mut remote, &frame).await.unwrap();
        drop(remote);
        task.await.unwrap();

        let stats = state.stats.snapshot();
        assert_eq!(stats.handler_failures, 1);
        assert_eq!(stats.messages_received, 1);
    }
}
