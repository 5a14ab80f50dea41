//! End-to-end tests for the IPC manager over loopback TCP.
//!
//! Every test binds `tcp://127.0.0.1:0` and reads the real port back from the
//! server, so tests can run in parallel.

use bytes::Bytes;
use conduit_core::{
    IpcAddress, IpcConfig, IpcError, IpcManager, LinkState, Message, PeerId, Role,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

const WAIT: Duration = Duration::from_secs(5);

async fn start_server(max_peers: usize) -> IpcManager {
    let server = IpcManager::new();
    server
        .start(IpcConfig::server(IpcAddress::tcp_loopback()).with_max_peers(max_peers))
        .await
        .expect("server should start");
    server
        .wait_for_state(|s| *s == LinkState::Listening, WAIT)
        .await
        .expect("server should listen");
    server
}

async fn start_client(server: &IpcManager) -> IpcManager {
    let client = IpcManager::new();
    let address = server.local_address().expect("server address");
    client
        .start(
            IpcConfig::client(address)
                .with_reconnect_delay(Duration::from_millis(50))
                .with_io_timeout(Duration::from_secs(2)),
        )
        .await
        .expect("client should start");
    client
        .wait_for_state(|s| *s == LinkState::Connected, WAIT)
        .await
        .expect("client should connect");
    client
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(WAIT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

/// Collects payloads seen on a channel.
fn collect(manager: &IpcManager, channel: &str) -> Arc<Mutex<Vec<Message>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    manager.on_message(channel, move |msg| {
        sink.lock().unwrap().push(msg.clone());
        Ok(())
    });
    seen
}

#[tokio::test]
async fn test_notification_client_to_server() {
    let server = start_server(4).await;
    let seen = collect(&server, "status");
    let client = start_client(&server).await;

    client.send("status", "ready").unwrap();
    wait_until(|| !seen.lock().unwrap().is_empty()).await;

    let got = seen.lock().unwrap()[0].clone();
    assert_eq!(got.channel, "status");
    assert_eq!(&got.payload[..], b"ready");
    assert!(got.origin.is_some());

    client.stop().await;
    server.stop().await;
}

#[tokio::test]
async fn test_payload_bytes_survive_transport() {
    let server = start_server(4).await;
    let seen = collect(&server, "blob \"quoted\" \n ch");
    let client = start_client(&server).await;

    let payload: Vec<u8> = (0..=255u8).collect();
    client.send("blob \"quoted\" \n ch", payload.clone()).unwrap();
    client.send("blob \"quoted\" \n ch", Bytes::new()).unwrap();
    wait_until(|| seen.lock().unwrap().len() == 2).await;

    let seen = seen.lock().unwrap();
    assert_eq!(&seen[0].payload[..], &payload[..]);
    assert!(seen[1].payload.is_empty());

    drop(seen);
    client.stop().await;
    server.stop().await;
}

#[tokio::test]
async fn test_request_response_roundtrip() {
    let server = start_server(4).await;
    let responder = server.responder();
    server.on_message("echo", move |msg| {
        let mut reply = b"echo:".to_vec();
        reply.extend_from_slice(&msg.payload);
        responder.reply(msg, reply)?;
        Ok(())
    });
    let client = start_client(&server).await;

    let reply = client
        .send_request("echo", "hi", Duration::from_secs(2))
        .await
        .unwrap();
    assert_eq!(&reply[..], b"echo:hi");

    client.stop().await;
    server.stop().await;
}

#[tokio::test]
async fn test_concurrent_requests_get_their_own_responses() {
    let server = start_server(4).await;
    let responder = server.responder();
    server.on_message("double", move |msg| {
        let n: u64 = std::str::from_utf8(&msg.payload)?.parse()?;
        responder.reply(msg, (n * 2).to_string())?;
        Ok(())
    });
    let client = Arc::new(start_client(&server).await);

    let mut tasks = Vec::new();
    for n in 0..32u64 {
        let client = client.clone();
        tasks.push(tokio::spawn(async move {
            let reply = client
                .send_request("double", n.to_string(), Duration::from_secs(5))
                .await
                .unwrap();
            (n, String::from_utf8(reply.to_vec()).unwrap())
        }));
    }

    for task in tasks {
        let (n, reply) = task.await.unwrap();
        assert_eq!(reply, (n * 2).to_string());
    }

    client.stop().await;
    server.stop().await;
}

#[tokio::test]
async fn test_request_timeout_returns_within_deadline() {
    let server = start_server(4).await;
    // Handler swallows requests without answering.
    server.on_message("silent", |_msg| Ok(()));
    let client = start_client(&server).await;

    let timeout = Duration::from_millis(200);
    let started = Instant::now();
    let result = client.send_request("silent", "anyone?", timeout).await;
    let elapsed = started.elapsed();

    assert!(matches!(result, Err(IpcError::Timeout(_))));
    assert!(elapsed >= timeout);
    assert!(elapsed < timeout + Duration::from_secs(1));

    client.stop().await;
    server.stop().await;
}

#[tokio::test]
async fn test_request_without_peers_fails_fast() {
    let server = start_server(4).await;

    let started = Instant::now();
    let result = server
        .send_request("nobody", "hello", Duration::from_secs(10))
        .await;
    assert!(matches!(result, Err(IpcError::Undeliverable { .. })));
    assert!(started.elapsed() < Duration::from_secs(2));

    server.stop().await;
}

#[tokio::test]
async fn test_server_request_to_specific_client() {
    let server = start_server(4).await;
    let client = start_client(&server).await;
    let responder = client.responder();
    client.on_message("whoami", move |msg| {
        responder.reply(msg, "client-1")?;
        Ok(())
    });

    wait_until(|| server.connected_peers().len() == 1).await;
    let peer = server.connected_peers()[0];

    let reply = server
        .send_request_to(peer, "whoami", "", Duration::from_secs(2))
        .await
        .unwrap();
    assert_eq!(&reply[..], b"client-1");

    client.stop().await;
    server.stop().await;
}

#[tokio::test]
async fn test_broadcast_reaches_every_client_once() {
    let server = start_server(4).await;
    let clients = vec![
        start_client(&server).await,
        start_client(&server).await,
        start_client(&server).await,
    ];
    let seen: Vec<_> = clients.iter().map(|c| collect(c, "news")).collect();
    wait_until(|| server.connected_peers().len() == 3).await;

    let before = server.statistics().messages_sent;
    server.broadcast("news", "extra").unwrap();

    wait_until(|| seen.iter().all(|s| s.lock().unwrap().len() == 1)).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    for s in &seen {
        assert_eq!(s.lock().unwrap().len(), 1);
    }
    wait_until(|| server.statistics().messages_sent == before + 3).await;

    for client in &clients {
        client.stop().await;
    }
    server.stop().await;
}

#[tokio::test]
async fn test_send_to_reaches_only_target() {
    let server = start_server(4).await;
    let first = start_client(&server).await;
    let second = start_client(&server).await;
    let seen_first = collect(&first, "direct");
    let seen_second = collect(&second, "direct");
    wait_until(|| server.connected_peers().len() == 2).await;

    // Peers are numbered in accept order and the first client connected first.
    let target = server.connected_peers()[0];
    server.send_to(target, "direct", "for you").unwrap();

    wait_until(|| seen_first.lock().unwrap().len() == 1).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(seen_second.lock().unwrap().is_empty());

    first.stop().await;
    second.stop().await;
    server.stop().await;
}

#[tokio::test]
async fn test_disconnect_peer() {
    let server = start_server(4).await;
    let client = start_client(&server).await;
    wait_until(|| server.connected_peers().len() == 1).await;
    let peer = server.connected_peers()[0];

    assert!(server.disconnect_peer(peer));
    assert!(!server.is_connected(peer));
    assert!(matches!(
        server.send_to(peer, "ch", "x"),
        Err(IpcError::PeerNotFound(p)) if p == peer
    ));
    assert!(!server.disconnect_peer(peer));

    client.stop().await;
    server.stop().await;
}

#[tokio::test]
async fn test_max_peers_is_enforced() {
    let server = start_server(2).await;
    let refusals = Arc::new(AtomicUsize::new(0));
    let counter = refusals.clone();
    server.on_error(move |_desc, code| {
        if code == -32003 {
            counter.fetch_add(1, Ordering::SeqCst);
        }
    });

    let _a = start_client(&server).await;
    let _b = start_client(&server).await;
    wait_until(|| server.connected_peers().len() == 2).await;

    // The third client connects at the transport level but is refused.
    let third = IpcManager::new();
    third
        .start(
            IpcConfig::client(server.local_address().unwrap())
                .with_reconnect(false),
        )
        .await
        .unwrap();

    wait_until(|| refusals.load(Ordering::SeqCst) >= 1).await;
    assert!(server.connected_peers().len() <= 2);

    third.stop().await;
    server.stop().await;
}

#[tokio::test]
async fn test_client_gives_up_after_max_attempts() {
    // Bind and release a port so nothing listens on it.
    let placeholder = start_server(1).await;
    let address = placeholder.local_address().unwrap();
    placeholder.stop().await;

    let client = IpcManager::new();
    let started = Instant::now();
    client
        .start(
            IpcConfig::client(address)
                .with_reconnect_delay(Duration::from_millis(100))
                .with_max_reconnect_attempts(3)
                .with_io_timeout(Duration::from_secs(1)),
        )
        .await
        .unwrap();

    client
        .wait_for_state(|s| *s == LinkState::Failed, WAIT)
        .await
        .unwrap();
    let elapsed = started.elapsed();

    let stats = client.statistics();
    assert_eq!(stats.connections_failed, 3);
    assert_eq!(stats.reconnect_attempts, 2);
    assert!(elapsed >= Duration::from_millis(200));

    // No further attempts once failed.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(client.statistics().connections_failed, 3);

    client.stop().await;
}

#[tokio::test]
async fn test_client_reconnects_after_server_restart() {
    let server = start_server(4).await;
    let address = server.local_address().unwrap();
    let client = start_client(&server).await;

    server.stop().await;
    client
        .wait_for_state(|s| *s != LinkState::Connected, WAIT)
        .await
        .unwrap();

    server
        .start(IpcConfig::server(address))
        .await
        .unwrap();
    client
        .wait_for_state(|s| *s == LinkState::Connected, WAIT)
        .await
        .unwrap();
    assert!(client.statistics().reconnect_attempts >= 1);

    let seen = collect(&server, "back");
    client.send("back", "again").unwrap();
    wait_until(|| seen.lock().unwrap().len() == 1).await;

    client.stop().await;
    server.stop().await;
}

#[tokio::test]
async fn test_failing_handler_does_not_block_other_channels() {
    let server = start_server(4).await;
    server.on_message("ping", |_msg| anyhow::bail!("ping handler always fails"));
    let pong = collect(&server, "pong");
    let client = start_client(&server).await;

    client.send("ping", "1").unwrap();
    client.send("pong", "2").unwrap();

    wait_until(|| pong.lock().unwrap().len() == 1).await;
    assert_eq!(server.statistics().handler_failures, 1);

    client.stop().await;
    server.stop().await;
}

#[tokio::test]
async fn test_connection_callbacks_fire_on_both_sides() {
    let server = start_server(4).await;
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    server.on_connection(move |peer: PeerId, connected| sink.lock().unwrap().push((peer, connected)));

    let client = start_client(&server).await;
    wait_until(|| events.lock().unwrap().len() == 1).await;
    client.stop().await;
    wait_until(|| events.lock().unwrap().len() == 2).await;

    let events = events.lock().unwrap();
    assert_eq!(events[0].0, events[1].0);
    assert!(events[0].1);
    assert!(!events[1].1);

    drop(events);
    server.stop().await;
}

#[tokio::test]
async fn test_role_restrictions_and_client_identity() {
    let server = start_server(4).await;
    let client = start_client(&server).await;

    assert_eq!(client.role(), Some(Role::Client));
    assert_eq!(client.connected_peers(), vec![client.self_id()]);
    assert!(matches!(
        client.broadcast("ch", "x"),
        Err(IpcError::WrongRole { .. })
    ));

    client.stop().await;
    assert!(client.connected_peers().is_empty());
    server.stop().await;
}

#[tokio::test]
async fn test_statistics_count_traffic() {
    let server = start_server(4).await;
    let seen = collect(&server, "count");
    let client = start_client(&server).await;

    for i in 0..5 {
        client.send("count", format!("{}", i)).unwrap();
    }
    wait_until(|| seen.lock().unwrap().len() == 5).await;

    let client_stats = client.statistics();
    let server_stats = server.statistics();
    assert_eq!(client_stats.messages_sent, 5);
    assert_eq!(server_stats.messages_received, 5);
    assert_eq!(client_stats.bytes_transferred, server_stats.bytes_transferred);
    assert!(client_stats.bytes_transferred > 0);

    client.stop().await;
    server.stop().await;
}

#[tokio::test]
async fn test_stop_fails_pending_requests_and_allows_restart() {
    let server = Arc::new(start_server(4).await);
    server.on_message("slow", |_msg| Ok(()));
    let client = Arc::new(start_client(&server).await);

    let waiter = {
        let client = client.clone();
        tokio::spawn(async move {
            client
                .send_request("slow", "x", Duration::from_secs(30))
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    client.stop().await;

    let result = tokio::time::timeout(WAIT, waiter).await.unwrap().unwrap();
    assert!(matches!(result, Err(IpcError::NotRunning)));
    assert!(!client.is_running());

    // Handlers and stats survive a restart.
    let sent_before = client.statistics().messages_sent;
    client
        .start(IpcConfig::client(server.local_address().unwrap()))
        .await
        .unwrap();
    client
        .wait_for_state(|s| *s == LinkState::Connected, WAIT)
        .await
        .unwrap();
    client.send("slow", "again").unwrap();
    wait_until(|| client.statistics().messages_sent == sent_before + 1).await;

    client.stop().await;
    server.stop().await;
}

#[cfg(unix)]
#[tokio::test]
async fn test_unix_socket_transport() {
    let dir = tempfile::TempDir::new().unwrap();
    let address = IpcAddress::Unix(dir.path().join("bus.sock"));

    let server = IpcManager::new();
    let seen = collect(&server, "hello");
    server
        .start(IpcConfig::server(address.clone()))
        .await
        .unwrap();
    server
        .wait_for_state(|s| *s == LinkState::Listening, WAIT)
        .await
        .unwrap();

    let client = start_client(&server).await;
    client.send("hello", "over unix").unwrap();
    wait_until(|| seen.lock().unwrap().len() == 1).await;

    let peers = server.peers();
    assert_eq!(peers.len(), 1);
    assert_eq!(peers[0].process_id, Some(std::process::id()));

    client.stop().await;
    server.stop().await;
}
