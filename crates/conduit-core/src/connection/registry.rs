//! Live connections and their identities.
//!
//! Removal from the registry map is the single check-and-set that retires a
//! connection: whoever removes it flips `active` and fires its close token.
//! The reader owning the read half then shuts the write half down, so the
//! underlying stream is closed exactly once.

use super::PeerId;
use crate::protocol::write_frame;
use crate::transport::BoxedStream;
use crate::{IpcError, Result};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::io::{AsyncWriteExt, WriteHalf};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Snapshot of one connection for callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PeerInfo {
    pub peer_id: PeerId,
    pub process_id: Option<u32>,
    pub description: String,
    pub connected_for: Duration,
    pub idle_for: Duration,
}

/// One established link to a peer.
pub struct Connection {
    peer_id: PeerId,
    process_id: Option<u32>,
    description: String,
    active: AtomicBool,
    connected_at: Instant,
    last_activity: Mutex<Instant>,
    writer: tokio::sync::Mutex<Option<WriteHalf<BoxedStream>>>,
    close: CancellationToken,
}

impl Connection {
    pub fn new(
        peer_id: PeerId,
        process_id: Option<u32>,
        description: impl Into<String>,
        writer: WriteHalf<BoxedStream>,
        close: CancellationToken,
    ) -> Self {
        let now = Instant::now();
        Self {
            peer_id,
            process_id,
            description: description.into(),
            active: AtomicBool::new(true),
            connected_at: now,
            last_activity: Mutex::new(now),
            writer: tokio::sync::Mutex::new(Some(writer)),
            close,
        }
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Resolves once the connection has been retired.
    pub async fn closed(&self) {
        self.close.cancelled().await
    }

    /// Refresh the last-activity timestamp.
    pub fn touch(&self) {
        *self
            .last_activity
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    pub fn info(&self) -> PeerInfo {
        let last = *self
            .last_activity
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        PeerInfo {
            peer_id: self.peer_id,
            process_id: self.process_id,
            description: self.description.clone(),
            connected_for: self.connected_at.elapsed(),
            idle_for: last.elapsed(),
        }
    }

    /// Write one encoded frame, bounded by `timeout`.
    pub async fn write_frame(&self, frame: &[u8], timeout: Duration) -> Result<()> {
        let failed = |message: String| IpcError::WriteFailed {
            peer: self.peer_id,
            message,
        };

        if !self.is_active() {
            return Err(failed("connection is closed".to_string()));
        }

        let mut guard = self.writer.lock().await;
        let writer = guard
            .as_mut()
            .ok_or_else(|| failed("connection is closed".to_string()))?;

        match tokio::time::timeout(timeout, write_frame(writer, frame)).await {
            Ok(Ok(())) => {
                drop(guard);
                self.touch();
                Ok(())
            }
            Ok(Err(e)) => Err(failed(e.to_string())),
            Err(_) => Err(failed(format!("write timed out after {:?}", timeout))),
        }
    }

    /// Flip `active` and wake the reader. Returns false if already retired.
    fn retire(&self) -> bool {
        let was_active = self.active.swap(false, Ordering::AcqRel);
        self.close.cancel();
        was_active
    }

    /// Shut down and drop the write half. Later calls are no-ops.
    pub(crate) async fn shutdown_writer(&self) {
        let writer = self.writer.lock().await.take();
        if let Some(mut writer) = writer {
            if let Err(e) = writer.shutdown().await {
                debug!("Shutdown of peer {} stream reported: {}", self.peer_id, e);
            }
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("peer_id", &self.peer_id)
            .field("process_id", &self.process_id)
            .field("description", &self.description)
            .field("active", &self.is_active())
            .finish()
    }
}

/// The set of live connections.
#[derive(Debug)]
pub struct ConnectionRegistry {
    connections: Mutex<HashMap<PeerId, Arc<Connection>>>,
    next_id: AtomicU32,
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self {
            connections: Mutex::new(HashMap::new()),
            next_id: AtomicU32::new(1),
        }
    }
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<PeerId, Arc<Connection>>> {
        self.connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Allocate a server-side peer id. Ids are never reused.
    pub fn next_peer_id(&self) -> PeerId {
        PeerId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Register `connection` unless `limit` connections are already live.
    pub fn try_insert(&self, connection: Arc<Connection>, limit: usize) -> bool {
        let mut connections = self.lock();
        if connections.len() >= limit {
            return false;
        }
        connections.insert(connection.peer_id(), connection);
        true
    }

    pub fn get(&self, peer_id: PeerId) -> Option<Arc<Connection>> {
        self.lock().get(&peer_id).cloned()
    }

    pub fn contains(&self, peer_id: PeerId) -> bool {
        self.lock().contains_key(&peer_id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Connected peer ids in ascending order.
    pub fn peer_ids(&self) -> Vec<PeerId> {
        let mut ids: Vec<PeerId> = self.lock().keys().copied().collect();
        ids.sort();
        ids
    }

    /// Snapshot of the live connections, ordered by peer id.
    pub fn active(&self) -> Vec<Arc<Connection>> {
        let mut connections: Vec<Arc<Connection>> = self
            .lock()
            .values()
            .filter(|conn| conn.is_active())
            .cloned()
            .collect();
        connections.sort_by_key(|conn| conn.peer_id());
        connections
    }

    pub fn infos(&self) -> Vec<PeerInfo> {
        self.active().iter().map(|conn| conn.info()).collect()
    }

    /// Retire the connection for `peer_id`. Returns it if it was live.
    pub fn remove(&self, peer_id: PeerId) -> Option<Arc<Connection>> {
        let removed = self.lock().remove(&peer_id);
        removed.filter(|conn| conn.retire())
    }

    /// Retire `connection` if it is still the registered entry for its id.
    pub fn remove_if_same(&self, connection: &Arc<Connection>) -> bool {
        let mut connections = self.lock();
        let same = connections
            .get(&connection.peer_id())
            .is_some_and(|current| Arc::ptr_eq(current, connection));
        if same {
            connections.remove(&connection.peer_id());
        }
        drop(connections);
        connection.retire() && same
    }

    /// Retire every connection.
    pub fn close_all(&self) -> Vec<Arc<Connection>> {
        let drained: Vec<Arc<Connection>> = self.lock().drain().map(|(_, conn)| conn).collect();
        for conn in &drained {
            conn.retire();
        }
        drained
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::BoxedStream;

    fn test_connection(registry: &ConnectionRegistry) -> (Arc<Connection>, tokio::io::DuplexStream) {
        let (local, remote) = tokio::io::duplex(1024);
        let stream: BoxedStream = Box::new(local);
        let (_read, write) = tokio::io::split(stream);
        let conn = Arc::new(Connection::new(
            registry.next_peer_id(),
            None,
            "duplex",
            write,
            CancellationToken::new(),
        ));
        (conn, remote)
    }

    #[tokio::test]
    async fn test_try_insert_respects_limit() {
        let registry = ConnectionRegistry::new();
        let (a, _ra) = test_connection(&registry);
        let (b, _rb) = test_connection(&registry);
        let (c, _rc) = test_connection(&registry);

        assert!(registry.try_insert(a, 2));
        assert!(registry.try_insert(b, 2));
        assert!(!registry.try_insert(c, 2));
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.peer_ids(), vec![PeerId(1), PeerId(2)]);
    }

    #[tokio::test]
    async fn test_remove_retires_exactly_once() {
        let registry = ConnectionRegistry::new();
        let (conn, _remote) = test_connection(&registry);
        let peer = conn.peer_id();
        registry.try_insert(conn.clone(), 10);

        assert!(registry.remove(peer).is_some());
        assert!(!conn.is_active());
        assert!(registry.remove(peer).is_none());
        assert!(!registry.remove_if_same(&conn));
        assert!(!registry.contains(peer));
    }

    #[tokio::test]
    async fn test_remove_if_same_ignores_replaced_entry() {
        let registry = ConnectionRegistry::new();
        let (old, _r1) = test_connection(&registry);
        registry.try_insert(old.clone(), 10);

        // A reconnect registered a new connection under the same id.
        let (new_local, _r2) = tokio::io::duplex(64);
        let stream: BoxedStream = Box::new(new_local);
        let (_read, write) = tokio::io::split(stream);
        let replacement = Arc::new(Connection::new(
            old.peer_id(),
            None,
            "replacement",
            write,
            CancellationToken::new(),
        ));
        registry.lock().insert(old.peer_id(), replacement.clone());

        assert!(!registry.remove_if_same(&old));
        assert!(registry.contains(old.peer_id()));
        assert!(replacement.is_active());
    }

    #[tokio::test]
    async fn test_write_frame_reaches_peer_and_fails_after_close() {
        use tokio::io::AsyncReadExt;

        let registry = ConnectionRegistry::new();
        let (conn, mut remote) = test_connection(&registry);
        registry.try_insert(conn.clone(), 10);

        conn.write_frame(b"abc", Duration::from_secs(1)).await.unwrap();
        let mut buf = [0u8; 3];
        remote.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"abc");

        registry.close_all();
        conn.shutdown_writer().await;
        conn.shutdown_writer().await;
        assert!(conn.write_frame(b"x", Duration::from_secs(1)).await.is_err());
    }

    #[tokio::test]
    async fn test_retire_fires_close_token() {
        let registry = ConnectionRegistry::new();
        let (conn, _remote) = test_connection(&registry);
        registry.try_insert(conn.clone(), 10);

        registry.remove(conn.peer_id());
        tokio::time::timeout(Duration::from_millis(100), conn.closed())
            .await
            .expect("close token should fire");
    }
}
