//! Correlation table for outstanding requests.
//!
//! A waiter registers its message id before the request is queued, so a fast
//! response can never arrive ahead of its entry. The returned guard removes
//! the entry when it is dropped, whichever way the wait ended.

use crate::{IpcError, Result};
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::debug;

/// How a pending request was settled from the transport side.
#[derive(Debug)]
pub(crate) enum Resolution {
    Response(Bytes),
    Undeliverable,
    Cancelled,
}

#[derive(Debug, Default)]
pub struct PendingRequests {
    waiters: Mutex<HashMap<String, oneshot::Sender<Resolution>>>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, oneshot::Sender<Resolution>>> {
        self.waiters.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a waiter for `id`.
    pub fn register(&self, id: impl Into<String>) -> PendingGuard<'_> {
        let id = id.into();
        let (tx, rx) = oneshot::channel();
        self.lock().insert(id.clone(), tx);
        PendingGuard {
            id,
            table: self,
            rx: Some(rx),
        }
    }

    /// Hand `payload` to the waiter for `id`. Returns false if nobody waits.
    pub fn resolve(&self, id: &str, payload: Bytes) -> bool {
        self.settle(id, Resolution::Response(payload))
    }

    /// Fail the waiter for `id` early because the request reached nobody.
    pub fn fail_undeliverable(&self, id: &str) -> bool {
        self.settle(id, Resolution::Undeliverable)
    }

    /// Release every waiter; used when the manager stops.
    pub fn cancel_all(&self) -> usize {
        let drained: Vec<_> = self.lock().drain().collect();
        let count = drained.len();
        for (_, tx) in drained {
            let _ = tx.send(Resolution::Cancelled);
        }
        if count > 0 {
            debug!("Cancelled {} pending request(s)", count);
        }
        count
    }

    pub fn contains(&self, id: &str) -> bool {
        self.lock().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn settle(&self, id: &str, resolution: Resolution) -> bool {
        let waiter = self.lock().remove(id);
        match waiter {
            // A send error means the waiter already gave up; that is fine.
            Some(tx) => tx.send(resolution).is_ok(),
            None => false,
        }
    }
}

/// Registration handle for one outstanding request.
#[derive(Debug)]
pub struct PendingGuard<'a> {
    id: String,
    table: &'a PendingRequests,
    rx: Option<oneshot::Receiver<Resolution>>,
}

impl PendingGuard<'_> {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Wait up to `timeout` for the response payload.
    pub async fn wait(mut self, timeout: Duration) -> Result<Bytes> {
        let Some(rx) = self.rx.take() else {
            return Err(IpcError::NotRunning);
        };
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(Resolution::Response(payload))) => Ok(payload),
            Ok(Ok(Resolution::Undeliverable)) => Err(IpcError::Undeliverable {
                id: self.id.clone(),
            }),
            Ok(Ok(Resolution::Cancelled)) | Ok(Err(_)) => Err(IpcError::NotRunning),
            Err(_) => Err(IpcError::Timeout(timeout)),
        }
    }
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.table.lock().remove(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_resolve_delivers_payload_and_clears_entry() {
        let table = PendingRequests::new();
        let guard = table.register("msg_1");
        assert!(table.contains("msg_1"));

        assert!(table.resolve("msg_1", Bytes::from_static(b"pong")));
        let payload = guard.wait(Duration::from_secs(1)).await.unwrap();
        assert_eq!(&payload[..], b"pong");
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn test_timeout_clears_entry() {
        let table = PendingRequests::new();
        let guard = table.register("msg_2");

        let result = guard.wait(Duration::from_millis(20)).await;
        assert!(matches!(result, Err(IpcError::Timeout(_))));
        assert!(!table.contains("msg_2"));
        assert!(!table.resolve("msg_2", Bytes::new()));
    }

    #[tokio::test]
    async fn test_unknown_id_is_ignored() {
        let table = PendingRequests::new();
        let _guard = table.register("msg_3");
        assert!(!table.resolve("msg_other", Bytes::new()));
        assert_eq!(table.len(), 1);
    }

    #[tokio::test]
    async fn test_undeliverable_and_cancel() {
        let table = PendingRequests::new();
        let first = table.register("a");
        let second = table.register("b");

        assert!(table.fail_undeliverable("a"));
        assert!(matches!(
            first.wait(Duration::from_secs(1)).await,
            Err(IpcError::Undeliverable { .. })
        ));

        assert_eq!(table.cancel_all(), 1);
        assert!(matches!(
            second.wait(Duration::from_secs(1)).await,
            Err(IpcError::NotRunning)
        ));
    }

    #[tokio::test]
    async fn test_dropping_guard_unregisters() {
        let table = PendingRequests::new();
        {
            let _guard = table.register("gone");
            assert!(table.contains("gone"));
        }
        assert!(table.is_empty());
    }
}
