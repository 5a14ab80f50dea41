//! Transport statistics.
//!
//! Counters are monotonic for the lifetime of a manager (restarts included)
//! and updated with relaxed atomics; [`StatsCollector::snapshot`] hands out a
//! copy, never a live reference.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Statistics {
    pub messages_sent: u64,
    pub messages_received: u64,
    /// Frame bytes (header included) written plus read.
    pub bytes_transferred: u64,
    pub connections_failed: u64,
    pub reconnect_attempts: u64,
    /// Outbound messages with no reachable peer plus inbound frames that
    /// failed to decode.
    pub messages_dropped: u64,
    /// Channel handlers that returned an error or panicked.
    pub handler_failures: u64,
}

/// Lock-free counter set shared by the transport tasks.
#[derive(Debug, Default)]
pub struct StatsCollector {
    messages_sent: AtomicU64,
    messages_received: AtomicU64,
    bytes_transferred: AtomicU64,
    connections_failed: AtomicU64,
    reconnect_attempts: AtomicU64,
    messages_dropped: AtomicU64,
    handler_failures: AtomicU64,
}

impl StatsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_sent(&self, bytes: usize) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_transferred
            .fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_received(&self, bytes: usize) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_transferred
            .fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_connection_failed(&self) {
        self.connections_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reconnect_attempt(&self) {
        self.reconnect_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dropped(&self) {
        self.messages_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_handler_failure(&self) {
        self.handler_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> Statistics {
        Statistics {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            bytes_transferred: self.bytes_transferred.load(Ordering::Relaxed),
            connections_failed: self.connections_failed.load(Ordering::Relaxed),
            reconnect_attempts: self.reconnect_attempts.load(Ordering::Relaxed),
            messages_dropped: self.messages_dropped.load(Ordering::Relaxed),
            handler_failures: self.handler_failures.load(Ordering::Relaxed),
        }
    }
}
