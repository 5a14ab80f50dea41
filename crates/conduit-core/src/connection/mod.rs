//! Connection lifecycle: the server-side acceptor, the client-side connector,
//! the per-connection reader and the registry that tracks live links.

pub(crate) mod client;
pub(crate) mod reader;
pub mod registry;
pub(crate) mod server;

pub use registry::{Connection, ConnectionRegistry, PeerInfo};

use serde::{Deserialize, Serialize};

/// Identifier of a connected peer.
///
/// Servers number peers from 1 in accept order and never reuse an id within
/// one manager. A client is known by its own OS process id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(pub u32);

impl PeerId {
    /// The id a client uses for itself and its single connection.
    pub fn current_process() -> Self {
        PeerId(std::process::id())
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Observable state of the link task (acceptor or connector).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum LinkState {
    /// Never started.
    #[default]
    Idle,
    /// Server endpoint is bound and accepting.
    Listening,
    /// Client is making its first connection attempt.
    Connecting,
    /// Client is retrying after a failure or a lost connection.
    Reconnecting { attempt: u32 },
    /// Client has a live connection to the server.
    Connected,
    /// Client connection dropped; a reconnect decision is pending.
    Disconnected,
    /// Client gave up reconnecting.
    Failed,
    /// Manager was stopped.
    Stopped,
}

impl LinkState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LinkState::Idle => "idle",
            LinkState::Listening => "listening",
            LinkState::Connecting => "connecting",
            LinkState::Reconnecting { .. } => "reconnecting",
            LinkState::Connected => "connected",
            LinkState::Disconnected => "disconnected",
            LinkState::Failed => "failed",
            LinkState::Stopped => "stopped",
        }
    }
}

impl std::fmt::Display for LinkState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LinkState::Reconnecting { attempt } => write!(f, "reconnecting (attempt {})", attempt),
            other => f.write_str(other.as_str()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_id_display_and_order() {
        assert_eq!(PeerId(42).to_string(), "42");
        assert!(PeerId(1) < PeerId(2));
        assert_eq!(serde_json::to_string(&PeerId(3)).unwrap(), "3");
    }

    #[test]
    fn test_link_state_display() {
        assert_eq!(LinkState::default(), LinkState::Idle);
        assert_eq!(LinkState::Listening.to_string(), "listening");
        assert_eq!(
            LinkState::Reconnecting { attempt: 2 }.to_string(),
            "reconnecting (attempt 2)"
        );
    }
}
