//! Configuration for the IPC manager.
//!
//! Defaults live as associated constants on [`IpcDefaults`]; [`IpcConfig`] is
//! the per-manager configuration, immutable once the manager is started.

use crate::transport::IpcAddress;
use crate::{IpcError, Result};
use std::time::Duration;

/// Default values for [`IpcConfig`].
pub struct IpcDefaults;

impl IpcDefaults {
    pub const PIPE_NAME: &'static str = "conduit";
    pub const MAX_PEERS: usize = 10;
    pub const BUFFER_SIZE: usize = 65_536; // 64KB
    pub const IO_TIMEOUT: Duration = Duration::from_millis(5000);
    pub const RECONNECT_ENABLED: bool = true;
    pub const RECONNECT_DELAY: Duration = Duration::from_millis(1000);
    pub const MAX_RECONNECT_ATTEMPTS: u32 = 5;
    pub const SEND_QUEUE_CAPACITY: usize = 1024;
    pub const ACCEPT_BACKOFF: Duration = Duration::from_millis(1000);
    pub const REQUEST_TIMEOUT: Duration = Duration::from_millis(5000);
    /// Poll interval while waiting for a busy endpoint to free up.
    pub const BUSY_POLL_INTERVAL: Duration = Duration::from_millis(50);
}

/// Which side of the link this manager plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Role {
    /// Listen for peers (the coordinating process).
    #[default]
    Server,
    /// Connect to a server (a worker or front-end process).
    Client,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Server => "server",
            Role::Client => "client",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Role {
    type Err = IpcError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "server" => Ok(Role::Server),
            "client" => Ok(Role::Client),
            other => Err(IpcError::Validation {
                field: "role".to_string(),
                message: format!("unknown role {:?}", other),
            }),
        }
    }
}

/// IPC manager configuration.
#[derive(Debug, Clone)]
pub struct IpcConfig {
    /// Endpoint to listen on (server) or connect to (client).
    pub address: IpcAddress,
    pub role: Role,
    /// Maximum concurrently connected peers (server role).
    pub max_peers: usize,
    /// Maximum encoded frame size in bytes, both directions.
    pub buffer_size: usize,
    /// Bound on a single connect attempt and on each frame write.
    pub io_timeout: Duration,
    pub reconnect_enabled: bool,
    pub reconnect_delay: Duration,
    pub max_reconnect_attempts: u32,
    /// Capacity of the outbound queue shared by all senders.
    pub send_queue_capacity: usize,
    /// Wait before retrying after a bind or accept failure (server role).
    pub accept_backoff: Duration,
}

impl Default for IpcConfig {
    fn default() -> Self {
        Self {
            address: IpcAddress::default_local(),
            role: Role::Server,
            max_peers: IpcDefaults::MAX_PEERS,
            buffer_size: IpcDefaults::BUFFER_SIZE,
            io_timeout: IpcDefaults::IO_TIMEOUT,
            reconnect_enabled: IpcDefaults::RECONNECT_ENABLED,
            reconnect_delay: IpcDefaults::RECONNECT_DELAY,
            max_reconnect_attempts: IpcDefaults::MAX_RECONNECT_ATTEMPTS,
            send_queue_capacity: IpcDefaults::SEND_QUEUE_CAPACITY,
            accept_backoff: IpcDefaults::ACCEPT_BACKOFF,
        }
    }
}

impl IpcConfig {
    /// Server configuration listening on `address`.
    pub fn server(address: IpcAddress) -> Self {
        Self {
            address,
            role: Role::Server,
            ..Self::default()
        }
    }

    /// Client configuration connecting to `address`.
    pub fn client(address: IpcAddress) -> Self {
        Self {
            address,
            role: Role::Client,
            ..Self::default()
        }
    }

    pub fn with_max_peers(mut self, max_peers: usize) -> Self {
        self.max_peers = max_peers;
        self
    }

    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size;
        self
    }

    pub fn with_io_timeout(mut self, timeout: Duration) -> Self {
        self.io_timeout = timeout;
        self
    }

    /// Enable or disable client-side reconnection.
    pub fn with_reconnect(mut self, enabled: bool) -> Self {
        self.reconnect_enabled = enabled;
        self
    }

    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    pub fn with_max_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.max_reconnect_attempts = attempts;
        self
    }

    pub fn with_send_queue_capacity(mut self, capacity: usize) -> Self {
        self.send_queue_capacity = capacity;
        self
    }

    pub fn with_accept_backoff(mut self, backoff: Duration) -> Self {
        self.accept_backoff = backoff;
        self
    }

    /// Reject values the transport cannot work with.
    pub fn validate(&self) -> Result<()> {
        fn invalid(field: &str, message: &str) -> IpcError {
            IpcError::Validation {
                field: field.to_string(),
                message: message.to_string(),
            }
        }

        if self.role == Role::Server && self.max_peers == 0 {
            return Err(invalid("max_peers", "must allow at least one peer"));
        }
        if self.buffer_size < crate::protocol::MIN_FRAME_SIZE {
            return Err(invalid(
                "buffer_size",
                &format!("must be at least {} bytes", crate::protocol::MIN_FRAME_SIZE),
            ));
        }
        if self.buffer_size > u32::MAX as usize {
            return Err(invalid("buffer_size", "must fit a u32 length prefix"));
        }
        if self.io_timeout.is_zero() {
            return Err(invalid("io_timeout", "must be non-zero"));
        }
        if self.send_queue_capacity == 0 {
            return Err(invalid("send_queue_capacity", "must be non-zero"));
        }
        Ok(())
    }
}
