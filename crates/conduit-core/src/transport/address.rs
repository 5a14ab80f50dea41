//! Endpoint addresses.
//!
//! Accepted forms:
//! - `tcp://127.0.0.1:4000`: loopback TCP (port 0 lets the OS pick)
//! - `/run/user/1000/app.sock` or `unix:///run/…`: unix domain socket (unix only)
//! - `\\.\pipe\app` or a bare pipe name: named pipe (Windows only)

use crate::config::IpcDefaults;
use crate::{IpcError, Result};
use std::net::SocketAddr;
#[cfg(unix)]
use std::path::PathBuf;

/// A local endpoint the bus can listen on or connect to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum IpcAddress {
    /// Loopback TCP socket.
    Tcp(SocketAddr),
    /// Unix domain socket at a filesystem path.
    #[cfg(unix)]
    Unix(PathBuf),
    /// Windows named pipe, full `\\.\pipe\…` form.
    #[cfg(windows)]
    NamedPipe(String),
}

#[cfg(windows)]
const PIPE_PREFIX: &str = r"\\.\pipe\";

impl IpcAddress {
    /// Platform default: a named pipe on Windows, a socket in the temp dir elsewhere.
    pub fn default_local() -> Self {
        #[cfg(windows)]
        {
            IpcAddress::NamedPipe(format!("{}{}", PIPE_PREFIX, IpcDefaults::PIPE_NAME))
        }
        #[cfg(unix)]
        {
            IpcAddress::Unix(std::env::temp_dir().join(format!("{}.sock", IpcDefaults::PIPE_NAME)))
        }
    }

    /// Parse an address string. See the module docs for accepted forms.
    pub fn parse(input: &str) -> Result<Self> {
        let trimmed = input.trim();
        let invalid = |message: &str| IpcError::InvalidAddress {
            address: input.to_string(),
            message: message.to_string(),
        };

        if trimmed.is_empty() {
            return Err(invalid("address is empty"));
        }

        if let Some(rest) = trimmed.strip_prefix("tcp://") {
            let addr: SocketAddr = rest
                .parse()
                .map_err(|e| invalid(&format!("bad socket address: {}", e)))?;
            if !addr.ip().is_loopback() {
                return Err(invalid("only loopback TCP addresses are supported"));
            }
            return Ok(IpcAddress::Tcp(addr));
        }

        #[cfg(unix)]
        {
            let path = trimmed.strip_prefix("unix://").unwrap_or(trimmed);
            if path.is_empty() {
                return Err(invalid("socket path is empty"));
            }
            Ok(IpcAddress::Unix(PathBuf::from(path)))
        }

        #[cfg(windows)]
        {
            let name = trimmed.strip_prefix(PIPE_PREFIX).unwrap_or(trimmed);
            if name.is_empty() || name.contains('\\') {
                return Err(invalid("pipe name must be non-empty and contain no backslash"));
            }
            Ok(IpcAddress::NamedPipe(format!("{}{}", PIPE_PREFIX, name)))
        }
    }

    /// Loopback TCP address on an OS-assigned port.
    pub fn tcp_loopback() -> Self {
        IpcAddress::Tcp(SocketAddr::from(([127, 0, 0, 1], 0)))
    }
}

impl std::str::FromStr for IpcAddress {
    type Err = IpcError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl std::fmt::Display for IpcAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IpcAddress::Tcp(addr) => write!(f, "tcp://{}", addr),
            #[cfg(unix)]
            IpcAddress::Unix(path) => write!(f, "{}", path.display()),
            #[cfg(windows)]
            IpcAddress::NamedPipe(name) => write!(f, "{}", name),
        }
    }
}
