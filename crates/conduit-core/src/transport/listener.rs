//! Server-side endpoint: bind once (TCP, unix socket) or create one pipe
//! instance per accepted peer (Windows named pipes).

use super::{BoxedStream, IpcAddress};
use crate::{IpcError, Result};
#[cfg(unix)]
use std::path::PathBuf;
use tokio::net::TcpListener;
#[cfg(unix)]
use tokio::net::UnixListener;
#[cfg(windows)]
use tokio::net::windows::named_pipe::{NamedPipeServer, ServerOptions};
use tracing::{debug, info, warn};

/// Largest instance count the Windows pipe API accepts.
#[cfg(windows)]
const PIPE_MAX_INSTANCES: usize = 254;

/// A freshly accepted peer stream.
pub struct Accepted {
    pub stream: BoxedStream,
    /// OS process id of the peer, when the transport exposes it.
    pub process_id: Option<u32>,
    /// Human-readable peer description for logs.
    pub description: String,
}

/// A bound server endpoint.
pub struct Listener {
    kind: ListenerKind,
    local_address: IpcAddress,
}

enum ListenerKind {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix { listener: UnixListener, path: PathBuf },
    #[cfg(windows)]
    Pipe {
        name: String,
        next: Option<NamedPipeServer>,
        max_instances: usize,
        buffer_size: u32,
    },
}

impl Listener {
    /// Bind the endpoint described by `address`.
    ///
    /// A stale unix socket file with nobody listening behind it is removed
    /// first; a live one fails the bind.
    pub async fn bind(address: &IpcAddress, max_peers: usize, buffer_size: usize) -> Result<Self> {
        // Only named pipes size their instances up front.
        #[cfg(not(windows))]
        let _ = (max_peers, buffer_size);

        let bind_failed = |e: std::io::Error| IpcError::BindFailed {
            address: address.to_string(),
            message: e.to_string(),
            source: Some(e),
        };

        match address {
            IpcAddress::Tcp(addr) => {
                let listener = TcpListener::bind(addr).await.map_err(bind_failed)?;
                let local = listener.local_addr().map_err(bind_failed)?;
                info!("IPC listener bound on tcp://{}", local);
                Ok(Self {
                    kind: ListenerKind::Tcp(listener),
                    local_address: IpcAddress::Tcp(local),
                })
            }
            #[cfg(unix)]
            IpcAddress::Unix(path) => {
                if path.exists() {
                    if tokio::net::UnixStream::connect(path).await.is_ok() {
                        return Err(IpcError::BindFailed {
                            address: address.to_string(),
                            message: "another server is already listening".to_string(),
                            source: None,
                        });
                    }
                    debug!("Removing stale socket file {}", path.display());
                    std::fs::remove_file(path).map_err(bind_failed)?;
                }
                let listener = UnixListener::bind(path).map_err(bind_failed)?;
                info!("IPC listener bound on {}", path.display());
                Ok(Self {
                    kind: ListenerKind::Unix {
                        listener,
                        path: path.clone(),
                    },
                    local_address: address.clone(),
                })
            }
            #[cfg(windows)]
            IpcAddress::NamedPipe(name) => {
                // One spare instance so a peer over the limit is refused by us
                // (and logged) instead of spinning on ERROR_PIPE_BUSY.
                let max_instances = (max_peers + 1).min(PIPE_MAX_INSTANCES);
                let buffer_size = u32::try_from(buffer_size).unwrap_or(u32::MAX);
                let first = ServerOptions::new()
                    .first_pipe_instance(true)
                    .max_instances(max_instances)
                    .in_buffer_size(buffer_size)
                    .out_buffer_size(buffer_size)
                    .create(name)
                    .map_err(bind_failed)?;
                info!("IPC listener created pipe {}", name);
                Ok(Self {
                    kind: ListenerKind::Pipe {
                        name: name.clone(),
                        next: Some(first),
                        max_instances,
                        buffer_size,
                    },
                    local_address: address.clone(),
                })
            }
        }
    }

    /// The bound address, with the real port for `tcp://…:0`.
    pub fn local_address(&self) -> &IpcAddress {
        &self.local_address
    }

    /// Wait for the next peer.
    pub async fn accept(&mut self) -> Result<Accepted> {
        match &mut self.kind {
            ListenerKind::Tcp(listener) => {
                let (stream, peer_addr) = listener.accept().await?;
                if let Err(e) = stream.set_nodelay(true) {
                    warn!("Failed to set TCP_NODELAY for {}: {}", peer_addr, e);
                }
                Ok(Accepted {
                    stream: Box::new(stream),
                    process_id: None,
                    description: peer_addr.to_string(),
                })
            }
            #[cfg(unix)]
            ListenerKind::Unix { listener, path } => {
                let (stream, _) = listener.accept().await?;
                let process_id = stream
                    .peer_cred()
                    .ok()
                    .and_then(|cred| cred.pid())
                    .and_then(|pid| u32::try_from(pid).ok());
                let description = match process_id {
                    Some(pid) => format!("{} (PID {})", path.display(), pid),
                    None => path.display().to_string(),
                };
                Ok(Accepted {
                    stream: Box::new(stream),
                    process_id,
                    description,
                })
            }
            #[cfg(windows)]
            ListenerKind::Pipe {
                name,
                next,
                max_instances,
                buffer_size,
            } => {
                let server = match next.take() {
                    Some(server) => server,
                    None => ServerOptions::new()
                        .max_instances(*max_instances)
                        .in_buffer_size(*buffer_size)
                        .out_buffer_size(*buffer_size)
                        .create(name.as_str())?,
                };
                server.connect().await?;

                // Create the next instance now so new peers never find the
                // pipe missing; a failure here surfaces on the next accept.
                *next = ServerOptions::new()
                    .max_instances(*max_instances)
                    .in_buffer_size(*buffer_size)
                    .out_buffer_size(*buffer_size)
                    .create(name.as_str())
                    .ok();

                Ok(Accepted {
                    stream: Box::new(server),
                    process_id: None,
                    description: name.clone(),
                })
            }
        }
    }
}

#[cfg(unix)]
impl Drop for Listener {
    fn drop(&mut self) {
        if let ListenerKind::Unix { path, .. } = &self.kind {
            if let Err(e) = std::fs::remove_file(path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!("Failed to remove socket file {}: {}", path.display(), e);
                }
            }
        }
    }
}
