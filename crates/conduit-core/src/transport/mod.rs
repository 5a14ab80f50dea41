//! Local byte-stream transports.
//!
//! Hides the difference between loopback TCP, unix domain sockets and Windows
//! named pipes behind a boxed `AsyncRead + AsyncWrite` stream. Everything above
//! this module only sees [`BoxedStream`].

pub mod address;
pub mod listener;

pub use address::IpcAddress;
pub use listener::{Accepted, Listener};

use crate::config::IpcDefaults;
use crate::{IpcError, Result};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::Instant;
use tracing::debug;

/// A duplex byte stream to one peer.
pub trait IpcStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> IpcStream for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

/// Type-erased peer stream.
pub type BoxedStream = Box<dyn IpcStream>;

/// Open a stream to `address`.
///
/// While the endpoint reports busy (every pipe instance taken, or the socket
/// backlog full) the open is retried until `timeout` has elapsed. The whole
/// attempt, busy waiting included, is bounded by `timeout`.
pub async fn connect(address: &IpcAddress, timeout: Duration) -> Result<BoxedStream> {
    match tokio::time::timeout(timeout, connect_with_busy_wait(address, timeout)).await {
        Ok(result) => result,
        Err(_) => Err(IpcError::ConnectFailed {
            address: address.to_string(),
            message: format!("timed out after {:?}", timeout),
            source: None,
        }),
    }
}

async fn connect_with_busy_wait(address: &IpcAddress, timeout: Duration) -> Result<BoxedStream> {
    let started = Instant::now();
    loop {
        match open_once(address).await {
            Ok(stream) => return Ok(stream),
            Err(e) if is_busy(&e) => {
                let waited = started.elapsed();
                if waited >= timeout {
                    return Err(IpcError::EndpointBusy {
                        address: address.to_string(),
                        waited,
                    });
                }
                debug!("Endpoint {} busy, waiting for availability", address);
                tokio::time::sleep(IpcDefaults::BUSY_POLL_INTERVAL).await;
            }
            Err(e) => {
                return Err(IpcError::ConnectFailed {
                    address: address.to_string(),
                    message: e.to_string(),
                    source: Some(e),
                })
            }
        }
    }
}

async fn open_once(address: &IpcAddress) -> std::io::Result<BoxedStream> {
    match address {
        IpcAddress::Tcp(addr) => {
            let stream = tokio::net::TcpStream::connect(addr).await?;
            stream.set_nodelay(true)?;
            Ok(Box::new(stream))
        }
        #[cfg(unix)]
        IpcAddress::Unix(path) => {
            let stream = tokio::net::UnixStream::connect(path).await?;
            Ok(Box::new(stream))
        }
        #[cfg(windows)]
        IpcAddress::NamedPipe(name) => {
            let client = tokio::net::windows::named_pipe::ClientOptions::new().open(name)?;
            Ok(Box::new(client))
        }
    }
}

/// Whether an open failure means "try again shortly" rather than "nobody there".
fn is_busy(err: &std::io::Error) -> bool {
    #[cfg(windows)]
    {
        if err.raw_os_error() == Some(windows_sys::Win32::Foundation::ERROR_PIPE_BUSY as i32) {
            return true;
        }
    }
    err.kind() == std::io::ErrorKind::WouldBlock
}
