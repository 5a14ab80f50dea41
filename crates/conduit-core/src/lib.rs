//! Conduit Core - local inter-process message bus.
//!
//! One coordinating process runs an [`IpcManager`] as a server; worker or
//! front-end processes run one as a client. Peers exchange named-channel
//! messages as length-prefixed JSON frames over loopback TCP, unix domain
//! sockets or Windows named pipes.
//!
//! Supported exchanges:
//! - fire-and-forget notifications ([`IpcManager::send`])
//! - unicast and broadcast from the server ([`IpcManager::send_to`], [`IpcManager::broadcast`])
//! - request/response with a timeout ([`IpcManager::send_request`], [`IpcManager::reply`])
//!
//! Clients reconnect automatically with a fixed delay and a bounded number of
//! attempts. Counters are available through [`IpcManager::statistics`].
//!
//! # Example
//!
//! ```rust,no_run
//! use conduit_core::{IpcAddress, IpcConfig, IpcManager, LinkState};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> conduit_core::Result<()> {
//!     let server = IpcManager::new();
//!     let responder = server.responder();
//!     server.on_message("echo", move |msg| {
//!         responder.reply(msg, msg.payload.clone())?;
//!         Ok(())
//!     });
//!     server.start(IpcConfig::server(IpcAddress::tcp_loopback())).await?;
//!     server
//!         .wait_for_state(|s| *s == LinkState::Listening, Duration::from_secs(1))
//!         .await?;
//!
//!     let client = IpcManager::new();
//!     client
//!         .start(IpcConfig::client(server.local_address().expect("listening")))
//!         .await?;
//!     client
//!         .wait_for_state(|s| *s == LinkState::Connected, Duration::from_secs(1))
//!         .await?;
//!
//!     let reply = client.send_request("echo", "ping", Duration::from_secs(1)).await?;
//!     assert_eq!(&reply[..], b"ping");
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod connection;
pub mod error;
pub mod manager;
pub mod protocol;
pub mod routing;
mod state;
pub mod stats;
pub mod transport;

pub use tokio_util::sync::CancellationToken;
pub use config::{IpcConfig, IpcDefaults, Role};
pub use connection::{LinkState, PeerId, PeerInfo};
pub use error::{IpcError, Result};
pub use manager::{IpcManager, Responder};
pub use protocol::{Message, MessageKind, RESPONSE_CHANNEL};
pub use state::{ConnectionCallback, ErrorCallback};
pub use stats::Statistics;
pub use transport::IpcAddress;
