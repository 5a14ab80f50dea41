//! The public IPC manager.
//!
//! One manager plays one role per run: a server accepting up to `max_peers`
//! peers, or a client holding a single connection to a server. Both roles
//! share the same outbound queue, dispatcher, router and statistics.
//!
//! # Example
//!
//! ```rust,no_run
//! use conduit_core::{IpcAddress, IpcConfig, IpcManager, LinkState};
//! use std::time::Duration;
//!
//! # async fn example() -> conduit_core::Result<()> {
//! let server = IpcManager::new();
//! server.on_message("echo", |msg| {
//!     println!("got {}", msg.payload_lossy());
//!     Ok(())
//! });
//! server.start(IpcConfig::server(IpcAddress::tcp_loopback())).await?;
//! server
//!     .wait_for_state(|s| *s == LinkState::Listening, Duration::from_secs(1))
//!     .await?;
//!
//! let address = server.local_address().expect("server is listening");
//! let client = IpcManager::new();
//! client.start(IpcConfig::client(address)).await?;
//! client.send("echo", "hello")?;
//!
//! client.stop().await;
//! server.stop().await;
//! # Ok(())
//! # }
//! ```

use crate::config::{IpcConfig, Role};
use crate::connection::client::run_connector;
use crate::connection::server::run_acceptor;
use crate::connection::{LinkState, PeerId, PeerInfo};
use crate::protocol::Message;
use crate::routing::dispatcher::run_dispatcher;
use crate::routing::Destination;
use crate::state::{BusState, Outlet};
use crate::stats::Statistics;
use crate::transport::IpcAddress;
use crate::{IpcError, Result};
use bytes::Bytes;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Background tasks of one run.
struct Running {
    shutdown: CancellationToken,
    link_task: JoinHandle<()>,
    dispatcher_task: JoinHandle<()>,
}

/// Message bus endpoint for one process.
pub struct IpcManager {
    state: Arc<BusState>,
    running: Mutex<Option<Running>>,
}

impl Default for IpcManager {
    fn default() -> Self {
        Self::new()
    }
}

impl IpcManager {
    pub fn new() -> Self {
        Self {
            state: Arc::new(BusState::new()),
            running: Mutex::new(None),
        }
    }

    fn running(&self) -> std::sync::MutexGuard<'_, Option<Running>> {
        self.running.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start in the role given by `config`.
    ///
    /// Returns `Ok` without doing anything if already running. Handlers,
    /// callbacks and statistics survive a stop/start cycle.
    pub async fn start(&self, config: IpcConfig) -> Result<()> {
        config.validate()?;

        let mut running = self.running();
        if running.is_some() {
            warn!("IPC manager already running");
            return Ok(());
        }

        let config = Arc::new(config);
        let (queue_tx, queue_rx) = mpsc::channel(config.send_queue_capacity);
        let opened = self.state.open_outlet(Outlet {
            role: config.role,
            max_frame: config.buffer_size,
            capacity: config.send_queue_capacity,
            queue: queue_tx,
        });
        if !opened {
            return Ok(());
        }

        let shutdown = CancellationToken::new();
        let dispatcher_task = tokio::spawn(run_dispatcher(
            queue_rx,
            self.state.clone(),
            config.io_timeout,
            shutdown.clone(),
        ));
        let link_task = match config.role {
            Role::Server => tokio::spawn(run_acceptor(
                self.state.clone(),
                config.clone(),
                shutdown.clone(),
            )),
            Role::Client => tokio::spawn(run_connector(
                self.state.clone(),
                config.clone(),
                shutdown.clone(),
            )),
        };

        *running = Some(Running {
            shutdown,
            link_task,
            dispatcher_task,
        });

        info!("IPC manager started as {} on {}", config.role, config.address);
        Ok(())
    }

    /// Stop all background work and close every connection.
    ///
    /// Pending requests fail with [`IpcError::NotRunning`]. Safe to call more
    /// than once.
    pub async fn stop(&self) {
        let running = self.running().take();
        let Some(running) = running else {
            return;
        };
        info!("Stopping IPC manager...");

        self.state.close_outlet();
        running.shutdown.cancel();
        self.state.registry.close_all();

        for (name, task) in [
            ("link", running.link_task),
            ("dispatcher", running.dispatcher_task),
        ] {
            if let Err(e) = task.await {
                if e.is_panic() {
                    error!("IPC {} task panicked: {}", name, e);
                }
            }
        }

        self.state.router.pending().cancel_all();
        self.state.set_local_address(None);
        self.state.set_link_state(LinkState::Stopped);
        info!("IPC manager stopped");
    }

    pub fn is_running(&self) -> bool {
        self.state.is_running()
    }

    /// Role of the current run, `None` when stopped.
    pub fn role(&self) -> Option<Role> {
        self.state.role()
    }

    /// This process's own id, used by clients as their peer id.
    pub fn self_id(&self) -> PeerId {
        self.state.self_id()
    }

    /// Queue a notification to every connected peer (the server, for a client).
    pub fn send(&self, channel: impl Into<String>, payload: impl Into<Bytes>) -> Result<()> {
        let message = Message::notification(channel, payload);
        self.state.enqueue(&message, Destination::All)
    }

    /// Queue a notification for one peer. Server only.
    pub fn send_to(
        &self,
        peer: PeerId,
        channel: impl Into<String>,
        payload: impl Into<Bytes>,
    ) -> Result<()> {
        self.state.require_role(Role::Server, "send_to")?;
        let message = Message::notification(channel, payload);
        self.state.enqueue(&message, Destination::Peer(peer))
    }

    /// Queue a notification for every connected peer. Server only.
    pub fn broadcast(&self, channel: impl Into<String>, payload: impl Into<Bytes>) -> Result<()> {
        self.state.require_role(Role::Server, "broadcast")?;
        let message = Message::notification(channel, payload);
        self.state.enqueue(&message, Destination::All)
    }

    /// Send a request and wait up to `timeout` for the matching response.
    ///
    /// Fails early with [`IpcError::Undeliverable`] when the request reached
    /// no peer, and with [`IpcError::Timeout`] when no response came in time.
    pub async fn send_request(
        &self,
        channel: impl Into<String>,
        payload: impl Into<Bytes>,
        timeout: Duration,
    ) -> Result<Bytes> {
        self.request(Message::request(channel, payload), Destination::All, timeout)
            .await
    }

    /// Like [`send_request`](Self::send_request), addressed to one peer. Server only.
    pub async fn send_request_to(
        &self,
        peer: PeerId,
        channel: impl Into<String>,
        payload: impl Into<Bytes>,
        timeout: Duration,
    ) -> Result<Bytes> {
        self.state.require_role(Role::Server, "send_request_to")?;
        self.request(Message::request(channel, payload), Destination::Peer(peer), timeout)
            .await
    }

    async fn request(&self, message: Message, destination: Destination, timeout: Duration) -> Result<Bytes> {
        let pending = self.state.router.pending().register(message.id.clone());
        self.state.enqueue(&message, destination)?;
        pending.wait(timeout).await
    }

    /// Queue a response for `request_id` to every connected peer.
    pub fn send_response(&self, request_id: impl Into<String>, payload: impl Into<Bytes>) -> Result<()> {
        let message = Message::response(request_id, payload);
        self.state.enqueue(&message, Destination::All)
    }

    /// Queue a response to `request`, addressed to the peer it came from.
    pub fn reply(&self, request: &Message, payload: impl Into<Bytes>) -> Result<()> {
        reply_via(&self.state, request, payload.into())
    }

    /// A handle handlers can capture to answer requests without keeping the
    /// manager alive.
    pub fn responder(&self) -> Responder {
        Responder {
            state: Arc::downgrade(&self.state),
        }
    }

    /// Install the handler for `channel`, replacing any previous one.
    ///
    /// Handlers run on the reader task of the connection the message arrived
    /// on, in arrival order. An `Err` or panic is counted and reported through
    /// the error callback; the connection stays up.
    pub fn on_message<F>(&self, channel: impl Into<String>, handler: F)
    where
        F: Fn(&Message) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.state.router.register(channel, Arc::new(handler));
    }

    /// Remove the handler for `channel`. Returns whether one was installed.
    pub fn remove_handler(&self, channel: &str) -> bool {
        self.state.router.remove(channel)
    }

    /// Called with `(peer, true)` on connect and `(peer, false)` on disconnect.
    pub fn on_connection<F>(&self, callback: F)
    where
        F: Fn(PeerId, bool) + Send + Sync + 'static,
    {
        self.state.callbacks.set_connection(Arc::new(callback));
    }

    /// Called with a description and numeric code for background failures.
    pub fn on_error<F>(&self, callback: F)
    where
        F: Fn(&str, i32) + Send + Sync + 'static,
    {
        self.state.callbacks.set_error(Arc::new(callback));
    }

    /// Ids of all live connections. A connected client reports its own id.
    pub fn connected_peers(&self) -> Vec<PeerId> {
        self.state.registry.peer_ids()
    }

    pub fn is_connected(&self, peer: PeerId) -> bool {
        self.state.registry.contains(peer)
    }

    /// Close the connection to `peer`. Returns false if it was not connected.
    pub fn disconnect_peer(&self, peer: PeerId) -> bool {
        let found = self.state.registry.remove(peer).is_some();
        if found {
            info!("Disconnecting peer {}", peer);
        }
        found
    }

    pub fn peers(&self) -> Vec<PeerInfo> {
        self.state.registry.infos()
    }

    pub fn statistics(&self) -> Statistics {
        self.state.stats.snapshot()
    }

    pub fn state(&self) -> LinkState {
        self.state.link_state()
    }

    /// Wait until the link state satisfies `predicate`.
    pub async fn wait_for_state<P>(&self, predicate: P, timeout: Duration) -> Result<LinkState>
    where
        P: Fn(&LinkState) -> bool,
    {
        let mut rx = self.state.subscribe_link();
        let result = match tokio::time::timeout(timeout, rx.wait_for(|s| predicate(s))).await {
            Ok(Ok(state)) => Ok(*state),
            Ok(Err(_)) => Err(IpcError::NotRunning),
            Err(_) => Err(IpcError::Timeout(timeout)),
        };
        result
    }

    /// The bound address while a server is listening.
    pub fn local_address(&self) -> Option<IpcAddress> {
        self.state.local_address()
    }
}

impl Drop for IpcManager {
    fn drop(&mut self) {
        let running = self
            .running
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(running) = running {
            self.state.close_outlet();
            running.shutdown.cancel();
            self.state.registry.close_all();
            self.state.router.pending().cancel_all();
        }
    }
}

impl std::fmt::Debug for IpcManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IpcManager")
            .field("role", &self.role())
            .field("state", &self.state())
            .field("peers", &self.connected_peers())
            .finish()
    }
}

/// Weak sending handle for use inside message handlers.
///
/// Holding a `Responder` does not keep the manager alive; once the manager
/// is dropped every call fails with [`IpcError::NotRunning`].
#[derive(Debug, Clone)]
pub struct Responder {
    state: Weak<BusState>,
}

impl Responder {
    fn state(&self) -> Result<Arc<BusState>> {
        self.state.upgrade().ok_or(IpcError::NotRunning)
    }

    /// Answer `request`, addressed to the peer it came from.
    pub fn reply(&self, request: &Message, payload: impl Into<Bytes>) -> Result<()> {
        let state = self.state()?;
        reply_via(&state, request, payload.into())
    }

    /// Queue a notification to every connected peer.
    pub fn send(&self, channel: impl Into<String>, payload: impl Into<Bytes>) -> Result<()> {
        let message = Message::notification(channel, payload);
        self.state()?.enqueue(&message, Destination::All)
    }
}

fn reply_via(state: &BusState, request: &Message, payload: Bytes) -> Result<()> {
    let destination = match request.origin {
        Some(peer) if state.role() == Some(Role::Server) => Destination::Peer(peer),
        _ => Destination::All,
    };
    let message = Message::response(request.id.clone(), payload);
    state.enqueue(&message, destination)
}
