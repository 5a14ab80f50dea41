//! State shared between the manager facade and its background tasks.

use crate::config::Role;
use crate::connection::{ConnectionRegistry, LinkState, PeerId};
use crate::protocol::{encode_frame, Message};
use crate::routing::{Destination, Outbound, Router};
use crate::stats::StatsCollector;
use crate::transport::IpcAddress;
use crate::{IpcError, Result};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tokio::sync::{mpsc, watch};
use tracing::error;

/// Called with `(peer, connected)` whenever a connection is established or lost.
pub type ConnectionCallback = Arc<dyn Fn(PeerId, bool) + Send + Sync>;

/// Called with `(description, code)` for transport failures in background tasks.
pub type ErrorCallback = Arc<dyn Fn(&str, i32) + Send + Sync>;

#[derive(Default)]
pub(crate) struct Callbacks {
    connection: RwLock<Option<ConnectionCallback>>,
    error: RwLock<Option<ErrorCallback>>,
}

impl Callbacks {
    pub(crate) fn set_connection(&self, callback: ConnectionCallback) {
        *self
            .connection
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(callback);
    }

    pub(crate) fn set_error(&self, callback: ErrorCallback) {
        *self.error.write().unwrap_or_else(PoisonError::into_inner) = Some(callback);
    }

    pub(crate) fn connection_changed(&self, peer: PeerId, connected: bool) {
        let callback = self
            .connection
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(callback) = callback {
            if catch_unwind(AssertUnwindSafe(|| callback(peer, connected))).is_err() {
                error!("Connection callback panicked for peer {}", peer);
            }
        }
    }

    /// Hand a background failure to the error callback, if any.
    pub(crate) fn report(&self, context: &str, err: &IpcError) {
        let callback = self.error.read().unwrap_or_else(PoisonError::into_inner).clone();
        if let Some(callback) = callback {
            let description = format!("{}: {}", context, err);
            let code = err.code();
            if catch_unwind(AssertUnwindSafe(|| callback(&description, code))).is_err() {
                error!("Error callback panicked while reporting: {}", description);
            }
        }
    }
}

/// Sending side of the outbound queue, present while the manager runs.
pub(crate) struct Outlet {
    pub(crate) role: Role,
    pub(crate) max_frame: usize,
    pub(crate) capacity: usize,
    pub(crate) queue: mpsc::Sender<Outbound>,
}

pub(crate) struct BusState {
    pub(crate) registry: ConnectionRegistry,
    pub(crate) router: Router,
    pub(crate) stats: StatsCollector,
    pub(crate) callbacks: Callbacks,
    self_id: PeerId,
    link: watch::Sender<LinkState>,
    local_address: Mutex<Option<IpcAddress>>,
    outlet: Mutex<Option<Outlet>>,
}

impl BusState {
    pub(crate) fn new() -> Self {
        let (link, _) = watch::channel(LinkState::Idle);
        Self {
            registry: ConnectionRegistry::new(),
            router: Router::new(),
            stats: StatsCollector::new(),
            callbacks: Callbacks::default(),
            self_id: PeerId::current_process(),
            link,
            local_address: Mutex::new(None),
            outlet: Mutex::new(None),
        }
    }

    pub(crate) fn self_id(&self) -> PeerId {
        self.self_id
    }

    pub(crate) fn link_state(&self) -> LinkState {
        *self.link.borrow()
    }

    pub(crate) fn set_link_state(&self, state: LinkState) {
        self.link.send_replace(state);
    }

    pub(crate) fn subscribe_link(&self) -> watch::Receiver<LinkState> {
        self.link.subscribe()
    }

    pub(crate) fn local_address(&self) -> Option<IpcAddress> {
        self.local_address
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn set_local_address(&self, address: Option<IpcAddress>) {
        *self
            .local_address
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = address;
    }

    fn outlet(&self) -> std::sync::MutexGuard<'_, Option<Outlet>> {
        self.outlet.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Install the queue sender. Fails if one is already installed.
    pub(crate) fn open_outlet(&self, outlet: Outlet) -> bool {
        let mut current = self.outlet();
        if current.is_some() {
            return false;
        }
        *current = Some(outlet);
        true
    }

    pub(crate) fn close_outlet(&self) -> bool {
        self.outlet().take().is_some()
    }

    pub(crate) fn is_running(&self) -> bool {
        self.outlet().is_some()
    }

    pub(crate) fn role(&self) -> Option<Role> {
        self.outlet().as_ref().map(|outlet| outlet.role)
    }

    /// Fail unless running in `required` role.
    pub(crate) fn require_role(&self, required: Role, operation: &'static str) -> Result<()> {
        match self.role() {
            None => Err(IpcError::NotRunning),
            Some(role) if role == required => Ok(()),
            Some(_) => Err(IpcError::WrongRole {
                operation,
                required: required.as_str(),
            }),
        }
    }

    /// Encode `message` and put it on the outbound queue without blocking.
    ///
    /// The outlet lock is only held to read the frame limit and to hand the
    /// frame to the queue; encoding runs unlocked.
    pub(crate) fn enqueue(&self, message: &Message, destination: Destination) -> Result<()> {
        let max_frame = self
            .outlet()
            .as_ref()
            .map(|outlet| outlet.max_frame)
            .ok_or(IpcError::NotRunning)?;

        if let Destination::Peer(peer) = destination {
            if !self.registry.contains(peer) {
                return Err(IpcError::PeerNotFound(peer));
            }
        }

        let frame = encode_frame(message, max_frame)?;
        let outbound = Outbound {
            id: message.id.clone(),
            kind: message.kind,
            channel: message.channel.clone(),
            frame,
            destination,
        };

        let guard = self.outlet();
        // Stopped while encoding.
        let outlet = guard.as_ref().ok_or(IpcError::NotRunning)?;
        outlet.queue.try_send(outbound).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => IpcError::QueueFull {
                capacity: outlet.capacity,
            },
            mpsc::error::TrySendError::Closed(_) => IpcError::NotRunning,
        })
    }
}

impl std::fmt::Debug for BusState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BusState")
            .field("link", &self.link_state())
            .field("connections", &self.registry.len())
            .finish()
    }
}
