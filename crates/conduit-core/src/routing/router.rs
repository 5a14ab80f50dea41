//! Inbound message routing: response correlation first, then the channel
//! handler table.

use super::pending::PendingRequests;
use crate::protocol::{Message, MessageKind};
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, error, info, warn};

/// Callback invoked for every inbound message on a channel.
pub type MessageHandler = Arc<dyn Fn(&Message) -> anyhow::Result<()> + Send + Sync>;

/// What happened to one inbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteOutcome {
    /// A response completed a pending request.
    Resolved,
    /// A response nobody waits for any more (late, duplicate or unknown id).
    Unmatched,
    /// The channel handler ran successfully.
    Handled,
    /// The channel handler returned an error or panicked.
    HandlerFailed(String),
    /// No handler is registered for the channel.
    NoHandler,
}

#[derive(Default)]
pub struct Router {
    handlers: RwLock<HashMap<String, MessageHandler>>,
    pending: PendingRequests,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pending(&self) -> &PendingRequests {
        &self.pending
    }

    /// Install `handler` for `channel`, replacing any previous one.
    pub fn register(&self, channel: impl Into<String>, handler: MessageHandler) -> bool {
        let channel = channel.into();
        let replaced = self
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(channel.clone(), handler)
            .is_some();
        info!("Registered message handler for channel: {}", channel);
        replaced
    }

    /// Remove the handler for `channel`. Returns whether one was installed.
    pub fn remove(&self, channel: &str) -> bool {
        let removed = self
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(channel)
            .is_some();
        if removed {
            info!("Removed message handler for channel: {}", channel);
        }
        removed
    }

    pub fn has_handler(&self, channel: &str) -> bool {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(channel)
    }

    /// Route one decoded inbound message.
    ///
    /// Responses only ever settle pending requests. Notifications and
    /// requests go to the channel's handler, which runs without any router
    /// lock held so it may call back into the manager.
    pub fn route(&self, message: &Message) -> RouteOutcome {
        if message.kind == MessageKind::Response {
            if self.pending.resolve(&message.id, message.payload.clone()) {
                debug!("Resolved pending request {}", message.id);
                return RouteOutcome::Resolved;
            }
            debug!("Discarding response {} with no pending request", message.id);
            return RouteOutcome::Unmatched;
        }

        let handler = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&message.channel)
            .cloned();

        let Some(handler) = handler else {
            debug!("No handler registered for channel: {}", message.channel);
            return RouteOutcome::NoHandler;
        };

        match catch_unwind(AssertUnwindSafe(|| handler(message))) {
            Ok(Ok(())) => RouteOutcome::Handled,
            Ok(Err(e)) => {
                warn!("Handler for channel {} failed: {:#}", message.channel, e);
                RouteOutcome::HandlerFailed(e.to_string())
            }
            Err(panic) => {
                let reason = panic_message(panic.as_ref());
                error!("Handler for channel {} panicked: {}", message.channel, reason);
                RouteOutcome::HandlerFailed(reason)
            }
        }
    }
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let channels: Vec<String> = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        f.debug_struct("Router")
            .field("channels", &channels)
            .field("pending", &self.pending.len())
            .finish()
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "handler panicked".to_string()
    }
}
