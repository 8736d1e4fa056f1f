//! Per-instance registries for handlers and pending replies.
//!
//! One [`TransportRegistry`] is owned by each transport instance - never
//! shared process-wide - so lifecycle and tests stay deterministic. All
//! maps are mutated behind tokio locks; handler lists are cloned out of
//! the lock before invocation so a handler can (un)register without
//! deadlocking.

use crate::identity::HandlerContext;

use models::{ChannelKind, ControlEnvelope};

use serde_json::Value;

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{oneshot, Mutex, RwLock};

/// Future returned by a boxed handler.
pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<Value, String>> + Send>>;

/// Type-erased event handler. The `Err` string becomes the message of an
/// error reply.
pub type BoxedHandler = Arc<dyn Fn(Option<Value>, HandlerContext) -> HandlerFuture + Send + Sync>;

/// Box a concrete async handler into the registry's erased form.
pub fn box_handler<F, Fut>(handler: F) -> BoxedHandler
where
    F: Fn(Option<Value>, HandlerContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, String>> + Send + 'static,
{
    Arc::new(move |payload, context| Box::pin(handler(payload, context)) as HandlerFuture)
}

struct HandlerEntry {
    id: u64,
    handler: BoxedHandler,
}

/// Handler sets and the pending-reply map for one transport instance.
pub struct TransportRegistry {
    handlers: RwLock<HashMap<ChannelKind, HashMap<String, Vec<HandlerEntry>>>>,
    pending: Mutex<HashMap<String, oneshot::Sender<ControlEnvelope>>>,
    next_handler_id: AtomicU64,
}

impl TransportRegistry {
    pub fn new() -> Self {
        let mut handlers = HashMap::new();
        handlers.insert(ChannelKind::Host, HashMap::new());
        handlers.insert(ChannelKind::Plugin, HashMap::new());

        Self {
            handlers: RwLock::new(handlers),
            pending: Mutex::new(HashMap::new()),
            next_handler_id: AtomicU64::new(1),
        }
    }

    /// Register a handler. Returns the handler id and whether it is the
    /// first registration for this event name.
    pub async fn register(
        &self,
        kind: ChannelKind,
        event_name: &str,
        handler: BoxedHandler,
    ) -> (u64, bool) {
        let id = self.next_handler_id.fetch_add(1, Ordering::Relaxed);

        let mut handlers = self.handlers.write().await;
        let entries = handlers
            .entry(kind)
            .or_default()
            .entry(event_name.to_string())
            .or_default();

        let first = entries.is_empty();
        entries.push(HandlerEntry {
            id,
            handler,
        });

        (id, first)
    }

    /// Unregister a handler by id. Returns whether the event name now has
    /// no handlers left. Unknown ids are a no-op reporting `false`.
    pub async fn unregister(&self, kind: ChannelKind, event_name: &str, id: u64) -> bool {
        let mut handlers = self.handlers.write().await;
        let Some(by_name) = handlers.get_mut(&kind) else {
            return false;
        };
        let Some(entries) = by_name.get_mut(event_name) else {
            return false;
        };

        let before = entries.len();
        entries.retain(|entry| entry.id != id);

        if entries.is_empty() {
            by_name.remove(event_name);
            // Only report "last handler gone" when this call removed one.
            return before > 0;
        }

        false
    }

    /// Snapshot the handlers for an event, cloned out of the lock.
    pub async fn handlers_for(&self, kind: ChannelKind, event_name: &str) -> Vec<BoxedHandler> {
        let handlers = self.handlers.read().await;
        handlers
            .get(&kind)
            .and_then(|by_name| by_name.get(event_name))
            .map(|entries| entries.iter().map(|entry| entry.handler.clone()).collect())
            .unwrap_or_default()
    }

    /// Whether any handler is registered for the event.
    pub async fn has_handlers(&self, kind: ChannelKind, event_name: &str) -> bool {
        let handlers = self.handlers.read().await;
        handlers
            .get(&kind)
            .and_then(|by_name| by_name.get(event_name))
            .is_some_and(|entries| !entries.is_empty())
    }

    /// Register a pending-reply waiter for a correlation id.
    pub async fn register_pending(&self, sync_id: String) -> oneshot::Receiver<ControlEnvelope> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(sync_id, tx);
        rx
    }

    /// Deliver a reply to its waiter. Returns `false` when no waiter was
    /// registered (stale or duplicate reply).
    pub async fn resolve_pending(&self, sync_id: &str, envelope: ControlEnvelope) -> bool {
        let waiter = self.pending.lock().await.remove(sync_id);
        match waiter {
            Some(tx) => tx.send(envelope).is_ok(),
            None => false,
        }
    }

    /// Drop a waiter that timed out or was cancelled.
    pub async fn remove_pending(&self, sync_id: &str) {
        self.pending.lock().await.remove(sync_id);
    }

    /// Drop every handler and pending waiter (transport destruction).
    pub async fn clear(&self) {
        let mut handlers = self.handlers.write().await;
        for by_name in handlers.values_mut() {
            by_name.clear();
        }
        drop(handlers);

        self.pending.lock().await.clear();
    }
}

impl Default for TransportRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle for one handler registration.
///
/// Unsubscription is explicit and idempotent: calling
/// [`Subscription::unsubscribe`] twice is a no-op the second time, and
/// dropping the handle leaves the handler registered.
pub struct Subscription {
    state: Option<SubscriptionState>,
}

struct SubscriptionState {
    registry: Arc<TransportRegistry>,
    kind: ChannelKind,
    event_name: String,
    id: u64,
    on_last: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub(crate) fn new(
        registry: Arc<TransportRegistry>,
        kind: ChannelKind,
        event_name: String,
        id: u64,
        on_last: Option<Box<dyn FnOnce() + Send>>,
    ) -> Self {
        Self {
            state: Some(SubscriptionState {
                registry,
                kind,
                event_name,
                id,
                on_last,
            }),
        }
    }

    /// Remove the handler. Safe to call any number of times.
    pub async fn unsubscribe(&mut self) {
        let Some(mut state) = self.state.take() else {
            return;
        };

        let was_last = state
            .registry
            .unregister(state.kind, &state.event_name, state.id)
            .await;

        if was_last {
            if let Some(on_last) = state.on_last.take() {
                on_last();
            }
        }
    }

    /// Whether the handler is still registered through this handle.
    pub fn is_active(&self) -> bool {
        self.state.is_some()
    }
}
