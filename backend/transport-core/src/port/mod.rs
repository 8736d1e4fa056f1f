//! Channel-upgrade (port) subsystem, client side.
//!
//! Upgrades are a pure performance optimization: a consumer that is
//! eligible attempts one lazily, caches the resulting handle per channel
//! name, and falls back to the control channel on any failure without
//! surfacing it to the caller. Channels the host rejects with
//! `not_supported` are remembered so they aren't retried on every call.

pub mod registry;

use crate::error::PortError;

use common::ErrorLocation;
use models::{ErrorCode, PortEnvelope};

use std::collections::{HashMap, HashSet};
use std::panic::Location;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::debug;
use tokio::sync::{mpsc, Mutex};

/// Client-side handle for one upgraded channel.
pub struct PortHandle {
    port_id: String,
    channel: String,
    tx: mpsc::Sender<PortEnvelope>,
    open: Arc<AtomicBool>,
}

impl PortHandle {
    pub(crate) fn new(
        port_id: String,
        channel: String,
        tx: mpsc::Sender<PortEnvelope>,
        open: Arc<AtomicBool>,
    ) -> Self {
        Self {
            port_id,
            channel,
            tx,
            open,
        }
    }

    pub fn port_id(&self) -> &str {
        &self.port_id
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    /// Send one frame on the pipe.
    ///
    /// # Errors
    ///
    /// Returns [`PortError::Unavailable`] once the pipe is closed; callers
    /// treat that as the signal to fall back to the control channel.
    pub async fn send(&self, frame: PortEnvelope) -> Result<(), PortError> {
        if !self.is_open() {
            return Err(PortError::Unavailable {
                channel: self.channel.clone(),
                message: String::from("port closed"),
                location: ErrorLocation::from(Location::caller()),
            });
        }

        self.tx
            .send(frame)
            .await
            .map_err(|_| {
                self.open.store(false, Ordering::SeqCst);
                PortError::Unavailable {
                    channel: self.channel.clone(),
                    message: String::from("port pipe dropped"),
                    location: ErrorLocation::from(Location::caller()),
                }
            })
    }

    /// Stop using this handle locally. The peer observes the pipe closing
    /// once the last sender drops.
    pub fn mark_closed(&self) {
        self.open.store(false, Ordering::SeqCst);
    }
}

/// Client-side bookkeeping: one cached handle per channel name, a
/// negative cache for channels the host declared ineligible, and the
/// handler-driven reference counts that open and close subscriptions.
pub(crate) struct ClientPortManager {
    handles: Mutex<HashMap<String, Arc<PortHandle>>>,
    denied: Mutex<HashSet<String>>,
    refs: Mutex<HashMap<String, usize>>,
    upgrading: Mutex<HashSet<String>>,
}

impl ClientPortManager {
    pub fn new() -> Self {
        Self {
            handles: Mutex::new(HashMap::new()),
            denied: Mutex::new(HashSet::new()),
            refs: Mutex::new(HashMap::new()),
            upgrading: Mutex::new(HashSet::new()),
        }
    }

    /// The cached open handle for a channel, pruning dead ones.
    pub async fn handle(&self, channel: &str) -> Option<Arc<PortHandle>> {
        let mut handles = self.handles.lock().await;
        match handles.get(channel) {
            Some(handle) if handle.is_open() => Some(handle.clone()),
            Some(_) => {
                handles.remove(channel);
                None
            }
            None => None,
        }
    }

    pub async fn store(&self, channel: &str, handle: Arc<PortHandle>) {
        self.handles.lock().await.insert(channel.to_string(), handle);
    }

    pub async fn remove(&self, channel: &str) -> Option<Arc<PortHandle>> {
        let handle = self.handles.lock().await.remove(channel);
        if let Some(handle) = &handle {
            handle.mark_closed();
        }
        handle
    }

    /// Remember a `not_supported` rejection so the channel isn't retried.
    pub async fn deny(&self, channel: &str) {
        self.denied.lock().await.insert(channel.to_string());
    }

    pub async fn is_denied(&self, channel: &str) -> bool {
        self.denied.lock().await.contains(channel)
    }

    /// Claim the in-flight slot for an upgrade attempt. A `false` return
    /// means another task is already negotiating; the caller falls back to
    /// the control channel for this call.
    pub async fn begin_upgrade(&self, channel: &str) -> bool {
        self.upgrading.lock().await.insert(channel.to_string())
    }

    pub async fn end_upgrade(&self, channel: &str) {
        self.upgrading.lock().await.remove(channel);
    }

    /// Handler-registration reference count, incremented by the first
    /// `on()` for a channel.
    pub async fn retain(&self, channel: &str) {
        *self.refs.lock().await.entry(channel.to_string()).or_insert(0) += 1;
    }

    /// Decrement the reference count; at zero the cached handle closes.
    pub async fn release(&self, channel: &str) {
        let dropped_to_zero = {
            let mut refs = self.refs.lock().await;
            match refs.get_mut(channel) {
                Some(count) => {
                    *count = count.saturating_sub(1);
                    if *count == 0 {
                        refs.remove(channel);
                        true
                    } else {
                        false
                    }
                }
                None => false,
            }
        };

        if dropped_to_zero {
            if self.remove(channel).await.is_some() {
                debug!("Released last subscription for \"{channel}\"; port closed");
            }
        }
    }

    /// Handle a host-initiated close for a channel (or a specific port).
    pub async fn handle_close(&self, channel: &str, port_id: Option<&str>) {
        let mut handles = self.handles.lock().await;
        let matches = handles
            .get(channel)
            .is_some_and(|handle| port_id.is_none_or(|id| handle.port_id() == id));

        if matches {
            if let Some(handle) = handles.remove(channel) {
                handle.mark_closed();
                debug!(
                    "Port {} for \"{channel}\" closed by peer",
                    handle.port_id()
                );
            }
        }
    }

    /// Close everything (transport destruction).
    pub async fn close_all(&self) {
        let mut handles = self.handles.lock().await;
        for (_, handle) in handles.drain() {
            handle.mark_closed();
        }
    }
}

/// Map a rejection code to whether the channel should be negative-cached.
pub(crate) fn is_permanent_rejection(code: ErrorCode) -> bool {
    matches!(code, ErrorCode::NotSupported)
}
