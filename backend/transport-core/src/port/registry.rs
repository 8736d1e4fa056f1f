//! Host-side port records.
//!
//! The host owns every negotiated port. Records are indexed by port id
//! and by owning sender so that destruction of a sender (its window or
//! plugin closing) cascades to all of its ports. A record moves
//! `unconfirmed -> confirmed -> closed` and never backward.

use crate::identity::SenderId;

use models::{PortEnvelope, PortScope};

use std::collections::HashMap;
use std::time::Instant;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

/// Metadata for one negotiated port.
#[derive(Debug, Clone)]
pub struct PortRecord {
    pub port_id: String,
    pub channel: String,
    pub scope: PortScope,
    pub owner: SenderId,
    pub permissions: Vec<String>,
    pub confirmed: bool,
    pub created_at: Instant,
}

/// A record plus the live resources tied to it.
pub(crate) struct PortEntry {
    pub record: PortRecord,
    pub pipe_tx: mpsc::Sender<PortEnvelope>,
    pub confirm_timer: Option<JoinHandle<()>>,
    pub reader: Option<JoinHandle<()>>,
}

impl PortEntry {
    /// Stop every task tied to this port. Dropping the entry afterwards
    /// closes the pipe, which the peer observes as a close.
    pub fn teardown(mut self) {
        if let Some(timer) = self.confirm_timer.take() {
            timer.abort();
        }
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}

/// Outcome of a confirmation attempt.
#[derive(Debug, PartialEq, Eq)]
pub enum ConfirmOutcome {
    /// The record moved to `confirmed` and its timeout was cleared.
    Confirmed,
    /// The record was already confirmed; nothing changed.
    AlreadyConfirmed,
    /// The confirming sender does not own the port.
    OwnerMismatch,
    /// No such record - the port timed out or was never negotiated.
    Unknown,
}

/// All port records owned by one host transport.
pub struct PortRegistry {
    entries: Mutex<HashMap<String, PortEntry>>,
}

impl PortRegistry {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) async fn insert(&self, entry: PortEntry) {
        self.entries
            .lock()
            .await
            .insert(entry.record.port_id.clone(), entry);
    }

    /// Attach the confirmation timer and reader task to an inserted
    /// record. If the record vanished in between (instant close), the
    /// tasks are stopped instead.
    pub(crate) async fn attach_tasks(
        &self,
        port_id: &str,
        timer: JoinHandle<()>,
        reader: JoinHandle<()>,
    ) {
        let mut entries = self.entries.lock().await;
        match entries.get_mut(port_id) {
            Some(entry) => {
                entry.confirm_timer = Some(timer);
                entry.reader = Some(reader);
            }
            None => {
                timer.abort();
                reader.abort();
            }
        }
    }

    /// Apply a confirmation from `owner` to the record.
    pub async fn confirm(&self, port_id: &str, owner: SenderId) -> ConfirmOutcome {
        let mut entries = self.entries.lock().await;
        let Some(entry) = entries.get_mut(port_id) else {
            return ConfirmOutcome::Unknown;
        };

        if entry.record.owner != owner {
            return ConfirmOutcome::OwnerMismatch;
        }

        if entry.record.confirmed {
            return ConfirmOutcome::AlreadyConfirmed;
        }

        entry.record.confirmed = true;
        if let Some(timer) = entry.confirm_timer.take() {
            timer.abort();
        }

        ConfirmOutcome::Confirmed
    }

    /// Remove a record regardless of state.
    pub(crate) async fn remove(&self, port_id: &str) -> Option<PortEntry> {
        self.entries.lock().await.remove(port_id)
    }

    /// Remove the record only while it is still unconfirmed (confirmation
    /// timeout path; a confirmation that raced in first wins).
    pub(crate) async fn remove_if_unconfirmed(&self, port_id: &str) -> Option<PortEntry> {
        let mut entries = self.entries.lock().await;
        if entries.get(port_id).is_some_and(|entry| !entry.record.confirmed) {
            return entries.remove(port_id);
        }
        None
    }

    /// Remove every record owned by a sender (sender destruction cascade).
    pub(crate) async fn remove_for_owner(&self, owner: SenderId) -> Vec<PortEntry> {
        let mut entries = self.entries.lock().await;
        let ids: Vec<String> = entries
            .iter()
            .filter(|(_, entry)| entry.record.owner == owner)
            .map(|(id, _)| id.clone())
            .collect();

        ids.into_iter()
            .filter_map(|id| entries.remove(&id))
            .collect()
    }

    /// Remove records matching a close request: same owner and channel,
    /// optionally narrowed to one port id.
    pub(crate) async fn remove_matching(
        &self,
        owner: SenderId,
        channel: &str,
        port_id: Option<&str>,
    ) -> Vec<PortEntry> {
        let mut entries = self.entries.lock().await;
        let ids: Vec<String> = entries
            .iter()
            .filter(|(id, entry)| {
                entry.record.owner == owner
                    && entry.record.channel == channel
                    && port_id.is_none_or(|wanted| wanted == id.as_str())
            })
            .map(|(id, _)| id.clone())
            .collect();

        ids.into_iter()
            .filter_map(|id| entries.remove(&id))
            .collect()
    }

    /// The confirmed pipe for a channel owned by `owner`, if any.
    pub(crate) async fn confirmed_pipe(
        &self,
        channel: &str,
        owner: SenderId,
    ) -> Option<(String, mpsc::Sender<PortEnvelope>)> {
        let entries = self.entries.lock().await;
        entries
            .values()
            .find(|entry| {
                entry.record.confirmed
                    && entry.record.owner == owner
                    && entry.record.channel == channel
            })
            .map(|entry| (entry.record.port_id.clone(), entry.pipe_tx.clone()))
    }

    /// Number of confirmed ports for a channel (diagnostics).
    pub async fn confirmed_for(&self, channel: &str) -> usize {
        self.entries
            .lock()
            .await
            .values()
            .filter(|entry| entry.record.confirmed && entry.record.channel == channel)
            .count()
    }

    /// Snapshot of one record's metadata.
    pub async fn record(&self, port_id: &str) -> Option<PortRecord> {
        self.entries
            .lock()
            .await
            .get(port_id)
            .map(|entry| entry.record.clone())
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }
}

impl Default for PortRegistry {
    fn default() -> Self {
        Self::new()
    }
}
