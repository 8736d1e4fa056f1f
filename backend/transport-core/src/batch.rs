//! Client-side request batching.
//!
//! Per event name the engine holds at most one active window. Calls that
//! land inside the window are coalesced according to the event's merge
//! strategy and flushed either when the window timer elapses or
//! immediately when the number of distinct pending entries reaches the
//! configured maximum. The timer starts on the first enqueue of a window
//! and never resets on later enqueues.
//!
//! Flush semantics per strategy:
//! - `queue`: one round trip per call, dispatched sequentially in arrival
//!   order so side-effecting calls observe a stable order
//! - `dedupe`: one round trip per distinct payload key; every resolver
//!   for that key receives the same result or the same error
//! - `latest`: a single round trip carrying the newest payload; every
//!   resolver receives that one result

use crate::cache::payload_key;
use crate::error::SendError;

use models::event::{BatchConfig, MergeStrategy};
use models::EventDescriptor;

use serde_json::Value;

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use log::debug;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;

/// Future produced by the underlying dispatch.
pub type DispatchFuture = Pin<Box<dyn Future<Output = Result<Value, SendError>> + Send>>;

/// The single-round-trip primitive the engine drives.
pub type BatchDispatcher = Arc<dyn Fn(String, Option<Value>) -> DispatchFuture + Send + Sync>;

/// Outcome delivered to every caller coalesced into one entry.
pub type BatchOutcome = Result<Value, SendError>;

struct BatchEntry {
    payload: Option<Value>,
    resolvers: Vec<oneshot::Sender<BatchOutcome>>,
}

struct BatchQueue {
    /// Distinguishes this window from earlier windows of the same event,
    /// so a stale timer can never flush a successor window early.
    generation: u64,
    strategy: MergeStrategy,
    max_size: usize,
    timer: Option<JoinHandle<()>>,
    queue: Vec<BatchEntry>,
    dedupe: HashMap<String, BatchEntry>,
    latest: Option<BatchEntry>,
}

impl BatchQueue {
    fn new(generation: u64, config: &BatchConfig) -> Self {
        Self {
            generation,
            strategy: config.merge_strategy,
            max_size: config.max_size.max(1),
            timer: None,
            queue: Vec::new(),
            dedupe: HashMap::new(),
            latest: None,
        }
    }

    /// Number of distinct pending entries (what the size threshold counts).
    fn pending(&self) -> usize {
        match self.strategy {
            MergeStrategy::Queue => self.queue.len(),
            MergeStrategy::Dedupe => self.dedupe.len(),
            MergeStrategy::Latest => usize::from(self.latest.is_some()),
        }
    }
}

/// Coalesces sends per event name into batched round trips.
pub struct BatchEngine {
    dispatcher: BatchDispatcher,
    queues: Mutex<HashMap<String, BatchQueue>>,
    next_generation: AtomicU64,
}

impl BatchEngine {
    pub fn new(dispatcher: BatchDispatcher) -> Self {
        Self {
            dispatcher,
            queues: Mutex::new(HashMap::new()),
            next_generation: AtomicU64::new(1),
        }
    }

    /// Add one call to the event's current window, opening a window if
    /// none is active. The returned receiver resolves with the call's
    /// outcome when its entry flushes.
    pub async fn enqueue(
        self: &Arc<Self>,
        event: &EventDescriptor,
        config: &BatchConfig,
        payload: Option<Value>,
    ) -> oneshot::Receiver<BatchOutcome> {
        let event_name = event.name().to_string();
        let (resolver, outcome) = oneshot::channel();

        let flush_now = {
            let mut queues = self.queues.lock().await;
            let queue = queues.entry(event_name.clone()).or_insert_with(|| {
                BatchQueue::new(self.next_generation.fetch_add(1, Ordering::Relaxed), config)
            });

            // Later enqueues may carry updated descriptor settings.
            queue.strategy = config.merge_strategy;
            queue.max_size = config.max_size.max(1);

            match queue.strategy {
                MergeStrategy::Latest => match queue.latest.as_mut() {
                    Some(entry) => {
                        entry.payload = payload;
                        entry.resolvers.push(resolver);
                    }
                    None => {
                        queue.latest = Some(BatchEntry {
                            payload,
                            resolvers: vec![resolver],
                        });
                    }
                },
                MergeStrategy::Dedupe => {
                    let key = payload_key(payload.as_ref());
                    match queue.dedupe.get_mut(&key) {
                        Some(entry) => entry.resolvers.push(resolver),
                        None => {
                            queue.dedupe.insert(
                                key,
                                BatchEntry {
                                    payload,
                                    resolvers: vec![resolver],
                                },
                            );
                        }
                    }
                }
                MergeStrategy::Queue => {
                    queue.queue.push(BatchEntry {
                        payload,
                        resolvers: vec![resolver],
                    });
                }
            }

            if queue.pending() >= queue.max_size {
                if let Some(timer) = queue.timer.take() {
                    timer.abort();
                }
                true
            } else {
                if queue.timer.is_none() {
                    let engine = Arc::clone(self);
                    let timer_event = event_name.clone();
                    let timer_generation = queue.generation;
                    let window = Duration::from_millis(config.window_ms);
                    queue.timer = Some(tokio::spawn(async move {
                        tokio::time::sleep(window).await;
                        engine
                            .flush_generation(&timer_event, timer_generation)
                            .await;
                    }));
                }
                false
            }
        };

        if flush_now {
            let engine = Arc::clone(self);
            tokio::spawn(async move {
                engine.flush_event(&event_name).await;
            });
        }

        outcome
    }

    /// Timer path: drain the window only if it is still the one the
    /// timer was armed for. Flushing happens on the timer task itself,
    /// so the handle is dropped rather than aborted.
    async fn flush_generation(self: &Arc<Self>, event_name: &str, generation: u64) {
        let queue = {
            let mut queues = self.queues.lock().await;
            if queues
                .get(event_name)
                .is_none_or(|queue| queue.generation != generation)
            {
                return;
            }
            queues.remove(event_name)
        };

        if let Some(queue) = queue {
            self.flush_queue(event_name, queue).await;
        }
    }

    /// Drain one event's window immediately.
    pub async fn flush_event(self: &Arc<Self>, event_name: &str) {
        let queue = {
            let mut queues = self.queues.lock().await;
            queues.remove(event_name)
        };

        if let Some(queue) = queue {
            self.flush_queue(event_name, queue).await;
        }
    }

    async fn flush_queue(self: &Arc<Self>, event_name: &str, mut queue: BatchQueue) {
        // A still-armed timer is left to expire on its own; the
        // generation check turns it into a no-op. Aborting it here would
        // cancel the very task this flush may be running on.
        drop(queue.timer.take());

        debug!(
            "Flushing batch window for \"{event_name}\" ({} pending)",
            queue.pending()
        );

        match queue.strategy {
            MergeStrategy::Latest => {
                if let Some(entry) = queue.latest.take() {
                    self.flush_entry(event_name, entry).await;
                }
            }
            MergeStrategy::Dedupe => {
                let entries: Vec<BatchEntry> = queue.dedupe.drain().map(|(_, e)| e).collect();
                join_all(
                    entries
                        .into_iter()
                        .map(|entry| self.flush_entry(event_name, entry)),
                )
                .await;
            }
            MergeStrategy::Queue => {
                for entry in queue.queue.drain(..) {
                    self.flush_entry(event_name, entry).await;
                }
            }
        }
    }

    /// Drain every pending window (shutdown ordering).
    pub async fn flush_all(self: &Arc<Self>) {
        let event_names: Vec<String> = {
            let queues = self.queues.lock().await;
            queues.keys().cloned().collect()
        };

        join_all(
            event_names
                .iter()
                .map(|event_name| self.flush_event(event_name)),
        )
        .await;
    }

    async fn flush_entry(&self, event_name: &str, entry: BatchEntry) {
        let result = (self.dispatcher)(event_name.to_string(), entry.payload).await;

        for resolver in entry.resolvers {
            // A dropped receiver means the caller gave up; nothing to do.
            let _ = resolver.send(result.clone());
        }
    }
}
