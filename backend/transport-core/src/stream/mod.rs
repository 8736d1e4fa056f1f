//! Streaming engine.
//!
//! One streaming call is identified by a unique `stream_id`. On the
//! control channel, stream traffic rides suffixed event names derived from
//! the logical channel (`{event}:stream:start`, `{event}:stream:data:{id}`
//! and so on); on an upgraded port it rides tagged frames carrying
//! [`StreamMessage`]s. Either way, events for a single stream arrive in
//! emission order.
//!
//! Cancellation is cooperative: the consumer flips a flag and sends one
//! `cancel` notification; the producer must check [`StreamEmitter::is_cancelled`]
//! before each emission and silently stop once it is set.

use crate::error::StreamError;

use common::ErrorLocation;
use models::{StreamMessage, StreamMessageType};

use serde_json::Value;

use std::collections::HashMap;
use std::future::Future;
use std::panic::Location;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::debug;
use tokio::sync::{mpsc, Mutex};

pub const STREAM_START_SUFFIX: &str = ":stream:start";
pub const STREAM_DATA_SUFFIX: &str = ":stream:data";
pub const STREAM_END_SUFFIX: &str = ":stream:end";
pub const STREAM_ERROR_SUFFIX: &str = ":stream:error";
pub const STREAM_CANCEL_SUFFIX: &str = ":stream:cancel";

pub fn start_event(event_name: &str) -> String {
    format!("{event_name}{STREAM_START_SUFFIX}")
}

pub fn cancel_event(event_name: &str) -> String {
    format!("{event_name}{STREAM_CANCEL_SUFFIX}")
}

pub fn data_event(event_name: &str, stream_id: &str) -> String {
    format!("{event_name}{STREAM_DATA_SUFFIX}:{stream_id}")
}

pub fn end_event(event_name: &str, stream_id: &str) -> String {
    format!("{event_name}{STREAM_END_SUFFIX}:{stream_id}")
}

pub fn error_event(event_name: &str, stream_id: &str) -> String {
    format!("{event_name}{STREAM_ERROR_SUFFIX}:{stream_id}")
}

/// One event observed by a stream consumer.
#[derive(Debug)]
pub enum StreamEvent {
    Data(Value),
    Error(StreamError),
    End,
}

/// Live handle for one consuming stream.
pub struct StreamController {
    stream_id: String,
    cancelled: Arc<AtomicBool>,
    cancel_fn: Arc<dyn Fn() + Send + Sync>,
}

impl StreamController {
    pub(crate) fn new(
        stream_id: String,
        cancelled: Arc<AtomicBool>,
        cancel_fn: Arc<dyn Fn() + Send + Sync>,
    ) -> Self {
        Self {
            stream_id,
            cancelled,
            cancel_fn,
        }
    }

    /// Cancel the stream. Idempotent: the second call is a no-op, and the
    /// cancel notification is sent exactly once.
    pub fn cancel(&self) {
        if !self.cancelled.swap(true, Ordering::SeqCst) {
            (self.cancel_fn)();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }
}

pub(crate) struct StreamRoute {
    pub event_name: String,
    pub tx: mpsc::UnboundedSender<StreamEvent>,
    pub cancelled: Arc<AtomicBool>,
    pub cleanup: Option<Box<dyn FnOnce() + Send>>,
}

/// Consumer-side routing table: stream id -> live route.
pub(crate) struct StreamRoutes {
    routes: Mutex<HashMap<String, StreamRoute>>,
}

impl StreamRoutes {
    pub fn new() -> Self {
        Self {
            routes: Mutex::new(HashMap::new()),
        }
    }

    pub async fn insert(&self, stream_id: String, route: StreamRoute) {
        self.routes.lock().await.insert(stream_id, route);
    }

    /// Remove a route and run its cleanup.
    pub async fn remove(&self, stream_id: &str) {
        let route = self.routes.lock().await.remove(stream_id);
        if let Some(mut route) = route {
            if let Some(cleanup) = route.cleanup.take() {
                cleanup();
            }
        }
    }

    /// Deliver one tagged message to its stream. Cancelled streams drop
    /// everything; terminal messages tear the route down after delivery.
    pub async fn deliver(&self, message: StreamMessage) {
        let (tx, event_name, terminal) = {
            let routes = self.routes.lock().await;
            let Some(route) = routes.get(&message.stream_id) else {
                debug!("Dropping message for unknown stream {}", message.stream_id);
                return;
            };

            if route.cancelled.load(Ordering::SeqCst) {
                return;
            }

            let terminal = !matches!(message.kind, StreamMessageType::Data);
            (route.tx.clone(), route.event_name.clone(), terminal)
        };

        let event = match message.kind {
            StreamMessageType::Data => match message.chunk {
                Some(chunk) => StreamEvent::Data(chunk),
                None => return,
            },
            StreamMessageType::Error => StreamEvent::Error(StreamError::Producer {
                event: event_name,
                stream_id: message.stream_id.clone(),
                message: message
                    .error
                    .unwrap_or_else(|| String::from("stream producer failed")),
                location: ErrorLocation::from(Location::caller()),
            }),
            StreamMessageType::End => StreamEvent::End,
        };

        // Unbounded on purpose: delivery happens on the demux path, which
        // must never block behind a slow consumer.
        let _ = tx.send(event);

        if terminal {
            self.remove(&message.stream_id).await;
        }
    }

    /// Cancel and remove every route (transport destruction).
    pub async fn cancel_all(&self) {
        let drained: Vec<StreamRoute> = {
            let mut routes = self.routes.lock().await;
            routes.drain().map(|(_, route)| route).collect()
        };

        for mut route in drained {
            route.cancelled.store(true, Ordering::SeqCst);
            if let Some(cleanup) = route.cleanup.take() {
                cleanup();
            }
        }
    }
}

/// Producer-side bookkeeping for one live stream.
pub(crate) struct StreamState {
    pub cancelled: AtomicBool,
    pub finished: AtomicBool,
}

/// Producer-side registry of live streams, keyed by stream id.
pub(crate) struct ActiveStreams {
    streams: Mutex<HashMap<String, Arc<StreamState>>>,
}

impl ActiveStreams {
    pub fn new() -> Self {
        Self {
            streams: Mutex::new(HashMap::new()),
        }
    }

    pub async fn insert(&self, stream_id: &str) -> Arc<StreamState> {
        let state = Arc::new(StreamState {
            cancelled: AtomicBool::new(false),
            finished: AtomicBool::new(false),
        });
        self.streams
            .lock()
            .await
            .insert(stream_id.to_string(), state.clone());
        state
    }

    /// Mark a stream cancelled. Returns `false` for unknown ids.
    pub async fn cancel(&self, stream_id: &str) -> bool {
        match self.streams.lock().await.get(stream_id) {
            Some(state) => {
                state.cancelled.store(true, Ordering::SeqCst);
                true
            }
            None => false,
        }
    }

    pub async fn remove(&self, stream_id: &str) {
        self.streams.lock().await.remove(stream_id);
    }
}

/// Future type produced by a stream sink.
pub type StreamSinkFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Transport-provided path from a producer to its consumer (port pipe when
/// one is confirmed, control channel otherwise).
pub(crate) type StreamSink = Arc<dyn Fn(StreamMessage) -> StreamSinkFuture + Send + Sync>;

/// Producer-side handle for emitting into one stream.
///
/// Handed to `on_stream` handlers. The producer must check
/// [`is_cancelled`](Self::is_cancelled) before each emission; once the
/// consumer cancels, every emission becomes a silent no-op.
#[derive(Clone)]
pub struct StreamEmitter {
    stream_id: String,
    state: Arc<StreamState>,
    sink: StreamSink,
    streams: Arc<ActiveStreams>,
}

impl StreamEmitter {
    pub(crate) fn new(
        stream_id: String,
        state: Arc<StreamState>,
        sink: StreamSink,
        streams: Arc<ActiveStreams>,
    ) -> Self {
        Self {
            stream_id,
            state,
            sink,
            streams,
        }
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    /// Whether the consumer cancelled the stream.
    pub fn is_cancelled(&self) -> bool {
        self.state.cancelled.load(Ordering::SeqCst)
    }

    /// Emit one data chunk. Returns `false` (and sends nothing) once the
    /// stream is cancelled or finished.
    pub async fn emit(&self, chunk: Value) -> bool {
        if self.is_cancelled() || self.state.finished.load(Ordering::SeqCst) {
            return false;
        }

        (self.sink)(StreamMessage::data(self.stream_id.clone(), chunk)).await;
        true
    }

    /// Terminate the stream with an error. The consumer is notified once;
    /// no further events are valid for this stream id.
    pub async fn error(&self, message: impl Into<String>) {
        if self.state.finished.swap(true, Ordering::SeqCst) {
            return;
        }

        if !self.is_cancelled() {
            (self.sink)(StreamMessage::error(self.stream_id.clone(), message)).await;
        }

        self.streams.remove(&self.stream_id).await;
    }

    /// Complete the stream successfully and release its resources.
    pub async fn end(&self) {
        if self.state.finished.swap(true, Ordering::SeqCst) {
            return;
        }

        if !self.is_cancelled() {
            (self.sink)(StreamMessage::end(self.stream_id.clone())).await;
        }

        self.streams.remove(&self.stream_id).await;
    }
}
