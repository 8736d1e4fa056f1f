//! Client-side transport for renderer and plugin contexts.
//!
//! A [`ClientTransport`] owns one control backend connected to the host
//! and layers the full send pipeline on top of it: cache consult, batch
//! coalescing, port fast path, correlated dispatch. It also receives
//! host-initiated traffic (pushes, stream events, port notifications) on
//! a demux loop that is the only caller of `backend.recv()`.
//!
//! Plugin contexts use [`ClientTransport::spawn_plugin`]; every envelope
//! they send carries the plugin name and its host-issued security key in
//! the header, which the host verifies before handlers run.

use crate::backend::ControlBackend;
use crate::batch::{BatchDispatcher, BatchEngine, DispatchFuture};
use crate::cache::{cache_key, CacheMode, CachePolicy, ResponseCache};
use crate::config::TransportConfig;
use crate::error::{BackendError, PortError, SendError, StreamError};
use crate::identity::{HandlerContext, HOST_SENDER};
use crate::payload_preview::preview;
use crate::port::{is_permanent_rejection, ClientPortManager, PortHandle};
use crate::registry::{box_handler, Subscription, TransportRegistry};
use crate::stream::{
    cancel_event, data_event, end_event, error_event, start_event, StreamController, StreamEvent,
    StreamRoute, StreamRoutes,
};
use crate::{
    is_reserved_channel, PORT_CLOSE_EVENT, PORT_CONFIRM_EVENT, PORT_DELIVER_EVENT,
    PORT_ERROR_EVENT, PORT_UPGRADE_EVENT,
};

use common::{ErrorLocation, RedactedPluginKey};
use models::{
    ChannelKind, ControlEnvelope, DataCode, EnvelopeStatus, ErrorCode, EventDescriptor, PortClose,
    PortConfirm, PortEnvelope, PortErrorNotice, PortMessageType, PortScope, StreamCancel,
    StreamMessage, StreamStart, SyncInfo, UpgradeRequest, UpgradeResponse,
};

use serde_json::{json, Value};

use std::future::Future;
use std::panic::Location;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::sync::mpsc;
use uuid::Uuid;

/// Identity attached to every envelope a plugin transport sends.
pub struct PluginIdentity {
    pub name: String,
    pub key: RedactedPluginKey,
}

/// Options for one send.
#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    /// Skip batching and dispatch immediately.
    pub immediate: bool,

    /// Reply timeout override in milliseconds. Defaults to the control
    /// channel's own timeout.
    pub timeout_ms: Option<u64>,

    /// Opt-in response caching.
    pub cache: Option<CachePolicy>,
}

impl SendOptions {
    pub fn immediate() -> Self {
        Self {
            immediate: true,
            ..Self::default()
        }
    }

    pub fn cached(policy: CachePolicy) -> Self {
        Self {
            cache: Some(policy),
            ..Self::default()
        }
    }
}

/// Whether a stream attempts the port upgrade for its channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PortPreference {
    #[default]
    Auto,
    Disabled,
}

/// Options for one streaming call.
#[derive(Debug, Clone, Default)]
pub struct StreamOptions {
    pub port: PortPreference,
}

/// Client-side transport instance, one per renderer/plugin context.
pub struct ClientTransport<B: ControlBackend> {
    backend: Arc<B>,
    registry: Arc<TransportRegistry>,
    cache: ResponseCache,
    batch: Arc<BatchEngine>,
    ports: Arc<ClientPortManager>,
    stream_routes: Arc<StreamRoutes>,
    config: TransportConfig,
    plugin: Option<PluginIdentity>,
    kind: ChannelKind,
    destroyed: AtomicBool,
}

impl<B: ControlBackend> ClientTransport<B> {
    /// Spawn a transport for a window/renderer context.
    pub fn spawn(backend: B, config: TransportConfig) -> Arc<Self> {
        Self::build(backend, config, None)
    }

    /// Spawn a transport for a plugin context. The identity rides in
    /// every envelope header and is verified host-side.
    pub fn spawn_plugin(backend: B, config: TransportConfig, identity: PluginIdentity) -> Arc<Self> {
        Self::build(backend, config, Some(identity))
    }

    fn build(backend: B, config: TransportConfig, plugin: Option<PluginIdentity>) -> Arc<Self> {
        let kind = match plugin {
            Some(_) => ChannelKind::Plugin,
            None => ChannelKind::Host,
        };

        let transport = Arc::new_cyclic(|weak: &Weak<Self>| {
            let dispatcher: BatchDispatcher = {
                let weak = weak.clone();
                Arc::new(move |event_name: String, payload: Option<Value>| {
                    let weak = weak.clone();
                    Box::pin(async move {
                        match weak.upgrade() {
                            Some(transport) => {
                                transport.dispatch(&event_name, payload, None).await
                            }
                            None => Err(SendError::Destroyed {
                                event: event_name,
                                message: String::from("transport dropped"),
                                location: ErrorLocation::from(Location::caller()),
                            }),
                        }
                    }) as DispatchFuture
                })
            };

            Self {
                backend: Arc::new(backend),
                registry: Arc::new(TransportRegistry::new()),
                cache: ResponseCache::new(),
                batch: Arc::new(BatchEngine::new(dispatcher)),
                ports: Arc::new(ClientPortManager::new()),
                stream_routes: Arc::new(StreamRoutes::new()),
                config,
                plugin,
                kind,
                destroyed: AtomicBool::new(false),
            }
        });

        tokio::spawn(Self::run(transport.clone()));
        transport
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    /// Send a request and await its reply.
    ///
    /// Consults the cache first when the call opts in, then either joins
    /// the event's batch window or dispatches one round trip over the
    /// active channel (an upgraded port when one is confirmed, the
    /// control channel otherwise).
    ///
    /// # Errors
    ///
    /// Substrate failures, error replies and timeouts surface as
    /// [`SendError`], wrapped with the event name. A cache miss in `only`
    /// mode fails immediately without dispatching.
    pub async fn send(
        self: &Arc<Self>,
        event: &EventDescriptor,
        payload: Option<Value>,
        options: SendOptions,
    ) -> Result<Value, SendError> {
        let event_name = event.name();

        if self.is_destroyed() {
            return Err(SendError::Destroyed {
                event: event_name.to_string(),
                message: String::from("transport destroyed"),
                location: ErrorLocation::from(Location::caller()),
            });
        }

        let cache_key = options
            .cache
            .as_ref()
            .map(|policy| cache_key(event_name, payload.as_ref(), policy));

        if let (Some(policy), Some(key)) = (&options.cache, &cache_key) {
            if let Some(hit) = self.cache.get(key).await {
                return Ok(hit);
            }
            if policy.mode == CacheMode::Only {
                return Err(SendError::CacheMiss {
                    event: event_name.to_string(),
                    message: format!("no cached value for key \"{key}\""),
                    location: ErrorLocation::from(Location::caller()),
                });
            }
        }

        // Lazy port upgrade for eligible channels; any failure just means
        // the control channel carries this call.
        if !is_reserved_channel(event_name) && self.config.allowlist.allows(event_name) {
            self.ensure_port(event_name, self.config.confirm_timeout_ms)
                .await;
        }

        // A requested cache policy forces the immediate path so the
        // response can be captured for the exact call that asked.
        if event.is_batch_enabled() && !options.immediate && options.cache.is_none() {
            let config = event
                .batch()
                .cloned()
                .unwrap_or_default();
            let outcome = self.batch.enqueue(event, &config, payload).await;
            return match outcome.await {
                Ok(result) => result,
                Err(_) => Err(SendError::Destroyed {
                    event: event_name.to_string(),
                    message: String::from("batch window dropped before flush"),
                    location: ErrorLocation::from(Location::caller()),
                }),
            };
        }

        let result = self.dispatch(event_name, payload, options.timeout_ms).await?;

        if let (Some(policy), Some(key)) = (options.cache, cache_key) {
            self.cache.put(key, result.clone(), policy.ttl).await;
        }

        Ok(result)
    }

    /// Fire-and-forget notification to the host; no reply is expected and
    /// none is awaited.
    pub async fn broadcast(
        &self,
        event: &EventDescriptor,
        payload: Option<Value>,
    ) -> Result<(), SendError> {
        let envelope = self.build_envelope(event.name(), payload, None);
        self.backend
            .send(envelope)
            .await
            .map_err(|e| SendError::Dispatch {
                event: event.name().to_string(),
                message: e.to_string(),
                location: ErrorLocation::from(Location::caller()),
            })
    }

    /// Register a handler for host-initiated traffic on this event.
    ///
    /// All registered handlers run per inbound call; the last result wins
    /// as the single reply. The first registration for an eligible
    /// channel also opens its port subscription; the last unregistration
    /// closes it.
    pub async fn on<F, Fut>(self: &Arc<Self>, event: &EventDescriptor, handler: F) -> Subscription
    where
        F: Fn(Option<Value>, HandlerContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, String>> + Send + 'static,
    {
        let event_name = event.name();
        let (id, first) = self
            .registry
            .register(self.kind, event_name, box_handler(handler))
            .await;

        let eligible =
            !is_reserved_channel(event_name) && self.config.allowlist.allows(event_name);

        if !eligible {
            return Subscription::new(
                self.registry.clone(),
                self.kind,
                event_name.to_string(),
                id,
                None,
            );
        }

        if first {
            self.ports.retain(event_name).await;
            let weak = Arc::downgrade(self);
            let channel = event_name.to_string();
            let wait = self.config.confirm_timeout_ms;
            tokio::spawn(async move {
                if let Some(transport) = weak.upgrade() {
                    transport.ensure_port(&channel, wait).await;
                }
            });
        }

        let ports = Arc::clone(&self.ports);
        let channel = event_name.to_string();
        let on_last: Box<dyn FnOnce() + Send> = Box::new(move || {
            tokio::spawn(async move {
                ports.release(&channel).await;
            });
        });

        Subscription::new(
            self.registry.clone(),
            self.kind,
            event_name.to_string(),
            id,
            Some(on_last),
        )
    }

    /// Start a streaming call.
    ///
    /// Returns a live controller immediately plus the event receiver;
    /// events for this stream arrive in producer emission order and stop
    /// after a terminal event or [`StreamController::cancel`].
    ///
    /// # Errors
    ///
    /// Only the start request can fail; once it is accepted, producer
    /// failures arrive as [`StreamEvent::Error`].
    pub async fn stream(
        self: &Arc<Self>,
        event: &EventDescriptor,
        payload: Option<Value>,
        options: StreamOptions,
    ) -> Result<(StreamController, mpsc::UnboundedReceiver<StreamEvent>), StreamError> {
        let event_name = event.name();

        if self.is_destroyed() {
            return Err(StreamError::Start {
                event: event_name.to_string(),
                message: String::from("transport destroyed"),
                location: ErrorLocation::from(Location::caller()),
            });
        }

        let stream_id = Uuid::new_v4().to_string();
        let (tx, rx) = mpsc::unbounded_channel();
        let cancelled = Arc::new(AtomicBool::new(false));

        // Control-channel fallback route: exact-name relays for this
        // stream's data/end/error events.
        let relay = {
            let routes = Arc::clone(&self.stream_routes);
            box_handler(move |payload: Option<Value>, _context: HandlerContext| {
                let routes = Arc::clone(&routes);
                async move {
                    if let Some(payload) = payload {
                        match serde_json::from_value::<StreamMessage>(payload) {
                            Ok(message) => routes.deliver(message).await,
                            Err(e) => warn!("Undecodable stream message: {e}"),
                        }
                    }
                    Ok(Value::Null)
                }
            })
        };

        let mut registrations: Vec<(String, u64)> = Vec::new();
        for name in [
            data_event(event_name, &stream_id),
            end_event(event_name, &stream_id),
            error_event(event_name, &stream_id),
        ] {
            let (id, _) = self.registry.register(self.kind, &name, relay.clone()).await;
            registrations.push((name, id));
        }

        let cleanup: Box<dyn FnOnce() + Send> = {
            let registry = self.registry.clone();
            let kind = self.kind;
            Box::new(move || {
                tokio::spawn(async move {
                    for (name, id) in registrations {
                        registry.unregister(kind, &name, id).await;
                    }
                });
            })
        };

        self.stream_routes
            .insert(
                stream_id.clone(),
                StreamRoute {
                    event_name: event_name.to_string(),
                    tx,
                    cancelled: cancelled.clone(),
                    cleanup: Some(cleanup),
                },
            )
            .await;

        // Streams prefer the port path but never depend on it; the
        // shorter confirmation window keeps startup latency bounded.
        if options.port == PortPreference::Auto && self.config.allowlist.allows(event_name) {
            self.ensure_port(event_name, self.config.stream_confirm_timeout_ms)
                .await;
        }

        let start_payload = serde_json::to_value(StreamStart {
            stream_id: stream_id.clone(),
            payload,
        })
        .map_err(|e| StreamError::Start {
            event: event_name.to_string(),
            message: format!("failed to serialize start payload: {e}"),
            location: ErrorLocation::from(Location::caller()),
        })?;

        if let Err(send_error) = self
            .dispatch(&start_event(event_name), Some(start_payload), None)
            .await
        {
            self.stream_routes.remove(&stream_id).await;
            return Err(StreamError::Start {
                event: event_name.to_string(),
                message: send_error.to_string(),
                location: ErrorLocation::from(Location::caller()),
            });
        }

        let cancel_fn: Arc<dyn Fn() + Send + Sync> = {
            let weak = Arc::downgrade(self);
            let cancel_name = cancel_event(event_name);
            let stream_id = stream_id.clone();
            Arc::new(move || {
                let weak = weak.clone();
                let cancel_name = cancel_name.clone();
                let stream_id = stream_id.clone();
                tokio::spawn(async move {
                    let Some(transport) = weak.upgrade() else {
                        return;
                    };
                    let payload = serde_json::to_value(StreamCancel {
                        stream_id: stream_id.clone(),
                    })
                    .ok();
                    let envelope = transport.build_envelope(&cancel_name, payload, None);
                    if let Err(e) = transport.backend.send(envelope).await {
                        debug!("Failed to send cancel for stream {stream_id}: {e}");
                    }
                    transport.stream_routes.remove(&stream_id).await;
                });
            })
        };

        let controller = StreamController::new(stream_id, cancelled, cancel_fn);
        Ok((controller, rx))
    }

    /// Raw upgrade request for one channel (most callers rely on the
    /// lazy attempt inside `send`/`stream` instead).
    pub async fn upgrade(&self, request: UpgradeRequest) -> Result<UpgradeResponse, SendError> {
        let payload = serde_json::to_value(&request).map_err(|e| SendError::Serialize {
            event: PORT_UPGRADE_EVENT.to_string(),
            message: e.to_string(),
            location: ErrorLocation::from(Location::caller()),
        })?;

        let value = self.dispatch(PORT_UPGRADE_EVENT, Some(payload), None).await?;

        serde_json::from_value(value).map_err(|e| SendError::Serialize {
            event: PORT_UPGRADE_EVENT.to_string(),
            message: format!("invalid upgrade response: {e}"),
            location: ErrorLocation::from(Location::caller()),
        })
    }

    /// Open (or reuse) the upgraded port for a channel. `None` means the
    /// channel stays on the control path.
    pub async fn open_port(self: &Arc<Self>, channel: &str) -> Option<Arc<PortHandle>> {
        self.ensure_port(channel, self.config.confirm_timeout_ms).await
    }

    /// Force immediate flush of all pending batch windows.
    pub async fn flush(&self) {
        self.batch.flush_all().await;
    }

    /// Tear the transport down: flush batches, cancel live streams,
    /// close ports and drop every handler registration.
    pub async fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }

        self.batch.flush_all().await;
        self.stream_routes.cancel_all().await;
        self.ports.close_all().await;
        self.registry.clear().await;
        self.cache.clear().await;
        info!("Client transport destroyed");
    }

    // ------------------------------------------------------------------
    // Dispatch internals
    // ------------------------------------------------------------------

    /// One round trip over the active channel.
    async fn dispatch(
        &self,
        event_name: &str,
        payload: Option<Value>,
        timeout_override: Option<u64>,
    ) -> Result<Value, SendError> {
        let timeout_ms = timeout_override.unwrap_or(self.config.default_send_timeout_ms);
        let sync = SyncInfo::new(Uuid::new_v4().to_string(), timeout_ms);
        let sync_id = sync.id.clone();
        let envelope = self.build_envelope(event_name, payload, Some(sync));

        let reply_rx = self.registry.register_pending(sync_id.clone()).await;

        let mut sent = false;
        if let Some(handle) = self.ports.handle(event_name).await {
            match serde_json::to_value(&envelope) {
                Ok(wrapped) => {
                    let frame = PortEnvelope {
                        channel: event_name.to_string(),
                        port_id: Some(handle.port_id().to_string()),
                        stream_id: None,
                        sequence: None,
                        kind: PortMessageType::Data,
                        payload: Some(wrapped),
                        error: None,
                    };
                    match handle.send(frame).await {
                        Ok(()) => sent = true,
                        Err(port_error) => {
                            debug!(
                                "Port send for \"{event_name}\" failed; falling back: {port_error}"
                            );
                            self.ports.remove(event_name).await;
                        }
                    }
                }
                Err(e) => {
                    self.registry.remove_pending(&sync_id).await;
                    return Err(SendError::Serialize {
                        event: event_name.to_string(),
                        message: e.to_string(),
                        location: ErrorLocation::from(Location::caller()),
                    });
                }
            }
        }

        if !sent {
            if let Err(backend_error) = self.backend.send(envelope).await {
                self.registry.remove_pending(&sync_id).await;
                return Err(SendError::Dispatch {
                    event: event_name.to_string(),
                    message: backend_error.to_string(),
                    location: ErrorLocation::from(Location::caller()),
                });
            }
        }

        match tokio::time::timeout(Duration::from_millis(timeout_ms), reply_rx).await {
            Err(_) => {
                self.registry.remove_pending(&sync_id).await;
                warn!("Request \"{event_name}\" timed out after {timeout_ms}ms");
                Err(SendError::Timeout {
                    event: event_name.to_string(),
                    timeout_ms,
                    location: ErrorLocation::from(Location::caller()),
                })
            }
            Ok(Err(_)) => Err(SendError::Dispatch {
                event: event_name.to_string(),
                message: String::from("reply channel closed"),
                location: ErrorLocation::from(Location::caller()),
            }),
            Ok(Ok(reply)) => unwrap_reply(event_name, reply),
        }
    }

    fn build_envelope(
        &self,
        event_name: &str,
        payload: Option<Value>,
        sync: Option<SyncInfo>,
    ) -> ControlEnvelope {
        let mut envelope = match sync {
            Some(sync) => ControlEnvelope::request(event_name, self.kind, payload, sync),
            None => ControlEnvelope::notification(event_name, self.kind, payload),
        };

        if let Some(identity) = &self.plugin {
            envelope.header.plugin = Some(identity.name.clone());
            envelope.header.unique_key = Some(identity.key.as_str().to_string());
        }

        envelope
    }

    // ------------------------------------------------------------------
    // Port upgrade internals
    // ------------------------------------------------------------------

    /// Lazily open the port for a channel, caching the handle. `None`
    /// means fall back to the control channel for now.
    async fn ensure_port(self: &Arc<Self>, channel: &str, wait_ms: u64) -> Option<Arc<PortHandle>> {
        if self.is_destroyed() {
            return None;
        }

        if let Some(handle) = self.ports.handle(channel).await {
            return Some(handle);
        }

        if self.ports.is_denied(channel).await {
            return None;
        }

        if !self.ports.begin_upgrade(channel).await {
            // Another task is negotiating; this call takes the control path.
            return None;
        }

        let result = self.open_port_flow(channel, wait_ms).await;
        self.ports.end_upgrade(channel).await;

        match result {
            Ok(handle) => Some(handle),
            Err(port_error) => {
                debug!("Port upgrade for \"{channel}\" unavailable; using control channel: {port_error}");
                if is_permanent_rejection(port_error.code()) {
                    self.ports.deny(channel).await;
                }
                None
            }
        }
    }

    async fn open_port_flow(
        self: &Arc<Self>,
        channel: &str,
        wait_ms: u64,
    ) -> Result<Arc<PortHandle>, PortError> {
        let scope = match &self.plugin {
            Some(_) => PortScope::Plugin,
            None => PortScope::App,
        };

        let request = UpgradeRequest {
            channel: channel.to_string(),
            scope,
            window_id: None,
            plugin: self.plugin.as_ref().map(|identity| identity.name.clone()),
            permissions: Vec::new(),
        };

        let response = self.upgrade(request).await.map_err(|e| PortError::Message {
            channel: channel.to_string(),
            message: e.to_string(),
            location: ErrorLocation::from(Location::caller()),
        })?;

        if !response.accepted {
            let (code, message) = response
                .error
                .map(|wire| (wire.code, wire.message))
                .unwrap_or((ErrorCode::MessageError, String::from("upgrade rejected")));
            return Err(PortError::Rejected {
                channel: channel.to_string(),
                code,
                message,
                location: ErrorLocation::from(Location::caller()),
            });
        }

        let port_id = response.port_id.clone().ok_or_else(|| PortError::Message {
            channel: channel.to_string(),
            message: String::from("accepted upgrade carried no port id"),
            location: ErrorLocation::from(Location::caller()),
        })?;

        let pipe = self
            .backend
            .take_port_pipe(&port_id, Duration::from_millis(wait_ms))
            .await
            .map_err(|backend_error| match backend_error {
                BackendError::NotSupported { message, .. } => PortError::Rejected {
                    channel: channel.to_string(),
                    code: ErrorCode::NotSupported,
                    message,
                    location: ErrorLocation::from(Location::caller()),
                },
                // The accepted endpoint never arrived in time; the host's
                // own timer will reap the unconfirmed record.
                _ => PortError::ConfirmTimeout {
                    channel: channel.to_string(),
                    port_id: port_id.clone(),
                    timeout_ms: wait_ms,
                    location: ErrorLocation::from(Location::caller()),
                },
            })?;

        let open = Arc::new(AtomicBool::new(true));
        let handle = Arc::new(PortHandle::new(
            port_id.clone(),
            channel.to_string(),
            pipe.sender,
            open.clone(),
        ));

        let weak = Arc::downgrade(self);
        tokio::spawn(run_port_reader(
            weak,
            channel.to_string(),
            pipe.receiver,
            open,
        ));

        // Acknowledge that this end is listening; the host clears its
        // confirmation timeout on receipt.
        let confirm = PortConfirm {
            channel: channel.to_string(),
            port_id: port_id.clone(),
            scope: response.scope,
            permissions: response.permissions.clone(),
        };
        let confirm_payload =
            serde_json::to_value(&confirm).map_err(|e| PortError::Message {
                channel: channel.to_string(),
                message: e.to_string(),
                location: ErrorLocation::from(Location::caller()),
            })?;
        let envelope = self.build_envelope(PORT_CONFIRM_EVENT, Some(confirm_payload), None);
        self.backend
            .send(envelope)
            .await
            .map_err(|e| PortError::Message {
                channel: channel.to_string(),
                message: format!("failed to send confirmation: {e}"),
                location: ErrorLocation::from(Location::caller()),
            })?;

        self.ports.store(channel, handle.clone()).await;
        info!("Channel \"{channel}\" upgraded to port {port_id}");

        Ok(handle)
    }

    // ------------------------------------------------------------------
    // Demux
    // ------------------------------------------------------------------

    async fn run(self: Arc<Self>) {
        while let Some(envelope) = self.backend.recv().await {
            self.route_control(envelope).await;
        }
        info!("Control channel closed");
    }

    async fn route_control(self: &Arc<Self>, envelope: ControlEnvelope) {
        match envelope.header.status {
            EnvelopeStatus::Reply => {
                let Some(sync) = envelope.sync.clone() else {
                    // Stray replies without correlation are dropped; they
                    // come from broadcast listeners answering anyway.
                    return;
                };
                if !self.registry.resolve_pending(&sync.id, envelope).await {
                    debug!("Dropping reply with no pending waiter ({})", sync.id);
                }
            }
            EnvelopeStatus::Request => {
                if envelope.name == PORT_CLOSE_EVENT {
                    if let Some(close) = envelope
                        .data
                        .clone()
                        .and_then(|data| serde_json::from_value::<PortClose>(data).ok())
                    {
                        self.ports
                            .handle_close(&close.channel, close.port_id.as_deref())
                            .await;
                    }
                    return;
                }

                if envelope.name == PORT_DELIVER_EVENT {
                    // Endpoint transfer announcement; the pipe itself is
                    // claimed during the upgrade flow.
                    debug!("Port endpoint announced: {:?}", envelope.data);
                    return;
                }

                if envelope.name == PORT_ERROR_EVENT {
                    if let Some(notice) = envelope
                        .data
                        .clone()
                        .and_then(|data| serde_json::from_value::<PortErrorNotice>(data).ok())
                    {
                        warn!(
                            "Port error on \"{}\" ({}): {}",
                            notice.channel, notice.error.code, notice.error.message
                        );
                        if !notice.channel.is_empty() {
                            self.ports
                                .handle_close(&notice.channel, notice.port_id.as_deref())
                                .await;
                        }
                    }
                    return;
                }

                self.dispatch_request(envelope).await;
            }
        }
    }

    async fn dispatch_request(self: &Arc<Self>, envelope: ControlEnvelope) {
        let handlers = self.registry.handlers_for(self.kind, &envelope.name).await;

        if handlers.is_empty() {
            debug!(
                "No handler registered for \"{}\" (payload {})",
                envelope.name,
                preview(envelope.data.as_ref())
            );
            return;
        }

        let context = HandlerContext {
            sender: HOST_SENDER,
            event_name: envelope.name.clone(),
            plugin: None,
        };

        // Notifications run inline on the demux path so per-connection
        // arrival order is preserved (stream events depend on this);
        // correlated requests may run arbitrary handlers and are spawned.
        if !envelope.is_correlated() {
            for handler in handlers {
                if let Err(message) = handler(envelope.data.clone(), context.clone()).await {
                    error!("Handler error for \"{}\": {message}", envelope.name);
                }
            }
            return;
        }

        let transport = Arc::clone(self);
        tokio::spawn(async move {
            let mut outcome: Result<Value, String> = Ok(Value::Null);
            for handler in handlers {
                outcome = handler(envelope.data.clone(), context.clone()).await;
                if let Err(message) = &outcome {
                    error!("Handler error for \"{}\": {message}", envelope.name);
                }
            }

            let reply = match outcome {
                Ok(value) => envelope.reply_to(DataCode::Success, Some(value)),
                Err(message) => envelope.reply_to(
                    DataCode::Error,
                    Some(json!({
                        "message": message,
                        "reason": "handler_throw",
                        "eventName": envelope.name,
                    })),
                ),
            };

            if let Err(e) = transport.backend.send(reply).await {
                warn!("Failed to send reply for \"{}\": {e}", envelope.name);
            }
        });
    }
}

/// Interpret a reply envelope as the send outcome.
pub(crate) fn unwrap_reply(event_name: &str, reply: ControlEnvelope) -> Result<Value, SendError> {
    match reply.code {
        DataCode::Success => Ok(reply.data.unwrap_or(Value::Null)),
        DataCode::Error | DataCode::NetworkError => Err(SendError::ErrorReply {
            event: event_name.to_string(),
            message: extract_error_message(reply.data.as_ref()),
            location: ErrorLocation::from(Location::caller()),
        }),
    }
}

fn extract_error_message(data: Option<&Value>) -> String {
    data.and_then(|value| value.get("message"))
        .and_then(|message| message.as_str())
        .map(str::to_string)
        .unwrap_or_else(|| preview(data))
}

/// Reader task for one upgraded port: stream frames route to their
/// streams, wrapped control envelopes rejoin the normal demux path, and
/// a close (or pipe drop) invalidates the cached handle.
async fn run_port_reader<B: ControlBackend>(
    transport: Weak<ClientTransport<B>>,
    channel: String,
    mut receiver: mpsc::Receiver<PortEnvelope>,
    open: Arc<AtomicBool>,
) {
    while let Some(frame) = receiver.recv().await {
        let Some(transport) = transport.upgrade() else {
            break;
        };

        match frame.kind {
            PortMessageType::Close => break,
            PortMessageType::Error => {
                if let Some(wire) = &frame.error {
                    warn!(
                        "Port error on \"{channel}\" ({}): {}",
                        wire.code, wire.message
                    );
                }
            }
            PortMessageType::Data => {
                let Some(payload) = frame.payload else {
                    continue;
                };

                if frame.stream_id.is_some() {
                    match serde_json::from_value::<StreamMessage>(payload) {
                        Ok(message) => transport.stream_routes.deliver(message).await,
                        Err(e) => warn!("Undecodable stream frame on \"{channel}\": {e}"),
                    }
                } else {
                    match serde_json::from_value::<ControlEnvelope>(payload) {
                        Ok(envelope) => transport.route_control(envelope).await,
                        Err(e) => warn!("Undecodable port frame on \"{channel}\": {e}"),
                    }
                }
            }
        }
    }

    open.store(false, Ordering::SeqCst);
    if let Some(transport) = transport.upgrade() {
        transport.ports.handle_close(&channel, None).await;
    }
}
