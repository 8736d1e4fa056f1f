//! Host-side transport.
//!
//! The host owns one [`HostTransport`] for the whole process. Renderer
//! and plugin contexts attach as senders, each bringing its own control
//! backend; a per-sender demux task is the only caller of that backend's
//! `recv()`. Inbound requests are dispatched with a fresh
//! [`HandlerContext`] carrying the sender id and - when the caller is a
//! plugin - its verified identity.
//!
//! The host is also the authority for the port-upgrade protocol: it
//! validates upgrade requests, owns every [`PortRecord`], enforces the
//! confirmation timeout and cascades port teardown when a sender is
//! detached.
//!
//! [`PortRecord`]: crate::port::registry::PortRecord

use crate::backend::ControlBackend;
use crate::client::unwrap_reply;
use crate::config::TransportConfig;
use crate::error::{BackendError, SendError};
use crate::identity::{HandlerContext, PluginKeyManager, PluginSecurityContext, SenderId};
use crate::payload_preview::preview;
use crate::port::registry::{ConfirmOutcome, PortEntry, PortRecord, PortRegistry};
use crate::registry::{box_handler, Subscription, TransportRegistry};
use crate::stream::{
    cancel_event, data_event, end_event, error_event, start_event, ActiveStreams, StreamEmitter,
    StreamSink, StreamSinkFuture,
};
use crate::{
    PORT_CLOSE_EVENT, PORT_CONFIRM_EVENT, PORT_DELIVER_EVENT, PORT_ERROR_EVENT, PORT_UPGRADE_EVENT,
};

use common::ErrorLocation;
use models::{
    ChannelKind, ControlEnvelope, DataCode, EnvelopeStatus, ErrorCode, EventDescriptor, PortClose,
    PortConfirm, PortDeliver, PortEnvelope, PortErrorNotice, PortMessageType, PortScope,
    PortWireError, StreamCancel, StreamMessage, StreamMessageType, StreamStart, SyncInfo,
    UpgradeRequest, UpgradeResponse,
};

use serde_json::{json, Value};

use std::collections::HashMap;
use std::future::Future;
use std::panic::Location;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

/// One attached renderer/plugin connection.
struct SenderConnection<B> {
    id: SenderId,
    backend: Arc<B>,

    /// Verified plugin identity established at attach time (e.g. by the
    /// WebSocket auth handshake). Per-envelope keys can add to this but
    /// never override it.
    plugin: Option<String>,
}

/// Subscription pair returned by [`HostTransport::on_stream`].
pub struct StreamHandlerSubscription {
    start: Subscription,
    cancel: Subscription,
}

impl StreamHandlerSubscription {
    /// Remove both underlying registrations. Idempotent.
    pub async fn unsubscribe(&mut self) {
        self.start.unsubscribe().await;
        self.cancel.unsubscribe().await;
    }

    pub fn is_active(&self) -> bool {
        self.start.is_active()
    }
}

/// Host-side transport instance, one per host process.
pub struct HostTransport<B: ControlBackend> {
    registry: Arc<TransportRegistry>,
    senders: RwLock<HashMap<SenderId, Arc<SenderConnection<B>>>>,
    next_sender_id: AtomicU64,
    key_manager: Arc<PluginKeyManager>,
    ports: Arc<PortRegistry>,
    streams: Arc<ActiveStreams>,
    config: TransportConfig,
}

impl<B: ControlBackend> HostTransport<B> {
    pub fn new(config: TransportConfig) -> Arc<Self> {
        Arc::new(Self {
            registry: Arc::new(TransportRegistry::new()),
            senders: RwLock::new(HashMap::new()),
            next_sender_id: AtomicU64::new(1),
            key_manager: Arc::new(PluginKeyManager::new()),
            ports: Arc::new(PortRegistry::new()),
            streams: Arc::new(ActiveStreams::new()),
            config,
        })
    }

    /// The plugin-key authority backing identity verification.
    pub fn key_manager(&self) -> &Arc<PluginKeyManager> {
        &self.key_manager
    }

    /// Host-owned port records (diagnostics and tests).
    pub fn ports(&self) -> &Arc<PortRegistry> {
        &self.ports
    }

    /// Number of currently attached senders.
    pub async fn sender_count(&self) -> usize {
        self.senders.read().await.len()
    }

    /// Attach a sender connection and start demuxing it.
    ///
    /// `plugin` carries a connection-level verified identity (from the
    /// backend's own authentication); pass `None` for window contexts.
    pub async fn attach_sender(self: &Arc<Self>, backend: B, plugin: Option<String>) -> SenderId {
        let id = self.next_sender_id.fetch_add(1, Ordering::Relaxed);
        let connection = Arc::new(SenderConnection {
            id,
            backend: Arc::new(backend),
            plugin,
        });

        self.senders.write().await.insert(id, connection.clone());

        match &connection.plugin {
            Some(name) => info!("Attached sender {id} (plugin \"{name}\")"),
            None => info!("Attached sender {id}"),
        }

        let transport = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(envelope) = connection.backend.recv().await {
                transport.route_from(&connection, envelope).await;
            }
            transport.detach_sender(connection.id).await;
        });

        id
    }

    /// Detach a sender. Its port records are destroyed with it so nothing
    /// leaks when a window or plugin view closes.
    pub async fn detach_sender(&self, sender: SenderId) {
        let removed = self.senders.write().await.remove(&sender);
        if removed.is_none() {
            return;
        }

        info!("Detached sender {sender}");

        let entries = self.ports.remove_for_owner(sender).await;
        let count = entries.len();
        for entry in entries {
            entry.teardown();
        }
        if count > 0 {
            info!("Closed {count} port(s) owned by sender {sender}");
        }
    }

    /// Register a handler for host-channel events.
    pub async fn on<F, Fut>(&self, event: &EventDescriptor, handler: F) -> Subscription
    where
        F: Fn(Option<Value>, HandlerContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, String>> + Send + 'static,
    {
        self.register(ChannelKind::Host, event.name(), box_handler(handler))
            .await
    }

    /// Register a handler for plugin-channel events. Handlers receive the
    /// verified caller identity in their context and enforce policy
    /// themselves; the transport only vouches for authenticity.
    pub async fn on_plugin<F, Fut>(&self, event: &EventDescriptor, handler: F) -> Subscription
    where
        F: Fn(Option<Value>, HandlerContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, String>> + Send + 'static,
    {
        self.register(ChannelKind::Plugin, event.name(), box_handler(handler))
            .await
    }

    async fn register(
        &self,
        kind: ChannelKind,
        event_name: &str,
        handler: crate::registry::BoxedHandler,
    ) -> Subscription {
        let (id, _) = self.registry.register(kind, event_name, handler).await;
        Subscription::new(
            self.registry.clone(),
            kind,
            event_name.to_string(),
            id,
            None,
        )
    }

    /// Register a stream producer for the event.
    ///
    /// The handler runs once per incoming stream start; it emits through
    /// the [`StreamEmitter`] and must poll
    /// [`is_cancelled`](StreamEmitter::is_cancelled) between emissions.
    /// Returning `Err` terminates that one stream with an error event.
    pub async fn on_stream<F, Fut>(
        self: &Arc<Self>,
        event: &EventDescriptor,
        handler: F,
    ) -> StreamHandlerSubscription
    where
        F: Fn(Option<Value>, StreamEmitter) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), String>> + Send + 'static,
    {
        let event_name = event.name().to_string();
        let handler = Arc::new(handler);

        let start_handler = {
            let weak = Arc::downgrade(self);
            let event_name = event_name.clone();
            let handler = handler.clone();
            box_handler(move |payload: Option<Value>, context: HandlerContext| {
                let weak = weak.clone();
                let event_name = event_name.clone();
                let handler = handler.clone();
                async move {
                    let Some(transport) = weak.upgrade() else {
                        return Err(String::from("transport gone"));
                    };

                    let start: StreamStart = payload
                        .ok_or_else(|| String::from("missing stream start payload"))
                        .and_then(|value| {
                            serde_json::from_value(value)
                                .map_err(|e| format!("invalid stream start: {e}"))
                        })?;

                    let state = transport.streams.insert(&start.stream_id).await;
                    let sink = transport.stream_sink(context.sender, &event_name).await?;
                    let emitter = StreamEmitter::new(
                        start.stream_id.clone(),
                        state,
                        sink,
                        transport.streams.clone(),
                    );

                    let user_handler = handler.clone();
                    let task_emitter = emitter.clone();
                    let task_event = event_name.clone();
                    tokio::spawn(async move {
                        if let Err(message) = user_handler(start.payload, task_emitter.clone()).await
                        {
                            error!("Stream handler error for \"{task_event}\": {message}");
                            task_emitter.error(message).await;
                        }
                    });

                    Ok(Value::Null)
                }
            })
        };

        let cancel_handler = {
            let weak = Arc::downgrade(self);
            box_handler(move |payload: Option<Value>, _context: HandlerContext| {
                let weak = weak.clone();
                async move {
                    if let (Some(transport), Some(payload)) = (weak.upgrade(), payload) {
                        if let Ok(cancel) = serde_json::from_value::<StreamCancel>(payload) {
                            if transport.streams.cancel(&cancel.stream_id).await {
                                debug!("Stream {} cancelled by consumer", cancel.stream_id);
                            }
                        }
                    }
                    Ok(Value::Null)
                }
            })
        };

        let start = self
            .register(ChannelKind::Host, &start_event(&event_name), start_handler)
            .await;
        let cancel = self
            .register(ChannelKind::Host, &cancel_event(&event_name), cancel_handler)
            .await;

        StreamHandlerSubscription { start, cancel }
    }

    /// Send a correlated request to one attached sender.
    pub async fn send_to(
        &self,
        sender: SenderId,
        event: &EventDescriptor,
        payload: Option<Value>,
        timeout_ms: Option<u64>,
    ) -> Result<Value, SendError> {
        let connection = self.connection(sender).await.ok_or_else(|| {
            SendError::Unavailable {
                event: event.name().to_string(),
                message: format!("sender {sender} is not attached"),
                location: ErrorLocation::from(Location::caller()),
            }
        })?;

        self.dispatch_to(&connection, ChannelKind::Host, None, event.name(), payload, timeout_ms)
            .await
    }

    /// Send a correlated request to the named plugin's context. The
    /// envelope carries the plugin's key so the receiving runtime can
    /// trust the origin.
    pub async fn send_to_plugin(
        &self,
        plugin: &str,
        event: &EventDescriptor,
        payload: Option<Value>,
        timeout_ms: Option<u64>,
    ) -> Result<Value, SendError> {
        let connection = self.plugin_connection(plugin).await.ok_or_else(|| {
            SendError::Unavailable {
                event: event.name().to_string(),
                message: format!("plugin \"{plugin}\" is not attached"),
                location: ErrorLocation::from(Location::caller()),
            }
        })?;

        let key = self
            .key_manager
            .key_for(plugin)
            .await
            .map(|key| key.as_str().to_string());

        self.dispatch_to(
            &connection,
            ChannelKind::Plugin,
            Some((plugin.to_string(), key)),
            event.name(),
            payload,
            timeout_ms,
        )
        .await
    }

    /// Fire-and-forget to one sender.
    pub async fn broadcast_to(
        &self,
        sender: SenderId,
        event: &EventDescriptor,
        payload: Option<Value>,
    ) {
        let Some(connection) = self.connection(sender).await else {
            debug!(
                "Skip broadcasting \"{}\": sender {sender} unavailable",
                event.name()
            );
            return;
        };

        let envelope = ControlEnvelope::notification(event.name(), ChannelKind::Host, payload);
        if let Err(e) = connection.backend.send(envelope).await {
            warn!("Error broadcasting \"{}\" to {sender}: {e}", event.name());
        }
    }

    /// Fire-and-forget to every attached sender.
    pub async fn broadcast(&self, event: &EventDescriptor, payload: Option<Value>) {
        let connections: Vec<Arc<SenderConnection<B>>> =
            self.senders.read().await.values().cloned().collect();

        for connection in connections {
            let envelope =
                ControlEnvelope::notification(event.name(), ChannelKind::Host, payload.clone());
            if let Err(e) = connection.backend.send(envelope).await {
                warn!(
                    "Error broadcasting \"{}\" to {}: {e}",
                    event.name(),
                    connection.id
                );
            }
        }
    }

    /// Fire-and-forget to the named plugin, carrying its key.
    pub async fn broadcast_plugin(
        &self,
        plugin: &str,
        event: &EventDescriptor,
        payload: Option<Value>,
    ) {
        let Some(connection) = self.plugin_connection(plugin).await else {
            return;
        };

        let mut envelope =
            ControlEnvelope::notification(event.name(), ChannelKind::Plugin, payload);
        envelope.header.plugin = Some(plugin.to_string());
        envelope.header.unique_key = self
            .key_manager
            .key_for(plugin)
            .await
            .map(|key| key.as_str().to_string());

        if let Err(e) = connection.backend.send(envelope).await {
            warn!("Error broadcasting \"{}\" to plugin {plugin}: {e}", event.name());
        }
    }

    // ------------------------------------------------------------------
    // Outbound dispatch
    // ------------------------------------------------------------------

    async fn dispatch_to(
        &self,
        connection: &Arc<SenderConnection<B>>,
        kind: ChannelKind,
        plugin_header: Option<(String, Option<String>)>,
        event_name: &str,
        payload: Option<Value>,
        timeout_override: Option<u64>,
    ) -> Result<Value, SendError> {
        let timeout_ms = timeout_override.unwrap_or(self.config.default_send_timeout_ms);
        let sync = SyncInfo::new(Uuid::new_v4().to_string(), timeout_ms);
        let sync_id = sync.id.clone();

        let mut envelope = ControlEnvelope::request(event_name, kind, payload, sync);
        if let Some((name, key)) = plugin_header {
            envelope.header.plugin = Some(name);
            envelope.header.unique_key = key;
        }

        let reply_rx = self.registry.register_pending(sync_id.clone()).await;

        let mut sent = false;
        if let Some((port_id, pipe)) = self.ports.confirmed_pipe(event_name, connection.id).await {
            match serde_json::to_value(&envelope) {
                Ok(wrapped) => {
                    let frame = PortEnvelope {
                        channel: event_name.to_string(),
                        port_id: Some(port_id),
                        stream_id: None,
                        sequence: None,
                        kind: PortMessageType::Data,
                        payload: Some(wrapped),
                        error: None,
                    };
                    if pipe.send(frame).await.is_ok() {
                        sent = true;
                    } else {
                        debug!("Port dispatch for \"{event_name}\" failed; using control channel");
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
            if let Err(backend_error) = connection.backend.send(envelope).await {
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
                warn!("Request \"{event_name}\" to sender {} timed out after {timeout_ms}ms", connection.id);
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

    async fn connection(&self, sender: SenderId) -> Option<Arc<SenderConnection<B>>> {
        self.senders.read().await.get(&sender).cloned()
    }

    async fn plugin_connection(&self, plugin: &str) -> Option<Arc<SenderConnection<B>>> {
        self.senders
            .read()
            .await
            .values()
            .find(|connection| connection.plugin.as_deref() == Some(plugin))
            .cloned()
    }

    // ------------------------------------------------------------------
    // Inbound routing
    // ------------------------------------------------------------------

    async fn route_from(
        self: &Arc<Self>,
        connection: &Arc<SenderConnection<B>>,
        envelope: ControlEnvelope,
    ) {
        match envelope.header.status {
            EnvelopeStatus::Reply => {
                let Some(sync) = envelope.sync.clone() else {
                    // Stray replies without correlation come from broadcast
                    // listeners answering anyway; dropping them keeps them
                    // from being misread as requests.
                    return;
                };
                if !self.registry.resolve_pending(&sync.id, envelope).await {
                    debug!("Dropping reply with no pending waiter ({})", sync.id);
                }
            }
            EnvelopeStatus::Request => {
                let context = self.build_context(connection, &envelope).await;
                match envelope.name.as_str() {
                    PORT_UPGRADE_EVENT => self.handle_upgrade(connection, context, envelope).await,
                    PORT_CONFIRM_EVENT => self.handle_confirm(connection, envelope).await,
                    PORT_CLOSE_EVENT => self.handle_port_close(connection, envelope).await,
                    _ => self.dispatch_request(connection, context, envelope).await,
                }
            }
        }
    }

    /// Resolve the caller identity for one inbound request. The identity
    /// is authentic by construction: either established by the backend's
    /// own authentication at attach time, or derived from a host-issued
    /// key - never from the sender's bare claim.
    async fn build_context(
        &self,
        connection: &Arc<SenderConnection<B>>,
        envelope: &ControlEnvelope,
    ) -> HandlerContext {
        let plugin = if let Some(name) = &connection.plugin {
            Some(PluginSecurityContext {
                name: name.clone(),
                verified: true,
            })
        } else if let Some(key) = &envelope.header.unique_key {
            match self.key_manager.resolve_key(key).await {
                Some(name) => Some(PluginSecurityContext {
                    name,
                    verified: true,
                }),
                None => envelope.header.plugin.clone().map(|name| PluginSecurityContext {
                    name,
                    verified: false,
                }),
            }
        } else {
            envelope.header.plugin.clone().map(|name| PluginSecurityContext {
                name,
                verified: false,
            })
        };

        HandlerContext {
            sender: connection.id,
            event_name: envelope.name.clone(),
            plugin,
        }
    }

    async fn dispatch_request(
        self: &Arc<Self>,
        connection: &Arc<SenderConnection<B>>,
        context: HandlerContext,
        envelope: ControlEnvelope,
    ) {
        let kind = match context.verified_plugin() {
            Some(_) => ChannelKind::Plugin,
            None => envelope.header.kind,
        };

        let handlers = self.registry.handlers_for(kind, &envelope.name).await;

        if handlers.is_empty() {
            warn!(
                "No handler registered for \"{}\" (payload {})",
                envelope.name,
                preview(envelope.data.as_ref())
            );
            if envelope.is_correlated() {
                let reply = envelope.reply_to(
                    DataCode::Error,
                    Some(json!({
                        "message": format!("No handler registered for \"{}\"", envelope.name),
                        "reason": "no_handler",
                        "eventName": envelope.name,
                    })),
                );
                if let Err(e) = connection.backend.send(reply).await {
                    warn!("Failed to send no-handler reply for \"{}\": {e}", envelope.name);
                }
            }
            return;
        }

        // Notifications run inline on the demux path so per-connection
        // arrival order is preserved (stream cancel depends on this);
        // correlated requests may run arbitrary handlers and are spawned.
        if !envelope.is_correlated() {
            for handler in handlers {
                if let Err(message) = handler(envelope.data.clone(), context.clone()).await {
                    error!("Handler error for \"{}\": {message}", envelope.name);
                }
            }
            return;
        }

        let backend = connection.backend.clone();
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

            if let Err(e) = backend.send(reply).await {
                warn!("Error sending reply for \"{}\": {e}", envelope.name);
            }
        });
    }

    // ------------------------------------------------------------------
    // Port-upgrade protocol
    // ------------------------------------------------------------------

    async fn handle_upgrade(
        self: &Arc<Self>,
        connection: &Arc<SenderConnection<B>>,
        context: HandlerContext,
        envelope: ControlEnvelope,
    ) {
        let data = envelope.data.clone().unwrap_or(Value::Null);

        let request: UpgradeRequest = match serde_json::from_value(data.clone()) {
            Ok(request) => request,
            Err(parse_error) => {
                let channel = data
                    .get("channel")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                let scope_invalid = data.get("scope").is_some_and(|scope| {
                    !matches!(scope.as_str(), Some("app" | "window" | "plugin"))
                });
                let code = if scope_invalid {
                    ErrorCode::InvalidScope
                } else {
                    ErrorCode::InvalidRequest
                };
                self.reply_upgrade(
                    connection,
                    &envelope,
                    UpgradeResponse::rejected(channel, code, parse_error.to_string()),
                )
                .await;
                return;
            }
        };

        if let Err((code, message)) = self.validate_upgrade(&request, &context) {
            debug!(
                "Rejecting upgrade for \"{}\" from sender {}: {message}",
                request.channel, connection.id
            );
            self.reply_upgrade(
                connection,
                &envelope,
                UpgradeResponse::rejected(request.channel, code, message),
            )
            .await;
            return;
        }

        let port_id = Uuid::new_v4().to_string();

        let pipe = match connection.backend.open_port_pipe(&port_id).await {
            Ok(pipe) => pipe,
            Err(BackendError::NotSupported { message, .. }) => {
                self.reply_upgrade(
                    connection,
                    &envelope,
                    UpgradeResponse::rejected(request.channel, ErrorCode::NotSupported, message),
                )
                .await;
                return;
            }
            Err(other) => {
                warn!(
                    "Failed to allocate port for \"{}\": {other}",
                    request.channel
                );
                self.reply_upgrade(
                    connection,
                    &envelope,
                    UpgradeResponse::rejected(
                        request.channel,
                        ErrorCode::PostMessageFailed,
                        other.to_string(),
                    ),
                )
                .await;
                return;
            }
        };

        let record = PortRecord {
            port_id: port_id.clone(),
            channel: request.channel.clone(),
            scope: request.scope,
            owner: connection.id,
            permissions: request.permissions.clone(),
            confirmed: false,
            created_at: Instant::now(),
        };

        self.ports
            .insert(PortEntry {
                record,
                pipe_tx: pipe.sender,
                confirm_timer: None,
                reader: None,
            })
            .await;

        let timer = {
            let transport = Arc::downgrade(self);
            let timer_port_id = port_id.clone();
            let timeout = Duration::from_millis(self.config.confirm_timeout_ms);
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                if let Some(transport) = transport.upgrade() {
                    transport.expire_port(&timer_port_id).await;
                }
            })
        };

        let reader = tokio::spawn(host_port_reader(
            Arc::downgrade(self),
            connection.clone(),
            port_id.clone(),
            pipe.receiver,
        ));

        self.ports.attach_tasks(&port_id, timer, reader).await;

        // Announce the out-of-band endpoint transfer.
        let deliver = PortDeliver {
            channel: request.channel.clone(),
            port_id: port_id.clone(),
        };
        let push = ControlEnvelope::notification(
            PORT_DELIVER_EVENT,
            ChannelKind::Host,
            serde_json::to_value(&deliver).ok(),
        );
        if let Err(e) = connection.backend.send(push).await {
            warn!("Failed to announce port endpoint for \"{}\": {e}", request.channel);
        }

        info!(
            "Negotiated port {port_id} for \"{}\" (sender {}, scope {:?})",
            request.channel, connection.id, request.scope
        );

        self.reply_upgrade(
            connection,
            &envelope,
            UpgradeResponse {
                accepted: true,
                channel: request.channel,
                scope: Some(request.scope),
                permissions: request.permissions,
                port_id: Some(port_id),
                error: None,
            },
        )
        .await;
    }

    fn validate_upgrade(
        &self,
        request: &UpgradeRequest,
        context: &HandlerContext,
    ) -> Result<(), (ErrorCode, String)> {
        if request.channel.is_empty() {
            return Err((
                ErrorCode::InvalidRequest,
                String::from("channel name must not be empty"),
            ));
        }

        if !self.config.allowlist.allows(&request.channel) {
            return Err((
                ErrorCode::NotSupported,
                format!("channel \"{}\" is not eligible for upgrade", request.channel),
            ));
        }

        match request.scope {
            PortScope::App => Ok(()),
            PortScope::Window => match request.window_id {
                None => Err((
                    ErrorCode::InvalidRequest,
                    String::from("windowId is required for window scope"),
                )),
                Some(window_id) if window_id != context.sender => Err((
                    ErrorCode::WindowMismatch,
                    format!(
                        "window {window_id} does not belong to sender {}",
                        context.sender
                    ),
                )),
                Some(_) => Ok(()),
            },
            PortScope::Plugin => match context.verified_plugin() {
                None => Err((
                    ErrorCode::PluginRequired,
                    String::from("no verified plugin identity for plugin scope"),
                )),
                Some(actual) => match &request.plugin {
                    Some(claimed) if claimed != actual => Err((
                        ErrorCode::PluginMismatch,
                        format!(
                            "plugin \"{claimed}\" does not match verified identity \"{actual}\""
                        ),
                    )),
                    _ => Ok(()),
                },
            },
        }
    }

    async fn reply_upgrade(
        &self,
        connection: &Arc<SenderConnection<B>>,
        envelope: &ControlEnvelope,
        response: UpgradeResponse,
    ) {
        if !envelope.is_correlated() {
            return;
        }

        match serde_json::to_value(&response) {
            Ok(value) => {
                let reply = envelope.reply_to(DataCode::Success, Some(value));
                if let Err(e) = connection.backend.send(reply).await {
                    warn!("Failed to send upgrade reply: {e}");
                }
            }
            Err(e) => error!("Failed to serialize upgrade response: {e}"),
        }
    }

    async fn handle_confirm(
        self: &Arc<Self>,
        connection: &Arc<SenderConnection<B>>,
        envelope: ControlEnvelope,
    ) {
        let confirm: Option<PortConfirm> = envelope
            .data
            .clone()
            .and_then(|data| serde_json::from_value(data).ok());

        let Some(confirm) = confirm else {
            warn!("Dropping malformed port confirmation");
            self.notify_port_error(connection, None, "malformed port confirmation")
                .await;
            return;
        };

        match self.ports.confirm(&confirm.port_id, connection.id).await {
            ConfirmOutcome::Confirmed => {
                info!(
                    "Port {} for \"{}\" confirmed by sender {}",
                    confirm.port_id, confirm.channel, connection.id
                );
                self.ack(connection, &envelope, json!({ "accepted": true }))
                    .await;
            }
            ConfirmOutcome::AlreadyConfirmed => {
                debug!("Duplicate confirmation for port {}", confirm.port_id);
                self.ack(connection, &envelope, json!({ "accepted": true }))
                    .await;
            }
            ConfirmOutcome::OwnerMismatch | ConfirmOutcome::Unknown => {
                // The record is gone (confirmation timed out) or the
                // confirming sender never owned it. Either way the port is
                // abandoned: close it so the peer's runtime discards the
                // endpoint without ever using it.
                warn!(
                    "Abandoned confirmation for port {} on \"{}\"; closing",
                    confirm.port_id, confirm.channel
                );
                let close = PortClose {
                    channel: confirm.channel.clone(),
                    port_id: Some(confirm.port_id.clone()),
                    reason: Some(String::from("confirm_timeout")),
                };
                let push = ControlEnvelope::notification(
                    PORT_CLOSE_EVENT,
                    ChannelKind::Host,
                    serde_json::to_value(&close).ok(),
                );
                if let Err(e) = connection.backend.send(push).await {
                    debug!("Failed to notify abandoned port {}: {e}", confirm.port_id);
                }

                if envelope.is_correlated() {
                    let reply = envelope.reply_to(
                        DataCode::Error,
                        Some(json!({
                            "message": format!("port {} is no longer available", confirm.port_id),
                            "reason": "confirm_timeout",
                            "eventName": envelope.name,
                        })),
                    );
                    let _ = connection.backend.send(reply).await;
                }
            }
        }
    }

    async fn handle_port_close(
        self: &Arc<Self>,
        connection: &Arc<SenderConnection<B>>,
        envelope: ControlEnvelope,
    ) {
        let close: Option<PortClose> = envelope
            .data
            .clone()
            .and_then(|data| serde_json::from_value(data).ok());

        let Some(close) = close else {
            warn!("Dropping malformed port close");
            self.notify_port_error(connection, None, "malformed port close")
                .await;
            return;
        };

        let entries = self
            .ports
            .remove_matching(connection.id, &close.channel, close.port_id.as_deref())
            .await;
        let count = entries.len();
        for entry in entries {
            entry.teardown();
        }

        if count > 0 {
            info!(
                "Closed {count} port(s) on \"{}\" (reason: {})",
                close.channel,
                close.reason.as_deref().unwrap_or("unspecified")
            );
        }

        self.ack(connection, &envelope, Value::Null).await;
    }

    /// Push a `transport:port:error` notice to one sender.
    async fn notify_port_error(
        &self,
        connection: &Arc<SenderConnection<B>>,
        port: Option<(&str, &str)>,
        message: &str,
    ) {
        let (channel, port_id) = match port {
            Some((channel, port_id)) => (channel.to_string(), Some(port_id.to_string())),
            None => (String::new(), None),
        };
        let notice = PortErrorNotice {
            channel,
            port_id,
            error: PortWireError {
                code: ErrorCode::MessageError,
                message: message.to_string(),
            },
        };
        let push = ControlEnvelope::notification(
            PORT_ERROR_EVENT,
            ChannelKind::Host,
            serde_json::to_value(&notice).ok(),
        );
        if let Err(e) = connection.backend.send(push).await {
            debug!("Failed to push port error notice: {e}");
        }
    }

    async fn ack(
        &self,
        connection: &Arc<SenderConnection<B>>,
        envelope: &ControlEnvelope,
        data: Value,
    ) {
        if !envelope.is_correlated() {
            return;
        }
        let reply = envelope.reply_to(DataCode::Success, Some(data));
        if let Err(e) = connection.backend.send(reply).await {
            debug!("Failed to send ack for \"{}\": {e}", envelope.name);
        }
    }

    /// Confirmation-timeout path: destroy the record if it is still
    /// unconfirmed and tell the requester's runtime to discard the
    /// endpoint.
    async fn expire_port(&self, port_id: &str) {
        let Some(entry) = self.ports.remove_if_unconfirmed(port_id).await else {
            return;
        };

        let PortEntry {
            record,
            pipe_tx,
            confirm_timer,
            reader,
        } = entry;

        warn!(
            "Port {port_id} for \"{}\" unconfirmed after {}ms; destroying",
            record.channel, self.config.confirm_timeout_ms
        );

        // This runs on the timer task itself: dropping (not aborting) the
        // timer handle lets the remaining cleanup finish.
        drop(confirm_timer);
        if let Some(reader) = reader {
            reader.abort();
        }
        drop(pipe_tx);

        if let Some(connection) = self.connection(record.owner).await {
            let close = PortClose {
                channel: record.channel,
                port_id: Some(record.port_id),
                reason: Some(String::from("confirm_timeout")),
            };
            let push = ControlEnvelope::notification(
                PORT_CLOSE_EVENT,
                ChannelKind::Host,
                serde_json::to_value(&close).ok(),
            );
            let _ = connection.backend.send(push).await;
        }
    }

    /// Build the producer->consumer path for one stream: the confirmed
    /// port pipe when the owner has one for this channel, the control
    /// channel otherwise. Evaluated per emission so a port that dies
    /// mid-stream degrades transparently.
    async fn stream_sink(
        &self,
        owner: SenderId,
        event_name: &str,
    ) -> Result<StreamSink, String> {
        let Some(connection) = self.connection(owner).await else {
            return Err(format!("sender {owner} unavailable"));
        };

        let ports = self.ports.clone();
        let backend = connection.backend.clone();
        let channel = event_name.to_string();
        let sequence = Arc::new(AtomicU64::new(0));

        Ok(Arc::new(move |message: StreamMessage| {
            let ports = ports.clone();
            let backend = backend.clone();
            let channel = channel.clone();
            let sequence = sequence.clone();

            Box::pin(async move {
                let payload = match serde_json::to_value(&message) {
                    Ok(payload) => payload,
                    Err(e) => {
                        warn!("Failed to serialize stream message for \"{channel}\": {e}");
                        return;
                    }
                };

                if let Some((port_id, pipe)) = ports.confirmed_pipe(&channel, owner).await {
                    let frame = PortEnvelope {
                        channel: channel.clone(),
                        port_id: Some(port_id),
                        stream_id: Some(message.stream_id.clone()),
                        sequence: Some(sequence.fetch_add(1, Ordering::Relaxed)),
                        kind: PortMessageType::Data,
                        payload: Some(payload.clone()),
                        error: None,
                    };
                    if pipe.send(frame).await.is_ok() {
                        return;
                    }
                    debug!("Port emission for \"{channel}\" failed; using control channel");
                }

                let name = match message.kind {
                    StreamMessageType::Data => data_event(&channel, &message.stream_id),
                    StreamMessageType::Error => error_event(&channel, &message.stream_id),
                    StreamMessageType::End => end_event(&channel, &message.stream_id),
                };
                let envelope =
                    ControlEnvelope::notification(name, ChannelKind::Host, Some(payload));
                if let Err(e) = backend.send(envelope).await {
                    warn!("Failed stream emission for \"{channel}\": {e}");
                }
            }) as StreamSinkFuture
        }))
    }
}

/// Reader task for the host end of one port pipe. Wrapped control
/// envelopes rejoin the normal routing path; a close frame (or the pipe
/// dropping) removes the record.
fn host_port_reader<B: ControlBackend>(
    transport: Weak<HostTransport<B>>,
    connection: Arc<SenderConnection<B>>,
    port_id: String,
    mut receiver: mpsc::Receiver<PortEnvelope>,
) -> Pin<Box<dyn Future<Output = ()> + Send>> {
    Box::pin(async move {
    while let Some(frame) = receiver.recv().await {
        let Some(transport) = transport.upgrade() else {
            return;
        };

        match frame.kind {
            PortMessageType::Close => break,
            PortMessageType::Error => {
                if let Some(wire) = &frame.error {
                    warn!("Port {port_id} error ({}): {}", wire.code, wire.message);
                }
            }
            PortMessageType::Data => {
                if frame.stream_id.is_some() {
                    // Streams flow host -> consumer; inbound stream frames
                    // have no meaning here.
                    continue;
                }
                let Some(payload) = frame.payload else {
                    continue;
                };
                match serde_json::from_value::<ControlEnvelope>(payload) {
                    // A close arriving on the pipe itself closes this
                    // port; routing it would have the close handler abort
                    // the task it is running on.
                    Ok(envelope) if envelope.name == PORT_CLOSE_EVENT => break,
                    Ok(envelope) => transport.route_from(&connection, envelope).await,
                    Err(e) => warn!("Undecodable frame on port {port_id}: {e}"),
                }
            }
        }
    }

    // Peer closed (frame or pipe drop): retire the record. The reader
    // handle inside the entry is this task, so it is dropped rather than
    // aborted.
    if let Some(transport) = transport.upgrade() {
        if let Some(entry) = transport.ports.remove(&port_id).await {
            let PortEntry {
                confirm_timer,
                reader,
                ..
            } = entry;
            if let Some(timer) = confirm_timer {
                timer.abort();
            }
            drop(reader);
        }
    }
    })
}
