//! WebSocket control backend.
//!
//! Out-of-process renderer and plugin contexts connect to the host over a
//! localhost-only WebSocket carrying JSON envelopes. The server:
//!
//! - Listens on `127.0.0.1` only and rejects non-loopback clients
//! - Requires an authentication handshake as the first message
//! - Resolves plugin keys to a verified identity at accept time
//!
//! # Protocol
//!
//! 1. **First message MUST be** a [`HandshakeRequest`] with a valid token:
//!    either the host-issued window token or a plugin security key
//! 2. Server responds with a [`HandshakeResponse`] carrying the assigned
//!    sender id (success) or an error (failure)
//! 3. If auth fails, the connection closes immediately (fail-closed)
//! 4. All subsequent frames are JSON [`ControlEnvelope`]s
//!
//! This backend has no transferable-pipe primitive, so the port methods
//! report `NotSupported`; port upgrades on WebSocket connections fall
//! back to the control channel.

use crate::backend::{ControlBackend, PortPipe};
use crate::error::BackendError;
use crate::identity::PluginKeyManager;

use common::ErrorLocation;
use models::ControlEnvelope;

use std::net::SocketAddr;
use std::panic::Location;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_async, connect_async, WebSocketStream};
use uuid::Uuid;

/// Buffer sizes for the per-connection reader/writer tasks.
const FRAME_CAPACITY: usize = 256;

/// First message sent by a connecting client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandshakeRequest {
    /// Window token or plugin security key.
    pub token: String,
}

/// Server reply to the handshake.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandshakeResponse {
    pub success: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_id: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// One authenticated WebSocket connection, usable as a control backend.
pub struct WebSocketBackend {
    outgoing: mpsc::Sender<Message>,
    incoming: Mutex<mpsc::Receiver<ControlEnvelope>>,
}

impl WebSocketBackend {
    /// Wrap an established stream: spawns the writer and reader tasks and
    /// wires them to bounded channels.
    fn spawn_io<S>(ws: WebSocketStream<S>) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (mut sink, mut stream) = ws.split();
        let (outgoing, mut outgoing_rx) = mpsc::channel::<Message>(FRAME_CAPACITY);
        let (incoming_tx, incoming) = mpsc::channel::<ControlEnvelope>(FRAME_CAPACITY);

        tokio::spawn(async move {
            while let Some(message) = outgoing_rx.recv().await {
                if sink.send(message).await.is_err() {
                    break;
                }
            }
        });

        tokio::spawn(async move {
            while let Some(message) = stream.next().await {
                match message {
                    Ok(Message::Text(text)) => {
                        match serde_json::from_str::<ControlEnvelope>(text.as_str()) {
                            Ok(envelope) => {
                                if incoming_tx.send(envelope).await.is_err() {
                                    break;
                                }
                            }
                            Err(parse_error) => {
                                warn!("Dropping undecodable frame: {parse_error}");
                            }
                        }
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {
                        // Binary/ping/pong frames carry no envelopes.
                    }
                    Err(read_error) => {
                        warn!("WebSocket read error: {read_error}");
                        break;
                    }
                }
            }
            // incoming_tx drops here; recv() observes the close.
        });

        Self {
            outgoing,
            incoming: Mutex::new(incoming),
        }
    }

    /// Connect to a host listener and authenticate.
    ///
    /// Returns the backend plus the sender id the host assigned.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::Handshake`] when the connection or the
    /// authentication exchange fails.
    pub async fn connect(port: u16, token: &str) -> Result<(Self, u64), BackendError> {
        let url = format!("ws://127.0.0.1:{port}");
        let (mut ws, _) = connect_async(&url).await.map_err(|e| BackendError::Handshake {
            message: format!("Failed to connect to {url}: {e}"),
            location: ErrorLocation::from(Location::caller()),
        })?;

        let handshake = HandshakeRequest {
            token: token.to_string(),
        };
        let text = serde_json::to_string(&handshake)?;
        ws.send(Message::text(text))
            .await
            .map_err(|e| BackendError::Handshake {
                message: format!("Failed to send handshake: {e}"),
                location: ErrorLocation::from(Location::caller()),
            })?;

        // The host replies once it has attached the sender.
        loop {
            let message = ws.next().await.ok_or_else(|| BackendError::Handshake {
                message: String::from("Connection closed before handshake response"),
                location: ErrorLocation::from(Location::caller()),
            })?;

            match message {
                Ok(Message::Text(text)) => {
                    let response: HandshakeResponse = serde_json::from_str(text.as_str())?;
                    if !response.success {
                        return Err(BackendError::Handshake {
                            message: response
                                .error
                                .unwrap_or_else(|| String::from("Authentication rejected")),
                            location: ErrorLocation::from(Location::caller()),
                        });
                    }
                    let sender_id = response.sender_id.ok_or_else(|| BackendError::Handshake {
                        message: String::from("Handshake response missing sender id"),
                        location: ErrorLocation::from(Location::caller()),
                    })?;
                    return Ok((Self::spawn_io(ws), sender_id));
                }
                Ok(Message::Close(_)) => {
                    return Err(BackendError::Handshake {
                        message: String::from("Connection closed during handshake"),
                        location: ErrorLocation::from(Location::caller()),
                    });
                }
                Ok(_) => continue,
                Err(e) => {
                    return Err(BackendError::Handshake {
                        message: format!("Error reading handshake response: {e}"),
                        location: ErrorLocation::from(Location::caller()),
                    });
                }
            }
        }
    }
}

impl ControlBackend for WebSocketBackend {
    async fn send(&self, envelope: ControlEnvelope) -> Result<(), BackendError> {
        let text = serde_json::to_string(&envelope).map_err(|e| BackendError::Send {
            message: format!("Failed to encode envelope: {e}"),
            location: ErrorLocation::from(Location::caller()),
        })?;

        self.outgoing
            .send(Message::text(text))
            .await
            .map_err(|_| BackendError::Closed {
                message: String::from("writer task gone"),
                location: ErrorLocation::from(Location::caller()),
            })
    }

    async fn recv(&self) -> Option<ControlEnvelope> {
        self.incoming.lock().await.recv().await
    }

    async fn open_port_pipe(&self, _port_id: &str) -> Result<PortPipe, BackendError> {
        Err(BackendError::NotSupported {
            message: String::from("WebSocket backend has no transferable pipe primitive"),
            location: ErrorLocation::from(Location::caller()),
        })
    }

    async fn take_port_pipe(
        &self,
        _port_id: &str,
        _wait: Duration,
    ) -> Result<PortPipe, BackendError> {
        Err(BackendError::NotSupported {
            message: String::from("WebSocket backend has no transferable pipe primitive"),
            location: ErrorLocation::from(Location::caller()),
        })
    }
}

/// An authenticated connection accepted by [`WebSocketListener`], ready to
/// be attached to a host transport.
pub struct AcceptedConnection {
    pub backend: WebSocketBackend,

    /// Verified plugin name when the client authenticated with a plugin
    /// key; `None` for window connections.
    pub plugin: Option<String>,

    /// Completes the handshake once the host has assigned a sender id.
    pub confirmer: ConnectionConfirmer,
}

/// Sends the successful handshake response after the host attached the
/// connection. Kept separate from the backend so the backend can be moved
/// into the host transport first.
pub struct ConnectionConfirmer {
    confirm_tx: mpsc::Sender<Message>,
}

impl ConnectionConfirmer {
    /// Tell the client its assigned sender id.
    pub async fn confirm(self, sender_id: u64) -> Result<(), BackendError> {
        let response = HandshakeResponse {
            success: true,
            sender_id: Some(sender_id),
            error: None,
        };
        let text = serde_json::to_string(&response)?;

        self.confirm_tx
            .send(Message::text(text))
            .await
            .map_err(|_| BackendError::Closed {
                message: String::from("connection closed before handshake confirmation"),
                location: ErrorLocation::from(Location::caller()),
            })
    }
}

/// Localhost-only WebSocket listener producing authenticated connections.
pub struct WebSocketListener {
    port: u16,
    window_token: String,
    accepted: mpsc::Receiver<AcceptedConnection>,
}

impl WebSocketListener {
    /// Bind on `127.0.0.1:port` and start accepting in the background.
    ///
    /// Pass `port` 0 to let the OS choose; the actual port is available
    /// from [`port`](Self::port). When no window token is supplied one is
    /// generated, exactly like the auth token of a fresh IPC server.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::Io`] when the port cannot be bound.
    pub async fn bind(
        port: u16,
        window_token: Option<String>,
        key_manager: Arc<PluginKeyManager>,
    ) -> Result<Self, BackendError> {
        let window_token = window_token.unwrap_or_else(|| {
            let token = Uuid::new_v4().to_string();
            info!("Generated window auth token for transport listener");
            token
        });

        let address = format!("127.0.0.1:{port}");
        let listener = TcpListener::bind(&address).await?;
        let actual_port = listener.local_addr()?.port();

        info!("Transport listener on 127.0.0.1:{actual_port}");

        let (conn_tx, accepted) = mpsc::channel(16);
        let loop_token = window_token.clone();

        tokio::spawn(async move {
            while let Ok((stream, addr)) = listener.accept().await {
                info!("Client connecting from {addr}");
                let token = loop_token.clone();
                let keys = key_manager.clone();
                let tx = conn_tx.clone();
                tokio::spawn(handle_connection(stream, addr, token, keys, tx));
            }
        });

        Ok(Self {
            port: actual_port,
            window_token,
            accepted,
        })
    }

    /// The bound port.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Token window contexts must present in their handshake.
    pub fn window_token(&self) -> &str {
        &self.window_token
    }

    /// Next authenticated connection, or `None` once the listener stops.
    pub async fn accept(&mut self) -> Option<AcceptedConnection> {
        self.accepted.recv().await
    }
}

/// Handle a single incoming connection through authentication.
async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    window_token: String,
    key_manager: Arc<PluginKeyManager>,
    conn_tx: mpsc::Sender<AcceptedConnection>,
) {
    // Reject non-loopback clients silently (don't give attackers info).
    if !addr.ip().is_loopback() {
        warn!("Rejected non-loopback connection from {addr}");
        return;
    }

    let mut ws = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            error!("WebSocket handshake failed for {addr}: {e}");
            return;
        }
    };

    // First message MUST be the auth handshake.
    let Some(Ok(Message::Text(text))) = ws.next().await else {
        warn!("Client {addr} disconnected or sent a non-text first message");
        return;
    };

    let handshake: HandshakeRequest = match serde_json::from_str(text.as_str()) {
        Ok(handshake) => handshake,
        Err(_) => {
            warn!("Client {addr} auth failed: first message was not a handshake");
            return;
        }
    };

    let plugin = if handshake.token == window_token {
        None
    } else {
        match key_manager.resolve_key(&handshake.token).await {
            Some(name) => Some(name),
            None => {
                warn!("Client {addr} auth failed: invalid token");
                let rejection = HandshakeResponse {
                    success: false,
                    sender_id: None,
                    error: Some(String::from("Invalid authentication token")),
                };
                if let Ok(text) = serde_json::to_string(&rejection) {
                    let _ = ws.send(Message::text(text)).await;
                }
                return;
            }
        }
    };

    match &plugin {
        Some(name) => info!("Client {addr} authenticated as plugin \"{name}\""),
        None => info!("Client {addr} authenticated as window context"),
    }

    let backend = WebSocketBackend::spawn_io(ws);
    let confirmer = ConnectionConfirmer {
        confirm_tx: backend.outgoing.clone(),
    };

    let connection = AcceptedConnection {
        backend,
        plugin,
        confirmer,
    };

    if conn_tx.send(connection).await.is_err() {
        warn!("Listener consumer gone; dropping connection from {addr}");
    }
}
