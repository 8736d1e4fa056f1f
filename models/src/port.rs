//! Port-upgrade protocol messages and the dedicated-pipe envelope.
//!
//! A port upgrade replaces the control channel with a dedicated
//! bidirectional pipe for one logical channel. The negotiation itself rides
//! the control channel on the reserved `transport:port:*` events; once
//! confirmed, traffic for that channel switches to [`PortEnvelope`] frames
//! on the pipe. Every failure along the way falls back to the control
//! channel, so nothing here is a correctness dependency.

use crate::error_code::ErrorCode;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Lifetime scope of an upgraded port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PortScope {
    /// Lives as long as the application.
    App,
    /// Tied to one window; destroyed with it.
    Window,
    /// Tied to one plugin view; destroyed with it.
    Plugin,
}

/// `transport:port:upgrade` request body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpgradeRequest {
    pub channel: String,
    pub scope: PortScope,

    /// Required for `window` scope; must equal the sender's own identity.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub window_id: Option<u64>,

    /// Plugin name for `plugin` scope.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plugin: Option<String>,

    /// Opaque permission tags echoed back on acceptance.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub permissions: Vec<String>,
}

/// `transport:port:upgrade` reply body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpgradeResponse {
    pub accepted: bool,
    pub channel: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<PortScope>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub permissions: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<PortWireError>,
}

impl UpgradeResponse {
    /// Build a rejection carrying the given error.
    pub fn rejected(channel: impl Into<String>, code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            accepted: false,
            channel: channel.into(),
            scope: None,
            permissions: Vec::new(),
            port_id: None,
            error: Some(PortWireError {
                code,
                message: message.into(),
            }),
        }
    }
}

/// `transport:port:confirm` body - the requester acknowledging that it has
/// received and started listening on the transferred endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortConfirm {
    pub channel: String,
    pub port_id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<PortScope>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub permissions: Vec<String>,
}

/// `transport:port:close` body. Either side may send it; omitting
/// `port_id` closes every port on the channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortClose {
    pub channel: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// `transport:port:deliver` push body announcing that an endpoint for
/// `port_id` has been transferred out-of-band and is ready to be claimed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortDeliver {
    pub channel: String,
    pub port_id: String,
}

/// `transport:port:error` push body reporting a transport-level problem
/// with a negotiated port. Receivers stop using the port and fall back to
/// the control channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortErrorNotice {
    pub channel: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port_id: Option<String>,

    pub error: PortWireError,
}

/// Structured error carried inside port envelopes and upgrade replies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortWireError {
    pub code: ErrorCode,
    pub message: String,
}

/// Message kind on an upgraded pipe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PortMessageType {
    Data,
    Close,
    Error,
}

/// One frame on a dedicated port pipe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortEnvelope {
    pub channel: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence: Option<u64>,

    #[serde(rename = "type")]
    pub kind: PortMessageType,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<PortWireError>,
}

impl PortEnvelope {
    /// Build a data frame for the given channel.
    pub fn data(channel: impl Into<String>, payload: Value) -> Self {
        Self {
            channel: channel.into(),
            port_id: None,
            stream_id: None,
            sequence: None,
            kind: PortMessageType::Data,
            payload: Some(payload),
            error: None,
        }
    }

    /// Build a close frame.
    pub fn close(channel: impl Into<String>, port_id: Option<String>) -> Self {
        Self {
            channel: channel.into(),
            port_id,
            stream_id: None,
            sequence: None,
            kind: PortMessageType::Close,
            payload: None,
            error: None,
        }
    }
}
