//! Control-channel envelope types.
//!
//! Every message on the control channel is one [`ControlEnvelope`]. The
//! shape mirrors what both ends expect on the wire:
//!
//! ```json
//! {
//!   "name": "core-box:search:query",
//!   "header": { "status": "request", "type": "host" },
//!   "code": 200,
//!   "data": { "text": "hello" },
//!   "sync": { "id": "...", "timeStamp": 1733000000000, "timeout": 60000 }
//! }
//! ```
//!
//! Presence of `sync` makes the message a correlated request/reply pair;
//! its absence makes it fire-and-forget.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::{SystemTime, UNIX_EPOCH};

/// Default reply timeout stamped into `sync` by the control channel when
/// the caller supplies none.
pub const CHANNEL_DEFAULT_TIMEOUT_MS: u64 = 60_000;

/// Whether an envelope is a request or the reply to one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvelopeStatus {
    Request,
    Reply,
}

/// Which logical channel family the envelope belongs to.
///
/// Host traffic and plugin traffic share one substrate connection but are
/// kept in separate handler namespaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    Host,
    Plugin,
}

/// Response status codes carried in every envelope.
///
/// Serialized as bare numbers on the wire; unknown codes decode as
/// [`DataCode::Error`] rather than failing the whole envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "u16", into = "u16")]
pub enum DataCode {
    Success,
    Error,
    NetworkError,
}

impl From<u16> for DataCode {
    fn from(code: u16) -> Self {
        match code {
            200 => DataCode::Success,
            500 => DataCode::NetworkError,
            _ => DataCode::Error,
        }
    }
}

impl From<DataCode> for u16 {
    fn from(code: DataCode) -> Self {
        match code {
            DataCode::Success => 200,
            DataCode::Error => 100,
            DataCode::NetworkError => 500,
        }
    }
}

/// Correlation block for request/reply pairs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncInfo {
    /// Unique request ID for response correlation.
    pub id: String,

    /// Milliseconds since the Unix epoch at send time.
    pub time_stamp: u64,

    /// Reply timeout in milliseconds. A reply copies the request's value.
    pub timeout: u64,
}

impl SyncInfo {
    /// Build a correlation block with a fresh timestamp.
    pub fn new(id: impl Into<String>, timeout_ms: u64) -> Self {
        Self {
            id: id.into(),
            time_stamp: unix_millis(),
            timeout: timeout_ms,
        }
    }
}

/// Envelope routing and identity metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvelopeHeader {
    pub status: EnvelopeStatus,

    #[serde(rename = "type")]
    pub kind: ChannelKind,

    /// Plugin name, present only on plugin-channel traffic.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plugin: Option<String>,

    /// Opaque plugin security key. The host resolves this to a verified
    /// identity; it is never trusted as-is.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unique_key: Option<String>,
}

impl EnvelopeHeader {
    pub fn request(kind: ChannelKind) -> Self {
        Self {
            status: EnvelopeStatus::Request,
            kind,
            plugin: None,
            unique_key: None,
        }
    }

    pub fn reply(kind: ChannelKind) -> Self {
        Self {
            status: EnvelopeStatus::Reply,
            kind,
            plugin: None,
            unique_key: None,
        }
    }
}

/// One message on the control channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlEnvelope {
    pub name: String,
    pub header: EnvelopeHeader,
    pub code: DataCode,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync: Option<SyncInfo>,
}

impl ControlEnvelope {
    /// Build a correlated request envelope.
    pub fn request(
        name: impl Into<String>,
        kind: ChannelKind,
        data: Option<Value>,
        sync: SyncInfo,
    ) -> Self {
        Self {
            name: name.into(),
            header: EnvelopeHeader::request(kind),
            code: DataCode::Success,
            data,
            sync: Some(sync),
        }
    }

    /// Build a fire-and-forget envelope (no `sync`, no reply expected).
    pub fn notification(name: impl Into<String>, kind: ChannelKind, data: Option<Value>) -> Self {
        Self {
            name: name.into(),
            header: EnvelopeHeader::request(kind),
            code: DataCode::Success,
            data,
            sync: None,
        }
    }

    /// Build the reply to this envelope.
    ///
    /// The reply reuses the request's correlation ID and timeout but carries
    /// a fresh timestamp. Replying to a fire-and-forget envelope produces a
    /// reply without `sync`, which receivers drop on arrival.
    pub fn reply_to(&self, code: DataCode, data: Option<Value>) -> Self {
        Self {
            name: self.name.clone(),
            header: EnvelopeHeader {
                status: EnvelopeStatus::Reply,
                kind: self.header.kind,
                plugin: self.header.plugin.clone(),
                unique_key: self.header.unique_key.clone(),
            },
            code,
            data,
            sync: self.sync.as_ref().map(|sync| SyncInfo {
                id: sync.id.clone(),
                time_stamp: unix_millis(),
                timeout: sync.timeout,
            }),
        }
    }

    /// True when this envelope expects (or carries) a correlated reply.
    pub fn is_correlated(&self) -> bool {
        self.sync.is_some()
    }
}

/// Milliseconds since the Unix epoch.
pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_millis() as u64)
        .unwrap_or(0)
}
