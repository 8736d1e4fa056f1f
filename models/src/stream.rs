//! Stream wire messages.
//!
//! One streaming call is a `start` request, a sequence of tagged
//! [`StreamMessage`]s (`data` / `error` / `end`), and optionally a client
//! `cancel` notification. Messages for a single stream are delivered in
//! emission order; nothing is ordered across streams.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Message kind within one stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamMessageType {
    Data,
    Error,
    End,
}

/// One tagged message belonging to a stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamMessage {
    #[serde(rename = "type")]
    pub kind: StreamMessageType,

    /// Data payload, only for `data` messages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk: Option<Value>,

    /// Error message, only for `error` messages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    pub stream_id: String,
}

impl StreamMessage {
    pub fn data(stream_id: impl Into<String>, chunk: Value) -> Self {
        Self {
            kind: StreamMessageType::Data,
            chunk: Some(chunk),
            error: None,
            stream_id: stream_id.into(),
        }
    }

    pub fn error(stream_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: StreamMessageType::Error,
            chunk: None,
            error: Some(message.into()),
            stream_id: stream_id.into(),
        }
    }

    pub fn end(stream_id: impl Into<String>) -> Self {
        Self {
            kind: StreamMessageType::End,
            chunk: None,
            error: None,
            stream_id: stream_id.into(),
        }
    }
}

/// Body of the stream `start` request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamStart {
    pub stream_id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

/// Body of the stream `cancel` notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamCancel {
    pub stream_id: String,
}
