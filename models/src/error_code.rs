//! Wire-level error taxonomy.

use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter, Result as FormatResult};

/// Machine-readable error codes carried in error payloads and port
/// envelopes.
///
/// Upgrade/port failures are recoverable (the transport falls back to the
/// control channel); request failures are surfaced to the caller.
/// `cache_miss` only occurs in `only` cache mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    InvalidRequest,
    InvalidScope,
    WindowMismatch,
    PluginRequired,
    PluginMismatch,
    SenderUnavailable,
    NotSupported,
    PostMessageFailed,
    ConfirmTimeout,
    MessageError,
    StreamError,
    CacheMiss,
}

impl ErrorCode {
    /// The wire spelling of this code.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::InvalidRequest => "invalid_request",
            ErrorCode::InvalidScope => "invalid_scope",
            ErrorCode::WindowMismatch => "window_mismatch",
            ErrorCode::PluginRequired => "plugin_required",
            ErrorCode::PluginMismatch => "plugin_mismatch",
            ErrorCode::SenderUnavailable => "sender_unavailable",
            ErrorCode::NotSupported => "not_supported",
            ErrorCode::PostMessageFailed => "post_message_failed",
            ErrorCode::ConfirmTimeout => "confirm_timeout",
            ErrorCode::MessageError => "message_error",
            ErrorCode::StreamError => "stream_error",
            ErrorCode::CacheMiss => "cache_miss",
        }
    }
}

impl Display for ErrorCode {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> FormatResult {
        formatter.write_str(self.as_str())
    }
}
