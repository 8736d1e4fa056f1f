use common::ErrorLocation;
use models::ErrorCode;

use thiserror::Error as ThisError;

/// Failures surfaced to callers of `send`.
///
/// Every variant carries the originating event name so a failure deep in
/// the substrate is still traceable to the logical channel that caused it.
/// `Clone` is required because batched sends fan one failure out to every
/// resolver sharing the round trip.
#[derive(Debug, Clone, ThisError)]
pub enum SendError {
    #[error("Dispatch Error for \"{event}\": {message} {location}")]
    Dispatch {
        event: String,
        message: String,
        location: ErrorLocation,
    },

    #[error("Timeout Error for \"{event}\": no reply within {timeout_ms}ms {location}")]
    Timeout {
        event: String,
        timeout_ms: u64,
        location: ErrorLocation,
    },

    #[error("Error Reply for \"{event}\": {message} {location}")]
    ErrorReply {
        event: String,
        message: String,
        location: ErrorLocation,
    },

    #[error("Serialize Error for \"{event}\": {message} {location}")]
    Serialize {
        event: String,
        message: String,
        location: ErrorLocation,
    },

    #[error("Cache Miss for \"{event}\": {message} {location}")]
    CacheMiss {
        event: String,
        message: String,
        location: ErrorLocation,
    },

    #[error("Transport Destroyed for \"{event}\": {message} {location}")]
    Destroyed {
        event: String,
        message: String,
        location: ErrorLocation,
    },

    #[error("Target Unavailable for \"{event}\": {message} {location}")]
    Unavailable {
        event: String,
        message: String,
        location: ErrorLocation,
    },
}

impl SendError {
    /// The wire-level code for this failure.
    pub fn code(&self) -> ErrorCode {
        match self {
            SendError::Dispatch { .. } => ErrorCode::PostMessageFailed,
            SendError::Timeout { .. } => ErrorCode::MessageError,
            SendError::ErrorReply { .. } => ErrorCode::MessageError,
            SendError::Serialize { .. } => ErrorCode::InvalidRequest,
            SendError::CacheMiss { .. } => ErrorCode::CacheMiss,
            SendError::Destroyed { .. } => ErrorCode::SenderUnavailable,
            SendError::Unavailable { .. } => ErrorCode::SenderUnavailable,
        }
    }

    /// The event name this failure is attributed to.
    pub fn event(&self) -> &str {
        match self {
            SendError::Dispatch { event, .. }
            | SendError::Timeout { event, .. }
            | SendError::ErrorReply { event, .. }
            | SendError::Serialize { event, .. }
            | SendError::CacheMiss { event, .. }
            | SendError::Destroyed { event, .. }
            | SendError::Unavailable { event, .. } => event,
        }
    }
}
