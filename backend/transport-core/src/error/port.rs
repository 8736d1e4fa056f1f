use common::ErrorLocation;
use models::ErrorCode;

use thiserror::Error as ThisError;

/// Failures inside the port-upgrade subsystem.
///
/// These are recoverable by design: callers log them and fall back to the
/// control channel. They never reach application code as a rejected
/// operation.
#[derive(Debug, Clone, ThisError)]
pub enum PortError {
    #[error("Upgrade Rejected for \"{channel}\" ({code}): {message} {location}")]
    Rejected {
        channel: String,
        code: ErrorCode,
        message: String,
        location: ErrorLocation,
    },

    #[error("Confirm Timeout for \"{channel}\": port {port_id} unconfirmed after {timeout_ms}ms {location}")]
    ConfirmTimeout {
        channel: String,
        port_id: String,
        timeout_ms: u64,
        location: ErrorLocation,
    },

    #[error("Port Unavailable for \"{channel}\": {message} {location}")]
    Unavailable {
        channel: String,
        message: String,
        location: ErrorLocation,
    },

    #[error("Port Message Error for \"{channel}\": {message} {location}")]
    Message {
        channel: String,
        message: String,
        location: ErrorLocation,
    },
}

impl PortError {
    /// The wire-level code for this failure.
    pub fn code(&self) -> ErrorCode {
        match self {
            PortError::Rejected { code, .. } => *code,
            PortError::ConfirmTimeout { .. } => ErrorCode::ConfirmTimeout,
            PortError::Unavailable { .. } => ErrorCode::SenderUnavailable,
            PortError::Message { .. } => ErrorCode::MessageError,
        }
    }
}
