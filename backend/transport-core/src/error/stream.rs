use common::ErrorLocation;

use thiserror::Error as ThisError;

/// Failures observed by one streaming call.
#[derive(Debug, Clone, ThisError)]
pub enum StreamError {
    /// The producer reported an error; the stream is torn down.
    #[error("Stream Error for \"{event}\" ({stream_id}): {message} {location}")]
    Producer {
        event: String,
        stream_id: String,
        message: String,
        location: ErrorLocation,
    },

    /// The start request itself failed; no stream was established.
    #[error("Stream Start Error for \"{event}\": {message} {location}")]
    Start {
        event: String,
        message: String,
        location: ErrorLocation,
    },
}
