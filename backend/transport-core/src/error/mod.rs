pub mod backend;
pub mod logging;
pub mod port;
pub mod send;
pub mod stream;

pub use backend::BackendError;
pub use logging::LoggingError;
pub use port::PortError;
pub use send::SendError;
pub use stream::StreamError;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Backend(#[from] backend::BackendError),

    #[error(transparent)]
    Logging(#[from] logging::LoggingError),

    #[error(transparent)]
    Port(#[from] port::PortError),

    #[error(transparent)]
    Send(#[from] send::SendError),

    #[error(transparent)]
    Stream(#[from] stream::StreamError),
}
