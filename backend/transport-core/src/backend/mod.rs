//! The pluggable messaging substrate.
//!
//! A [`ControlBackend`] carries named, serializable envelopes between two
//! processes with per-connection ordering. The transport core never
//! branches on which backend is active: everything it needs is behind
//! this trait, including the optional dedicated-pipe primitive that the
//! port-upgrade subsystem builds on.
//!
//! Backends that cannot allocate dedicated pipes (e.g. the WebSocket
//! backend) report `NotSupported` from the pipe methods; the upgrade path
//! treats that like any other failure and falls back to the control
//! channel.

pub mod pair;
pub mod websocket;

pub use pair::PairBackend;
pub use websocket::{AcceptedConnection, WebSocketBackend, WebSocketListener};

use crate::error::BackendError;

use models::{ControlEnvelope, PortEnvelope};

use std::future::Future;
use std::time::Duration;

use tokio::sync::mpsc;

/// Buffer size for port pipes.
pub(crate) const PORT_PIPE_CAPACITY: usize = 64;

/// One endpoint of a dedicated bidirectional pipe.
pub struct PortPipe {
    pub sender: mpsc::Sender<PortEnvelope>,
    pub receiver: mpsc::Receiver<PortEnvelope>,
}

impl PortPipe {
    /// Create a linked pair of endpoints. Frames sent on one endpoint
    /// arrive on the other, in order.
    pub fn pair() -> (PortPipe, PortPipe) {
        let (near_tx, far_rx) = mpsc::channel(PORT_PIPE_CAPACITY);
        let (far_tx, near_rx) = mpsc::channel(PORT_PIPE_CAPACITY);

        (
            PortPipe {
                sender: near_tx,
                receiver: near_rx,
            },
            PortPipe {
                sender: far_tx,
                receiver: far_rx,
            },
        )
    }
}

/// Asynchronous, ordered delivery of envelopes between two endpoints.
///
/// # Invariant
///
/// Only one task - the transport's demux loop - calls [`recv`]. Everything
/// else routes through channels fed by that loop; this is what makes
/// reply correlation race-free.
///
/// [`recv`]: ControlBackend::recv
pub trait ControlBackend: Send + Sync + 'static {
    /// Send one envelope to the peer.
    fn send(
        &self,
        envelope: ControlEnvelope,
    ) -> impl Future<Output = Result<(), BackendError>> + Send;

    /// Receive the next envelope. `None` means the connection closed.
    fn recv(&self) -> impl Future<Output = Option<ControlEnvelope>> + Send;

    /// Allocate a dedicated pipe for `port_id`, transferring the far
    /// endpoint to the peer out-of-band. Returns the near endpoint.
    fn open_port_pipe(
        &self,
        port_id: &str,
    ) -> impl Future<Output = Result<PortPipe, BackendError>> + Send;

    /// Claim a pipe endpoint the peer transferred for `port_id`, waiting
    /// up to `wait` for it to arrive.
    fn take_port_pipe(
        &self,
        port_id: &str,
        wait: Duration,
    ) -> impl Future<Output = Result<PortPipe, BackendError>> + Send;
}
