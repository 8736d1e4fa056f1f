//! In-process backend pair.
//!
//! Two linked endpoints carrying envelopes over bounded channels, for
//! plugin runtimes hosted in the host process itself and for tests. This
//! backend supports the dedicated-pipe primitive: both endpoints share a
//! mailbox through which one side's allocated pipe endpoint is
//! transferred to the other.

use crate::backend::{ControlBackend, PortPipe};
use crate::error::BackendError;

use common::ErrorLocation;
use models::ControlEnvelope;

use std::collections::HashMap;
use std::panic::Location;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex, Notify};
use tokio::time::{timeout, Instant};

/// Buffer size for the control channel itself.
const CONTROL_CAPACITY: usize = 256;

/// State shared by both endpoints: transferred pipe endpoints waiting to
/// be claimed.
struct PairShared {
    transferred: Mutex<HashMap<String, PortPipe>>,
    arrived: Notify,
}

/// One endpoint of an in-process backend pair.
pub struct PairBackend {
    outgoing: mpsc::Sender<ControlEnvelope>,
    incoming: Mutex<mpsc::Receiver<ControlEnvelope>>,
    shared: Arc<PairShared>,
}

impl PairBackend {
    /// Create two linked endpoints. Envelopes sent on one arrive on the
    /// other in order.
    pub fn pair() -> (PairBackend, PairBackend) {
        let (a_tx, b_rx) = mpsc::channel(CONTROL_CAPACITY);
        let (b_tx, a_rx) = mpsc::channel(CONTROL_CAPACITY);

        let shared = Arc::new(PairShared {
            transferred: Mutex::new(HashMap::new()),
            arrived: Notify::new(),
        });

        (
            PairBackend {
                outgoing: a_tx,
                incoming: Mutex::new(a_rx),
                shared: shared.clone(),
            },
            PairBackend {
                outgoing: b_tx,
                incoming: Mutex::new(b_rx),
                shared,
            },
        )
    }
}

impl ControlBackend for PairBackend {
    async fn send(&self, envelope: ControlEnvelope) -> Result<(), BackendError> {
        self.outgoing
            .send(envelope)
            .await
            .map_err(|_| BackendError::Closed {
                message: String::from("peer endpoint dropped"),
                location: ErrorLocation::from(Location::caller()),
            })
    }

    async fn recv(&self) -> Option<ControlEnvelope> {
        self.incoming.lock().await.recv().await
    }

    async fn open_port_pipe(&self, port_id: &str) -> Result<PortPipe, BackendError> {
        let (near, far) = PortPipe::pair();

        self.shared
            .transferred
            .lock()
            .await
            .insert(port_id.to_string(), far);
        self.shared.arrived.notify_waiters();

        Ok(near)
    }

    async fn take_port_pipe(&self, port_id: &str, wait: Duration) -> Result<PortPipe, BackendError> {
        let deadline = Instant::now() + wait;

        loop {
            if let Some(pipe) = self.shared.transferred.lock().await.remove(port_id) {
                return Ok(pipe);
            }

            let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
                return Err(BackendError::Closed {
                    message: format!("no pipe endpoint arrived for port {port_id}"),
                    location: ErrorLocation::from(Location::caller()),
                });
            };

            // Re-check after either a notification or the deadline.
            let _ = timeout(remaining, self.shared.arrived.notified()).await;

            if Instant::now() >= deadline
                && self.shared.transferred.lock().await.get(port_id).is_none()
            {
                return Err(BackendError::Closed {
                    message: format!("no pipe endpoint arrived for port {port_id}"),
                    location: ErrorLocation::from(Location::caller()),
                });
            }
        }
    }
}
