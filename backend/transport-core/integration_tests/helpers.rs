//! Test helpers for transport integration tests.
//!
//! Most tests run a real host and client over the paired in-process
//! backend; WebSocket tests build their own stack on a loopback listener.

use models::EventDescriptor;

use transport_core::backend::PairBackend;
use transport_core::client::ClientTransport;
use transport_core::config::{TransportConfig, UpgradeAllowlist};
use transport_core::host::HostTransport;
use transport_core::identity::SenderId;

use std::sync::Arc;

/// Baseline config: no port upgrades, short timeouts so a broken path
/// fails the test instead of hanging it.
pub fn test_config() -> TransportConfig {
    TransportConfig {
        allowlist: UpgradeAllowlist::disabled(),
        confirm_timeout_ms: 1_000,
        stream_confirm_timeout_ms: 500,
        default_send_timeout_ms: 2_000,
    }
}

/// Baseline config plus an explicit upgrade allowlist.
pub fn port_config(channels: &[&str]) -> TransportConfig {
    TransportConfig {
        allowlist: UpgradeAllowlist::from_channels(channels.iter().copied()),
        ..test_config()
    }
}

/// A connected host/client pair over the in-process backend, both using
/// the same config.
pub async fn pair_transports(
    config: TransportConfig,
) -> (
    Arc<HostTransport<PairBackend>>,
    Arc<ClientTransport<PairBackend>>,
    SenderId,
) {
    pair_transports_with(config.clone(), config).await
}

/// Same, with separate host and client configs (e.g. to disable the
/// client's lazy upgrade attempts while the host still accepts them).
pub async fn pair_transports_with(
    host_config: TransportConfig,
    client_config: TransportConfig,
) -> (
    Arc<HostTransport<PairBackend>>,
    Arc<ClientTransport<PairBackend>>,
    SenderId,
) {
    let (host_end, client_end) = PairBackend::pair();
    let host = HostTransport::new(host_config);
    let sender = host.attach_sender(host_end, None).await;
    let client = ClientTransport::spawn(client_end, client_config);
    (host, client, sender)
}

/// Descriptor from a raw event name.
pub fn event(name: &str) -> EventDescriptor {
    EventDescriptor::raw(name).expect("valid event name")
}

/// Poll an async condition until it holds, failing the test after
/// `deadline_ms`.
pub async fn wait_until<F, Fut>(deadline_ms: u64, mut probe: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    tokio::time::timeout(std::time::Duration::from_millis(deadline_ms), async {
        loop {
            if probe().await {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not met in time");
}
