//! Typed, bidirectional transport between a privileged host process and
//! its untrusted renderer/plugin contexts.
//!
//! On top of a substrate that only guarantees asynchronous, ordered
//! delivery of named envelopes per connection, this crate provides:
//!
//! - correlated request/response with timeouts ([`client::ClientTransport::send`],
//!   [`host::HostTransport::send_to`])
//! - cancellable host-to-client streaming ([`client::ClientTransport::stream`],
//!   [`host::HostTransport::on_stream`])
//! - opportunistic upgrade of a logical channel to a dedicated pipe with
//!   handshake, confirmation and transparent fallback ([`port`])
//! - client-side batching with queue/dedupe/latest merge strategies
//!   ([`batch`])
//! - response caching with TTL ([`cache`])
//! - verified caller-identity propagation ([`identity`])
//!
//! # Architecture
//!
//! The substrate lives behind [`backend::ControlBackend`]; the core never
//! branches on which backend is active. Two implementations ship here:
//! an in-process pair for embedded plugin runtimes and tests, and a
//! localhost WebSocket listener/connector for out-of-process contexts.

pub mod backend;
pub mod batch;
pub mod cache;
pub mod client;
pub mod config;
pub mod error;
pub mod host;
pub mod identity;
pub mod logging;
pub mod payload_preview;
pub mod port;
pub mod registry;
pub mod stream;

pub use client::{ClientTransport, PluginIdentity, PortPreference, SendOptions, StreamOptions};
pub use host::{HostTransport, StreamHandlerSubscription};
pub use registry::Subscription;
pub use stream::{StreamController, StreamEmitter, StreamEvent};

use const_format::concatcp;

/// Reserved namespace for the port-upgrade protocol's own control events.
pub const PORT_EVENT_NAMESPACE: &str = "transport:port";

pub const PORT_UPGRADE_EVENT: &str = concatcp!(PORT_EVENT_NAMESPACE, ":upgrade");
pub const PORT_CONFIRM_EVENT: &str = concatcp!(PORT_EVENT_NAMESPACE, ":confirm");
pub const PORT_CLOSE_EVENT: &str = concatcp!(PORT_EVENT_NAMESPACE, ":close");
pub const PORT_ERROR_EVENT: &str = concatcp!(PORT_EVENT_NAMESPACE, ":error");
pub const PORT_DELIVER_EVENT: &str = concatcp!(PORT_EVENT_NAMESPACE, ":deliver");

/// Channels the transport uses for its own protocol traffic. These never
/// batch, cache or upgrade.
pub fn is_reserved_channel(event_name: &str) -> bool {
    event_name.starts_with(PORT_EVENT_NAMESPACE) || event_name.contains(":stream:")
}

#[cfg(test)]
mod tests;
