//! Domain models for the transport layer.
//!
//! This crate contains pure data structures representing the wire protocol
//! and event contracts shared by the host process and plugin/renderer
//! runtimes. Models have no business logic - they're just data that can be
//! passed between layers and serialized onto the control channel.
//!
//! ## Architecture
//!
//! - **models** (this crate): pure data structures
//! - **transport-core**: transport machinery operating on models
//!
//! Everything here serializes with serde to the JSON wire format; field
//! names are camelCase on the wire so both ends of the channel agree
//! without negotiation.

pub mod envelope;
pub mod error;
pub mod error_code;
pub mod event;
pub mod port;
pub mod stream;

pub use envelope::{ChannelKind, ControlEnvelope, DataCode, EnvelopeHeader, EnvelopeStatus, SyncInfo};
pub use error::model_error::ModelError;
pub use error_code::ErrorCode;
pub use event::builder::EventDescriptorBuilder;
pub use event::{BatchConfig, EventDescriptor, MergeStrategy};
pub use port::{
    PortClose, PortConfirm, PortDeliver, PortEnvelope, PortErrorNotice, PortMessageType,
    PortScope, PortWireError, UpgradeRequest, UpgradeResponse,
};
pub use stream::{StreamCancel, StreamMessage, StreamMessageType, StreamStart};

#[cfg(test)]
mod tests;
