//! Foundation utilities shared by every crate in the workspace.
//!
//! This crate intentionally stays tiny: error-location capture and the
//! redacted plugin-key wrapper live here because both the wire models and
//! the transport itself need them.
//!
//! ## Architecture
//!
//! - **common** (this crate): foundation utilities with no dependencies on
//!   the rest of the workspace
//! - **models**: pure data structures for the wire protocol
//! - **transport-core**: the transport machinery operating on models
//!
//! Keeping the foundation separate prevents dependency cycles between the
//! model and transport layers.

pub mod error;
pub mod redacted_key;

pub use error::error_location::ErrorLocation;
pub use error::redact_error::RedactError;
pub use redacted_key::RedactedPluginKey;
