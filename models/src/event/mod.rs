//! Event descriptors - the named contracts identifying logical channels.
//!
//! A descriptor is immutable and shared by both transport ends without
//! negotiation. Event names follow the `namespace:module:action` convention
//! produced by [`builder::EventDescriptorBuilder`]; legacy names that
//! predate the convention go through [`EventDescriptor::raw`].

pub mod builder;

use serde::{Deserialize, Serialize};

use crate::ModelError;
use common::ErrorLocation;
use std::panic::Location;

/// Strategy for merging calls that land in the same batch window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MergeStrategy {
    /// Every call preserved in arrival order; flushed sequentially.
    #[default]
    Queue,
    /// Calls with an identical derived key share one round trip.
    Dedupe,
    /// The window collapses to a single entry holding the newest payload.
    Latest,
}

/// Batch coalescing configuration for one event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchConfig {
    /// Whether batch mode is enabled for this event.
    pub enabled: bool,

    /// Time window in milliseconds to collect requests before flushing.
    #[serde(default = "default_window_ms")]
    pub window_ms: u64,

    /// Maximum number of distinct pending entries before forcing a flush.
    #[serde(default = "default_max_size")]
    pub max_size: usize,

    /// Strategy for merging requests inside one window.
    #[serde(default)]
    pub merge_strategy: MergeStrategy,
}

fn default_window_ms() -> u64 {
    50
}

fn default_max_size() -> usize {
    50
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            window_ms: default_window_ms(),
            max_size: default_max_size(),
            merge_strategy: MergeStrategy::default(),
        }
    }
}

/// Immutable, named contract identifying one logical channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventDescriptor {
    name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    batch: Option<BatchConfig>,
}

impl EventDescriptor {
    /// Start building a descriptor with the standard
    /// `namespace:module:action` name.
    pub fn builder() -> builder::EventDescriptorBuilder {
        builder::EventDescriptorBuilder::default()
    }

    /// Admit a legacy event name that doesn't follow the naming convention.
    ///
    /// # Errors
    ///
    /// Returns [`ModelError::Validation`] when the name is empty.
    #[track_caller]
    pub fn raw(name: impl Into<String>) -> Result<Self, ModelError> {
        let name = name.into();
        if name.is_empty() {
            return Err(ModelError::Validation {
                message: String::from("Event name cannot be empty"),
                location: ErrorLocation::from(Location::caller()),
            });
        }

        Ok(Self { name, batch: None })
    }

    /// Attach a batch configuration, consuming the descriptor.
    pub fn with_batch(mut self, batch: BatchConfig) -> Self {
        self.batch = Some(batch);
        self
    }

    /// The full event name, e.g. `core-box:search:query`.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Batch configuration, when this event opted into coalescing.
    pub fn batch(&self) -> Option<&BatchConfig> {
        self.batch.as_ref()
    }

    /// True when sends on this event are coalesced by default.
    pub fn is_batch_enabled(&self) -> bool {
        self.batch.as_ref().is_some_and(|batch| batch.enabled)
    }
}
