use crate::event::{BatchConfig, EventDescriptor};
use crate::ModelError;

use common::ErrorLocation;

use std::panic::Location;

/// Builder for creating validated [`EventDescriptor`] instances.
///
/// Provides a fluent API for assembling the `namespace:module:action`
/// event name; every segment is validated non-empty at `define()` time.
#[derive(Debug, Default)]
pub struct EventDescriptorBuilder {
    namespace: Option<String>,
    module: Option<String>,
    action: Option<String>,
    batch: Option<BatchConfig>,
}

impl EventDescriptorBuilder {
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    pub fn with_module(mut self, module: impl Into<String>) -> Self {
        self.module = Some(module.into());
        self
    }

    pub fn with_action(mut self, action: impl Into<String>) -> Self {
        self.action = Some(action.into());
        self
    }

    pub fn with_batch(mut self, batch: BatchConfig) -> Self {
        self.batch = Some(batch);
        self
    }

    /// Finalize the descriptor with validation.
    #[track_caller]
    pub fn define(self) -> Result<EventDescriptor, ModelError> {
        let namespace = self.namespace.ok_or_else(|| ModelError::Validation {
            message: String::from("Namespace is required"),
            location: ErrorLocation::from(Location::caller()),
        })?;

        if namespace.is_empty() {
            return Err(ModelError::Validation {
                message: String::from("Namespace cannot be empty"),
                location: ErrorLocation::from(Location::caller()),
            });
        }

        let module = self.module.ok_or_else(|| ModelError::Validation {
            message: String::from("Module is required"),
            location: ErrorLocation::from(Location::caller()),
        })?;

        if module.is_empty() {
            return Err(ModelError::Validation {
                message: String::from("Module cannot be empty"),
                location: ErrorLocation::from(Location::caller()),
            });
        }

        let action = self.action.ok_or_else(|| ModelError::Validation {
            message: String::from("Action is required"),
            location: ErrorLocation::from(Location::caller()),
        })?;

        if action.is_empty() {
            return Err(ModelError::Validation {
                message: String::from("Action cannot be empty"),
                location: ErrorLocation::from(Location::caller()),
            });
        }

        let descriptor = EventDescriptor::raw(format!("{namespace}:{module}:{action}"))?;

        Ok(match self.batch {
            Some(batch) => descriptor.with_batch(batch),
            None => descriptor,
        })
    }
}
