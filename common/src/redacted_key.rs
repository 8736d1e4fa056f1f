//! Secure plugin-key handling with redacted Debug output.

use crate::{ErrorLocation, RedactError};

use std::fmt;
use std::panic::Location;

use serde::ser::Error;
use zeroize::Zeroize;

/// A plugin security key that never exposes its value in logs or debug
/// output.
///
/// The host issues one of these per attached plugin view; every message a
/// plugin sends must carry it. Treat it like a credential: it is zeroized
/// on drop and refuses accidental serialization.
#[derive(Clone)]
pub struct RedactedPluginKey {
    inner: String,
}

impl RedactedPluginKey {
    /// Create a new redacted plugin key.
    pub fn new(key: String) -> Self {
        Self { inner: key }
    }

    /// Get the actual key value for transmission.
    ///
    /// # Security Note
    /// Only call this when actually attaching the key to an outgoing
    /// envelope header.
    #[inline]
    pub fn as_str(&self) -> &str {
        &self.inner
    }

    /// Get the key length (safe to log).
    #[inline]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Check if the key is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

impl fmt::Debug for RedactedPluginKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RedactedPluginKey([REDACTED])")
    }
}

impl fmt::Display for RedactedPluginKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[REDACTED PLUGIN KEY]")
    }
}

impl Drop for RedactedPluginKey {
    fn drop(&mut self) {
        self.inner.zeroize();
    }
}

// Prevent accidental serialization
impl serde::Serialize for RedactedPluginKey {
    fn serialize<S>(&self, _serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        Err(S::Error::custom(RedactError::Serialization {
            message: String::from(
                "RedactedPluginKey cannot be serialized - use as_str() explicitly",
            ),
            location: ErrorLocation::from(Location::caller()),
        }))
    }
}
