//! Caller identity for untrusted senders.
//!
//! The host issues an opaque key per attached plugin view. Every message a
//! plugin sends carries that key in its envelope header; the transport
//! resolves it back to a plugin name before handlers run. The transport
//! makes no authorization decisions - it only guarantees that a
//! [`PluginSecurityContext`] marked `verified` was derived from a key the
//! host issued, never from caller-supplied data.

use common::RedactedPluginKey;

use std::collections::HashMap;

use tokio::sync::RwLock;
use uuid::Uuid;

/// Identity of one attached renderer/plugin context, assigned by the host
/// when the connection is attached.
pub type SenderId = u64;

/// Sender identity used for the host itself on client-side contexts.
pub const HOST_SENDER: SenderId = 0;

/// Security context attached to plugin-originated requests.
#[derive(Debug, Clone)]
pub struct PluginSecurityContext {
    /// Plugin name.
    pub name: String,

    /// Whether the name was resolved from a host-issued key. An
    /// unverified context means the sender merely *claimed* the name.
    pub verified: bool,
}

/// Context handed to every host-side handler for one inbound call.
///
/// Never persisted; built fresh per dispatch.
#[derive(Debug, Clone)]
pub struct HandlerContext {
    /// The connection the request arrived on.
    pub sender: SenderId,

    /// The event name being handled.
    pub event_name: String,

    /// Plugin context, when the request originated from a plugin.
    pub plugin: Option<PluginSecurityContext>,
}

impl HandlerContext {
    /// The verified plugin name, if any. Unverified claims return `None`.
    pub fn verified_plugin(&self) -> Option<&str> {
        self.plugin
            .as_ref()
            .filter(|plugin| plugin.verified)
            .map(|plugin| plugin.name.as_str())
    }
}

/// Issues and resolves opaque plugin security keys.
///
/// A key is generated when a plugin UI view is attached and revoked when
/// it is destroyed. Requesting a key for a plugin that already holds one
/// returns the existing key.
pub struct PluginKeyManager {
    key_to_name: RwLock<HashMap<String, String>>,
    name_to_key: RwLock<HashMap<String, String>>,
}

impl PluginKeyManager {
    pub fn new() -> Self {
        Self {
            key_to_name: RwLock::new(HashMap::new()),
            name_to_key: RwLock::new(HashMap::new()),
        }
    }

    /// Request a key for the named plugin, issuing a new one if needed.
    pub async fn request_key(&self, name: &str) -> RedactedPluginKey {
        if let Some(existing) = self.name_to_key.read().await.get(name) {
            return RedactedPluginKey::new(existing.clone());
        }

        let key = Uuid::new_v4().to_string();
        self.key_to_name
            .write()
            .await
            .insert(key.clone(), name.to_string());
        self.name_to_key
            .write()
            .await
            .insert(name.to_string(), key.clone());

        RedactedPluginKey::new(key)
    }

    /// Revoke a previously issued key. Returns `false` when the key was
    /// unknown.
    pub async fn revoke_key(&self, key: &str) -> bool {
        let removed = self.key_to_name.write().await.remove(key);
        match removed {
            Some(name) => {
                self.name_to_key.write().await.remove(&name);
                true
            }
            None => false,
        }
    }

    /// Resolve a key to its plugin name.
    pub async fn resolve_key(&self, key: &str) -> Option<String> {
        self.key_to_name.read().await.get(key).cloned()
    }

    /// Whether the key is currently valid.
    pub async fn is_valid_key(&self, key: &str) -> bool {
        self.key_to_name.read().await.contains_key(key)
    }

    /// The key currently held by the named plugin, if any.
    pub async fn key_for(&self, name: &str) -> Option<RedactedPluginKey> {
        self.name_to_key
            .read()
            .await
            .get(name)
            .cloned()
            .map(RedactedPluginKey::new)
    }
}

impl Default for PluginKeyManager {
    fn default() -> Self {
        Self::new()
    }
}
