//! Response caching with TTL.
//!
//! The cache sits in front of dispatch: a `send` that opts in with a
//! [`CachePolicy`] consults it synchronously before anything touches the
//! wire, and populates it after a successful round trip. Entries are
//! evicted lazily on expired reads and replaced on overwrite - nothing
//! here runs a background sweeper.

use serde_json::Value;

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

/// How the cache participates in one send.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CacheMode {
    /// Return the cached value when present, otherwise dispatch and
    /// populate.
    #[default]
    Prefer,
    /// Return the cached value or fail with `cache_miss` - never dispatch.
    Only,
}

/// Per-call cache request.
#[derive(Debug, Clone, Default)]
pub struct CachePolicy {
    pub mode: CacheMode,

    /// Explicit cache key override. Defaults to a key derived from the
    /// event name and serialized payload.
    pub key: Option<String>,

    /// Entry lifetime. `None` caches until overwritten.
    pub ttl: Option<Duration>,
}

impl CachePolicy {
    /// `prefer` mode with a TTL.
    pub fn prefer_for(ttl: Duration) -> Self {
        Self {
            mode: CacheMode::Prefer,
            key: None,
            ttl: Some(ttl),
        }
    }

    /// `only` mode - a miss is a contract violation.
    pub fn only() -> Self {
        Self {
            mode: CacheMode::Only,
            key: None,
            ttl: None,
        }
    }
}

struct CacheEntry {
    value: Value,
    expires_at: Option<Instant>,
}

impl CacheEntry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|deadline| deadline <= now)
    }
}

/// Key -> value map owned by one transport instance.
pub struct ResponseCache {
    entries: Mutex<HashMap<String, CacheEntry>>,
}

impl ResponseCache {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Look up an unexpired entry; expired entries are evicted on the way.
    pub async fn get(&self, key: &str) -> Option<Value> {
        let mut entries = self.entries.lock().await;
        let now = Instant::now();

        match entries.get(key) {
            Some(entry) if entry.is_expired(now) => {
                entries.remove(key);
                None
            }
            Some(entry) => Some(entry.value.clone()),
            None => None,
        }
    }

    /// Store a value, replacing any previous entry for the key.
    pub async fn put(&self, key: String, value: Value, ttl: Option<Duration>) {
        let entry = CacheEntry {
            value,
            expires_at: ttl.map(|ttl| Instant::now() + ttl),
        };
        self.entries.lock().await.insert(key, entry);
    }

    /// Drop every entry.
    pub async fn clear(&self) {
        self.entries.lock().await.clear();
    }

    /// Number of live entries (expired entries may still be counted until
    /// the next read touches them).
    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }
}

impl Default for ResponseCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Stable key for a payload, shared by the cache and the batch engine so
/// the two always agree on what "the same request" means.
pub fn payload_key(payload: Option<&Value>) -> String {
    match payload {
        None => String::from("__void__"),
        Some(Value::Null) => String::from("__null__"),
        Some(Value::String(text)) => format!("str:{text}"),
        Some(other) => format!("json:{other}"),
    }
}

/// Full cache key for one send: explicit override, or event + payload.
pub fn cache_key(event: &str, payload: Option<&Value>, policy: &CachePolicy) -> String {
    match &policy.key {
        Some(key) => format!("{event}::{key}"),
        None => format!("{event}::{}", payload_key(payload)),
    }
}
