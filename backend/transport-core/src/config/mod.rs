//! Transport configuration.
//!
//! The only external configuration surface is one environment variable:
//! [`PORT_ALLOWLIST_ENV`], a comma/whitespace-separated list of channel
//! names eligible for port upgrade. Everything else (timeouts) has
//! programmatic defaults that host processes may override when
//! constructing a transport.

use log::info;
use once_cell::sync::Lazy;
use regex::Regex;

use std::collections::HashSet;
use std::env;

/// Environment variable naming the channels eligible for port upgrade.
///
/// - unset: a small built-in set of high-frequency channels
/// - blank: all upgrades disabled
/// - otherwise: comma/whitespace-separated channel names
pub const PORT_ALLOWLIST_ENV: &str = "TRANSPORT_PORT_CHANNELS";

/// Host-side port confirmation timeout.
pub const DEFAULT_CONFIRM_TIMEOUT_MS: u64 = 10_000;

/// Port confirmation timeout used by streaming calls, which prefer a quick
/// fallback over waiting out the full window.
pub const DEFAULT_STREAM_CONFIRM_TIMEOUT_MS: u64 = 1_500;

static SPLIT_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[\s,]+").expect("allowlist split pattern is valid"));

/// Built-in default set of upgrade-eligible channels. These are the
/// high-frequency channels that benefit from bypassing the control
/// channel; everything else stays on it unless configured otherwise.
static DEFAULT_PORT_CHANNELS: Lazy<HashSet<String>> = Lazy::new(|| {
    [
        "core-box:search:query",
        "core-box:search:stream",
        "download:file:progress",
        "intelligence:chat:stream",
    ]
    .into_iter()
    .map(String::from)
    .collect()
});

/// The set of channel names allowed to negotiate a port upgrade.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpgradeAllowlist {
    channels: HashSet<String>,
}

impl UpgradeAllowlist {
    /// Read the allowlist from [`PORT_ALLOWLIST_ENV`].
    pub fn from_env() -> Self {
        match env::var(PORT_ALLOWLIST_ENV) {
            Ok(raw) => {
                let allowlist = Self::parse(&raw);
                info!(
                    "Port upgrade allowlist from {}: {} channel(s)",
                    PORT_ALLOWLIST_ENV,
                    allowlist.channels.len()
                );
                allowlist
            }
            Err(_) => Self::builtin(),
        }
    }

    /// Parse an explicit allowlist value. A blank value disables all
    /// upgrades.
    pub fn parse(raw: &str) -> Self {
        let channels = SPLIT_PATTERN
            .split(raw.trim())
            .filter(|entry| !entry.is_empty())
            .map(String::from)
            .collect();
        Self { channels }
    }

    /// The built-in default set.
    pub fn builtin() -> Self {
        Self {
            channels: DEFAULT_PORT_CHANNELS.clone(),
        }
    }

    /// An allowlist that rejects every channel.
    pub fn disabled() -> Self {
        Self {
            channels: HashSet::new(),
        }
    }

    /// An allowlist containing exactly the given channels.
    pub fn from_channels<I, S>(channels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            channels: channels.into_iter().map(Into::into).collect(),
        }
    }

    /// Whether the named channel may negotiate a port upgrade.
    pub fn allows(&self, channel: &str) -> bool {
        self.channels.contains(channel)
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}

/// Per-instance transport configuration.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Channels eligible for port upgrade (host side enforces this).
    pub allowlist: UpgradeAllowlist,

    /// How long the host keeps an unconfirmed port before destroying it.
    pub confirm_timeout_ms: u64,

    /// How long a streaming call waits for port confirmation before
    /// falling back to the control channel.
    pub stream_confirm_timeout_ms: u64,

    /// Reply timeout stamped into `sync` when the caller supplies none.
    pub default_send_timeout_ms: u64,
}

impl TransportConfig {
    /// Defaults plus the environment-provided allowlist.
    pub fn from_env() -> Self {
        Self {
            allowlist: UpgradeAllowlist::from_env(),
            ..Self::default()
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            allowlist: UpgradeAllowlist::builtin(),
            confirm_timeout_ms: DEFAULT_CONFIRM_TIMEOUT_MS,
            stream_confirm_timeout_ms: DEFAULT_STREAM_CONFIRM_TIMEOUT_MS,
            default_send_timeout_ms: models::envelope::CHANNEL_DEFAULT_TIMEOUT_MS,
        }
    }
}
