// Unit tests for the upgrade allowlist and its environment surface.

use crate::config::{TransportConfig, UpgradeAllowlist, PORT_ALLOWLIST_ENV};

use serial_test::serial;

/// **VALUE**: Verifies comma/whitespace-separated parsing.
///
/// **BUG THIS CATCHES**: Would catch the split pattern dropping entries
/// around mixed separators or keeping empty strings as channel names.
#[test]
fn given_mixed_separators_when_parsed_then_all_channels_kept() {
    let allowlist =
        UpgradeAllowlist::parse("core-box:search:stream, download:file:progress\n intelligence:chat:stream");

    assert!(allowlist.allows("core-box:search:stream"));
    assert!(allowlist.allows("download:file:progress"));
    assert!(allowlist.allows("intelligence:chat:stream"));
    assert!(!allowlist.allows(""));
    assert!(!allowlist.allows("app:ui:hide"));
}

/// **VALUE**: Verifies that an explicitly blank value disables upgrades.
///
/// **WHY THIS MATTERS**: Blank-means-disabled is the documented kill
/// switch for port upgrades; falling back to the builtin set instead
/// would silently re-enable them.
#[test]
fn given_blank_value_when_parsed_then_all_upgrades_disabled() {
    let allowlist = UpgradeAllowlist::parse("   ");

    assert!(allowlist.is_empty());
    assert!(!allowlist.allows("core-box:search:stream"));
}

/// **VALUE**: Verifies the environment variable wiring end to end:
/// set, blank, and unset.
///
/// **BUG THIS CATCHES**: Would catch `from_env` confusing "unset" (builtin
/// defaults) with "blank" (disabled) - the two most easily swapped cases.
#[test]
#[serial]
fn given_env_variants_when_from_env_then_set_blank_unset_differ() {
    // GIVEN: An explicit list
    unsafe { std::env::set_var(PORT_ALLOWLIST_ENV, "a:b:c") };
    let explicit = UpgradeAllowlist::from_env();
    assert!(explicit.allows("a:b:c"));
    assert!(!explicit.allows("core-box:search:stream"));

    // GIVEN: A blank value
    unsafe { std::env::set_var(PORT_ALLOWLIST_ENV, "") };
    let disabled = UpgradeAllowlist::from_env();
    assert!(disabled.is_empty());

    // GIVEN: No value at all
    unsafe { std::env::remove_var(PORT_ALLOWLIST_ENV) };
    let builtin = UpgradeAllowlist::from_env();
    assert!(builtin.allows("core-box:search:stream"));
}

/// **VALUE**: Verifies the default timeouts match the documented protocol.
#[test]
fn given_default_config_when_built_then_documented_timeouts_hold() {
    let config = TransportConfig::default();

    assert_eq!(config.confirm_timeout_ms, 10_000);
    assert_eq!(config.stream_confirm_timeout_ms, 1_500);
    assert_eq!(config.default_send_timeout_ms, 60_000);
}
