// Unit tests for control-envelope serialization.
// The wire format is shared with non-Rust runtimes, so field names and
// code values are asserted literally.

use crate::{ChannelKind, ControlEnvelope, DataCode, SyncInfo};
use serde_json::json;

/// **VALUE**: Verifies the exact wire shape of a correlated request.
///
/// **WHY THIS MATTERS**: Renderer and plugin runtimes parse these envelopes
/// with their own deserializers. If a field name drifts (e.g. `time_stamp`
/// instead of `timeStamp`) or `code` stops being numeric, every peer breaks
/// at once with no compile-time signal on our side.
///
/// **BUG THIS CATCHES**: Would catch if:
/// - A `rename_all` attribute is removed or changed
/// - `DataCode` loses its numeric representation
/// - `sync`/`data` stop being optional
#[test]
fn given_request_envelope_when_serialized_then_matches_wire_format() {
    // GIVEN: A correlated request envelope
    let envelope = ControlEnvelope::request(
        "core-box:search:query",
        ChannelKind::Host,
        Some(json!({ "text": "hello" })),
        SyncInfo::new("req-1", 60_000),
    );

    // WHEN: Serializing to JSON
    let value = serde_json::to_value(&envelope).expect("envelope must serialize");

    // THEN: Wire field names and code values match the protocol
    assert_eq!(value["name"], "core-box:search:query");
    assert_eq!(value["header"]["status"], "request");
    assert_eq!(value["header"]["type"], "host");
    assert_eq!(value["code"], 200);
    assert_eq!(value["data"]["text"], "hello");
    assert_eq!(value["sync"]["id"], "req-1");
    assert_eq!(value["sync"]["timeout"], 60_000);
    assert!(
        value["sync"].get("timeStamp").is_some(),
        "timestamp must serialize as camelCase timeStamp"
    );
}

/// **VALUE**: Verifies that replies preserve correlation and flip status.
///
/// **BUG THIS CATCHES**: Would catch a reply builder that loses the sync id
/// (breaking correlation) or forgets to mark the envelope as a reply
/// (causing the peer to dispatch it as a fresh request).
#[test]
fn given_request_when_reply_built_then_correlation_preserved() {
    // GIVEN: A correlated request
    let request = ControlEnvelope::request(
        "ping",
        ChannelKind::Host,
        Some(json!({ "n": 1 })),
        SyncInfo::new("req-2", 10_000),
    );

    // WHEN: Building the reply
    let reply = request.reply_to(DataCode::Success, Some(json!({ "n": 2 })));

    // THEN: Same name and sync id, reply status, request timeout carried over
    assert_eq!(reply.name, request.name);
    let sync = reply.sync.clone().expect("reply must carry sync");
    assert_eq!(sync.id, "req-2");
    assert_eq!(sync.timeout, 10_000);
    let value = serde_json::to_value(&reply).expect("reply must serialize");
    assert_eq!(value["header"]["status"], "reply");
}

/// **VALUE**: Verifies fire-and-forget envelopes omit `sync` entirely.
///
/// **WHY THIS MATTERS**: Receivers use the presence of `sync` to decide
/// whether a reply is expected. A broadcast that accidentally carries a
/// correlation block would leak pending-map entries on the peer.
#[test]
fn given_notification_when_serialized_then_sync_field_absent() {
    let envelope = ControlEnvelope::notification("app:ui:hide", ChannelKind::Host, None);

    let value = serde_json::to_value(&envelope).expect("envelope must serialize");

    assert!(value.get("sync").is_none(), "notifications carry no sync");
    assert!(value.get("data").is_none(), "empty payloads are omitted");
    assert!(!envelope.is_correlated());
}

/// **VALUE**: Verifies unknown wire codes decode without failing the envelope.
///
/// **BUG THIS CATCHES**: A peer running a newer protocol revision may send a
/// code we don't know. Hard-failing the whole envelope would turn a benign
/// addition into a dead channel.
#[test]
fn given_unknown_data_code_when_deserialized_then_maps_to_error() {
    let raw = json!({
        "name": "ping",
        "header": { "status": "reply", "type": "host" },
        "code": 418,
        "data": null
    });

    let envelope: ControlEnvelope =
        serde_json::from_value(raw).expect("unknown codes must not fail decoding");

    assert_eq!(envelope.code, DataCode::Error);
}
