// Unit tests for port-protocol message serialization.

use crate::{ErrorCode, PortEnvelope, PortMessageType, PortScope, UpgradeRequest, UpgradeResponse};
use serde_json::json;

/// **VALUE**: Verifies upgrade requests serialize with wire-correct scope
/// and camelCase field names.
///
/// **WHY THIS MATTERS**: The host validates `scope` and `windowId` straight
/// off the wire; a renamed field silently downgrades every eligible channel
/// to the control path, which is invisible except as lost throughput.
#[test]
fn given_upgrade_request_when_serialized_then_matches_wire_format() {
    let request = UpgradeRequest {
        channel: "core-box:search:stream".to_string(),
        scope: PortScope::Window,
        window_id: Some(7),
        plugin: None,
        permissions: vec!["read".to_string()],
    };

    let value = serde_json::to_value(&request).expect("request must serialize");

    assert_eq!(value["channel"], "core-box:search:stream");
    assert_eq!(value["scope"], "window");
    assert_eq!(value["windowId"], 7);
    assert_eq!(value["permissions"][0], "read");
    assert!(value.get("plugin").is_none(), "absent plugin is omitted");
}

/// **VALUE**: Verifies rejection replies carry the snake_case error code.
///
/// **BUG THIS CATCHES**: Would catch the `ErrorCode` serde representation
/// drifting from the documented taxonomy (`window_mismatch` etc.), which
/// client-side fallback logic matches on.
#[test]
fn given_rejected_upgrade_when_serialized_then_carries_error_code() {
    let response = UpgradeResponse::rejected(
        "core-box:search:stream",
        ErrorCode::WindowMismatch,
        "window 9 does not belong to sender 7",
    );

    let value = serde_json::to_value(&response).expect("response must serialize");

    assert_eq!(value["accepted"], false);
    assert_eq!(value["error"]["code"], "window_mismatch");
    assert!(value.get("portId").is_none());
}

/// **VALUE**: Verifies port frames round-trip through JSON.
///
/// **BUG THIS CATCHES**: Would catch `type` losing its rename (the field is
/// a Rust keyword, so it's easy to accidentally ship `kind` on the wire).
#[test]
fn given_port_envelope_when_round_tripped_then_fields_survive() {
    let frame = PortEnvelope {
        channel: "core-box:search:stream".to_string(),
        port_id: Some("port-1".to_string()),
        stream_id: Some("stream-1".to_string()),
        sequence: Some(3),
        kind: PortMessageType::Data,
        payload: Some(json!({ "row": 1 })),
        error: None,
    };

    let encoded = serde_json::to_value(&frame).expect("frame must serialize");
    assert_eq!(encoded["type"], "data");
    assert_eq!(encoded["portId"], "port-1");

    let decoded: PortEnvelope =
        serde_json::from_value(encoded).expect("frame must deserialize");
    assert_eq!(decoded, frame);
}
