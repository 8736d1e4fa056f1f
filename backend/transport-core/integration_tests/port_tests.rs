//! Port-upgrade protocol: negotiation, scope enforcement, confirmation
//! timeout and teardown cascades.

use crate::helpers::{
    event, pair_transports, pair_transports_with, port_config, test_config, wait_until,
};

use models::{ErrorCode, PortConfirm, PortScope, UpgradeRequest, UpgradeResponse};
use serde_json::{json, Value};

use transport_core::backend::PairBackend;
use transport_core::client::{ClientTransport, PluginIdentity, SendOptions};
use transport_core::error::SendError;

const CHANNEL: &str = "core-box:search:query";

fn upgrade_request(scope: PortScope) -> UpgradeRequest {
    UpgradeRequest {
        channel: String::from(CHANNEL),
        scope,
        window_id: None,
        plugin: None,
        permissions: Vec::new(),
    }
}

/// **VALUE**: A valid app-scoped upgrade is accepted and leaves an
/// unconfirmed record owned by the requesting sender.
///
/// **BUG THIS CATCHES**: Would catch the host confirming records eagerly
/// (skipping the handshake) or recording the wrong owner, which breaks
/// the teardown cascade.
#[tokio::test]
async fn given_eligible_channel_when_upgrade_requested_then_accepted_unconfirmed() {
    let (host, client, sender) =
        pair_transports_with(port_config(&[CHANNEL]), test_config()).await;

    let response = client
        .upgrade(upgrade_request(PortScope::App))
        .await
        .expect("upgrade round trip");

    assert!(response.accepted);
    assert_eq!(response.channel, CHANNEL);
    assert_eq!(response.scope, Some(PortScope::App));
    let port_id = response.port_id.expect("accepted upgrade carries a port id");

    let record = host.ports().record(&port_id).await.expect("record exists");
    assert!(!record.confirmed, "record must start unconfirmed");
    assert_eq!(record.owner, sender);
    assert_eq!(record.channel, CHANNEL);
}

/// **VALUE**: Window-scope enforcement - a windowId that is not the
/// sender's own identity is rejected with `window_mismatch`; the matching
/// id is accepted.
#[tokio::test]
async fn given_window_scope_when_window_id_mismatches_then_rejected() {
    let (_host, client, sender) =
        pair_transports_with(port_config(&[CHANNEL]), test_config()).await;

    let mismatched = UpgradeRequest {
        window_id: Some(sender + 999),
        ..upgrade_request(PortScope::Window)
    };
    let response = client.upgrade(mismatched).await.expect("round trip");
    assert!(!response.accepted);
    assert_eq!(
        response.error.expect("rejection carries error").code,
        ErrorCode::WindowMismatch
    );

    let matching = UpgradeRequest {
        window_id: Some(sender),
        ..upgrade_request(PortScope::Window)
    };
    let response = client.upgrade(matching).await.expect("round trip");
    assert!(response.accepted, "the sender's own window id is accepted");
}

/// **VALUE**: Plugin-scope enforcement - no verified plugin identity
/// means `plugin_required`; a claim that contradicts the verified
/// identity means `plugin_mismatch`.
#[tokio::test]
async fn given_plugin_scope_when_identity_missing_or_mismatched_then_rejected() {
    // GIVEN: A window client with no plugin identity
    let (host, window_client, _sender) =
        pair_transports_with(port_config(&[CHANNEL]), test_config()).await;

    let response = window_client
        .upgrade(upgrade_request(PortScope::Plugin))
        .await
        .expect("round trip");
    assert!(!response.accepted);
    assert_eq!(
        response.error.expect("error").code,
        ErrorCode::PluginRequired
    );

    // GIVEN: A verified plugin context on the same host
    let (plugin_host_end, plugin_end) = PairBackend::pair();
    let _plugin_sender = host.attach_sender(plugin_host_end, None).await;
    let key = host.key_manager().request_key("notes").await;
    let plugin_client = ClientTransport::spawn_plugin(
        plugin_end,
        test_config(),
        PluginIdentity {
            name: String::from("notes"),
            key,
        },
    );

    // WHEN: Claiming a different plugin than the verified identity
    let contradicting = UpgradeRequest {
        plugin: Some(String::from("other-plugin")),
        ..upgrade_request(PortScope::Plugin)
    };
    let response = plugin_client.upgrade(contradicting).await.expect("round trip");
    assert!(!response.accepted);
    assert_eq!(
        response.error.expect("error").code,
        ErrorCode::PluginMismatch
    );

    // WHEN: The claim matches the verified identity
    let matching = UpgradeRequest {
        plugin: Some(String::from("notes")),
        ..upgrade_request(PortScope::Plugin)
    };
    let response = plugin_client.upgrade(matching).await.expect("round trip");
    assert!(response.accepted);
}

/// **VALUE**: Channels outside the allowlist are rejected with
/// `not_supported`; an invalid scope string is rejected with
/// `invalid_scope`; an empty channel with `invalid_request`.
#[tokio::test]
async fn given_ineligible_or_malformed_requests_when_upgrading_then_coded_rejections() {
    let (_host, client, _sender) =
        pair_transports_with(port_config(&[CHANNEL]), test_config()).await;

    // Not on the allowlist
    let off_list = UpgradeRequest {
        channel: String::from("app:ui:hide"),
        ..upgrade_request(PortScope::App)
    };
    let response = client.upgrade(off_list).await.expect("round trip");
    assert_eq!(
        response.error.expect("error").code,
        ErrorCode::NotSupported
    );

    // Empty channel name
    let empty = UpgradeRequest {
        channel: String::new(),
        ..upgrade_request(PortScope::App)
    };
    let response = client.upgrade(empty).await.expect("round trip");
    assert_eq!(
        response.error.expect("error").code,
        ErrorCode::InvalidRequest
    );

    // Unknown scope string never parses into the typed request, so it is
    // sent raw.
    let raw_reply = client
        .send(
            &event("transport:port:upgrade"),
            Some(json!({ "channel": CHANNEL, "scope": "galaxy" })),
            SendOptions::default(),
        )
        .await
        .expect("round trip");
    let response: UpgradeResponse =
        serde_json::from_value(raw_reply).expect("upgrade response shape");
    assert_eq!(
        response.error.expect("error").code,
        ErrorCode::InvalidScope
    );
}

/// **VALUE**: The full handshake through `open_port` produces a confirmed
/// record and a usable handle.
#[tokio::test]
async fn given_open_port_when_handshake_completes_then_record_confirmed() {
    let (host, client, _sender) = pair_transports(port_config(&[CHANNEL])).await;

    let handle = client.open_port(CHANNEL).await.expect("port handle");
    assert!(handle.is_open());
    assert_eq!(handle.channel(), CHANNEL);

    let host_ports = host.ports().clone();
    wait_until(1_000, || {
        let host_ports = host_ports.clone();
        async move { host_ports.confirmed_for(CHANNEL).await == 1 }
    })
    .await;
}

/// **VALUE**: The fallback guarantee - when no confirmation arrives
/// within the timeout the host destroys the port, later sends still
/// succeed over the control channel, and a late confirmation finds the
/// port closed without ever being used.
///
/// **WHY THIS MATTERS**: This is the "upgrade is never a correctness
/// dependency" rule; breaking it turns a lost confirmation into a dead
/// channel.
#[tokio::test]
async fn given_unconfirmed_port_when_timeout_elapses_then_fallback_and_late_confirm_closed() {
    let mut host_config = port_config(&[CHANNEL]);
    host_config.confirm_timeout_ms = 150;
    let (host, client, _sender) = pair_transports_with(host_config, test_config()).await;

    // GIVEN: An accepted upgrade that is never confirmed
    let response = client
        .upgrade(upgrade_request(PortScope::App))
        .await
        .expect("upgrade round trip");
    assert!(response.accepted);
    let port_id = response.port_id.expect("port id");

    // WHEN: The confirmation window passes
    let host_ports = host.ports().clone();
    wait_until(1_000, || {
        let host_ports = host_ports.clone();
        async move { host_ports.is_empty().await }
    })
    .await;

    // THEN: The channel still works over the control path
    let _handler = host
        .on(&event(CHANNEL), |payload: Option<Value>, _context| async move {
            Ok(json!({ "echo": payload }))
        })
        .await;
    let reply = client
        .send(&event(CHANNEL), Some(json!(7)), SendOptions::default())
        .await
        .expect("control-channel send after abandoned upgrade");
    assert_eq!(reply, json!({ "echo": 7 }));

    // WHEN: The confirmation finally arrives anyway
    let late_confirm = serde_json::to_value(PortConfirm {
        channel: String::from(CHANNEL),
        port_id: port_id.clone(),
        scope: None,
        permissions: Vec::new(),
    })
    .expect("confirm payload");
    let result = client
        .send(
            &event("transport:port:confirm"),
            Some(late_confirm),
            SendOptions::default(),
        )
        .await;

    // THEN: The abandoned port is reported closed, never revived
    match result {
        Err(SendError::ErrorReply { message, .. }) => {
            assert!(
                message.contains("no longer available"),
                "late confirm must be refused: {message}"
            );
        }
        other => panic!("late confirmation must be refused, got {other:?}"),
    }
    assert!(host.ports().is_empty().await);
}

/// **VALUE**: Destroying a sender cascades to its ports.
///
/// **BUG THIS CATCHES**: Would catch the owner index being wrong or the
/// cascade never running, which leaks a record (and its pipes and timer)
/// per closed window.
#[tokio::test]
async fn given_confirmed_port_when_sender_detached_then_ports_removed() {
    let (host, client, sender) = pair_transports(port_config(&[CHANNEL])).await;

    client.open_port(CHANNEL).await.expect("port handle");
    let host_ports = host.ports().clone();
    wait_until(1_000, || {
        let host_ports = host_ports.clone();
        async move { host_ports.confirmed_for(CHANNEL).await == 1 }
    })
    .await;

    host.detach_sender(sender).await;

    assert!(
        host.ports().is_empty().await,
        "sender destruction must cascade to its ports"
    );
    assert_eq!(host.sender_count().await, 0);
}

/// **VALUE**: Sends on an upgraded channel keep working end to end (the
/// dispatch switches to the port transparently).
#[tokio::test]
async fn given_confirmed_port_when_sending_then_round_trip_still_works() {
    let (host, client, _sender) = pair_transports(port_config(&[CHANNEL])).await;
    let lookup = event(CHANNEL);

    let _handler = host
        .on(&lookup, |payload: Option<Value>, _context| async move {
            Ok(json!({ "result": payload }))
        })
        .await;

    // First send triggers the lazy upgrade; both sends must succeed.
    let first = client
        .send(&lookup, Some(json!(1)), SendOptions::default())
        .await
        .expect("first send");
    let second = client
        .send(&lookup, Some(json!(2)), SendOptions::default())
        .await
        .expect("second send");

    assert_eq!(first, json!({ "result": 1 }));
    assert_eq!(second, json!({ "result": 2 }));

    let host_ports = host.ports().clone();
    wait_until(1_000, || {
        let host_ports = host_ports.clone();
        async move { host_ports.confirmed_for(CHANNEL).await == 1 }
    })
    .await;
}
