//! Batching semantics exercised end to end over the paired backend.
//!
//! Enqueue order inside one window is made deterministic by polling the
//! send futures from a single task via `tokio::join!` - each future
//! enqueues on its first poll.

use crate::helpers::{pair_transports, test_config};

use models::event::{BatchConfig, MergeStrategy};
use models::EventDescriptor;

use serde_json::{json, Value};

use transport_core::client::SendOptions;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;

fn batched(name: &str, strategy: MergeStrategy, window_ms: u64, max_size: usize) -> EventDescriptor {
    EventDescriptor::raw(name)
        .expect("valid event name")
        .with_batch(BatchConfig {
            enabled: true,
            window_ms,
            max_size,
            merge_strategy: strategy,
        })
}

/// **VALUE**: N sends with identical payloads inside one dedupe window
/// share exactly one underlying dispatch, and all N callers get the same
/// value.
///
/// **BUG THIS CATCHES**: Would catch the dedupe key drifting between
/// cache and batch derivation, or resolvers being dropped on shared
/// entries (some callers would hang).
#[tokio::test]
async fn given_identical_sends_when_dedupe_batch_flushes_then_single_dispatch() {
    let (host, client, _sender) = pair_transports(test_config()).await;
    let lookup = batched("storage:app:get", MergeStrategy::Dedupe, 40, 50);
    let calls = Arc::new(AtomicUsize::new(0));

    let handler_calls = calls.clone();
    let _subscription = host
        .on(&lookup, move |payload: Option<Value>, _context| {
            let handler_calls = handler_calls.clone();
            async move {
                handler_calls.fetch_add(1, Ordering::SeqCst);
                Ok(json!({ "echo": payload }))
            }
        })
        .await;

    let payload = json!({ "key": "theme" });
    let (r1, r2, r3) = tokio::join!(
        client.send(&lookup, Some(payload.clone()), SendOptions::default()),
        client.send(&lookup, Some(payload.clone()), SendOptions::default()),
        client.send(&lookup, Some(payload.clone()), SendOptions::default()),
    );

    let (r1, r2, r3) = (r1.expect("r1"), r2.expect("r2"), r3.expect("r3"));
    assert_eq!(calls.load(Ordering::SeqCst), 1, "one dispatch for the window");
    assert_eq!(r1, r2);
    assert_eq!(r2, r3);
    assert_eq!(r1, json!({ "echo": { "key": "theme" } }));
}

/// **VALUE**: `latest` collapses a window to one dispatch carrying the
/// newest payload; every pending caller resolves with that one result.
#[tokio::test]
async fn given_three_sends_when_latest_batch_flushes_then_only_newest_dispatched() {
    let (host, client, _sender) = pair_transports(test_config()).await;
    let preview = batched("core-box:preview:update", MergeStrategy::Latest, 40, 50);
    let payloads = Arc::new(Mutex::new(Vec::new()));

    let seen = payloads.clone();
    let _subscription = host
        .on(&preview, move |payload: Option<Value>, _context| {
            let seen = seen.clone();
            async move {
                seen.lock().await.push(payload.clone());
                Ok(json!({ "applied": payload }))
            }
        })
        .await;

    let (r1, r2, r3) = tokio::join!(
        client.send(&preview, Some(json!({ "rev": 1 })), SendOptions::default()),
        client.send(&preview, Some(json!({ "rev": 2 })), SendOptions::default()),
        client.send(&preview, Some(json!({ "rev": 3 })), SendOptions::default()),
    );

    let expected = json!({ "applied": { "rev": 3 } });
    assert_eq!(r1.expect("r1"), expected);
    assert_eq!(r2.expect("r2"), expected);
    assert_eq!(r3.expect("r3"), expected);
    assert_eq!(
        *payloads.lock().await,
        vec![Some(json!({ "rev": 3 }))],
        "exactly one dispatch, carrying the newest payload"
    );
}

/// **VALUE**: `queue` dispatches every call in strict submission order.
///
/// **WHY THIS MATTERS**: Queue mode exists so side-effecting calls
/// observe a stable order; the handler records invocation order to
/// verify it.
#[tokio::test]
async fn given_queue_strategy_when_batch_flushes_then_handler_sees_submission_order() {
    let (host, client, _sender) = pair_transports(test_config()).await;
    let append = batched("workspace:script:append", MergeStrategy::Queue, 40, 50);
    let order = Arc::new(Mutex::new(Vec::new()));

    let seen = order.clone();
    let _subscription = host
        .on(&append, move |payload: Option<Value>, _context| {
            let seen = seen.clone();
            async move {
                seen.lock().await.push(payload.clone());
                Ok(Value::Null)
            }
        })
        .await;

    let (r1, r2, r3) = tokio::join!(
        client.send(&append, Some(json!("a")), SendOptions::default()),
        client.send(&append, Some(json!("b")), SendOptions::default()),
        client.send(&append, Some(json!("c")), SendOptions::default()),
    );
    r1.expect("r1");
    r2.expect("r2");
    r3.expect("r3");

    assert_eq!(
        *order.lock().await,
        vec![Some(json!("a")), Some(json!("b")), Some(json!("c"))],
        "queue flush must preserve submission order"
    );
}

/// **VALUE**: `immediate` bypasses an enabled batch window entirely.
#[tokio::test]
async fn given_batched_event_when_immediate_option_used_then_no_window_wait() {
    let (host, client, _sender) = pair_transports(test_config()).await;
    // A five-second window would make a non-bypassed send time out the
    // 500ms guard below.
    let slow = batched("storage:app:get", MergeStrategy::Dedupe, 5_000, 50);
    let calls = Arc::new(AtomicUsize::new(0));

    let handler_calls = calls.clone();
    let _subscription = host
        .on(&slow, move |_payload, _context| {
            let handler_calls = handler_calls.clone();
            async move {
                handler_calls.fetch_add(1, Ordering::SeqCst);
                Ok(json!("now"))
            }
        })
        .await;

    let reply = tokio::time::timeout(
        Duration::from_millis(500),
        client.send(&slow, Some(json!(1)), SendOptions::immediate()),
    )
    .await
    .expect("immediate send must not wait for the window")
    .expect("reply");

    assert_eq!(reply, json!("now"));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

/// **VALUE**: `flush()` drains a long window on demand - the shutdown
/// ordering hook.
#[tokio::test]
async fn given_pending_window_when_flush_called_then_sends_complete() {
    let (host, client, _sender) = pair_transports(test_config()).await;
    let slow = batched("storage:app:get", MergeStrategy::Queue, 5_000, 50);

    let _subscription = host
        .on(&slow, |_payload, _context| async { Ok(json!("drained")) })
        .await;

    let pending = {
        let client = client.clone();
        let slow = slow.clone();
        tokio::spawn(async move { client.send(&slow, Some(json!(1)), SendOptions::default()).await })
    };

    // Give the send a moment to open its window, then force the drain.
    tokio::time::sleep(Duration::from_millis(50)).await;
    client.flush().await;

    let reply = tokio::time::timeout(Duration::from_millis(500), pending)
        .await
        .expect("flush must complete the pending send")
        .expect("task join")
        .expect("reply");
    assert_eq!(reply, json!("drained"));
}

/// **VALUE**: Reaching `max_size` flushes immediately instead of waiting
/// out the timer.
#[tokio::test]
async fn given_max_size_reached_when_sending_then_window_flushes_early() {
    let (host, client, _sender) = pair_transports(test_config()).await;
    let capped = batched("storage:app:get", MergeStrategy::Queue, 5_000, 2);
    let calls = Arc::new(AtomicUsize::new(0));

    let handler_calls = calls.clone();
    let _subscription = host
        .on(&capped, move |_payload, _context| {
            let handler_calls = handler_calls.clone();
            async move {
                handler_calls.fetch_add(1, Ordering::SeqCst);
                Ok(Value::Null)
            }
        })
        .await;

    let both = async {
        let (r1, r2) = tokio::join!(
            client.send(&capped, Some(json!(1)), SendOptions::default()),
            client.send(&capped, Some(json!(2)), SendOptions::default()),
        );
        r1.expect("r1");
        r2.expect("r2");
    };

    tokio::time::timeout(Duration::from_millis(500), both)
        .await
        .expect("size threshold must flush well before the 5s window");
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}
