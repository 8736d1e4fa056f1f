//! Streaming engine behavior over the paired backend.

use crate::helpers::{event, pair_transports, port_config, test_config};

use serde_json::{json, Value};

use transport_core::client::{SendOptions, StreamOptions};
use transport_core::stream::{cancel_event, StreamEvent};

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// **VALUE**: The basic stream lifecycle: chunks arrive in emission
/// order, then the end event closes the stream.
///
/// **BUG THIS CATCHES**: Would catch chunk reordering (the per-stream
/// ordering guarantee), dropped terminal events, or the receiver staying
/// open after `end`.
#[tokio::test]
async fn given_stream_handler_when_consumed_then_chunks_in_order_then_end() {
    let (host, client, _sender) = pair_transports(test_config()).await;
    let results = event("core-box:search:stream");

    let _producer = host
        .on_stream(&results, |payload: Option<Value>, emitter| async move {
            let query = payload
                .as_ref()
                .and_then(|value| value.get("text"))
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            for index in 0..3 {
                if emitter.is_cancelled() {
                    return Ok(());
                }
                emitter.emit(json!({ "query": query, "rank": index })).await;
            }
            emitter.end().await;
            Ok(())
        })
        .await;

    let (controller, mut events) = client
        .stream(&results, Some(json!({ "text": "rust" })), StreamOptions::default())
        .await
        .expect("stream start");

    let mut chunks = Vec::new();
    let mut ended = false;
    while let Some(event) = events.recv().await {
        match event {
            StreamEvent::Data(chunk) => chunks.push(chunk),
            StreamEvent::End => {
                ended = true;
                break;
            }
            StreamEvent::Error(error) => panic!("unexpected stream error: {error}"),
        }
    }

    assert!(ended, "stream must terminate with End");
    assert_eq!(
        chunks,
        vec![
            json!({ "query": "rust", "rank": 0 }),
            json!({ "query": "rust", "rank": 1 }),
            json!({ "query": "rust", "rank": 2 }),
        ],
        "chunks must arrive in emission order"
    );
    assert!(!controller.is_cancelled());
}

/// **VALUE**: Cooperative cancellation: after `cancel()` the producer
/// observes the flag and stops, exactly one cancel notification is sent,
/// and the consumer's event stream closes without a terminal event.
///
/// **BUG THIS CATCHES**: Would catch `cancel()` losing idempotency (two
/// notifications), the producer-side flag never being set, or delivery
/// continuing past cancellation.
#[tokio::test]
async fn given_active_stream_when_cancelled_then_producer_stops_and_one_notification() {
    let (host, client, _sender) = pair_transports(test_config()).await;
    let feed = event("core-box:search:stream");
    let producer_saw_cancel = Arc::new(AtomicBool::new(false));
    let cancel_notifications = Arc::new(AtomicUsize::new(0));

    // Count cancel notifications alongside the producer's own handler.
    let notification_count = cancel_notifications.clone();
    let _cancel_probe = host
        .on(&event(&cancel_event(feed.name())), move |_payload, _context| {
            let notification_count = notification_count.clone();
            async move {
                notification_count.fetch_add(1, Ordering::SeqCst);
                Ok(Value::Null)
            }
        })
        .await;

    let saw_cancel = producer_saw_cancel.clone();
    let _producer = host
        .on_stream(&feed, move |_payload, emitter| {
            let saw_cancel = saw_cancel.clone();
            async move {
                for index in 0..500 {
                    if emitter.is_cancelled() {
                        saw_cancel.store(true, Ordering::SeqCst);
                        return Ok(());
                    }
                    emitter.emit(json!(index)).await;
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
                emitter.end().await;
                Ok(())
            }
        })
        .await;

    let (controller, mut events) = client
        .stream(&feed, None, StreamOptions::default())
        .await
        .expect("stream start");

    // WHEN: Receiving one chunk, then cancelling twice
    let first = events.recv().await.expect("first event");
    assert!(matches!(first, StreamEvent::Data(_)));
    controller.cancel();
    controller.cancel();
    assert!(controller.is_cancelled());

    // THEN: The consumer's stream drains and closes without End/Error
    let drained = tokio::time::timeout(Duration::from_secs(2), async {
        let mut post_cancel_terminals = 0;
        while let Some(event) = events.recv().await {
            if !matches!(event, StreamEvent::Data(_)) {
                post_cancel_terminals += 1;
            }
        }
        post_cancel_terminals
    })
    .await
    .expect("receiver must close after cancellation");
    assert_eq!(drained, 0, "no terminal events after cancellation");

    // THEN: The producer observed the flag and exactly one cancel
    // notification crossed the wire
    tokio::time::timeout(Duration::from_secs(2), async {
        while !producer_saw_cancel.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("producer must observe cancellation");
    assert_eq!(cancel_notifications.load(Ordering::SeqCst), 1);
}

/// **VALUE**: A stream handler failure terminates that one stream with an
/// error event; unrelated traffic keeps working.
#[tokio::test]
async fn given_failing_stream_handler_when_consumed_then_single_error_event() {
    let (host, client, _sender) = pair_transports(test_config()).await;
    let doomed = event("intelligence:chat:stream");

    let _producer = host
        .on_stream(&doomed, |_payload, emitter| async move {
            emitter.emit(json!("partial")).await;
            Err(String::from("model unavailable"))
        })
        .await;

    let ping = event("ping");
    let _ping_handler = host
        .on(&ping, |_payload, _context| async { Ok(json!("pong")) })
        .await;

    let (_controller, mut events) = client
        .stream(&doomed, None, StreamOptions::default())
        .await
        .expect("stream start");

    let mut saw_error = false;
    while let Some(event) = events.recv().await {
        match event {
            StreamEvent::Data(_) => {}
            StreamEvent::Error(error) => {
                assert!(
                    error.to_string().contains("model unavailable"),
                    "producer message must survive: {error}"
                );
                saw_error = true;
            }
            StreamEvent::End => panic!("errored stream must not also end"),
        }
    }
    assert!(saw_error, "consumer must be notified exactly once");

    // Other traffic is unaffected
    let reply = client
        .send(&ping, None, SendOptions::default())
        .await
        .expect("transport still alive");
    assert_eq!(reply, json!("pong"));
}

/// **VALUE**: With the channel allowlisted, streaming negotiates a port
/// and the ordering guarantee holds across it.
///
/// **BUG THIS CATCHES**: Would catch the port path reordering frames or
/// stream routing ignoring port-delivered messages.
#[tokio::test]
async fn given_allowlisted_channel_when_streaming_then_port_carries_ordered_chunks() {
    let channel = "core-box:search:stream";
    let (host, client, _sender) = pair_transports(port_config(&[channel])).await;
    let results = event(channel);

    let _producer = host
        .on_stream(&results, |_payload, emitter| async move {
            for index in 0..20 {
                if emitter.is_cancelled() {
                    return Ok(());
                }
                emitter.emit(json!(index)).await;
            }
            emitter.end().await;
            Ok(())
        })
        .await;

    let (_controller, mut events) = client
        .stream(&results, None, StreamOptions::default())
        .await
        .expect("stream start");

    let mut chunks = Vec::new();
    while let Some(event) = events.recv().await {
        match event {
            StreamEvent::Data(chunk) => chunks.push(chunk),
            StreamEvent::End => break,
            StreamEvent::Error(error) => panic!("unexpected stream error: {error}"),
        }
    }

    let expected: Vec<Value> = (0..20).map(|index| json!(index)).collect();
    assert_eq!(chunks, expected, "port delivery must preserve order");
    assert_eq!(
        host.ports().confirmed_for(channel).await,
        1,
        "the stream should have negotiated one confirmed port"
    );
}
