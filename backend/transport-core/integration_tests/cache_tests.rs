//! Response-cache behavior exercised through real sends.

use crate::helpers::{event, pair_transports, test_config};

use serde_json::{json, Value};

use transport_core::cache::{CacheMode, CachePolicy};
use transport_core::client::SendOptions;
use transport_core::error::SendError;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// **VALUE**: `prefer` mode with a TTL: a second identical send inside
/// the TTL returns the cached value without dispatching; after the TTL it
/// dispatches again.
///
/// **BUG THIS CATCHES**: Would catch the cache being consulted after
/// dispatch, the derived key ignoring the payload, or TTL expiry never
/// happening.
#[tokio::test]
async fn given_prefer_ttl_when_repeated_inside_and_after_ttl_then_hit_then_redispatch() {
    let (host, client, _sender) = pair_transports(test_config()).await;
    let version = event("app:config:version");
    let calls = Arc::new(AtomicUsize::new(0));

    let handler_calls = calls.clone();
    let _subscription = host
        .on(&version, move |_payload, _context| {
            let handler_calls = handler_calls.clone();
            async move {
                let call = handler_calls.fetch_add(1, Ordering::SeqCst) + 1;
                Ok(json!({ "version": call }))
            }
        })
        .await;

    let options = || SendOptions::cached(CachePolicy::prefer_for(Duration::from_millis(300)));

    // WHEN: Two sends inside the TTL
    let first = client
        .send(&version, Some(json!({ "scope": "app" })), options())
        .await
        .expect("first");
    let second = client
        .send(&version, Some(json!({ "scope": "app" })), options())
        .await
        .expect("second");

    // THEN: Identical value, single dispatch
    assert_eq!(first, json!({ "version": 1 }));
    assert_eq!(second, first, "cached value must be identical");
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    // WHEN: The TTL elapses
    tokio::time::sleep(Duration::from_millis(400)).await;
    let third = client
        .send(&version, Some(json!({ "scope": "app" })), options())
        .await
        .expect("third");

    // THEN: A fresh dispatch happened
    assert_eq!(third, json!({ "version": 2 }));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

/// **VALUE**: `only` mode on a cold cache fails immediately with a cache
/// miss and never dispatches.
///
/// **WHY THIS MATTERS**: `only` signals "I rely on a cache someone else
/// populated"; dispatching would hide the programming error it exists to
/// expose.
#[tokio::test]
async fn given_cold_cache_when_only_mode_send_then_cache_miss_without_dispatch() {
    let (host, client, _sender) = pair_transports(test_config()).await;
    let profile = event("app:user:profile");
    let calls = Arc::new(AtomicUsize::new(0));

    let handler_calls = calls.clone();
    let _subscription = host
        .on(&profile, move |_payload, _context| {
            let handler_calls = handler_calls.clone();
            async move {
                handler_calls.fetch_add(1, Ordering::SeqCst);
                Ok(Value::Null)
            }
        })
        .await;

    let result = client
        .send(
            &profile,
            None,
            SendOptions::cached(CachePolicy::only()),
        )
        .await;

    assert!(
        matches!(result, Err(SendError::CacheMiss { .. })),
        "only-mode miss must be a hard error, got {result:?}"
    );
    assert_eq!(calls.load(Ordering::SeqCst), 0, "no dispatch on only-mode miss");
}

/// **VALUE**: After a `prefer` send populates the cache, `only` mode
/// reads it without dispatching.
#[tokio::test]
async fn given_populated_cache_when_only_mode_send_then_served_from_cache() {
    let (host, client, _sender) = pair_transports(test_config()).await;
    let profile = event("app:user:profile");
    let calls = Arc::new(AtomicUsize::new(0));

    let handler_calls = calls.clone();
    let _subscription = host
        .on(&profile, move |_payload, _context| {
            let handler_calls = handler_calls.clone();
            async move {
                handler_calls.fetch_add(1, Ordering::SeqCst);
                Ok(json!({ "name": "dana" }))
            }
        })
        .await;

    let populated = client
        .send(
            &profile,
            Some(json!({ "id": 7 })),
            SendOptions::cached(CachePolicy::default()),
        )
        .await
        .expect("populate");

    let cached = client
        .send(
            &profile,
            Some(json!({ "id": 7 })),
            SendOptions::cached(CachePolicy {
                mode: CacheMode::Only,
                ..CachePolicy::default()
            }),
        )
        .await
        .expect("only-mode read after population");

    assert_eq!(populated, cached);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

/// **VALUE**: An explicit cache key groups differing payloads under one
/// entry.
#[tokio::test]
async fn given_explicit_key_when_payloads_differ_then_one_entry_shared() {
    let (host, client, _sender) = pair_transports(test_config()).await;
    let listing = event("files:index:list");
    let calls = Arc::new(AtomicUsize::new(0));

    let handler_calls = calls.clone();
    let _subscription = host
        .on(&listing, move |_payload, _context| {
            let handler_calls = handler_calls.clone();
            async move {
                handler_calls.fetch_add(1, Ordering::SeqCst);
                Ok(json!(["a.txt", "b.txt"]))
            }
        })
        .await;

    let keyed = |payload: Value| {
        let policy = CachePolicy {
            key: Some(String::from("all-files")),
            ..CachePolicy::default()
        };
        client.send(&listing, Some(payload), SendOptions::cached(policy))
    };

    let first = keyed(json!({ "page": 1 })).await.expect("first");
    let second = keyed(json!({ "page": 2 })).await.expect("second");

    assert_eq!(first, second, "explicit key must override payload derivation");
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}
