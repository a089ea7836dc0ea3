//! Integration Tests for Signal Synchronization
//!
//! These tests drive signals against the in-memory server and check the
//! observable behavior: optimistic writes, rollback, compare-and-set,
//! reconnection, and reference-counted subscriptions.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::{json, Value};

use ripple_core::codec::Codec;
use ripple_core::reactive::Effect;
use ripple_core::signals::{ListSignal, NumberSignal, ValueSignal};
use ripple_core::state::{EntryId, EntryKind, ServerEvent};
use ripple_core::sync::EventLogOptions;
use ripple_core::transport::InMemoryTransport;
use ripple_core::SyncError;

/// Let spawned subscription pumps catch up.
async fn settle() {
    for _ in 0..32 {
        tokio::task::yield_now().await;
    }
}

fn text(server: &InMemoryTransport, id: &str) -> ValueSignal<String> {
    ValueSignal::new(
        id,
        Arc::new(server.clone()),
        EventLogOptions::default().with_initial_value(json!("a")),
    )
}

fn number(server: &InMemoryTransport, id: &str) -> NumberSignal {
    NumberSignal::new(
        id,
        Arc::new(server.clone()),
        EventLogOptions::default().with_initial_value(json!(0)),
    )
}

fn recorder<T: Send + 'static>() -> (Arc<Mutex<Vec<T>>>, impl Fn(T) + Send + Sync + 'static) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    (seen, move |value| sink.lock().push(value))
}

/// Test that a write is visible at once and confirmation causes no flicker.
#[tokio::test]
async fn optimistic_round_trip_without_flicker() {
    let server = InMemoryTransport::new();
    server.register("title", EntryKind::Value, json!("a"));
    let title = text(&server, "title");

    let (seen, record) = recorder();
    let _watch = title.watch(record);
    settle().await;

    let write = title.set("b".to_owned(), true);
    assert_eq!(title.peek(), "b");
    assert!(write.await.unwrap());

    settle().await;
    assert_eq!(title.peek(), "b");
    assert_eq!(*seen.lock(), vec!["a".to_owned(), "b".to_owned()]);
    assert_eq!(title.event_log().pending_count(), 0);
}

/// Test that a failed publish rolls the optimistic value back.
#[tokio::test]
async fn rollback_on_transport_failure() {
    let server = InMemoryTransport::new();
    server.register("title", EntryKind::Value, json!("a"));
    let title = text(&server, "title");

    let (seen, record) = recorder();
    let _watch = title.watch(record);
    settle().await;

    server.fail_next_publish();
    let write = title.set("b".to_owned(), true);
    assert_eq!(title.peek(), "b");

    let result = write.await;
    assert!(matches!(result, Err(SyncError::Transport(_))));
    assert_eq!(title.peek(), "a");
    assert_eq!(*seen.lock(), vec!["a".to_owned(), "b".to_owned(), "a".to_owned()]);
    assert_eq!(server.server_value("title", &EntryId::root()), Some(json!("a")));
}

/// Test that a stale compare-and-set never overwrites a newer value.
#[tokio::test]
async fn stale_compare_and_set_is_rejected_everywhere() {
    let server = InMemoryTransport::new();
    server.register("title", EntryKind::Value, json!("a"));
    let alice = text(&server, "title");
    let bob = text(&server, "title");
    let _a = alice.watch(|_| {});
    let _b = bob.watch(|_| {});
    settle().await;

    // Bob's view is stale while Alice's write is in flight.
    server.hold();
    let alice_write = tokio::spawn(alice.set("x".to_owned(), true));
    settle().await;
    let bob_write = tokio::spawn(bob.compare_and_set("a".to_owned(), "y".to_owned(), true));
    settle().await;
    assert_eq!(bob.peek(), "y");
    server.release();

    assert!(alice_write.await.unwrap().unwrap());
    assert!(!bob_write.await.unwrap().unwrap());
    settle().await;

    assert_eq!(alice.peek(), "x");
    assert_eq!(bob.peek(), "x");
    assert_eq!(server.server_value("title", &EntryId::root()), Some(json!("x")));
}

/// Test that sequential updates compose in order.
#[tokio::test]
async fn sequential_updates_compose() {
    let server = InMemoryTransport::new();
    server.register("n", EntryKind::Number, json!(0));
    let n = number(&server, "n");
    let _watch = n.watch(|_| {});

    for _ in 0..5 {
        n.update(|v| v * 2.0 + 1.0).await.unwrap();
    }
    assert_eq!(n.peek(), 31.0);
    assert_eq!(server.server_value("n", &EntryId::root()), Some(json!(31.0)));
}

/// Test that competing writers using update lose no increments.
#[tokio::test]
async fn competing_writers_lose_no_updates() {
    let server = InMemoryTransport::new();
    server.register("clicks", EntryKind::Number, json!(0));
    let a = number(&server, "clicks");
    let b = number(&server, "clicks");
    let _wa = a.watch(|_| {});
    let _wb = b.watch(|_| {});
    settle().await;

    let run = |signal: NumberSignal| async move {
        for _ in 0..10 {
            signal.increment(1.0).await.unwrap();
        }
    };
    tokio::join!(run(a.clone()), run(b.clone()));
    settle().await;

    assert_eq!(server.server_value("clicks", &EntryId::root()), Some(json!(20.0)));
    assert_eq!(a.peek(), 20.0);
    assert_eq!(b.peek(), 20.0);

    // Every rejected attempt was retried.
    let events = server.events("clicks");
    assert_eq!(events.iter().filter(|e| e.accepted).count(), 20);
}

/// Test that delivering the same confirmed event twice changes nothing.
#[tokio::test]
async fn duplicate_delivery_is_silent() {
    let server = InMemoryTransport::new();
    server.register("title", EntryKind::Value, json!("a"));
    let title = text(&server, "title");

    let runs = Arc::new(AtomicUsize::new(0));
    let r = runs.clone();
    let _watch = title.watch(move |_| {
        r.fetch_add(1, Ordering::SeqCst);
    });
    settle().await;

    title.set("b".to_owned(), true).await.unwrap();
    let before = runs.load(Ordering::SeqCst);

    let confirmed: Vec<ServerEvent> = server.events("title");
    let frame = Codec::Json.encode(confirmed.last().unwrap()).unwrap();
    server.inject("title", frame);
    settle().await;

    assert_eq!(runs.load(Ordering::SeqCst), before);
    assert_eq!(title.peek(), "b");
    assert_eq!(title.event_log().diagnostics().applied, 3);
}

/// Test that a lost subscription resumes after the last seen event.
#[tokio::test]
async fn resubscription_resumes_not_replays() {
    let server = InMemoryTransport::new();
    server.register("title", EntryKind::Value, json!("a"));
    let title = text(&server, "title");

    let runs = Arc::new(AtomicUsize::new(0));
    let r = runs.clone();
    let _watch = title.watch(move |_| {
        r.fetch_add(1, Ordering::SeqCst);
    });
    settle().await;

    title.set("b".to_owned(), true).await.unwrap();
    let seen_event = title.event_log().last_event_id();

    server.hold();
    let pending = tokio::spawn(title.set("c".to_owned(), true));
    settle().await;
    let runs_before = runs.load(Ordering::SeqCst);

    server.drop_subscriptions("title");
    settle().await;

    let calls = server.subscribe_calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[1].last_event_id, seen_event);
    assert!(title.event_log().is_connected());
    assert_eq!(runs.load(Ordering::SeqCst), runs_before);
    assert_eq!(title.peek(), "c");

    server.release();
    assert!(pending.await.unwrap().unwrap());
    assert_eq!(title.peek(), "c");
    assert_eq!(title.event_log().pending_count(), 0);
}

/// Test that consumers share one subscription.
#[tokio::test]
async fn reference_counted_connection() {
    let server = InMemoryTransport::new();
    server.register("title", EntryKind::Value, json!("a"));
    let title = text(&server, "title");
    assert!(!title.event_log().is_connected());

    let first = title.watch(|_| {});
    let second = title.watch(|_| {});
    let third = title.clone().watch(|_| {});
    assert_eq!(server.subscribe_calls().len(), 1);
    assert_eq!(server.active_subscribers("title"), 1);

    drop(first);
    drop(second);
    assert!(title.event_log().is_connected());
    assert_eq!(server.cancellations(), 0);

    drop(third);
    assert!(!title.event_log().is_connected());
    assert_eq!(server.cancellations(), 1);
    assert_eq!(server.active_subscribers("title"), 0);
}

/// Test that a plain effect reading a signal counts as a consumer.
#[tokio::test]
async fn effect_reading_a_signal_holds_the_connection() {
    let server = InMemoryTransport::new();
    server.register("n", EntryKind::Number, json!(4));
    let n = number(&server, "n");

    let doubled = Arc::new(Mutex::new(0.0));
    let (signal, out) = (n.clone(), doubled.clone());
    let effect = Effect::new(move || {
        *out.lock() = signal.value() * 2.0;
    });
    settle().await;
    assert!(n.event_log().is_connected());
    assert_eq!(*doubled.lock(), 8.0);

    n.add(1.0).await.unwrap();
    assert_eq!(*doubled.lock(), 10.0);

    effect.dispose();
    assert!(!n.event_log().is_connected());
}

/// Test that losing and regaining health reconnects from the last event.
#[tokio::test]
async fn health_toggle_reconnects() {
    let server = InMemoryTransport::new();
    server.register("title", EntryKind::Value, json!("a"));
    let title = text(&server, "title");
    let _watch = title.watch(|_| {});
    settle().await;
    title.set("b".to_owned(), true).await.unwrap();

    server.set_online(false);
    settle().await;
    assert!(!title.event_log().is_connected());

    server.set_online(true);
    settle().await;
    assert!(title.event_log().is_connected());

    let calls = server.subscribe_calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[1].last_event_id, title.event_log().last_event_id());
}

/// Test that an unknown event shape is counted and otherwise ignored.
#[tokio::test]
async fn unknown_event_is_a_diagnostic() {
    let server = InMemoryTransport::new();
    server.register("title", EntryKind::Value, json!("a"));
    let title = text(&server, "title");
    let _watch = title.watch(|_| {});
    settle().await;

    server.inject(
        "title",
        br#"{"id": "zzz", "type": "merge", "value": "q", "accepted": true}"#.to_vec(),
    );
    settle().await;

    let diagnostics = title.event_log().diagnostics();
    assert_eq!(diagnostics.unrecognized, 1);
    assert_eq!(title.peek(), "a");
}

/// Test that list edits from one client reach another.
#[tokio::test]
async fn list_edits_across_clients() {
    let server = InMemoryTransport::new();
    server.register("todo", EntryKind::List, Value::Null);
    let alice: ListSignal<String> = ListSignal::new("todo", Arc::new(server.clone()), EventLogOptions::default());
    let bob: ListSignal<String> = ListSignal::new("todo", Arc::new(server.clone()), EventLogOptions::default());

    let (seen, record) = recorder();
    let _a = alice.watch(|_| {});
    let _b = bob.watch(record);
    settle().await;

    alice.insert_last("milk".into()).await.unwrap();
    alice.insert_first("eggs".into()).await.unwrap();
    settle().await;
    assert_eq!(bob.values(), vec!["eggs", "milk"]);

    let items = bob.items();
    assert!(bob.remove(&items[0]).await.unwrap());
    settle().await;

    assert_eq!(alice.values(), vec!["milk"]);
    assert_eq!(seen.lock().last(), Some(&vec!["milk".to_owned()]));
    assert_eq!(server.server_items("todo"), vec![json!("milk")]);
}

/// Test that the delay option holds the publish back.
#[tokio::test]
async fn delay_option_postpones_publish() {
    let server = InMemoryTransport::new();
    server.register("title", EntryKind::Value, json!("a"));
    let title: ValueSignal<String> = ValueSignal::new(
        "title",
        Arc::new(server.clone()),
        EventLogOptions::default()
            .with_initial_value(json!("a"))
            .with_delay(Duration::from_millis(30)),
    );

    let started = tokio::time::Instant::now();
    title.set("b".to_owned(), true).await.unwrap();
    assert!(started.elapsed() >= Duration::from_millis(30));
}

/// Test a full exchange over MessagePack framing, with options from config.
#[tokio::test]
async fn message_pack_clients() {
    let server = InMemoryTransport::with_codec(Codec::MessagePack);
    server.register("score", EntryKind::Number, json!(10));
    let options: EventLogOptions = serde_json::from_value(json!({
        "codec": "msgpack",
        "initial_value": 10
    }))
    .unwrap();

    let a = NumberSignal::new("score", Arc::new(server.clone()), options.clone());
    let b = NumberSignal::new("score", Arc::new(server.clone()), options);
    let _wb = b.watch(|_| {});
    settle().await;

    a.increment(5.0).await.unwrap();
    settle().await;
    assert_eq!(b.peek(), 15.0);
}
