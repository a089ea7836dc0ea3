//! InMemoryTransport: an in-process authoritative server
//!
//! Keeps one confirmed [`State`] and one append-only event log per signal
//! id. Published events are evaluated with the same rules clients use, so
//! a compare-and-set that lost a race is rejected here exactly as it would
//! be by a real server. Every processed event is tagged with the verdict
//! and broadcast to all subscribers of the signal, in log order.
//!
//! Fault injection hooks let tests fail a publish, hold deliveries back,
//! drop subscriptions, and toggle connection health.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use futures_util::future::BoxFuture;
use indexmap::IndexMap;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{mpsc, watch};

use super::{Subscription, SubscriptionMessage, Transport};
use crate::codec::Codec;
use crate::error::TransportError;
use crate::state::{DerivedState, EntryId, EntryKind, EventId, ServerEvent, State, StateEvent, StateView};

/// One recorded call to [`Transport::subscribe`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribeCall {
    pub signal_id: String,
    pub last_event_id: Option<EventId>,
}

struct Topic {
    state: State,
    log: Vec<(EventId, Vec<u8>)>,
    /// Snapshot ids handed out, mapped to the log length they cover.
    snapshots: HashMap<EventId, usize>,
    subscribers: IndexMap<u64, mpsc::UnboundedSender<SubscriptionMessage>>,
}

impl Topic {
    fn new(kind: EntryKind, initial: Value) -> Self {
        Self {
            state: State::with_root(kind, initial),
            log: Vec::new(),
            snapshots: HashMap::new(),
            subscribers: IndexMap::new(),
        }
    }

    /// Log index of the first event the holder of `id` has not seen.
    fn position_after(&self, id: &EventId) -> Option<usize> {
        if let Some(&covered) = self.snapshots.get(id) {
            return Some(covered);
        }
        self.log
            .iter()
            .position(|(logged, _)| logged == id)
            .map(|index| index + 1)
    }

    fn snapshot_event(&self) -> StateEvent {
        match self.state.entry(&EntryId::root()) {
            Some(root) if root.kind == EntryKind::List => {
                StateEvent::list_snapshot(self.state.entries().cloned().collect())
            }
            Some(root) => StateEvent::snapshot(root.value.clone()),
            None => StateEvent::snapshot(Value::Null),
        }
    }

    fn broadcast(&mut self, message: SubscriptionMessage) {
        self.subscribers.retain(|_, tx| tx.send(message.clone()).is_ok());
    }
}

impl Default for Topic {
    fn default() -> Self {
        Self::new(EntryKind::Value, Value::Null)
    }
}

struct Shared {
    codec: Codec,
    topics: DashMap<String, Topic>,
    online: watch::Sender<bool>,
    fail_next: Mutex<Option<TransportError>>,
    failing_subscribes: AtomicUsize,
    held: AtomicBool,
    queued: Mutex<Vec<(String, StateEvent)>>,
    subscribe_calls: Mutex<Vec<SubscribeCall>>,
    cancellations: AtomicUsize,
    next_subscriber: AtomicU64,
}

impl Shared {
    /// Evaluate, log and broadcast one event. Returns the verdict.
    fn process(&self, signal_id: &str, event: StateEvent) -> bool {
        let mut guard = self.topics.entry(signal_id.to_owned()).or_default();
        let topic = &mut *guard;

        let mut next = DerivedState::new(&topic.state);
        let accepted = next.evaluate(&event);
        let changes = next.into_overlay();
        topic.state.ingest(changes);

        tracing::debug!(
            signal = signal_id,
            event = %event.id,
            kind = event.kind(),
            accepted,
            "Server processed event"
        );

        let id = event.id.clone();
        match self.codec.encode(&ServerEvent { event, accepted }) {
            Ok(frame) => {
                topic.log.push((id, frame.clone()));
                topic.broadcast(SubscriptionMessage::Frame(frame));
            }
            Err(error) => tracing::warn!(signal = signal_id, %error, "Server failed to encode event"),
        }
        accepted
    }
}

/// In-memory [`Transport`] with an authoritative server behind it.
///
/// Clones share the same server.
#[derive(Clone)]
pub struct InMemoryTransport {
    shared: Arc<Shared>,
}

impl InMemoryTransport {
    pub fn new() -> Self {
        Self::with_codec(Codec::default())
    }

    pub fn with_codec(codec: Codec) -> Self {
        let (online, _) = watch::channel(true);
        Self {
            shared: Arc::new(Shared {
                codec,
                topics: DashMap::new(),
                online,
                fail_next: Mutex::new(None),
                failing_subscribes: AtomicUsize::new(0),
                held: AtomicBool::new(false),
                queued: Mutex::new(Vec::new()),
                subscribe_calls: Mutex::new(Vec::new()),
                cancellations: AtomicUsize::new(0),
                next_subscriber: AtomicU64::new(0),
            }),
        }
    }

    /// Create (or reset) a signal on the server.
    ///
    /// Unregistered signals are created on first use as a null value.
    pub fn register(&self, signal_id: &str, kind: EntryKind, initial: Value) {
        self.shared
            .topics
            .insert(signal_id.to_owned(), Topic::new(kind, initial));
    }

    /// Apply an event directly on the server, as if another client had
    /// published it.
    pub fn apply(&self, signal_id: &str, event: StateEvent) -> bool {
        self.shared.process(signal_id, event)
    }

    /// Queue published events instead of processing them.
    pub fn hold(&self) {
        self.shared.held.store(true, Ordering::SeqCst);
    }

    /// Process every queued event in arrival order and stop holding.
    ///
    /// Returns how many events were processed.
    pub fn release(&self) -> usize {
        self.shared.held.store(false, Ordering::SeqCst);
        let queued = std::mem::take(&mut *self.shared.queued.lock());
        let count = queued.len();
        for (signal_id, event) in queued {
            self.shared.process(&signal_id, event);
        }
        count
    }

    /// Make the next publish fail without reaching the server.
    pub fn fail_next_publish(&self) {
        *self.shared.fail_next.lock() = Some(TransportError::Publish("injected failure".into()));
    }

    /// Make the next `count` subscribe calls fail while staying online.
    pub fn fail_subscribes(&self, count: usize) {
        self.shared.failing_subscribes.store(count, Ordering::SeqCst);
    }

    /// Tell every subscriber of `signal_id` its subscription is lost.
    pub fn drop_subscriptions(&self, signal_id: &str) {
        if let Some(mut topic) = self.shared.topics.get_mut(signal_id) {
            for (_, tx) in topic.subscribers.drain(..) {
                let _ = tx.send(SubscriptionMessage::Lost);
            }
        }
    }

    pub fn set_online(&self, online: bool) {
        self.shared.online.send_replace(online);
    }

    /// Deliver a raw frame to every subscriber of `signal_id`, bypassing
    /// the log.
    pub fn inject(&self, signal_id: &str, frame: Vec<u8>) {
        if let Some(mut topic) = self.shared.topics.get_mut(signal_id) {
            topic.broadcast(SubscriptionMessage::Frame(frame));
        }
    }

    pub fn subscribe_calls(&self) -> Vec<SubscribeCall> {
        self.shared.subscribe_calls.lock().clone()
    }

    pub fn cancellations(&self) -> usize {
        self.shared.cancellations.load(Ordering::SeqCst)
    }

    pub fn active_subscribers(&self, signal_id: &str) -> usize {
        self.shared
            .topics
            .get(signal_id)
            .map_or(0, |topic| topic.subscribers.len())
    }

    /// The server's event log for `signal_id`, oldest first.
    pub fn events(&self, signal_id: &str) -> Vec<ServerEvent> {
        let Some(topic) = self.shared.topics.get(signal_id) else {
            return Vec::new();
        };
        topic
            .log
            .iter()
            .filter_map(|(_, frame)| self.shared.codec.decode_server_event(frame).ok())
            .collect()
    }

    /// Confirmed value of one entry on the server.
    pub fn server_value(&self, signal_id: &str, entry: &EntryId) -> Option<Value> {
        let topic = self.shared.topics.get(signal_id)?;
        topic.state.value_of(entry).cloned()
    }

    /// Confirmed list item values on the server, in chain order.
    pub fn server_items(&self, signal_id: &str) -> Vec<Value> {
        let Some(topic) = self.shared.topics.get(signal_id) else {
            return Vec::new();
        };
        topic
            .state
            .items(&EntryId::root())
            .into_iter()
            .map(|item| item.value.clone())
            .collect()
    }
}

impl Default for InMemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for InMemoryTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryTransport")
            .field("codec", &self.shared.codec)
            .field("topics", &self.shared.topics.len())
            .field("online", &*self.shared.online.borrow())
            .finish()
    }
}

impl Transport for InMemoryTransport {
    fn subscribe(
        &self,
        signal_id: &str,
        last_event_id: Option<&EventId>,
    ) -> Result<Subscription, TransportError> {
        self.shared.subscribe_calls.lock().push(SubscribeCall {
            signal_id: signal_id.to_owned(),
            last_event_id: last_event_id.cloned(),
        });
        if !*self.shared.online.borrow() {
            return Err(TransportError::Subscribe("server unreachable".into()));
        }
        if self
            .shared
            .failing_subscribes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(TransportError::Subscribe("injected failure".into()));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let key = self.shared.next_subscriber.fetch_add(1, Ordering::Relaxed);
        {
            let mut guard = self.shared.topics.entry(signal_id.to_owned()).or_default();
            let topic = &mut *guard;
            match last_event_id.and_then(|id| topic.position_after(id)) {
                Some(from) => {
                    for (_, frame) in topic.log.iter().skip(from) {
                        let _ = tx.send(SubscriptionMessage::Frame(frame.clone()));
                    }
                }
                None => {
                    let event = topic.snapshot_event();
                    topic.snapshots.insert(event.id.clone(), topic.log.len());
                    match self.shared.codec.encode(&ServerEvent { event, accepted: true }) {
                        Ok(frame) => {
                            let _ = tx.send(SubscriptionMessage::Frame(frame));
                        }
                        Err(error) => {
                            return Err(TransportError::Subscribe(error.to_string()));
                        }
                    }
                }
            }
            topic.subscribers.insert(key, tx);
        }

        let shared = Arc::downgrade(&self.shared);
        let topic_id = signal_id.to_owned();
        Ok(Subscription::new(rx, move || {
            if let Some(shared) = shared.upgrade() {
                shared.cancellations.fetch_add(1, Ordering::SeqCst);
                if let Some(mut topic) = shared.topics.get_mut(&topic_id) {
                    topic.subscribers.shift_remove(&key);
                }
            }
        }))
    }

    fn publish(&self, signal_id: &str, frame: Vec<u8>) -> BoxFuture<'static, Result<(), TransportError>> {
        let shared = self.shared.clone();
        let signal_id = signal_id.to_owned();
        Box::pin(async move {
            // One scheduler hop stands in for the network.
            tokio::task::yield_now().await;

            if let Some(error) = shared.fail_next.lock().take() {
                return Err(error);
            }
            if !*shared.online.borrow() {
                return Err(TransportError::Closed);
            }
            let event = shared
                .codec
                .decode_event(&frame)
                .map_err(|error| TransportError::Publish(error.to_string()))?;

            if shared.held.load(Ordering::SeqCst) {
                shared.queued.lock().push((signal_id, event));
            } else {
                shared.process(&signal_id, event);
            }
            Ok(())
        })
    }

    fn connection_state(&self) -> watch::Receiver<bool> {
        self.shared.online.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn frame(event: &StateEvent) -> Vec<u8> {
        Codec::Json.encode_event(event).unwrap()
    }

    async fn next_event(subscription: &mut Subscription) -> ServerEvent {
        match subscription.next().await {
            Some(SubscriptionMessage::Frame(bytes)) => Codec::Json.decode_server_event(&bytes).unwrap(),
            other => panic!("expected a frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn fresh_subscription_starts_with_snapshot() {
        let transport = InMemoryTransport::new();
        transport.register("counter", EntryKind::Number, json!(7));

        let mut subscription = transport.subscribe("counter", None).unwrap();
        let first = next_event(&mut subscription).await;
        assert!(first.accepted);
        assert_eq!(first.event.op, crate::state::Operation::Snapshot { value: json!(7) });
    }

    #[tokio::test]
    async fn server_side_compare_and_set() {
        let transport = InMemoryTransport::new();
        transport.register("name", EntryKind::Value, json!("a"));
        let mut subscription = transport.subscribe("name", None).unwrap();
        let _snapshot = next_event(&mut subscription).await;

        let good = StateEvent::compare_and_set(EntryId::root(), json!("a"), json!("b"));
        let stale = StateEvent::compare_and_set(EntryId::root(), json!("a"), json!("c"));
        transport.publish("name", frame(&good)).await.unwrap();
        transport.publish("name", frame(&stale)).await.unwrap();

        assert!(next_event(&mut subscription).await.accepted);
        assert!(!next_event(&mut subscription).await.accepted);
        assert_eq!(transport.server_value("name", &EntryId::root()), Some(json!("b")));
        assert_eq!(transport.events("name").len(), 2);
    }

    #[tokio::test]
    async fn resubscribe_replays_only_newer_events() {
        let transport = InMemoryTransport::new();
        let first = StateEvent::set(EntryId::root(), json!(1));
        let second = StateEvent::set(EntryId::root(), json!(2));
        transport.apply("v", first.clone());
        transport.apply("v", second.clone());

        let mut subscription = transport.subscribe("v", Some(&first.id)).unwrap();
        assert_eq!(next_event(&mut subscription).await.event.id, second.id);

        // A snapshot id is a valid resume point too.
        let mut fresh = transport.subscribe("v", None).unwrap();
        let snapshot = next_event(&mut fresh).await;
        let third = StateEvent::set(EntryId::root(), json!(3));
        transport.apply("v", third.clone());
        let mut resumed = transport.subscribe("v", Some(&snapshot.event.id)).unwrap();
        assert_eq!(next_event(&mut resumed).await.event.id, third.id);
    }

    #[tokio::test]
    async fn fault_injection() {
        let transport = InMemoryTransport::new();
        let event = StateEvent::set(EntryId::root(), json!(1));

        transport.fail_next_publish();
        assert!(transport.publish("v", frame(&event)).await.is_err());
        assert!(transport.publish("v", frame(&event)).await.is_ok());

        transport.hold();
        transport.publish("v", frame(&StateEvent::set(EntryId::root(), json!(2)))).await.unwrap();
        assert_eq!(transport.server_value("v", &EntryId::root()), Some(json!(1)));
        assert_eq!(transport.release(), 1);
        assert_eq!(transport.server_value("v", &EntryId::root()), Some(json!(2)));

        transport.set_online(false);
        assert_eq!(transport.publish("v", frame(&event)).await, Err(TransportError::Closed));
        assert!(transport.subscribe("v", None).is_err());
    }

    #[tokio::test]
    async fn cancel_and_drop_are_recorded() {
        let transport = InMemoryTransport::new();
        let subscription = transport.subscribe("v", None).unwrap();
        let mut other = transport.subscribe("v", None).unwrap();
        assert_eq!(transport.active_subscribers("v"), 2);

        subscription.cancel();
        assert_eq!(transport.cancellations(), 1);
        assert_eq!(transport.active_subscribers("v"), 1);

        transport.drop_subscriptions("v");
        let _snapshot = next_event(&mut other).await;
        assert_eq!(other.next().await, Some(SubscriptionMessage::Lost));
        assert_eq!(transport.active_subscribers("v"), 0);
        assert_eq!(transport.subscribe_calls().len(), 2);
    }
}
