//! Event Log
//!
//! One [`EventLog`] mediates every read and write of one synchronized
//! signal. It owns three things:
//!
//! - the **confirmed** [`State`], built only from events the server accepted
//! - the **visual** overlay: confirmed state with every pending local event
//!   re-applied in publish order
//! - the transport subscription
//!
//! # Connection Rule
//!
//! Every entry is mirrored into a [`Cell`] whose observer hooks count
//! consumers into `subscribe_count`. An [`Effect`] evaluates
//!
//! ```text
//! subscribe_count > 0 && connection_active  =>  connect, else disconnect
//! ```
//!
//! Both transitions are idempotent. The hooks fire through
//! [`Runtime::defer`], so the counter never changes inside another
//! reactive pass.
//!
//! # Reconciliation
//!
//! For each inbound event the confirmed layer is advanced in a scratch
//! overlay. If the event was accepted, a new visual layer is derived from it
//! with the remaining pending events re-applied, diffed against the old
//! visual layer, and both layers are promoted. Only entries in the diff
//! reach the cells, inside one batch.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use indexmap::IndexMap;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use super::options::EventLogOptions;
use crate::error::SyncError;
use crate::reactive::{Cell, Effect, ObserverHooks, ReactiveContext, Runtime};
use crate::state::{
    DerivedState, Entries, Entry, EntryId, EntryKind, EventId, Overlay, ServerEvent, State, StateEvent,
    StateView,
};
use crate::transport::{Canceller, SubscriptionMessage, Transport};

/// Counters describing what an event log has seen so far.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Diagnostics {
    /// Inbound events accepted into confirmed state.
    pub applied: u64,
    /// Inbound events rejected by the server or by local evaluation.
    pub rejected: u64,
    /// Inbound frames that could not be decoded.
    pub unrecognized: u64,
    pub subscriptions_opened: u64,
    pub subscriptions_cancelled: u64,
    /// Subscribe attempts the transport refused.
    pub subscribe_failures: u64,
}

#[derive(Default)]
struct Counters {
    applied: AtomicU64,
    rejected: AtomicU64,
    unrecognized: AtomicU64,
    opened: AtomicU64,
    cancelled: AtomicU64,
    subscribe_failures: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> Diagnostics {
        Diagnostics {
            applied: self.applied.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            unrecognized: self.unrecognized.load(Ordering::Relaxed),
            subscriptions_opened: self.opened.load(Ordering::Relaxed),
            subscriptions_cancelled: self.cancelled.load(Ordering::Relaxed),
            subscribe_failures: self.subscribe_failures.load(Ordering::Relaxed),
        }
    }
}

#[derive(Default)]
struct LogState {
    confirmed: State,
    visual: Overlay,
    pending: IndexMap<EventId, StateEvent>,
    last_event: Option<EventId>,
}

impl LogState {
    /// Recompute the visual layer from confirmed state and the pending
    /// events, returning what changed.
    fn rebuild_visual(&mut self) -> Entries {
        let previous = DerivedState::with_overlay(&self.confirmed, std::mem::take(&mut self.visual));
        let mut next = DerivedState::new(&self.confirmed);
        next.evaluate_batch(self.pending.values());
        let diff = next.collect_diff(&previous);
        self.visual = next.into_overlay();
        diff
    }
}

struct Connection {
    generation: u64,
    canceller: Canceller,
    pump: JoinHandle<()>,
}

/// Keeps the consumer count raised while a publish is in flight, so the
/// confirmation has a subscription to arrive on.
struct Consumer(Cell<usize>);

impl Consumer {
    fn attach(count: &Cell<usize>) -> Self {
        let up = count.clone();
        Runtime::defer(move || up.update(|n| n + 1));
        Self(count.clone())
    }
}

impl Drop for Consumer {
    fn drop(&mut self) {
        let down = self.0.clone();
        Runtime::defer(move || down.update(|n| n.saturating_sub(1)));
    }
}

/// Owns a published event until the transport has taken it.
///
/// Dropped while still armed (the send failed, or the publish future was
/// dropped before the send completed) it withdraws the event: the
/// resolver is discarded and an eager change is rolled back.
struct PendingWrite {
    inner: Arc<Inner>,
    id: EventId,
    eager: bool,
    armed: bool,
}

impl PendingWrite {
    fn sent(mut self) {
        self.armed = false;
    }
}

impl Drop for PendingWrite {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        self.inner.pending_results.lock().remove(&self.id);
        if self.eager {
            self.inner.remove_pending_change(&self.id);
        }
        debug!(signal = %self.inner.signal_id, event = %self.id, "Publish withdrawn");
    }
}

struct Prepared {
    frame: Vec<u8>,
    confirmation: oneshot::Receiver<bool>,
    write: PendingWrite,
    _consumer: Consumer,
}

struct Inner {
    this: Weak<Inner>,
    signal_id: String,
    transport: Arc<dyn Transport>,
    options: EventLogOptions,
    state: Mutex<LogState>,
    pending_results: Mutex<HashMap<EventId, oneshot::Sender<bool>>>,
    cells: Mutex<IndexMap<EntryId, Cell<Option<Entry>>>>,
    subscribe_count: Cell<usize>,
    connection_active: Cell<bool>,
    rule: Mutex<Option<Effect>>,
    /// Serializes runs of the connection rule across threads.
    rule_gate: Mutex<()>,
    connection: Mutex<Option<Connection>>,
    generation: AtomicU64,
    health: Mutex<Option<JoinHandle<()>>>,
    counters: Counters,
}

impl Inner {
    fn new_cell(&self, id: &EntryId, entry: Option<Entry>) -> Cell<Option<Entry>> {
        let up = self.subscribe_count.clone();
        let down = self.subscribe_count.clone();
        let log = self.this.clone();
        let id = id.clone();
        Cell::with_hooks(
            entry,
            ObserverHooks::new(
                move || up.update(|n| n + 1),
                move || {
                    down.update(|n| n.saturating_sub(1));
                    if let Some(inner) = log.upgrade() {
                        inner.prune_cell(&id);
                    }
                },
            ),
        )
    }

    fn cell(&self, id: &EntryId) -> Cell<Option<Entry>> {
        if let Some(cell) = self.cells.lock().get(id) {
            return cell.clone();
        }
        let entry = self.with_visual(|view| view.entry(id).cloned());
        if entry.is_none() && !ReactiveContext::is_active() {
            // Nothing can observe it, so there is nothing to keep.
            return Cell::new(None);
        }
        self.cells
            .lock()
            .entry(id.clone())
            .or_insert_with(|| self.new_cell(id, entry))
            .clone()
    }

    /// Forget the cell of an absent entry once nobody observes it.
    fn prune_cell(&self, id: &EntryId) {
        let mut cells = self.cells.lock();
        let unused = cells
            .get(id)
            .is_some_and(|cell| cell.observer_count() == 0 && cell.get_untracked().is_none());
        if unused {
            cells.shift_remove(id);
        }
    }

    fn with_visual<R>(&self, f: impl FnOnce(&dyn StateView) -> R) -> R {
        let mut guard = self.state.lock();
        let st = &mut *guard;
        let view = DerivedState::with_overlay(&st.confirmed, std::mem::take(&mut st.visual));
        let result = f(&view);
        st.visual = view.into_overlay();
        result
    }

    fn connect(self: &Arc<Self>) {
        let mut connection = self.connection.lock();
        if connection.is_some() {
            return;
        }
        let Ok(runtime) = Handle::try_current() else {
            warn!(signal = %self.signal_id, "Cannot connect outside an async runtime");
            return;
        };

        let last_event = self.state.lock().last_event.clone();
        let subscription = match self.transport.subscribe(&self.signal_id, last_event.as_ref()) {
            Ok(subscription) => subscription,
            Err(error) => {
                Counters::bump(&self.counters.subscribe_failures);
                let retry = self.options.retry_delay;
                warn!(signal = %self.signal_id, %error, ?retry, "Subscribe failed, retrying");
                let log = Arc::downgrade(self);
                runtime.spawn(async move {
                    tokio::time::sleep(retry).await;
                    if let Some(inner) = log.upgrade() {
                        inner.rerun_rule();
                    }
                });
                return;
            }
        };

        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let (messages, canceller) = subscription.into_parts();
        let pump = runtime.spawn(pump(Arc::downgrade(self), generation, messages));
        *connection = Some(Connection {
            generation,
            canceller,
            pump,
        });
        Counters::bump(&self.counters.opened);
        debug!(
            signal = %self.signal_id,
            last_event = ?last_event.as_ref().map(EventId::as_str),
            "Connected"
        );
    }

    fn disconnect(&self) {
        let Some(mut connection) = self.connection.lock().take() else {
            return;
        };
        connection.canceller.cancel();
        connection.pump.abort();
        Counters::bump(&self.counters.cancelled);
        debug!(signal = %self.signal_id, "Disconnected");
    }

    /// Drop the connection opened as `generation`, if it is still current.
    fn release_connection(&self, generation: u64) -> bool {
        let mut slot = self.connection.lock();
        if !slot.as_ref().is_some_and(|c| c.generation == generation) {
            return false;
        }
        let Some(mut connection) = slot.take() else {
            return false;
        };
        drop(slot);
        connection.canceller.cancel();
        Counters::bump(&self.counters.cancelled);
        true
    }

    /// Answer a lost subscription by re-running the connection rule.
    fn resubscribe(&self, generation: u64) {
        if !self.release_connection(generation) {
            return;
        }
        debug!(signal = %self.signal_id, "Subscription lost, resubscribing");
        self.rerun_rule();
    }

    /// Nudge the consumer count so the connection rule runs again.
    fn rerun_rule(&self) {
        Runtime::batch(|| {
            self.subscribe_count.update(|n| n + 1);
            self.subscribe_count.update(|n| n.saturating_sub(1));
        });
    }

    fn receive(&self, frame: &[u8]) {
        match self.options.codec.decode_server_event(frame) {
            Ok(server) => self.reconcile(server.event.id.clone(), Some(server)),
            Err(error) => {
                Counters::bump(&self.counters.unrecognized);
                let id = self.options.codec.peek_event_id(frame);
                warn!(
                    signal = %self.signal_id,
                    event = ?id.as_ref().map(EventId::as_str),
                    %error,
                    "Unrecognized event treated as rejected"
                );
                if let Some(id) = id {
                    self.reconcile(id, None);
                }
            }
        }
    }

    fn reconcile(&self, id: EventId, server: Option<ServerEvent>) {
        let (accepted, diff, pending) = {
            let mut guard = self.state.lock();
            let st = &mut *guard;
            st.last_event = Some(id.clone());
            let was_pending = st.pending.shift_remove(&id).is_some();

            let mut next_confirmed = DerivedState::new(&st.confirmed);
            let accepted = match &server {
                Some(server) => server.accepted && next_confirmed.evaluate(&server.event),
                None => false,
            };

            let diff = if accepted {
                let previous = DerivedState::with_overlay(&st.confirmed, std::mem::take(&mut st.visual));
                let mut next_visual = DerivedState::new(&next_confirmed);
                next_visual.evaluate_batch(st.pending.values());
                let diff = next_visual.collect_diff(&previous);
                let visual = next_visual.into_overlay();
                let promoted = next_confirmed.into_overlay();
                st.confirmed.ingest(promoted);
                st.visual = visual;
                diff
            } else if was_pending {
                st.rebuild_visual()
            } else {
                Entries::new()
            };
            (accepted, diff, st.pending.len())
        };

        if accepted {
            Counters::bump(&self.counters.applied);
        } else {
            Counters::bump(&self.counters.rejected);
        }
        debug!(
            signal = %self.signal_id,
            event = %id,
            accepted,
            pending,
            changed = diff.len(),
            "Reconciled"
        );

        self.update_signals(diff);

        let resolver = self.pending_results.lock().remove(&id);
        if let Some(resolver) = resolver {
            let _ = resolver.send(accepted);
        }
    }

    fn add_pending_change(&self, event: &StateEvent) {
        let diff = {
            let mut guard = self.state.lock();
            let st = &mut *guard;
            st.pending.insert(event.id.clone(), event.clone());

            let mut current = DerivedState::with_overlay(&st.confirmed, std::mem::take(&mut st.visual));
            let mut step = DerivedState::new(&current);
            let diff = if step.evaluate(event) {
                step.collect_diff(&current)
            } else {
                Entries::new()
            };
            let step = step.into_overlay();
            current.ingest(step);
            st.visual = current.into_overlay();
            diff
        };
        self.update_signals(diff);
    }

    fn remove_pending_change(&self, id: &EventId) {
        let diff = {
            let mut st = self.state.lock();
            if st.pending.shift_remove(id).is_none() {
                return;
            }
            st.rebuild_visual()
        };
        self.update_signals(diff);
    }

    fn update_signals(&self, diff: Entries) {
        if diff.is_empty() {
            return;
        }
        trace!(
            signal = %self.signal_id,
            entries = ?diff.keys().map(EntryId::as_str).collect::<Vec<_>>(),
            "Propagating diff"
        );

        Runtime::batch(|| {
            let mut cells = self.cells.lock();
            for (key, entry) in diff {
                match entry {
                    Some(entry) => match cells.get(&key) {
                        Some(cell) => cell.set(Some(entry)),
                        None => {
                            let cell = self.new_cell(&key, Some(entry));
                            cells.insert(key, cell);
                        }
                    },
                    None => {
                        if let Some(cell) = cells.shift_remove(&key) {
                            cell.set(None);
                        }
                    }
                }
            }
        });
    }

    fn prepare(self: &Arc<Self>, event: &StateEvent, eager: bool) -> Result<Prepared, SyncError> {
        let frame = self.options.codec.encode_event(event)?;
        let consumer = Consumer::attach(&self.subscribe_count);
        let (tx, confirmation) = oneshot::channel();
        self.pending_results.lock().insert(event.id.clone(), tx);
        if eager {
            self.add_pending_change(event);
        }
        let write = PendingWrite {
            inner: self.clone(),
            id: event.id.clone(),
            eager,
            armed: true,
        };
        debug!(
            signal = %self.signal_id,
            event = %event.id,
            kind = event.kind(),
            eager,
            "Publishing"
        );
        Ok(Prepared {
            frame,
            confirmation,
            write,
            _consumer: consumer,
        })
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(rule) = self.rule.get_mut().take() {
            rule.dispose();
        }
        if let Some(health) = self.health.get_mut().take() {
            health.abort();
        }
        if let Some(mut connection) = self.connection.get_mut().take() {
            connection.canceller.cancel();
            connection.pump.abort();
        }
    }
}

async fn pump(
    log: Weak<Inner>,
    generation: u64,
    mut messages: mpsc::UnboundedReceiver<SubscriptionMessage>,
) {
    while let Some(message) = messages.recv().await {
        let Some(inner) = log.upgrade() else {
            return;
        };
        match message {
            SubscriptionMessage::Frame(frame) => inner.receive(&frame),
            SubscriptionMessage::Lost => {
                inner.resubscribe(generation);
                return;
            }
        }
    }
    if let Some(inner) = log.upgrade() {
        if inner.release_connection(generation) {
            debug!(signal = %inner.signal_id, "Transport hung up");
        }
    }
}

async fn watch_health(log: Weak<Inner>, mut health: watch::Receiver<bool>) {
    while health.changed().await.is_ok() {
        let online = *health.borrow_and_update();
        let Some(inner) = log.upgrade() else {
            return;
        };
        if inner.connection_active.get_untracked() != online {
            debug!(signal = %inner.signal_id, online, "Connection health changed");
            inner.connection_active.set(online);
        }
    }
}

/// Synchronizes one signal with the server's event log.
///
/// Clones share state.
#[derive(Clone)]
pub struct EventLog {
    inner: Arc<Inner>,
}

impl EventLog {
    /// Create an event log for `signal_id` whose root entry has `kind`.
    ///
    /// Nothing is subscribed until the first consumer observes an entry.
    /// Must be called inside a tokio runtime for connection health to be
    /// tracked.
    pub fn new(
        signal_id: impl Into<String>,
        kind: EntryKind,
        transport: Arc<dyn Transport>,
        options: EventLogOptions,
    ) -> Self {
        let signal_id = signal_id.into();
        let confirmed = State::with_root(kind, options.initial_value.clone());
        let root = confirmed.entry(&EntryId::root()).cloned();
        let health = transport.connection_state();
        let online = *health.borrow();

        let inner = Arc::new_cyclic(|this| Inner {
            this: this.clone(),
            signal_id,
            transport,
            options,
            state: Mutex::new(LogState {
                confirmed,
                ..LogState::default()
            }),
            pending_results: Mutex::new(HashMap::new()),
            cells: Mutex::new(IndexMap::new()),
            subscribe_count: Cell::new(0),
            connection_active: Cell::new(online),
            rule: Mutex::new(None),
            rule_gate: Mutex::new(()),
            connection: Mutex::new(None),
            generation: AtomicU64::new(0),
            health: Mutex::new(None),
            counters: Counters::default(),
        });
        let root_cell = inner.new_cell(&EntryId::root(), root);
        inner.cells.lock().insert(EntryId::root(), root_cell);

        let weak = Arc::downgrade(&inner);
        let count = inner.subscribe_count.clone();
        let active = inner.connection_active.clone();
        let rule = Effect::new(move || {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let _gate = inner.rule_gate.lock();
            let wanted = count.get() > 0 && active.get();
            // Only the two cells above may become dependencies of the rule.
            ReactiveContext::untracked(|| {
                if wanted {
                    inner.connect();
                } else {
                    inner.disconnect();
                }
            });
        });
        *inner.rule.lock() = Some(rule);

        match Handle::try_current() {
            Ok(runtime) => {
                let watcher = runtime.spawn(watch_health(Arc::downgrade(&inner), health));
                *inner.health.lock() = Some(watcher);
            }
            Err(_) => debug!(signal = %inner.signal_id, "No async runtime, health not tracked"),
        }

        debug!(signal = %inner.signal_id, ?kind, "Event log created");
        Self { inner }
    }

    pub fn signal_id(&self) -> &str {
        &self.inner.signal_id
    }

    pub fn options(&self) -> &EventLogOptions {
        &self.inner.options
    }

    /// Publish an event and resolve with the server's verdict.
    ///
    /// With `eager` the event is applied to the visual layer before this
    /// returns; a transport failure rolls it back. Everything up to the
    /// network send happens synchronously, so the optimistic value is
    /// readable as soon as `publish` returns, before the future is polled.
    ///
    /// Dropping the future before the transport has taken the event
    /// withdraws it, exactly like a failed send. Once sent, the event
    /// stays pending until the server's verdict arrives.
    pub fn publish(
        &self,
        event: StateEvent,
        eager: bool,
    ) -> impl Future<Output = Result<bool, SyncError>> + Send + 'static {
        let inner = self.inner.clone();
        let prepared = inner.prepare(&event, eager);
        async move {
            let Prepared {
                frame,
                confirmation,
                write,
                _consumer,
            } = prepared?;
            if let Some(delay) = inner.options.delay {
                tokio::time::sleep(delay).await;
            }
            if let Err(error) = inner.transport.publish(&inner.signal_id, frame).await {
                debug!(signal = %inner.signal_id, event = %write.id, %error, "Publish failed, rolling back");
                drop(write);
                return Err(error.into());
            }
            write.sent();
            confirmation.await.map_err(|_| SyncError::Closed)
        }
    }

    /// Current visual entry, tracked by any running effect.
    pub fn read(&self, id: &EntryId) -> Option<Entry> {
        self.inner.cell(id).get()
    }

    /// Current visual entry, untracked.
    pub fn entry(&self, id: &EntryId) -> Option<Entry> {
        self.inner.with_visual(|view| view.entry(id).cloned())
    }

    /// Current visual value of an entry, untracked.
    pub fn value_of(&self, id: &EntryId) -> Option<Value> {
        self.inner.with_visual(|view| view.value_of(id).cloned())
    }

    /// Visual list items under the root, untracked.
    pub fn items(&self) -> Vec<Entry> {
        self.inner.with_visual(|view| {
            view.items(&EntryId::root())
                .into_iter()
                .cloned()
                .collect()
        })
    }

    /// Confirmed value of an entry, ignoring pending writes.
    pub fn confirmed_value_of(&self, id: &EntryId) -> Option<Value> {
        self.inner.state.lock().confirmed.value_of(id).cloned()
    }

    pub fn last_event_id(&self) -> Option<EventId> {
        self.inner.state.lock().last_event.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connection.lock().is_some()
    }

    pub fn pending_count(&self) -> usize {
        self.inner.state.lock().pending.len()
    }

    /// Number of observed entry cells plus in-flight publishes.
    pub fn consumer_count(&self) -> usize {
        self.inner.subscribe_count.get_untracked()
    }

    pub fn diagnostics(&self) -> Diagnostics {
        self.inner.counters.snapshot()
    }
}

impl fmt::Debug for EventLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventLog")
            .field("signal_id", &self.inner.signal_id)
            .field("connected", &self.is_connected())
            .field("consumers", &self.consumer_count())
            .field("pending", &self.pending_count())
            .finish()
    }
}
