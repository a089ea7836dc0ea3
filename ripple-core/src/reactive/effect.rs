//! Effect Implementation
//!
//! An Effect is a side-effecting computation that runs whenever its
//! dependencies change.
//!
//! # How Effects Work
//!
//! 1. When created, the effect runs its function immediately to establish
//!    initial dependencies.
//!
//! 2. Every cell read during a run becomes a dependency. The effect attaches
//!    itself as an observer of each one.
//!
//! 3. When any dependency changes, the runtime notifies the effect and it
//!    re-runs.
//!
//! 4. After a re-run the effect diffs its old and new dependency sets. It
//!    detaches only from cells it stopped reading and attaches only to cells
//!    it started reading, so a cell it keeps reading never sees its observer
//!    count drop to zero in between. The event log relies on this: a UI
//!    effect that re-renders must not make the connection flap.
//!
//! # Use Cases
//!
//! - Re-rendering UI when a synchronized value changes
//! - Driving the event log's connect/disconnect rule
//! - Logging state changes

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use super::cell::Observable;
use super::context::ReactiveContext;
use super::runtime::Runtime;
use super::subscriber::{Subscriber, SubscriberId};

static EFFECT_ID_COUNTER: AtomicU64 = AtomicU64::new(0);

fn next_effect_id() -> u64 {
    EFFECT_ID_COUNTER.fetch_add(1, Ordering::Relaxed)
}

struct EffectInner {
    id: u64,
    subscriber_id: SubscriberId,
    run: Box<dyn Fn() + Send + Sync>,
    /// Cells this effect currently observes, keyed by cell ID.
    dependencies: Mutex<HashMap<u64, Weak<dyn Observable>>>,
    disposed: AtomicBool,
    run_count: AtomicUsize,
}

impl EffectInner {
    fn execute(self: &Arc<Self>) {
        if self.disposed.load(Ordering::SeqCst) {
            return;
        }

        let seen = Runtime::batch(|| {
            let _ctx = ReactiveContext::enter(self.subscriber_id);
            (self.run)();
            ReactiveContext::get_dependencies()
        });

        let mut current: HashMap<u64, Weak<dyn Observable>> = HashMap::new();
        for dep in seen {
            current.entry(dep.id).or_insert(dep.source);
        }

        let previous = std::mem::take(&mut *self.dependencies.lock());

        Runtime::batch(|| {
            for (id, source) in &previous {
                if !current.contains_key(id) {
                    if let Some(source) = source.upgrade() {
                        source.remove_observer(self.subscriber_id);
                    }
                }
            }
            for (id, source) in &current {
                if !previous.contains_key(id) {
                    if let Some(source) = source.upgrade() {
                        source.add_observer(self.observer());
                    }
                }
            }
        });

        *self.dependencies.lock() = current;
        self.run_count.fetch_add(1, Ordering::SeqCst);
    }

    /// The subscriber this effect registers on its dependencies.
    fn observer(self: &Arc<Self>) -> Subscriber {
        let weak = Arc::downgrade(self);
        Subscriber::with_id(self.subscriber_id, move || {
            if let Some(effect) = weak.upgrade() {
                effect.execute();
            }
        })
    }

    fn release_dependencies(&self) {
        let dependencies = std::mem::take(&mut *self.dependencies.lock());
        for source in dependencies.values() {
            if let Some(source) = source.upgrade() {
                source.remove_observer(self.subscriber_id);
            }
        }
    }
}

impl Drop for EffectInner {
    fn drop(&mut self) {
        self.release_dependencies();
    }
}

/// A side-effecting computation that runs when dependencies change.
///
/// Clones share state. The effect stays alive, and keeps observing its
/// dependencies, until it is disposed or the last clone is dropped.
///
/// # Example
///
/// ```rust
/// use ripple_core::reactive::{Cell, Effect};
///
/// let count = Cell::new(0);
/// let seen = count.clone();
/// let effect = Effect::new(move || {
///     let _ = seen.get();
/// });
///
/// count.set(5);
/// assert_eq!(effect.run_count(), 2);
/// ```
pub struct Effect {
    inner: Arc<EffectInner>,
}

impl Effect {
    /// Create a new effect and run it immediately.
    pub fn new<F>(run: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        let effect = Self::new_lazy(run);
        effect.execute();
        effect
    }

    /// Create a new effect without running it.
    ///
    /// It has no dependencies until [`execute`](Self::execute) is called.
    pub fn new_lazy<F>(run: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(EffectInner {
                id: next_effect_id(),
                subscriber_id: SubscriberId::new(),
                run: Box::new(run),
                dependencies: Mutex::new(HashMap::new()),
                disposed: AtomicBool::new(false),
                run_count: AtomicUsize::new(0),
            }),
        }
    }

    /// Get the effect's unique ID.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Get the subscriber ID for this effect.
    pub fn subscriber_id(&self) -> SubscriberId {
        self.inner.subscriber_id
    }

    /// Run the effect function and refresh its dependencies.
    pub fn execute(&self) {
        self.inner.execute();
    }

    /// Stop the effect and detach it from every dependency.
    pub fn dispose(&self) {
        self.inner.disposed.store(true, Ordering::SeqCst);
        self.inner.release_dependencies();
    }

    /// Check if the effect has been disposed.
    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::SeqCst)
    }

    /// Get the number of times the effect has run.
    pub fn run_count(&self) -> usize {
        self.inner.run_count.load(Ordering::SeqCst)
    }

    /// Get the number of distinct cells the effect observes.
    pub fn dependency_count(&self) -> usize {
        self.inner.dependencies.lock().len()
    }
}

impl Clone for Effect {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl std::fmt::Debug for Effect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Effect")
            .field("id", &self.inner.id)
            .field("run_count", &self.run_count())
            .field("dependency_count", &self.dependency_count())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
