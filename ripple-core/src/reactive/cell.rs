//! Cell Implementation
//!
//! A Cell is the observable value holder every synchronized entry is
//! mirrored into. It holds a value and tracks which subscribers depend
//! on it.
//!
//! # How Cells Work
//!
//! 1. When a cell is read inside a reactive context (an effect), the cell
//!    records itself as a dependency of that context. The effect then
//!    attaches itself as an observer.
//!
//! 2. When a cell's value changes, every observer is handed to the
//!    [`Runtime`], which notifies them right away or at the end of the
//!    current batch.
//!
//! 3. A cell may carry [`ObserverHooks`]. The first-observer hook fires when
//!    the observer set goes from empty to non-empty, the last-observer hook
//!    when it becomes empty again. Both are routed through
//!    [`Runtime::defer`], so they never run inside another pass.
//!
//! # Thread Safety
//!
//! The value sits behind a `parking_lot::RwLock` and the observer set
//! behind a `parking_lot::Mutex`. No lock is held while a callback runs.

use std::fmt::Debug;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};

use super::context::ReactiveContext;
use super::runtime::Runtime;
use super::subscriber::{Subscriber, SubscriberId};

static CELL_ID_COUNTER: AtomicU64 = AtomicU64::new(0);

fn next_cell_id() -> u64 {
    CELL_ID_COUNTER.fetch_add(1, Ordering::Relaxed)
}

/// Something observers can attach to and detach from.
///
/// Implemented by every cell regardless of its value type, so an effect
/// can hold its dependencies as one homogeneous list.
pub trait Observable: Send + Sync {
    /// Attach an observer. Re-attaching an existing ID replaces its callback.
    fn add_observer(&self, subscriber: Subscriber);

    /// Detach an observer. Unknown IDs are ignored.
    fn remove_observer(&self, id: SubscriberId);
}

/// Callbacks fired when a cell gains its first or loses its last observer.
#[derive(Clone)]
pub struct ObserverHooks {
    on_first: Arc<dyn Fn() + Send + Sync>,
    on_last: Arc<dyn Fn() + Send + Sync>,
}

impl ObserverHooks {
    pub fn new<F, L>(on_first: F, on_last: L) -> Self
    where
        F: Fn() + Send + Sync + 'static,
        L: Fn() + Send + Sync + 'static,
    {
        Self {
            on_first: Arc::new(on_first),
            on_last: Arc::new(on_last),
        }
    }
}

struct CellInner<T> {
    id: u64,
    value: RwLock<T>,
    observers: Mutex<IndexMap<SubscriberId, Subscriber>>,
    hooks: Option<ObserverHooks>,
}

impl<T> Observable for CellInner<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn add_observer(&self, subscriber: Subscriber) {
        let first = {
            let mut observers = self.observers.lock();
            let was_empty = observers.is_empty();
            observers.insert(subscriber.id(), subscriber);
            was_empty
        };

        if first {
            if let Some(hooks) = &self.hooks {
                let on_first = hooks.on_first.clone();
                Runtime::defer(move || on_first());
            }
        }
    }

    fn remove_observer(&self, id: SubscriberId) {
        let last = {
            let mut observers = self.observers.lock();
            observers.shift_remove(&id).is_some() && observers.is_empty()
        };

        if last {
            if let Some(hooks) = &self.hooks {
                let on_last = hooks.on_last.clone();
                Runtime::defer(move || on_last());
            }
        }
    }
}

/// A reactive cell holding a value of type T.
///
/// Clones share the same value and observers.
///
/// # Example
///
/// ```rust
/// use ripple_core::reactive::Cell;
///
/// let count = Cell::new(0);
/// count.set(5);
/// assert_eq!(count.get(), 5);
/// ```
pub struct Cell<T>
where
    T: Clone + Send + Sync + 'static,
{
    inner: Arc<CellInner<T>>,
}

impl<T> Cell<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Create a new cell with the given initial value.
    pub fn new(value: T) -> Self {
        Self::build(value, None)
    }

    /// Create a cell whose observer set drives the given hooks.
    pub fn with_hooks(value: T, hooks: ObserverHooks) -> Self {
        Self::build(value, Some(hooks))
    }

    fn build(value: T, hooks: Option<ObserverHooks>) -> Self {
        Self {
            inner: Arc::new(CellInner {
                id: next_cell_id(),
                value: RwLock::new(value),
                observers: Mutex::new(IndexMap::new()),
                hooks,
            }),
        }
    }

    /// Get the cell's unique ID.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Get the current value.
    ///
    /// Inside a reactive context this also records the cell as a
    /// dependency of the running computation.
    pub fn get(&self) -> T {
        if ReactiveContext::is_active() {
            ReactiveContext::track_dependency(self.inner.id, self.downgrade());
        }

        self.inner.value.read().clone()
    }

    /// Get the current value without tracking dependencies.
    pub fn get_untracked(&self) -> T {
        self.inner.value.read().clone()
    }

    /// Set a new value and notify observers.
    pub fn set(&self, value: T) {
        *self.inner.value.write() = value;
        self.notify_observers();
    }

    /// Update the value using a function of the current value.
    ///
    /// The read and the write happen under one lock, so concurrent
    /// updates from different threads never overwrite each other.
    pub fn update<F>(&self, f: F)
    where
        F: FnOnce(&T) -> T,
    {
        {
            let mut value = self.inner.value.write();
            let next = f(&*value);
            *value = next;
        }
        self.notify_observers();
    }

    /// Register a notification callback under the given subscriber ID.
    pub fn subscribe<F>(&self, subscriber_id: SubscriberId, notify: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.inner
            .add_observer(Subscriber::with_id(subscriber_id, notify));
    }

    /// Remove a subscriber.
    pub fn unsubscribe(&self, subscriber_id: SubscriberId) {
        self.inner.remove_observer(subscriber_id);
    }

    /// Get the number of observers.
    pub fn observer_count(&self) -> usize {
        self.inner.observers.lock().len()
    }

    /// Weak handle usable as an effect dependency.
    pub fn downgrade(&self) -> Weak<dyn Observable> {
        let inner: Arc<dyn Observable> = self.inner.clone();
        Arc::downgrade(&inner)
    }

    fn notify_observers(&self) {
        let observers: Vec<Subscriber> = self.inner.observers.lock().values().cloned().collect();
        if !observers.is_empty() {
            Runtime::notify(observers);
        }
    }
}

impl<T> Clone for Cell<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Debug for Cell<T>
where
    T: Clone + Send + Sync + Debug + 'static,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cell")
            .field("id", &self.inner.id)
            .field("value", &self.get_untracked())
            .field("observer_count", &self.observer_count())
            .finish()
    }
}
