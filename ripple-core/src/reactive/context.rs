//! Reactive Context
//!
//! The reactive context tracks which computation is currently running.
//! This enables automatic dependency tracking: when a cell is read,
//! it records itself as a dependency of the current computation.
//!
//! # Implementation
//!
//! We use a thread-local stack to track the currently executing computation.
//! When entering a reactive context (e.g., running an effect), we push the
//! subscriber onto the stack. When the computation completes, we pop it.
//!
//! Unlike a plain ID list, each recorded dependency carries a weak handle to
//! its cell. The effect that owns the context uses those handles to attach
//! and detach itself, which is what drives the first-observer and
//! last-observer hooks on a cell.

use std::cell::RefCell;
use std::sync::Weak;

use super::cell::Observable;
use super::SubscriberId;

thread_local! {
    static CONTEXT_STACK: RefCell<Vec<ContextEntry>> = RefCell::new(Vec::new());
}

/// A cell read during a tracked computation.
#[derive(Clone)]
pub struct Dependency {
    /// The cell's unique ID.
    pub id: u64,
    /// Weak handle used to (un)register the observer.
    pub source: Weak<dyn Observable>,
}

impl std::fmt::Debug for Dependency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dependency").field("id", &self.id).finish()
    }
}

/// An entry in the reactive context stack.
#[derive(Debug, Clone)]
struct ContextEntry {
    subscriber_id: SubscriberId,
    /// Cells read so far, in read order. May contain repeats.
    dependencies: Vec<Dependency>,
}

/// Guard that pops the context when dropped.
///
/// This keeps the stack balanced even if the computation panics.
pub struct ReactiveContext {
    subscriber_id: SubscriberId,
}

impl ReactiveContext {
    /// Enter a new reactive context for the given subscriber.
    ///
    /// The context is exited when the returned guard is dropped.
    pub fn enter(subscriber_id: SubscriberId) -> Self {
        CONTEXT_STACK.with(|stack| {
            stack.borrow_mut().push(ContextEntry {
                subscriber_id,
                dependencies: Vec::new(),
            });
        });

        Self { subscriber_id }
    }

    /// Check if there is an active reactive context.
    pub fn is_active() -> bool {
        CONTEXT_STACK.with(|stack| !stack.borrow().is_empty())
    }

    /// Get the current subscriber ID, if any.
    pub fn current_subscriber() -> Option<SubscriberId> {
        CONTEXT_STACK.with(|stack| stack.borrow().last().map(|entry| entry.subscriber_id))
    }

    /// Record a dependency on the given cell.
    ///
    /// Called by cells when they are read.
    pub fn track_dependency(id: u64, source: Weak<dyn Observable>) {
        CONTEXT_STACK.with(|stack| {
            if let Some(entry) = stack.borrow_mut().last_mut() {
                entry.dependencies.push(Dependency { id, source });
            }
        });
    }

    /// Get the dependencies collected in the current context.
    pub fn get_dependencies() -> Vec<Dependency> {
        CONTEXT_STACK.with(|stack| {
            stack
                .borrow()
                .last()
                .map(|entry| entry.dependencies.clone())
                .unwrap_or_default()
        })
    }

    /// Run `f` with tracking suspended.
    ///
    /// Reads inside `f` do not become dependencies of the enclosing
    /// computation.
    pub fn untracked<R>(f: impl FnOnce() -> R) -> R {
        let saved = CONTEXT_STACK.with(|stack| std::mem::take(&mut *stack.borrow_mut()));
        let restore = Restore(Some(saved));
        let result = f();
        drop(restore);
        result
    }
}

struct Restore(Option<Vec<ContextEntry>>);

impl Drop for Restore {
    fn drop(&mut self) {
        if let Some(saved) = self.0.take() {
            CONTEXT_STACK.with(|stack| *stack.borrow_mut() = saved);
        }
    }
}

impl Drop for ReactiveContext {
    fn drop(&mut self) {
        CONTEXT_STACK.with(|stack| {
            let popped = stack.borrow_mut().pop();

            if let Some(entry) = popped {
                debug_assert_eq!(
                    entry.subscriber_id, self.subscriber_id,
                    "ReactiveContext mismatch: expected {:?}, got {:?}",
                    self.subscriber_id, entry.subscriber_id
                );
            }
        });
    }
}
