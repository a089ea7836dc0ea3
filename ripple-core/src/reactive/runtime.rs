//! Reactive Runtime
//!
//! The runtime decides *when* notifications and side effects run. Cells
//! hand their subscribers to the runtime instead of calling them directly,
//! which gives us two guarantees:
//!
//! 1. Inside a batch, every subscriber is notified at most once, after the
//!    outermost batch closes. Consumers observe one settled state rather than
//!    each intermediate write.
//!
//! 2. Work passed to [`Runtime::defer`] never runs in the middle of another
//!    reactive pass. Observer hooks use this: attaching an observer while an
//!    effect recomputes its dependencies must not mutate other cells
//!    re-entrantly.
//!
//! # Thread Model
//!
//! Scheduling state is thread-local. Cells and effects are `Send + Sync` and
//! may be touched from any thread, but a batch only coalesces the writes
//! made on the thread that opened it.

use std::cell::RefCell;
use std::collections::VecDeque;

use indexmap::IndexMap;

use super::subscriber::{Subscriber, SubscriberId};

thread_local! {
    static SCHEDULER: RefCell<Scheduler> = RefCell::new(Scheduler::default());
}

#[derive(Default)]
struct Scheduler {
    /// Number of open passes (batches, effect runs, notification rounds).
    depth: usize,
    /// Set while the outermost pass drains its queues.
    flushing: bool,
    /// Subscribers waiting for the current pass to close.
    queued: IndexMap<SubscriberId, Subscriber>,
    /// Side effects waiting for the current pass to close.
    deferred: VecDeque<Box<dyn FnOnce()>>,
}

/// The reactive runtime.
///
/// Stateless handle over the thread-local scheduler.
pub struct Runtime;

/// Guard for one reactive pass. Closing the outermost pass flushes.
struct Pass;

impl Pass {
    fn enter() -> Self {
        SCHEDULER.with(|s| s.borrow_mut().depth += 1);
        Pass
    }
}

impl Drop for Pass {
    fn drop(&mut self) {
        let outermost = SCHEDULER.with(|s| {
            let mut s = s.borrow_mut();
            s.depth -= 1;
            s.depth == 0
        });
        if outermost {
            Runtime::flush();
        }
    }
}

/// Clears the flushing flag even if a subscriber panics.
struct FlushGuard;

impl Drop for FlushGuard {
    fn drop(&mut self) {
        SCHEDULER.with(|s| s.borrow_mut().flushing = false);
    }
}

impl Runtime {
    /// Run `f` as a batch.
    ///
    /// Notifications raised inside are delivered once each when the
    /// outermost batch returns.
    pub fn batch<R>(f: impl FnOnce() -> R) -> R {
        let pass = Pass::enter();
        let result = f();
        drop(pass);
        result
    }

    /// Check whether a batch or other reactive pass is open on this thread.
    pub fn is_batching() -> bool {
        SCHEDULER.with(|s| {
            let s = s.borrow();
            s.depth > 0 || s.flushing
        })
    }

    /// Run `f` once no reactive pass is in progress.
    ///
    /// Outside a pass this runs immediately.
    pub fn defer(f: impl FnOnce() + 'static) {
        let mut task: Option<Box<dyn FnOnce()>> = Some(Box::new(f));
        SCHEDULER.with(|s| {
            let mut s = s.borrow_mut();
            if s.depth > 0 || s.flushing {
                if let Some(task) = task.take() {
                    s.deferred.push_back(task);
                }
            }
        });
        if let Some(task) = task {
            task();
        }
    }

    /// Deliver a change notification to the given subscribers.
    pub fn notify(subscribers: impl IntoIterator<Item = Subscriber>) {
        let pass = Pass::enter();
        SCHEDULER.with(|s| {
            let mut s = s.borrow_mut();
            for subscriber in subscribers {
                s.queued.entry(subscriber.id()).or_insert(subscriber);
            }
        });
        drop(pass);
    }

    fn flush() {
        let already_flushing = SCHEDULER.with(|s| std::mem::replace(&mut s.borrow_mut().flushing, true));
        if already_flushing {
            return;
        }
        let _guard = FlushGuard;

        loop {
            let queued = SCHEDULER.with(|s| std::mem::take(&mut s.borrow_mut().queued));
            if !queued.is_empty() {
                let _pass = Pass::enter();
                for subscriber in queued.into_values() {
                    subscriber.notify();
                }
                continue;
            }

            let deferred = SCHEDULER.with(|s| std::mem::take(&mut s.borrow_mut().deferred));
            if !deferred.is_empty() {
                for task in deferred {
                    task();
                }
                continue;
            }

            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn counting_subscriber(count: &Arc<AtomicUsize>) -> Subscriber {
        let count = count.clone();
        Subscriber::new(move || {
            count.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn notify_outside_batch_runs_immediately() {
        let count = Arc::new(AtomicUsize::new(0));
        Runtime::notify([counting_subscriber(&count)]);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn batch_coalesces_notifications() {
        let count = Arc::new(AtomicUsize::new(0));
        let subscriber = counting_subscriber(&count);

        Runtime::batch(|| {
            Runtime::notify([subscriber.clone()]);
            Runtime::notify([subscriber.clone()]);
            Runtime::batch(|| Runtime::notify([subscriber.clone()]));
            assert_eq!(count.load(Ordering::SeqCst), 0);
        });

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn defer_waits_for_the_outermost_pass() {
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));

        let o = order.clone();
        Runtime::batch(|| {
            let inner = o.clone();
            Runtime::defer(move || inner.lock().push("deferred"));
            o.lock().push("batch body");
        });

        assert_eq!(*order.lock(), vec!["batch body", "deferred"]);
        assert!(!Runtime::is_batching());
    }

    #[test]
    fn defer_outside_pass_runs_now() {
        let ran = Arc::new(AtomicUsize::new(0));
        let r = ran.clone();
        Runtime::defer(move || {
            r.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }
}
