use std::collections::HashSet;
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use super::{encode, SignalValue, ValueSignal, Watch};
use crate::error::SyncError;
use crate::state::{EntryId, EntryKind, Position, StateEvent};
use crate::sync::{EventLog, EventLogOptions};
use crate::transport::Transport;

/// A synchronized ordered list.
///
/// The root entry is the list head; every item is its own entry and can be
/// read and written through a [`ValueSignal`]. Reads walk the chain
/// through tracked cells, so an effect reading the list re-runs on any
/// insert, remove or item write.
pub struct ListSignal<T> {
    log: EventLog,
    _marker: PhantomData<fn() -> T>,
}

impl<T: SignalValue> ListSignal<T> {
    pub fn new(signal_id: impl Into<String>, transport: Arc<dyn Transport>, options: EventLogOptions) -> Self {
        Self {
            log: EventLog::new(signal_id, EntryKind::List, transport, options),
            _marker: PhantomData,
        }
    }

    pub fn event_log(&self) -> &EventLog {
        &self.log
    }

    /// Item signals in list order, tracked.
    pub fn items(&self) -> Vec<ValueSignal<T>> {
        let mut items = Vec::new();
        let Some(head) = self.log.read(&EntryId::root()) else {
            return items;
        };
        let mut seen = HashSet::new();
        let mut cursor = head.next;
        while let Some(id) = cursor {
            if !seen.insert(id.clone()) {
                break;
            }
            let Some(entry) = self.log.read(&id) else {
                break;
            };
            cursor = entry.next;
            items.push(ValueSignal::attach(self.log.clone(), id));
        }
        items
    }

    /// Item values in list order, tracked.
    pub fn values(&self) -> Vec<T> {
        self.items().iter().map(ValueSignal::value).collect()
    }

    pub fn len(&self) -> usize {
        self.items().len()
    }

    pub fn is_empty(&self) -> bool {
        self.log
            .read(&EntryId::root())
            .and_then(|head| head.next)
            .is_none()
    }

    pub fn insert_first(&self, value: T) -> impl Future<Output = Result<bool, SyncError>> + Send + 'static {
        self.insert(value, Position::First)
    }

    pub fn insert_last(&self, value: T) -> impl Future<Output = Result<bool, SyncError>> + Send + 'static {
        self.insert(value, Position::Last)
    }

    fn insert(&self, value: T, position: Position) -> impl Future<Output = Result<bool, SyncError>> + Send + 'static {
        let published = encode(&value).map(|value| self.log.publish(StateEvent::insert(value, position), true));
        async move { published?.await }
    }

    /// Unlink `item`. Resolves `false` if it was already gone.
    pub fn remove(&self, item: &ValueSignal<T>) -> impl Future<Output = Result<bool, SyncError>> + Send + 'static {
        self.log.publish(StateEvent::remove(item.id().clone()), true)
    }

    /// Run `on_change` with the current values now and after every change.
    pub fn watch<F>(&self, on_change: F) -> Watch
    where
        F: Fn(Vec<T>) + Send + Sync + 'static,
    {
        let list = self.clone();
        Watch::new(move || on_change(list.values()))
    }
}

impl<T> Clone for ListSignal<T> {
    fn clone(&self) -> Self {
        Self {
            log: self.log.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T> fmt::Debug for ListSignal<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListSignal")
            .field("signal", &self.log.signal_id())
            .finish()
    }
}
