use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use serde_json::Value;
use tokio::runtime::Handle;
use tracing::{debug, warn};

use super::{decode, encode, SignalValue, Watch};
use crate::error::SyncError;
use crate::state::{EntryId, EntryKind, StateEvent};
use crate::sync::{EventLog, EventLogOptions};
use crate::transport::Transport;

/// A synchronized value of type `T`.
///
/// Writes are optimistic: the new value is visible to every reader as soon
/// as the write is issued, and is rolled back if the transport fails or the
/// server rejects it.
pub struct ValueSignal<T> {
    key: EntryId,
    log: EventLog,
    _marker: PhantomData<fn() -> T>,
}

impl<T: SignalValue> ValueSignal<T> {
    /// A standalone value signal synchronized as `signal_id`.
    pub fn new(signal_id: impl Into<String>, transport: Arc<dyn Transport>, options: EventLogOptions) -> Self {
        Self::with_kind(signal_id, EntryKind::Value, transport, options)
    }

    pub(crate) fn with_kind(
        signal_id: impl Into<String>,
        kind: EntryKind,
        transport: Arc<dyn Transport>,
        options: EventLogOptions,
    ) -> Self {
        Self::attach(EventLog::new(signal_id, kind, transport, options), EntryId::root())
    }

    /// A signal for entry `key` of an existing log.
    pub(crate) fn attach(log: EventLog, key: EntryId) -> Self {
        Self {
            key,
            log,
            _marker: PhantomData,
        }
    }

    /// The entry this signal reads and writes.
    pub fn id(&self) -> &EntryId {
        &self.key
    }

    pub fn event_log(&self) -> &EventLog {
        &self.log
    }

    /// Current value, tracked.
    pub fn value(&self) -> T {
        decode(&self.key, self.log.read(&self.key).map(|entry| entry.value))
    }

    /// Current value, untracked.
    pub fn peek(&self) -> T {
        decode(&self.key, self.log.value_of(&self.key))
    }

    /// Fire-and-forget write.
    ///
    /// The value is visible immediately; failures are logged.
    pub fn set_value(&self, value: T) {
        let Ok(runtime) = Handle::try_current() else {
            warn!(entry = %self.key, "Cannot publish outside an async runtime");
            return;
        };
        let write = self.set(value, true);
        let signal_id = self.log.signal_id().to_owned();
        let key = self.key.clone();
        runtime.spawn(async move {
            match write.await {
                Ok(true) => {}
                Ok(false) => debug!(signal = %signal_id, entry = %key, "Write rejected by server"),
                Err(error) => warn!(signal = %signal_id, entry = %key, %error, "Write failed"),
            }
        });
    }

    /// Unconditional write. Resolves with the server's verdict.
    pub fn set(&self, value: T, eager: bool) -> impl Future<Output = Result<bool, SyncError>> + Send + 'static {
        let published = encode(&value).map(|value| self.log.publish(StateEvent::set(self.key.clone(), value), eager));
        async move { published?.await }
    }

    /// Write `next` only if the signal still holds `expected`.
    ///
    /// Resolves to `false` when the condition failed, locally or on the
    /// server. That is not an error.
    pub fn compare_and_set(
        &self,
        expected: T,
        next: T,
        eager: bool,
    ) -> impl Future<Output = Result<bool, SyncError>> + Send + 'static {
        let published = encode(&expected)
            .and_then(|expected| Ok((expected, encode(&next)?)))
            .map(|(expected, next)| self.publish_compare_and_set(expected, next, eager));
        async move { published?.await }
    }

    fn publish_compare_and_set(
        &self,
        expected: Value,
        next: Value,
        eager: bool,
    ) -> impl Future<Output = Result<bool, SyncError>> + Send + 'static {
        self.log
            .publish(StateEvent::compare_and_set(self.key.clone(), expected, next), eager)
    }

    /// Replace the value with `updater(current)`, retrying on contention.
    ///
    /// Each attempt is a compare-and-set against the value the updater
    /// saw. Retries are unbounded unless the log's options set
    /// `max_update_attempts`.
    pub async fn update<F>(&self, updater: F) -> Result<(), SyncError>
    where
        F: Fn(&T) -> T,
    {
        let limit = self.log.options().max_update_attempts;
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            let raw = match self.log.value_of(&self.key) {
                Some(raw) => raw,
                None if self.key.is_root() => Value::Null,
                None => return Err(SyncError::MissingEntry(self.key.clone())),
            };
            let current: T = decode(&self.key, Some(raw.clone()));
            let next = encode(&updater(&current))?;

            if self.publish_compare_and_set(raw, next, true).await? {
                return Ok(());
            }
            if limit.is_some_and(|max| attempts >= max) {
                return Err(SyncError::Contention { attempts });
            }
            debug!(
                signal = %self.log.signal_id(),
                entry = %self.key,
                attempts,
                "Update lost a race, retrying"
            );
        }
    }

    /// Run `on_change` with the current value now and after every change.
    pub fn watch<F>(&self, on_change: F) -> Watch
    where
        F: Fn(T) + Send + Sync + 'static,
    {
        let signal = self.clone();
        Watch::new(move || on_change(signal.value()))
    }
}

impl<T> Clone for ValueSignal<T> {
    fn clone(&self) -> Self {
        Self {
            key: self.key.clone(),
            log: self.log.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T> fmt::Debug for ValueSignal<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ValueSignal")
            .field("signal", &self.log.signal_id())
            .field("entry", &self.key)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::InMemoryTransport;
    use parking_lot::Mutex;
    use serde_json::json;

    fn signal(transport: &InMemoryTransport, initial: Value) -> ValueSignal<String> {
        transport.register("name", EntryKind::Value, initial.clone());
        ValueSignal::new(
            "name",
            Arc::new(transport.clone()),
            EventLogOptions::default().with_initial_value(initial),
        )
    }

    #[tokio::test]
    async fn set_is_visible_before_confirmation() {
        let transport = InMemoryTransport::new();
        let name = signal(&transport, json!("a"));

        let write = name.set("b".to_owned(), true);
        assert_eq!(name.peek(), "b");
        assert!(write.await.unwrap());
        assert_eq!(name.peek(), "b");
        assert_eq!(transport.server_value("name", &EntryId::root()), Some(json!("b")));
    }

    #[tokio::test]
    async fn abandoned_set_leaves_no_trace() {
        let transport = InMemoryTransport::new();
        let name = signal(&transport, json!("a"));

        drop(name.set("ghost".to_owned(), true));
        for _ in 0..16 {
            tokio::task::yield_now().await;
        }

        assert_eq!(name.peek(), "a");
        assert_eq!(name.event_log().pending_count(), 0);
        assert_eq!(transport.server_value("name", &EntryId::root()), Some(json!("a")));
    }

    #[tokio::test]
    async fn lazy_set_waits_for_the_server() {
        let transport = InMemoryTransport::new();
        let name = signal(&transport, json!("a"));

        let write = name.set("b".to_owned(), false);
        assert_eq!(name.peek(), "a");
        assert!(write.await.unwrap());
        assert_eq!(name.peek(), "b");
    }

    #[tokio::test]
    async fn stale_compare_and_set_is_false() {
        let transport = InMemoryTransport::new();
        let name = signal(&transport, json!("a"));

        let accepted = name
            .compare_and_set("zzz".to_owned(), "b".to_owned(), true)
            .await
            .unwrap();
        assert!(!accepted);
        assert_eq!(name.peek(), "a");
        assert_eq!(transport.server_value("name", &EntryId::root()), Some(json!("a")));
    }

    #[tokio::test]
    async fn bounded_update_reports_contention() {
        let transport = InMemoryTransport::new();
        transport.register("n", EntryKind::Value, json!(0));
        let value: ValueSignal<i64> = ValueSignal::new(
            "n",
            Arc::new(transport.clone()),
            EventLogOptions::default()
                .with_initial_value(json!(0))
                .with_max_update_attempts(2),
        );

        // Every attempt races a write that lands first.
        let racer = transport.clone();
        let result = value
            .update(move |v| {
                racer.apply("n", StateEvent::set(EntryId::root(), json!(v + 100)));
                v + 1
            })
            .await;
        assert!(matches!(result, Err(SyncError::Contention { attempts: 2 })));
    }

    #[tokio::test]
    async fn watch_sees_every_settled_value() {
        let transport = InMemoryTransport::new();
        let name = signal(&transport, json!("a"));
        let seen = Arc::new(Mutex::new(Vec::new()));

        let s = seen.clone();
        let watch = name.watch(move |v| s.lock().push(v));
        assert!(name.event_log().is_connected());

        name.set("b".to_owned(), true).await.unwrap();
        assert_eq!(*seen.lock(), vec!["a".to_owned(), "b".to_owned()]);

        drop(watch);
        assert!(!name.event_log().is_connected());
    }

    #[tokio::test]
    async fn set_value_is_fire_and_forget() {
        let transport = InMemoryTransport::new();
        let name = signal(&transport, json!("a"));

        name.set_value("b".to_owned());
        assert_eq!(name.peek(), "b");
        for _ in 0..16 {
            tokio::task::yield_now().await;
        }
        assert_eq!(transport.server_value("name", &EntryId::root()), Some(json!("b")));
        assert_eq!(name.event_log().pending_count(), 0);
    }
}
