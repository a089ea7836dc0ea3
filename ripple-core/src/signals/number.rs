use std::future::Future;
use std::ops::Deref;
use std::sync::Arc;

use super::ValueSignal;
use crate::error::SyncError;
use crate::state::{EntryKind, StateEvent};
use crate::sync::EventLogOptions;
use crate::transport::Transport;

/// A synchronized number.
///
/// Dereferences to [`ValueSignal<f64>`] for reads, `set` and
/// `compare_and_set`.
#[derive(Clone, Debug)]
pub struct NumberSignal(ValueSignal<f64>);

impl NumberSignal {
    pub fn new(signal_id: impl Into<String>, transport: Arc<dyn Transport>, options: EventLogOptions) -> Self {
        Self(ValueSignal::with_kind(signal_id, EntryKind::Number, transport, options))
    }

    /// Add `delta` through the compare-and-set path, so it orders against
    /// every other write like an `update` would.
    pub async fn increment(&self, delta: f64) -> Result<(), SyncError> {
        self.0.update(move |current| current + delta).await
    }

    /// Add `delta` as a commutative increment event.
    ///
    /// Never contends, so there is nothing to retry. Resolves `false` only
    /// if the stored value is not a number.
    pub fn add(&self, delta: f64) -> impl Future<Output = Result<bool, SyncError>> + Send + 'static {
        self.0
            .event_log()
            .publish(StateEvent::increment(self.0.id().clone(), delta), true)
    }
}

impl Deref for NumberSignal {
    type Target = ValueSignal<f64>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::EntryId;
    use crate::transport::InMemoryTransport;
    use serde_json::json;

    fn counter(transport: &InMemoryTransport) -> NumberSignal {
        transport.register("count", EntryKind::Number, json!(0));
        NumberSignal::new(
            "count",
            Arc::new(transport.clone()),
            EventLogOptions::default().with_initial_value(json!(0)),
        )
    }

    #[tokio::test]
    async fn increment_goes_through_compare_and_set() {
        let transport = InMemoryTransport::new();
        let count = counter(&transport);

        count.increment(1.0).await.unwrap();
        count.increment(2.0).await.unwrap();
        assert_eq!(count.peek(), 3.0);

        let events = transport.events("count");
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| e.event.kind() == "set"));
    }

    #[tokio::test]
    async fn add_uses_increment_events() {
        let transport = InMemoryTransport::new();
        let count = counter(&transport);

        let first = count.add(5.0);
        let second = count.add(-2.0);
        assert_eq!(count.peek(), 3.0);
        assert!(first.await.unwrap());
        assert!(second.await.unwrap());

        assert_eq!(transport.server_value("count", &EntryId::root()), Some(json!(3.0)));
        assert!(transport.events("count").iter().all(|e| e.event.kind() == "increment"));
    }
}
