//! Transport abstraction
//!
//! Decouples the event log from any concrete network stack. A transport
//! moves opaque frames: the event log encodes and decodes them with its
//! [`Codec`](crate::codec::Codec).
//!
//! [`InMemoryTransport`] is an in-process authoritative server used by
//! tests and simulations.

mod memory;

pub use memory::{InMemoryTransport, SubscribeCall};

use std::fmt;

use futures_util::future::BoxFuture;
use tokio::sync::{mpsc, watch};

use crate::error::TransportError;
use crate::state::EventId;

/// What a live subscription delivers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionMessage {
    /// One encoded server event.
    Frame(Vec<u8>),
    /// The subscription is gone and should be re-established.
    Lost,
}

/// Cancels a subscription. Cancelling twice is a no-op.
pub struct Canceller(Option<Box<dyn FnOnce() + Send>>);

impl Canceller {
    pub fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self(Some(Box::new(cancel)))
    }

    pub fn cancel(&mut self) {
        if let Some(cancel) = self.0.take() {
            cancel();
        }
    }
}

impl fmt::Debug for Canceller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Canceller")
            .field("armed", &self.0.is_some())
            .finish()
    }
}

/// A live stream of server events for one signal.
#[derive(Debug)]
pub struct Subscription {
    messages: mpsc::UnboundedReceiver<SubscriptionMessage>,
    canceller: Canceller,
}

impl Subscription {
    pub fn new(
        messages: mpsc::UnboundedReceiver<SubscriptionMessage>,
        cancel: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self {
            messages,
            canceller: Canceller::new(cancel),
        }
    }

    /// Next message, or `None` once the transport hung up.
    pub async fn next(&mut self) -> Option<SubscriptionMessage> {
        self.messages.recv().await
    }

    pub fn cancel(mut self) {
        self.canceller.cancel();
    }

    /// Split into the message stream and its canceller.
    pub fn into_parts(self) -> (mpsc::UnboundedReceiver<SubscriptionMessage>, Canceller) {
        (self.messages, self.canceller)
    }
}

/// Transport layer abstraction.
///
/// Object safe, so an event log can hold any transport as
/// `Arc<dyn Transport>`.
pub trait Transport: Send + Sync + fmt::Debug + 'static {
    /// Open a subscription to `signal_id`.
    ///
    /// With `last_event_id` the server replays only later events; without
    /// it (or if the id is unknown) it starts with a snapshot.
    fn subscribe(
        &self,
        signal_id: &str,
        last_event_id: Option<&EventId>,
    ) -> Result<Subscription, TransportError>;

    /// Send one encoded event to the server.
    ///
    /// Resolves once the server has taken the event, not once it has been
    /// applied.
    fn publish(&self, signal_id: &str, frame: Vec<u8>) -> BoxFuture<'static, Result<(), TransportError>>;

    /// Connection health: `true` while the server is reachable.
    fn connection_state(&self) -> watch::Receiver<bool>;
}
