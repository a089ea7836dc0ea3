//! Ripple Core
//!
//! This crate provides the client-side signal synchronization engine of the
//! Ripple reactive runtime. It keeps named values ("signals") consistent
//! with a server-authoritative, append-only event log while letting UI code
//! treat them as local reactive state.
//!
//! It implements:
//!
//! - Reactive primitives (cells, effects, batching)
//! - A layered entry model for speculative evaluation and diffing
//! - An event log with optimistic writes and reconciliation
//! - Typed value, number and list signals
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - `reactive`: Cells, effects and the notification runtime
//! - `state`: Entries, events, and the confirmed/derived state layers
//! - `sync`: The event log that reconciles local and server state
//! - `signals`: The typed public API
//! - `transport`: The transport contract and an in-memory server
//! - `codec`: JSON and MessagePack framing
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use ripple_core::signals::NumberSignal;
//! use ripple_core::state::EntryKind;
//! use ripple_core::sync::EventLogOptions;
//! use ripple_core::transport::InMemoryTransport;
//!
//! # async fn demo() -> Result<(), ripple_core::error::SyncError> {
//! let server = InMemoryTransport::new();
//! server.register("clicks", EntryKind::Number, 0.into());
//!
//! let clicks = NumberSignal::new("clicks", Arc::new(server), EventLogOptions::default());
//! let _watch = clicks.watch(|n| println!("clicks: {n}"));
//!
//! // Visible right away, confirmed once the server echoes it back.
//! clicks.increment(1.0).await?;
//! # Ok(())
//! # }
//! ```

pub mod codec;
pub mod error;
pub mod reactive;
pub mod signals;
pub mod state;
pub mod sync;
pub mod transport;

pub use codec::Codec;
pub use error::{ProtocolError, SyncError, TransportError};
pub use signals::{ListSignal, NumberSignal, SignalValue, ValueSignal, Watch};
pub use state::{Entry, EntryId, EntryKind, EventId, StateEvent};
pub use sync::{Diagnostics, EventLog, EventLogOptions};
pub use transport::{InMemoryTransport, Transport};
