//! Synchronization
//!
//! The [`EventLog`] keeps one signal's local state consistent with the
//! server's append-only event log: optimistic writes, reconciliation of
//! confirmed and speculative layers, and a reference-counted subscription.

mod event_log;
mod options;

pub use event_log::{Diagnostics, EventLog};
pub use options::EventLogOptions;
