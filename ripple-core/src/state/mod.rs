//! Entry/State Model
//!
//! The synchronized data model: entries, the events that mutate them, and
//! the layered [`DerivedState`] used for speculative evaluation and diffing.

mod derived;
mod entry;
mod event;

pub use derived::{DerivedState, Overlay, State, StateView};
pub use entry::{values_equal, Entries, Entry, EntryId, EntryKind};
pub use event::{Condition, EventId, Operation, Position, ServerEvent, StateEvent};
