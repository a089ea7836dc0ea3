//! State events
//!
//! Every mutation of synchronized state is one [`StateEvent`] targeting a
//! single entry, optionally gated by conditions on other entries. Clients
//! publish events; the server appends them to its log, marks each as
//! accepted or rejected, and streams them back as [`ServerEvent`]s.
//!
//! # Wire Shape
//!
//! ```json
//! {"id": "01J...", "type": "set", "set": "root", "value": 3,
//!  "conditions": [{"id": "root", "value": 2}], "accepted": true}
//! ```
//!
//! `accepted` is present only on events coming back from the server.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use smallvec::SmallVec;

use super::entry::{Entry, EntryId};

/// Unique id of one event.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(String);

impl EventId {
    /// A new, globally unique, time-ordered id.
    pub fn fresh() -> Self {
        Self(ulid::Ulid::new().to_string())
    }

    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EventId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<&EventId> for EntryId {
    fn from(id: &EventId) -> Self {
        EntryId::new(id.as_str())
    }
}

/// Precondition of a conditional write: `id` must currently hold `value`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub id: EntryId,
    pub value: Value,
}

/// Where an insert lands in a list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Position {
    First,
    Last,
}

/// The mutation carried by a [`StateEvent`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Operation {
    /// Write `value` into `set`, if every condition holds.
    #[serde(rename_all = "camelCase")]
    Set {
        set: EntryId,
        value: Value,
        #[serde(default, skip_serializing_if = "SmallVec::is_empty")]
        conditions: SmallVec<[Condition; 1]>,
    },
    /// Add `delta` to a numeric entry.
    #[serde(rename_all = "camelCase")]
    Increment { entry_id: EntryId, delta: f64 },
    /// Link a new list item at one end of the list.
    ///
    /// The item is created under `entry_id`, or under the event id when
    /// absent.
    #[serde(rename_all = "camelCase")]
    Insert {
        value: Value,
        position: Position,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        entry_id: Option<EntryId>,
    },
    /// Unlink and delete a list item.
    #[serde(rename_all = "camelCase")]
    Remove { entry_id: EntryId },
    /// Replace the root value.
    Snapshot { value: Value },
    /// Replace every entry.
    ListSnapshot { entries: Vec<Entry> },
}

/// One event as published by a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateEvent {
    pub id: EventId,
    #[serde(flatten)]
    pub op: Operation,
}

impl StateEvent {
    pub fn new(op: Operation) -> Self {
        Self {
            id: EventId::fresh(),
            op,
        }
    }

    /// Unconditional write.
    pub fn set(entry: EntryId, value: Value) -> Self {
        Self::new(Operation::Set {
            set: entry,
            value,
            conditions: SmallVec::new(),
        })
    }

    /// Write gated on the entry itself still holding `expected`.
    pub fn compare_and_set(entry: EntryId, expected: Value, value: Value) -> Self {
        let mut conditions = SmallVec::new();
        conditions.push(Condition {
            id: entry.clone(),
            value: expected,
        });
        Self::new(Operation::Set {
            set: entry,
            value,
            conditions,
        })
    }

    pub fn increment(entry: EntryId, delta: f64) -> Self {
        Self::new(Operation::Increment {
            entry_id: entry,
            delta,
        })
    }

    pub fn insert(value: Value, position: Position) -> Self {
        Self::new(Operation::Insert {
            value,
            position,
            entry_id: None,
        })
    }

    pub fn remove(entry: EntryId) -> Self {
        Self::new(Operation::Remove { entry_id: entry })
    }

    pub fn snapshot(value: Value) -> Self {
        Self::new(Operation::Snapshot { value })
    }

    pub fn list_snapshot(entries: Vec<Entry>) -> Self {
        Self::new(Operation::ListSnapshot { entries })
    }

    /// Wire name of the operation, for logging.
    pub fn kind(&self) -> &'static str {
        match self.op {
            Operation::Set { .. } => "set",
            Operation::Increment { .. } => "increment",
            Operation::Insert { .. } => "insert",
            Operation::Remove { .. } => "remove",
            Operation::Snapshot { .. } => "snapshot",
            Operation::ListSnapshot { .. } => "list-snapshot",
        }
    }
}

/// An event as observed on a subscription: the original event plus the
/// server's verdict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerEvent {
    #[serde(flatten)]
    pub event: StateEvent,
    pub accepted: bool,
}
