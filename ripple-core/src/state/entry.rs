//! Entries
//!
//! An entry is one synchronized value slot: the root value of a signal, or
//! one node of a list-backed signal.

use std::borrow::Borrow;
use std::fmt;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Opaque key of one entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntryId(String);

impl EntryId {
    /// Reserved id of a signal's primary value (or list head record).
    pub const ROOT: &'static str = "root";

    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn root() -> Self {
        Self(Self::ROOT.to_owned())
    }

    pub fn is_root(&self) -> bool {
        self.0 == Self::ROOT
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for EntryId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl From<&str> for EntryId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for EntryId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// What an entry holds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    /// Arbitrary JSON value.
    #[default]
    Value,
    /// Numeric value; the target of increments.
    Number,
    /// Head record of a list. `next` is the first item, `prev` the last.
    List,
}

/// One synchronized value slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Entry {
    pub id: EntryId,
    #[serde(rename = "type")]
    pub kind: EntryKind,
    #[serde(default)]
    pub value: Value,
    #[serde(default)]
    pub prev: Option<EntryId>,
    #[serde(default)]
    pub next: Option<EntryId>,
}

impl Entry {
    /// A scalar entry with no list links.
    pub fn scalar(id: EntryId, kind: EntryKind, value: Value) -> Self {
        Self {
            id,
            kind,
            value,
            prev: None,
            next: None,
        }
    }

    /// An empty list head.
    pub fn list(id: EntryId) -> Self {
        Self::scalar(id, EntryKind::List, Value::Null)
    }

    /// Whether two entries hold the same effective content.
    ///
    /// Numbers compare by value, so `1` and `1.0` are the same entry.
    pub fn same_as(&self, other: &Entry) -> bool {
        self.id == other.id
            && self.kind == other.kind
            && self.prev == other.prev
            && self.next == other.next
            && values_equal(&self.value, &other.value)
    }
}

/// Ordered `id -> entry` map.
///
/// As a snapshot every value is `Some`. As a diff, `None` marks an entry
/// deleted since the previous version.
pub type Entries = IndexMap<EntryId, Option<Entry>>;

/// JSON equality with numbers compared numerically.
pub fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_f64(), y.as_f64()) {
            (Some(x), Some(y)) => x == y,
            _ => x == y,
        },
        (Value::Array(x), Value::Array(y)) => {
            x.len() == y.len() && x.iter().zip(y).all(|(x, y)| values_equal(x, y))
        }
        (Value::Object(x), Value::Object(y)) => {
            x.len() == y.len()
                && x
                    .iter()
                    .all(|(k, v)| y.get(k).is_some_and(|w| values_equal(v, w)))
        }
        _ => a == b,
    }
}
