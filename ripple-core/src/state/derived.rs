//! Confirmed and derived state
//!
//! [`State`] is a plain entry store. [`DerivedState`] is a copy-on-write
//! overlay on top of any other [`StateView`]: reads fall through to the
//! parent unless the overlay holds its own version of an entry, and every
//! write lands in the overlay only.
//!
//! # Layering
//!
//! The event log keeps three layers alive at a time:
//!
//! ```text
//! confirmed State  <-  new confirmed overlay  <-  visual overlay
//! ```
//!
//! Overlays borrow their parent, so a long-lived layer is stored as a
//! detached [`Overlay`] and re-attached with [`DerivedState::with_overlay`].
//! Detaching and re-attaching onto a different parent is how a speculative
//! layer is re-parented once the layer below it has been promoted.
//!
//! # Evaluation Rules
//!
//! | event          | accepted when                                        |
//! |----------------|------------------------------------------------------|
//! | set            | target exists (or is root) and every condition holds |
//! | increment      | target exists and is null or numeric                 |
//! | insert         | list head exists and the new id is unused            |
//! | remove         | id is a linked list item                             |
//! | snapshot       | always                                               |
//! | list-snapshot  | always                                               |
//!
//! A rejected event leaves the overlay untouched.

use indexmap::IndexSet;
use serde_json::Value;

use super::entry::{values_equal, Entries, Entry, EntryId, EntryKind};
use super::event::{Operation, Position, StateEvent};

/// Read access shared by every state layer.
pub trait StateView {
    /// The effective entry under `id`, if it exists.
    fn entry(&self, id: &EntryId) -> Option<&Entry>;

    /// Ids of every effective entry, parents first.
    fn entry_ids(&self) -> Vec<EntryId>;

    fn value_of(&self, id: &EntryId) -> Option<&Value> {
        self.entry(id).map(|entry| &entry.value)
    }

    /// Items of the list rooted at `list`, in chain order.
    ///
    /// Stops early on a dangling link or a cycle.
    fn items(&self, list: &EntryId) -> Vec<&Entry> {
        let mut items = Vec::new();
        let Some(head) = self.entry(list) else {
            return items;
        };
        let limit = self.entry_ids().len();
        let mut cursor = head.next.as_ref();
        while let Some(id) = cursor {
            if items.len() >= limit {
                break;
            }
            let Some(item) = self.entry(id) else {
                break;
            };
            items.push(item);
            cursor = item.next.as_ref();
        }
        items
    }
}

/// Authoritative entry store.
#[derive(Debug, Clone, Default)]
pub struct State {
    entries: indexmap::IndexMap<EntryId, Entry>,
}

impl State {
    pub fn new() -> Self {
        Self::default()
    }

    /// A state holding just the root entry.
    pub fn with_root(kind: EntryKind, value: Value) -> Self {
        let mut state = Self::new();
        let root = match kind {
            EntryKind::List => Entry::list(EntryId::root()),
            kind => Entry::scalar(EntryId::root(), kind, value),
        };
        state.insert(root);
        state
    }

    pub fn insert(&mut self, entry: Entry) {
        self.entries.insert(entry.id.clone(), entry);
    }

    /// Make the overlay's changes authoritative here.
    pub fn ingest(&mut self, overlay: Overlay) {
        for (id, entry) in overlay.overrides {
            match entry {
                Some(entry) => {
                    self.entries.insert(id, entry);
                }
                None => {
                    self.entries.shift_remove(&id);
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Every entry, in insertion order.
    pub fn entries(&self) -> impl Iterator<Item = &Entry> {
        self.entries.values()
    }
}

impl StateView for State {
    fn entry(&self, id: &EntryId) -> Option<&Entry> {
        self.entries.get(id)
    }

    fn entry_ids(&self) -> Vec<EntryId> {
        self.entries.keys().cloned().collect()
    }
}

/// The owned override map of a derived layer.
///
/// `None` marks an entry deleted in this layer.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Overlay {
    overrides: Entries,
}

impl Overlay {
    pub fn is_empty(&self) -> bool {
        self.overrides.is_empty()
    }

    pub fn len(&self) -> usize {
        self.overrides.len()
    }

    pub fn changes(&self) -> &Entries {
        &self.overrides
    }
}

/// A copy-on-write layer over a parent state.
pub struct DerivedState<'p> {
    parent: &'p dyn StateView,
    overlay: Overlay,
}

impl<'p> DerivedState<'p> {
    /// An empty layer: reads exactly like `parent`.
    pub fn new(parent: &'p dyn StateView) -> Self {
        Self::with_overlay(parent, Overlay::default())
    }

    /// Attach a previously detached overlay to `parent`.
    pub fn with_overlay(parent: &'p dyn StateView, overlay: Overlay) -> Self {
        Self { parent, overlay }
    }

    /// Detach the overlay, releasing the borrow of the parent.
    pub fn into_overlay(self) -> Overlay {
        self.overlay
    }

    pub fn overlay(&self) -> &Overlay {
        &self.overlay
    }

    /// Apply one event to this layer.
    ///
    /// Returns whether the event's preconditions held. A rejected event
    /// changes nothing.
    pub fn evaluate(&mut self, event: &StateEvent) -> bool {
        match &event.op {
            Operation::Set {
                set,
                value,
                conditions,
            } => {
                let holds = conditions.iter().all(|condition| {
                    let current = self.value_of(&condition.id).unwrap_or(&Value::Null);
                    values_equal(current, &condition.value)
                });
                if !holds {
                    return false;
                }
                self.set_value(set, value.clone())
            }
            Operation::Increment { entry_id, delta } => {
                let Some(entry) = self.entry(entry_id) else {
                    return false;
                };
                let current = match &entry.value {
                    Value::Null => 0.0,
                    Value::Number(n) => match n.as_f64() {
                        Some(n) => n,
                        None => return false,
                    },
                    _ => return false,
                };
                let mut entry = entry.clone();
                entry.value = Value::from(current + delta);
                self.put(entry);
                true
            }
            Operation::Insert {
                value,
                position,
                entry_id,
            } => {
                let id = entry_id.clone().unwrap_or_else(|| EntryId::from(&event.id));
                self.insert_item(id, value.clone(), *position)
            }
            Operation::Remove { entry_id } => self.remove_item(entry_id),
            Operation::Snapshot { value } => {
                let root = EntryId::root();
                let entry = match self.entry(&root) {
                    Some(existing) => Entry {
                        value: value.clone(),
                        ..existing.clone()
                    },
                    None => Entry::scalar(root, EntryKind::Value, value.clone()),
                };
                self.put(entry);
                true
            }
            Operation::ListSnapshot { entries } => {
                let incoming: IndexSet<&EntryId> = entries.iter().map(|e| &e.id).collect();
                for id in self.entry_ids() {
                    if !incoming.contains(&id) {
                        self.delete(id);
                    }
                }
                for entry in entries {
                    self.put(entry.clone());
                }
                true
            }
        }
    }

    /// Apply events in order, each against the result of the ones before.
    ///
    /// Returns how many were accepted.
    pub fn evaluate_batch<'e>(&mut self, events: impl IntoIterator<Item = &'e StateEvent>) -> usize {
        events
            .into_iter()
            .filter(|event| self.evaluate(event))
            .count()
    }

    /// Entries whose effective value differs from `other`'s.
    ///
    /// Entries visible only in `other` come back as `None`.
    pub fn collect_diff(&self, other: &dyn StateView) -> Entries {
        let mut keys: IndexSet<EntryId> = self.entry_ids().into_iter().collect();
        keys.extend(other.entry_ids());

        let mut diff = Entries::new();
        for key in keys {
            let mine = self.entry(&key);
            let theirs = other.entry(&key);
            let changed = match (mine, theirs) {
                (Some(a), Some(b)) => !a.same_as(b),
                (None, None) => false,
                _ => true,
            };
            if changed {
                diff.insert(key, mine.cloned());
            }
        }
        diff
    }

    /// Take over another layer's changes as this layer's own.
    pub fn ingest(&mut self, other: Overlay) {
        for (id, entry) in other.overrides {
            self.overlay.overrides.insert(id, entry);
        }
    }

    fn put(&mut self, entry: Entry) {
        self.overlay.overrides.insert(entry.id.clone(), Some(entry));
    }

    fn delete(&mut self, id: EntryId) {
        self.overlay.overrides.insert(id, None);
    }

    fn set_value(&mut self, id: &EntryId, value: Value) -> bool {
        let entry = match self.entry(id) {
            Some(existing) => Entry {
                value,
                ..existing.clone()
            },
            None if id.is_root() => Entry::scalar(id.clone(), EntryKind::Value, value),
            None => return false,
        };
        self.put(entry);
        true
    }

    fn insert_item(&mut self, id: EntryId, value: Value, position: Position) -> bool {
        if self.entry(&id).is_some() {
            return false;
        }
        let Some(mut head) = self.entry(&EntryId::root()).cloned() else {
            return false;
        };

        let mut item = Entry::scalar(id.clone(), EntryKind::Value, value);
        match position {
            Position::First => {
                item.next = head.next.clone();
                match head.next.as_ref().and_then(|first| self.entry(first)).cloned() {
                    Some(mut first) => {
                        first.prev = Some(id.clone());
                        self.put(first);
                    }
                    None => head.prev = Some(id.clone()),
                }
                head.next = Some(id);
            }
            Position::Last => {
                item.prev = head.prev.clone();
                match head.prev.as_ref().and_then(|last| self.entry(last)).cloned() {
                    Some(mut last) => {
                        last.next = Some(id.clone());
                        self.put(last);
                    }
                    None => head.next = Some(id.clone()),
                }
                head.prev = Some(id);
            }
        }
        self.put(head);
        self.put(item);
        true
    }

    fn remove_item(&mut self, id: &EntryId) -> bool {
        if id.is_root() {
            return false;
        }
        let Some(item) = self.entry(id).cloned() else {
            return false;
        };
        let Some(mut head) = self.entry(&EntryId::root()).cloned() else {
            return false;
        };
        let linked = item.prev.is_some() || head.next.as_ref() == Some(id);
        if !linked {
            return false;
        }

        match item.prev.as_ref().and_then(|prev| self.entry(prev)).cloned() {
            Some(mut prev) => {
                prev.next = item.next.clone();
                self.put(prev);
            }
            None => head.next = item.next.clone(),
        }
        match item.next.as_ref().and_then(|next| self.entry(next)).cloned() {
            Some(mut next) => {
                next.prev = item.prev.clone();
                self.put(next);
            }
            None => head.prev = item.prev.clone(),
        }
        self.put(head);
        self.delete(id.clone());
        true
    }
}

impl StateView for DerivedState<'_> {
    fn entry(&self, id: &EntryId) -> Option<&Entry> {
        match self.overlay.overrides.get(id) {
            Some(local) => local.as_ref(),
            None => self.parent.entry(id),
        }
    }

    fn entry_ids(&self) -> Vec<EntryId> {
        let mut ids: Vec<EntryId> = self
            .parent
            .entry_ids()
            .into_iter()
            .filter(|id| !matches!(self.overlay.overrides.get(id), Some(None)))
            .collect();
        for (id, entry) in &self.overlay.overrides {
            if entry.is_some() && self.parent.entry(id).is_none() {
                ids.push(id.clone());
            }
        }
        ids
    }
}
