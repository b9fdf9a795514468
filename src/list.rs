//! List variables: hybrid array/map containers for sub-variables.
//!
//! A list variable starts life as a plain growable array — the common case
//! of scripts appending values and reading them back by index. The first
//! write under a non-integer name, a gap, or an out-of-order index promotes
//! the list to named mode, where every entry carries an explicit name and a
//! name index is built lazily once the list is big enough (or a by-name
//! read forces it).
//!
//! Once a list is removed from its parent scope it is marked invalidated so
//! that any path still caching it as a parent falls back to a fresh walk
//! instead of mutating a detached structure.

use crate::path::PathKey;
use crate::value::Value;
use parking_lot::RwLock;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;

/// Shared handle to a list variable. Scopes hold lists through this handle
/// so that paths can cache a weak reference to their parent list.
pub type ListRef = Arc<RwLock<ListVariable>>;

/// Element count above which named mode builds its name index.
const INDEX_THRESHOLD: usize = 8;

/// One stored item: a scalar value or a nested list.
#[derive(Debug, Clone)]
pub enum Item {
    /// A scalar leaf.
    Value(Value),

    /// A nested list variable.
    List(ListRef),
}

impl Item {
    /// Creates a fresh shared list item.
    pub fn new_list() -> Self {
        Item::List(Arc::new(RwLock::new(ListVariable::new())))
    }

    /// The scalar value, if this item is one.
    pub fn as_value(&self) -> Option<&Value> {
        match self {
            Item::Value(v) => Some(v),
            Item::List(_) => None,
        }
    }

    /// The list handle, if this item is one.
    pub fn as_list(&self) -> Option<&ListRef> {
        match self {
            Item::Value(_) => None,
            Item::List(l) => Some(l),
        }
    }
}

impl From<Value> for Item {
    fn from(v: Value) -> Self {
        Item::Value(v)
    }
}

/// An immutable name/value pair inside a named-mode list.
///
/// Entries order by name (lexicographically), which is what duplicate
/// detection and the sorted-scan fast path compare by.
#[derive(Debug, Clone)]
pub struct VariableEntry {
    name: String,
    value: Item,
}

impl VariableEntry {
    /// Creates an entry.
    pub fn new(name: impl Into<String>, value: Item) -> Self {
        Self { name: name.into(), value }
    }

    /// The entry's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The entry's item.
    pub fn value(&self) -> &Item {
        &self.value
    }
}

impl PartialEq for VariableEntry {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl Eq for VariableEntry {}

impl PartialOrd for VariableEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for VariableEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.name.cmp(&other.name)
    }
}

enum Repr {
    /// Positional storage; keys are the implicit indices `0..len`.
    Array(Vec<Item>),

    /// Named storage. `index` maps name to slot and is built lazily;
    /// `sorted` tracks whether entries are in ascending name order (the
    /// small-list scan relies on it); `next_index` is the next implicit
    /// numeric name handed out by appends.
    Named {
        entries: Vec<VariableEntry>,
        index: Option<HashMap<String, usize>>,
        sorted: bool,
        next_index: usize,
    },
}

/// The value of a list-type variable: a hybrid array-or-map container.
///
/// # Example
///
/// ```rust
/// use varstore::{ListVariable, Item, Value, PathKey};
///
/// let mut list = ListVariable::new();
/// list.add(Value::from(10i64).into());
/// list.add(Value::from(20i64).into());
/// assert!(list.is_array_mode());
///
/// // A named write promotes the list; positional entries keep their
/// // implicit numeric names.
/// list.put(&PathKey::Name("label".into()), Value::from("x").into());
/// assert!(!list.is_array_mode());
/// assert!(list.get(&PathKey::Index(1)).is_some());
/// ```
pub struct ListVariable {
    repr: Repr,
    invalidated: bool,
}

impl ListVariable {
    /// Creates an empty list in array mode.
    pub fn new() -> Self {
        Self { repr: Repr::Array(Vec::new()), invalidated: false }
    }

    /// Creates a list from a sequence of positional values.
    pub fn from_values<I: IntoIterator<Item = Value>>(values: I) -> Self {
        Self {
            repr: Repr::Array(values.into_iter().map(Item::Value).collect()),
            invalidated: false,
        }
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        match &self.repr {
            Repr::Array(items) => items.len(),
            Repr::Named { entries, .. } => entries.len(),
        }
    }

    /// Whether the list has no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the list is still in positional array mode.
    pub fn is_array_mode(&self) -> bool {
        matches!(self.repr, Repr::Array(_))
    }

    /// Whether the backing array is currently in ascending key order.
    pub fn is_sorted(&self) -> bool {
        match &self.repr {
            Repr::Array(_) => true,
            Repr::Named { sorted, .. } => *sorted,
        }
    }

    /// Whether this list has been removed from its parent and must not be
    /// reused through stale caches.
    pub fn is_invalidated(&self) -> bool {
        self.invalidated
    }

    /// Marks this list, and every list nested inside it, as detached.
    /// The entries themselves are kept readable so that callers can still
    /// enumerate what was removed.
    pub fn invalidate(&mut self) {
        self.invalidated = true;
        let invalidate_item = |item: &Item| {
            if let Item::List(nested) = item {
                nested.write().invalidate();
            }
        };
        match &self.repr {
            Repr::Array(items) => items.iter().for_each(invalidate_item),
            Repr::Named { entries, .. } => {
                entries.iter().for_each(|e| invalidate_item(&e.value))
            }
        }
    }

    /// Appends an item under the next implicit numeric key and returns the
    /// name it was stored under.
    pub fn add(&mut self, value: Item) -> String {
        match &mut self.repr {
            Repr::Array(items) => {
                items.push(value);
                (items.len() - 1).to_string()
            }
            Repr::Named { next_index, .. } => {
                let name = next_index.to_string();
                *next_index += 1;
                self.append_named(name.clone(), value);
                name
            }
        }
    }

    /// Looks up an entry by key.
    ///
    /// In array mode a name key is translated to a numeric parse attempt; a
    /// non-numeric name yields `None` rather than an error. May build the
    /// name index as a side effect (which is why lookup takes `&mut self`).
    pub fn get(&mut self, key: &PathKey) -> Option<Item> {
        match &mut self.repr {
            Repr::Array(items) => match key {
                PathKey::Index(i) => items.get(*i).cloned(),
                PathKey::Name(name) => {
                    let i: usize = name.parse().ok()?;
                    items.get(i).cloned()
                }
            },
            Repr::Named { .. } => {
                let name = key.canonical();
                let slot = self.find_named(&name)?;
                match &self.repr {
                    Repr::Named { entries, .. } => Some(entries[slot].value.clone()),
                    Repr::Array(_) => unreachable!(),
                }
            }
        }
    }

    /// Writes an item under a key, returning the item it replaced (if any)
    /// so the caller can invalidate a replaced nested list.
    pub fn put(&mut self, key: &PathKey, value: Item) -> Option<Item> {
        match &mut self.repr {
            Repr::Array(items) => {
                let index = match key {
                    PathKey::Index(i) => Some(*i),
                    PathKey::Name(name) => name.parse::<usize>().ok(),
                };
                match index {
                    Some(i) if i < items.len() => {
                        Some(std::mem::replace(&mut items[i], value))
                    }
                    Some(i) if i == items.len() => {
                        items.push(value);
                        None
                    }
                    // A gap or a non-numeric name leaves array territory.
                    _ => {
                        self.promote();
                        self.put_named(key.canonical(), value)
                    }
                }
            }
            Repr::Named { .. } => self.put_named(key.canonical(), value),
        }
    }

    /// Removes an entry by key, returning the removed item. A removed
    /// nested list is invalidated. Removing anything but the final array
    /// element promotes the list first, since the remaining entries keep
    /// their names.
    pub fn remove(&mut self, key: &PathKey) -> Option<Item> {
        match &mut self.repr {
            Repr::Array(items) => {
                let index = match key {
                    PathKey::Index(i) => Some(*i),
                    PathKey::Name(name) => name.parse::<usize>().ok(),
                };
                match index {
                    Some(i) if i + 1 == items.len() => {
                        let removed = items.pop();
                        if let Some(Item::List(l)) = &removed {
                            l.write().invalidate();
                        }
                        removed
                    }
                    Some(i) if i < items.len() => {
                        self.promote();
                        self.remove_named(&key.canonical())
                    }
                    _ => None,
                }
            }
            Repr::Named { .. } => self.remove_named(&key.canonical()),
        }
    }

    /// Snapshot of `(name, item)` pairs in insertion order. Array-mode
    /// names are the implicit indices.
    pub fn entries(&self) -> Vec<(String, Item)> {
        match &self.repr {
            Repr::Array(items) => items
                .iter()
                .enumerate()
                .map(|(i, item)| (i.to_string(), item.clone()))
                .collect(),
            Repr::Named { entries, .. } => {
                entries.iter().map(|e| (e.name.clone(), e.value.clone())).collect()
            }
        }
    }

    /// Collects the flattened names of every scalar leaf under `prefix`.
    /// Used to emit one tombstone per persisted record when a whole list is
    /// deleted.
    pub fn collect_leaf_names(&self, prefix: &str, out: &mut Vec<String>) {
        for (name, item) in self.entries() {
            let full = format!("{}{}{}", prefix, crate::path::SEPARATOR, name);
            match item {
                Item::Value(_) => out.push(full),
                Item::List(nested) => nested.read().collect_leaf_names(&full, out),
            }
        }
    }

    /// Collects `(flattened name, value)` for every scalar leaf under
    /// `prefix`. Used when a whole list must be re-persisted.
    pub fn collect_leaves(&self, prefix: &str, out: &mut Vec<(String, Value)>) {
        for (name, item) in self.entries() {
            let full = format!("{}{}{}", prefix, crate::path::SEPARATOR, name);
            match item {
                Item::Value(v) => out.push((full, v)),
                Item::List(nested) => nested.read().collect_leaves(&full, out),
            }
        }
    }

    /// Converts positional storage into named storage, wrapping every
    /// existing value into an entry named after its index so iteration
    /// order and name lookups stay consistent.
    fn promote(&mut self) {
        if let Repr::Array(items) = &mut self.repr {
            let entries: Vec<VariableEntry> = std::mem::take(items)
                .into_iter()
                .enumerate()
                .map(|(i, value)| VariableEntry::new(i.to_string(), value))
                .collect();
            // "10" sorts before "2", so a promoted list of 11+ elements is
            // no longer in ascending name order.
            let sorted = entries.windows(2).all(|w| w[0] <= w[1]);
            let next_index = entries.len();
            self.repr = Repr::Named { entries, index: None, sorted, next_index };
        }
    }

    /// Finds the slot of a named entry, building the name index when the
    /// list is unsorted or past the size threshold.
    fn find_named(&mut self, name: &str) -> Option<usize> {
        let Repr::Named { entries, index, sorted, .. } = &mut self.repr else {
            return None;
        };
        if let Some(map) = index {
            return map.get(name).copied();
        }
        if *sorted && entries.len() <= INDEX_THRESHOLD {
            // Small and sorted: scan with early exit, no index needed.
            for entry in entries.iter().enumerate() {
                match entry.1.name.as_str().cmp(name) {
                    Ordering::Equal => return Some(entry.0),
                    Ordering::Greater => return None,
                    Ordering::Less => {}
                }
            }
            return None;
        }
        let map: HashMap<String, usize> =
            entries.iter().enumerate().map(|(i, e)| (e.name.clone(), i)).collect();
        let slot = map.get(name).copied();
        *index = Some(map);
        slot
    }

    fn put_named(&mut self, name: String, value: Item) -> Option<Item> {
        if let Some(slot) = self.find_named(&name) {
            // Duplicate name: overwrite the prior slot in place rather than
            // appending, so repeated writes to one key cannot grow the list.
            let Repr::Named { entries, .. } = &mut self.repr else { unreachable!() };
            let old = std::mem::replace(&mut entries[slot].value, value);
            return Some(old);
        }
        self.append_named(name, value);
        None
    }

    fn append_named(&mut self, name: String, value: Item) {
        let Repr::Named { entries, index, sorted, next_index } = &mut self.repr else {
            unreachable!("append_named on array-mode list");
        };
        if let Some(last) = entries.last() {
            if last.name.as_str() > name.as_str() {
                *sorted = false;
            }
        }
        if let Ok(n) = name.parse::<usize>() {
            if n >= *next_index {
                *next_index = n + 1;
            }
        }
        entries.push(VariableEntry::new(name.clone(), value));
        if let Some(map) = index {
            map.insert(name, entries.len() - 1);
        } else if entries.len() > INDEX_THRESHOLD {
            *index =
                Some(entries.iter().enumerate().map(|(i, e)| (e.name.clone(), i)).collect());
        }
    }

    fn remove_named(&mut self, name: &str) -> Option<Item> {
        let slot = self.find_named(name)?;
        let Repr::Named { entries, index, .. } = &mut self.repr else { unreachable!() };
        let removed = entries.remove(slot);
        // Slots shifted; rebuild the index lazily on next use.
        *index = None;
        if let Item::List(l) = &removed.value {
            l.write().invalidate();
        }
        Some(removed.value)
    }

    #[cfg(test)]
    fn has_index(&self) -> bool {
        matches!(&self.repr, Repr::Named { index: Some(_), .. })
    }
}

impl Default for ListVariable {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ListVariable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListVariable")
            .field("len", &self.len())
            .field("array_mode", &self.is_array_mode())
            .field("invalidated", &self.invalidated)
            .finish()
    }
}
