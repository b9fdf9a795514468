//! The in-memory scope implementation.
//!
//! One hash map from root variable name to either a scalar or a list.
//! Every other scope delegates here. When the scope backs a durable
//! storage, a change sink receives each mutation as a flattened name plus
//! the new value (`None` for deletion); changes replayed *from* storage
//! bypass the sink so they are never echoed back into the write queue.

use crate::ctx::Ctx;
use crate::list::{Item, ListRef, ListVariable};
use crate::path::{join_keys, PathKey, VariablePath, SEPARATOR};
use crate::scope::VariableScope;
use crate::value::Value;
use crate::{Error, Result};
use std::collections::HashMap;
use std::sync::Arc;

/// Receives durable mutations as `(flattened name, new value)`; `None`
/// means the record was deleted.
pub type ChangeSink = Arc<dyn Fn(&str, Option<&Value>) + Send + Sync>;

/// One mutation observed while applying an operation.
type Event = (String, Option<Value>);

/// In-memory, hash-backed implementation of the scope contract.
///
/// # Example
///
/// ```rust
/// use varstore::{SimpleVariableScope, VariablePath, VariableScope, Value};
///
/// let mut scope = SimpleVariableScope::new();
/// let path = VariablePath::parse("kills::alice").unwrap();
/// scope.set(&path, None, Value::from(3i64)).unwrap();
/// let item = scope.get(&path, None).unwrap().unwrap();
/// assert_eq!(item.as_value(), Some(&Value::from(3i64)));
/// ```
pub struct SimpleVariableScope {
    vars: HashMap<String, Item>,
    sink: Option<ChangeSink>,
}

impl SimpleVariableScope {
    /// Creates an empty scope with no change sink.
    pub fn new() -> Self {
        Self { vars: HashMap::new(), sink: None }
    }

    /// Creates an empty scope whose mutations are reported to `sink`.
    pub fn with_sink(sink: ChangeSink) -> Self {
        Self { vars: HashMap::new(), sink: Some(sink) }
    }

    /// Number of root variables.
    pub fn len(&self) -> usize {
        self.vars.len()
    }

    /// Whether the scope holds no variables.
    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    fn emit(&self, events: Vec<Event>) {
        if let Some(sink) = &self.sink {
            for (name, value) in &events {
                sink(name, value.as_ref());
            }
        }
    }

    /// Walks to the parent list of the final segment without creating
    /// anything. `None` if any step is absent or not a list.
    fn walk_parent(&self, keys: &[PathKey]) -> Option<ListRef> {
        let root = keys[0].canonical();
        let mut current = match self.vars.get(&root)? {
            Item::List(l) => l.clone(),
            Item::Value(_) => return None,
        };
        for key in &keys[1..keys.len() - 1] {
            let next = current.write().get(key);
            match next {
                Some(Item::List(l)) => current = l,
                _ => return None,
            }
        }
        Some(current)
    }

    /// Walks to the parent list of the final segment, creating missing
    /// intermediate lists. A scalar mid-walk is an invariant error.
    fn walk_parent_creating(&mut self, keys: &[PathKey]) -> Result<ListRef> {
        let root = keys[0].canonical();
        let entry = self.vars.entry(root).or_insert_with(Item::new_list);
        let mut current = match entry {
            Item::List(l) => l.clone(),
            Item::Value(_) => {
                return Err(Error::not_a_list(format!(
                    "'{}' holds a value; cannot descend into '{}'",
                    keys[0],
                    join_keys(keys)
                )))
            }
        };
        for key in &keys[1..keys.len() - 1] {
            let next = {
                let mut guard = current.write();
                match guard.get(key) {
                    Some(Item::List(l)) => l,
                    Some(Item::Value(_)) => {
                        return Err(Error::not_a_list(format!(
                            "'{}' holds a value mid-way through '{}'",
                            key,
                            join_keys(keys)
                        )))
                    }
                    None => {
                        let fresh = Item::new_list();
                        let handle = fresh.as_list().expect("fresh list").clone();
                        guard.put(key, fresh);
                        handle
                    }
                }
            };
            current = next;
        }
        Ok(current)
    }

    /// Resolves the list *at* the full path (not its parent), creating it
    /// if absent. Used by append and merge.
    fn ensure_list_at(
        &mut self,
        path: &VariablePath,
        keys: &[PathKey],
        ctx: Option<&Ctx>,
    ) -> Result<ListRef> {
        if keys.len() == 1 {
            let root = keys[0].canonical();
            let entry = self.vars.entry(root).or_insert_with(Item::new_list);
            return match entry {
                Item::List(l) => Ok(l.clone()),
                Item::Value(_) => Err(Error::not_a_list(format!(
                    "'{}' holds a value, not a list",
                    keys[0]
                ))),
            };
        }
        let parent = match path.cached_parent(ctx) {
            Some(parent) => parent,
            None => {
                let parent = self.walk_parent_creating(keys)?;
                path.cache_parent(&parent, ctx);
                parent
            }
        };
        let last = keys.last().expect("non-empty path");
        let mut guard = parent.write();
        match guard.get(last) {
            Some(Item::List(l)) => Ok(l),
            Some(Item::Value(_)) => Err(Error::not_a_list(format!(
                "'{}' holds a value, not a list",
                join_keys(keys)
            ))),
            None => {
                let fresh = Item::new_list();
                let handle = fresh.as_list().expect("fresh list").clone();
                guard.put(last, fresh);
                Ok(handle)
            }
        }
    }

    /// Tombstone events for an item that just left the tree. Lists are
    /// invalidated; one event per scalar leaf is produced since only
    /// leaves have persisted records.
    fn removed_events(full_name: &str, item: &Item, events: &mut Vec<Event>) {
        match item {
            Item::Value(_) => events.push((full_name.to_string(), None)),
            Item::List(list) => {
                list.write().invalidate();
                let mut names = Vec::new();
                list.read().collect_leaf_names(full_name, &mut names);
                events.extend(names.into_iter().map(|n| (n, None)));
            }
        }
    }

    fn do_set(
        &mut self,
        path: &VariablePath,
        keys: &[PathKey],
        ctx: Option<&Ctx>,
        value: Value,
    ) -> Result<Vec<Event>> {
        let name = join_keys(keys);
        let mut events = Vec::new();
        if keys.len() == 1 {
            let root = keys[0].canonical();
            if let Some(old) = self.vars.insert(root, Item::Value(value.clone())) {
                if matches!(old, Item::List(_)) {
                    Self::removed_events(&name, &old, &mut events);
                }
            }
            events.push((name, Some(value)));
            return Ok(events);
        }
        let parent = match path.cached_parent(ctx) {
            Some(parent) => parent,
            None => {
                let parent = self.walk_parent_creating(keys)?;
                path.cache_parent(&parent, ctx);
                parent
            }
        };
        let last = keys.last().expect("non-empty path");
        let old = parent.write().put(last, Item::Value(value.clone()));
        if let Some(old @ Item::List(_)) = old {
            Self::removed_events(&name, &old, &mut events);
        }
        events.push((name, Some(value)));
        Ok(events)
    }

    fn do_delete(
        &mut self,
        path: &VariablePath,
        keys: &[PathKey],
        ctx: Option<&Ctx>,
        delete_list: bool,
    ) -> Result<(bool, Vec<Event>)> {
        let name = join_keys(keys);
        let mut events = Vec::new();
        if keys.len() == 1 {
            let root = keys[0].canonical();
            let is_list = match self.vars.get(&root) {
                None => return Ok((false, events)),
                Some(item) => matches!(item, Item::List(_)),
            };
            if is_list && !delete_list {
                return Ok((false, events));
            }
            let old = self.vars.remove(&root).expect("checked above");
            Self::removed_events(&name, &old, &mut events);
            return Ok((true, events));
        }
        let parent = match path.cached_parent(ctx) {
            Some(parent) => Some(parent),
            None => self.walk_parent(keys),
        };
        let Some(parent) = parent else { return Ok((false, events)) };
        let last = keys.last().expect("non-empty path");
        let removed = {
            let mut guard = parent.write();
            match guard.get(last) {
                None => None,
                Some(Item::List(_)) if !delete_list => return Ok((false, events)),
                Some(_) => guard.remove(last),
            }
        };
        match removed {
            Some(old) => {
                Self::removed_events(&name, &old, &mut events);
                Ok((true, events))
            }
            None => Ok((false, events)),
        }
    }

    fn do_merge(
        &mut self,
        path: &VariablePath,
        keys: &[PathKey],
        ctx: Option<&Ctx>,
        list: ListVariable,
    ) -> Result<Vec<Event>> {
        let name = join_keys(keys);
        let target = self.ensure_list_at(path, keys, ctx)?;
        let mut events = Vec::new();
        for (entry_name, item) in list.entries() {
            let full = format!("{}{}{}", name, SEPARATOR, entry_name);
            let old = target.write().put(&PathKey::Name(entry_name), item.clone());
            if let Some(old @ Item::List(_)) = old {
                Self::removed_events(&full, &old, &mut events);
            }
            match &item {
                Item::Value(v) => events.push((full, Some(v.clone()))),
                Item::List(nested) => {
                    let mut leaves = Vec::new();
                    nested.read().collect_leaves(&full, &mut leaves);
                    events.extend(leaves.into_iter().map(|(n, v)| (n, Some(v))));
                }
            }
        }
        Ok(events)
    }
}

impl Default for SimpleVariableScope {
    fn default() -> Self {
        Self::new()
    }
}

impl VariableScope for SimpleVariableScope {
    fn get(&mut self, path: &VariablePath, ctx: Option<&Ctx>) -> Result<Option<Item>> {
        let keys = path.resolve(ctx)?;
        if keys.len() == 1 {
            return Ok(self.vars.get(&keys[0].canonical()).cloned());
        }
        // Fast path: the parent list resolved last time is still valid.
        if let Some(parent) = path.cached_parent(ctx) {
            return Ok(parent.write().get(keys.last().expect("non-empty path")));
        }
        let Some(parent) = self.walk_parent(&keys) else { return Ok(None) };
        path.cache_parent(&parent, ctx);
        let result = parent.write().get(keys.last().expect("non-empty path"));
        Ok(result)
    }

    fn set(&mut self, path: &VariablePath, ctx: Option<&Ctx>, value: Value) -> Result<()> {
        let keys = path.resolve(ctx)?;
        let events = self.do_set(path, &keys, ctx, value)?;
        self.emit(events);
        Ok(())
    }

    fn append(&mut self, path: &VariablePath, ctx: Option<&Ctx>, value: Value) -> Result<()> {
        let keys = path.resolve(ctx)?;
        let list = self.ensure_list_at(path, &keys, ctx)?;
        let added = list.write().add(Item::Value(value.clone()));
        let full = format!("{}{}{}", join_keys(&keys), SEPARATOR, added);
        self.emit(vec![(full, Some(value))]);
        Ok(())
    }

    fn delete(
        &mut self,
        path: &VariablePath,
        ctx: Option<&Ctx>,
        delete_list: bool,
    ) -> Result<bool> {
        let keys = path.resolve(ctx)?;
        let (removed, events) = self.do_delete(path, &keys, ctx, delete_list)?;
        self.emit(events);
        Ok(removed)
    }

    fn merge_list(
        &mut self,
        path: &VariablePath,
        ctx: Option<&Ctx>,
        list: ListVariable,
    ) -> Result<()> {
        let keys = path.resolve(ctx)?;
        let events = self.do_merge(path, &keys, ctx, list)?;
        self.emit(events);
        Ok(())
    }

    fn apply_loaded(&mut self, path: &VariablePath, value: Option<Value>) -> Result<()> {
        let keys = path.resolve(None)?;
        let result = match value {
            Some(value) => self.do_set(path, &keys, None, value).map(|_| ()),
            None => self.do_delete(path, &keys, None, true).map(|_| ()),
        };
        match result {
            Ok(()) => Ok(()),
            // A persisted record conflicting with the in-memory shape is a
            // data error for that record only: skip it, keep loading.
            Err(Error::NotAList(msg)) => {
                log::warn!("skipping loaded variable '{}': {}", path, msg);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}
