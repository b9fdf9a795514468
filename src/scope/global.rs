//! The prefix-routed global scope.
//!
//! Holds a default backing scope plus an ordered list of
//! `(prefix, backing scope)` entries, letting different variable name
//! prefixes be persisted by different storages. Routing is deliberately
//! **last-match-wins** over the whole entry list — a linear override, not
//! longest-prefix-wins — and tests pin that behavior.

use crate::ctx::Ctx;
use crate::list::{Item, ListVariable};
use crate::path::{PathKey, RouteSlot, VariablePath};
use crate::scope::{SimpleVariableScope, VariableScope};
use crate::value::Value;
use crate::{Error, Result};

struct RouteEntry {
    prefix: Vec<PathKey>,
    scope: Box<dyn VariableScope>,
}

/// Routes paths across multiple backing scopes by name prefix.
///
/// # Example
///
/// ```rust
/// use varstore::{GlobalVariableScope, SimpleVariableScope, VariablePath, VariableScope, Value};
///
/// let mut global = GlobalVariableScope::new();
/// global.add_route(
///     VariablePath::parse("db").unwrap(),
///     Box::new(SimpleVariableScope::new()),
/// ).unwrap();
///
/// // "db::users" routes to the added scope, everything else to the default
/// let path = VariablePath::parse("db::users").unwrap();
/// global.set(&path, None, Value::from(1i64)).unwrap();
/// ```
pub struct GlobalVariableScope {
    default_scope: Box<dyn VariableScope>,
    routes: Vec<RouteEntry>,
}

impl GlobalVariableScope {
    /// Creates a global scope with an in-memory default backing scope.
    pub fn new() -> Self {
        Self::with_default(Box::new(SimpleVariableScope::new()))
    }

    /// Creates a global scope around the given default backing scope.
    pub fn with_default(default_scope: Box<dyn VariableScope>) -> Self {
        Self { default_scope, routes: Vec::new() }
    }

    /// Replaces the default backing scope (used when a storage registers
    /// itself as the catch-all).
    pub fn set_default(&mut self, scope: Box<dyn VariableScope>) {
        self.default_scope = scope;
    }

    /// Appends a routed entry. The prefix must be fully literal. Entries
    /// added later override earlier ones for paths matching both.
    pub fn add_route(&mut self, prefix: VariablePath, scope: Box<dyn VariableScope>) -> Result<()> {
        let keys = prefix
            .resolve(None)
            .map_err(|_| Error::invalid_path("route prefixes must be literal"))?;
        self.routes.push(RouteEntry { prefix: keys, scope });
        Ok(())
    }

    /// Number of routed entries (excluding the default scope).
    pub fn route_count(&self) -> usize {
        self.routes.len()
    }

    fn prefix_matches(prefix: &[PathKey], keys: &[PathKey]) -> bool {
        prefix.len() <= keys.len()
            && prefix.iter().zip(keys).all(|(p, k)| p.same_entry(k))
    }

    fn compute_slot(&self, keys: &[PathKey]) -> RouteSlot {
        let mut slot = RouteSlot::Default;
        for (i, entry) in self.routes.iter().enumerate() {
            if Self::prefix_matches(&entry.prefix, keys) {
                slot = RouteSlot::Entry(i);
            }
        }
        slot
    }

    /// Resolves the backing scope for a path, honoring and refreshing the
    /// path's routing cache. Walks the full list and keeps the **last**
    /// entry whose prefix matches. Paths with dynamic segments resolve to
    /// different keys per context, so they are routed fresh every time.
    fn route(&mut self, path: &VariablePath, keys: &[PathKey]) -> &mut dyn VariableScope {
        let slot = if path.has_dynamic() {
            self.compute_slot(keys)
        } else {
            match path.cached_route() {
                Some(slot) => slot,
                None => {
                    let slot = self.compute_slot(keys);
                    path.cache_route(slot);
                    slot
                }
            }
        };
        match slot {
            RouteSlot::Default => self.default_scope.as_mut(),
            RouteSlot::Entry(i) => self.routes[i].scope.as_mut(),
        }
    }
}

impl Default for GlobalVariableScope {
    fn default() -> Self {
        Self::new()
    }
}

impl VariableScope for GlobalVariableScope {
    fn get(&mut self, path: &VariablePath, ctx: Option<&Ctx>) -> Result<Option<Item>> {
        let keys = path.resolve(ctx)?;
        self.route(path, &keys).get(path, ctx)
    }

    fn set(&mut self, path: &VariablePath, ctx: Option<&Ctx>, value: Value) -> Result<()> {
        let keys = path.resolve(ctx)?;
        self.route(path, &keys).set(path, ctx, value)
    }

    fn append(&mut self, path: &VariablePath, ctx: Option<&Ctx>, value: Value) -> Result<()> {
        let keys = path.resolve(ctx)?;
        self.route(path, &keys).append(path, ctx, value)
    }

    fn delete(
        &mut self,
        path: &VariablePath,
        ctx: Option<&Ctx>,
        delete_list: bool,
    ) -> Result<bool> {
        let keys = path.resolve(ctx)?;
        self.route(path, &keys).delete(path, ctx, delete_list)
    }

    fn merge_list(
        &mut self,
        path: &VariablePath,
        ctx: Option<&Ctx>,
        list: ListVariable,
    ) -> Result<()> {
        let keys = path.resolve(ctx)?;
        self.route(path, &keys).merge_list(path, ctx, list)
    }

    fn apply_loaded(&mut self, path: &VariablePath, value: Option<Value>) -> Result<()> {
        let keys = path.resolve(None)?;
        self.route(path, &keys).apply_loaded(path, value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    fn path(text: &str) -> VariablePath {
        VariablePath::parse(text).unwrap()
    }

    /// A scope that tags every change with a label so tests can see where
    /// a path was routed.
    fn tagged_scope(label: &'static str, log: &Arc<Mutex<Vec<String>>>) -> Box<dyn VariableScope> {
        let log = Arc::clone(log);
        Box::new(SimpleVariableScope::with_sink(Arc::new(move |name, _| {
            log.lock().push(format!("{}:{}", label, name));
        })))
    }

    #[test]
    fn test_default_routing() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut global = GlobalVariableScope::with_default(tagged_scope("default", &log));
        global.set(&path("anything::x"), None, Value::from(1i64)).unwrap();
        assert_eq!(log.lock().as_slice(), ["default:anything::x"]);
    }

    #[test]
    fn test_last_match_wins() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut global = GlobalVariableScope::with_default(tagged_scope("default", &log));
        // Both prefixes match "db::users::1"; the later entry must win,
        // even though the earlier one is more specific.
        global.add_route(path("db::users"), tagged_scope("first", &log)).unwrap();
        global.add_route(path("db"), tagged_scope("second", &log)).unwrap();

        global.set(&path("db::users::1"), None, Value::from(1i64)).unwrap();
        assert_eq!(log.lock().as_slice(), ["second:db::users::1"]);
    }

    #[test]
    fn test_routing_is_deterministic() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut global = GlobalVariableScope::with_default(tagged_scope("default", &log));
        global.add_route(path("a"), tagged_scope("a1", &log)).unwrap();
        global.add_route(path("a"), tagged_scope("a2", &log)).unwrap();

        for _ in 0..3 {
            // Fresh path each time: same route every time
            global.set(&path("a::k"), None, Value::from(1i64)).unwrap();
        }
        assert_eq!(log.lock().as_slice(), ["a2:a::k", "a2:a::k", "a2:a::k"]);
    }

    #[test]
    fn test_route_cache_reused() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut global = GlobalVariableScope::with_default(tagged_scope("default", &log));
        global.add_route(path("db"), tagged_scope("db", &log)).unwrap();

        let p = path("db::x");
        global.set(&p, None, Value::from(1i64)).unwrap();
        global.set(&p, None, Value::from(2i64)).unwrap();
        let entries = log.lock().clone();
        assert_eq!(entries, ["db:db::x", "db:db::x"]);
    }

    #[test]
    fn test_reads_and_writes_land_in_same_scope() {
        let mut global = GlobalVariableScope::new();
        global
            .add_route(path("db"), Box::new(SimpleVariableScope::new()))
            .unwrap();

        global.set(&path("db::x"), None, Value::from(5i64)).unwrap();
        global.set(&path("other"), None, Value::from(6i64)).unwrap();

        let got = global.get(&path("db::x"), None).unwrap().unwrap();
        assert_eq!(got.as_value(), Some(&Value::from(5i64)));
        let got = global.get(&path("other"), None).unwrap().unwrap();
        assert_eq!(got.as_value(), Some(&Value::from(6i64)));

        // The same root under the default scope is a different variable
        assert!(global.get(&path("db::x::missing"), None).unwrap().is_none());
    }

    #[test]
    fn test_dynamic_route_prefix_rejected() {
        let mut global = GlobalVariableScope::new();
        let prefix = VariablePath::from_segments(vec![crate::path::Segment::dynamic(|_| None)]);
        assert!(global.add_route(prefix, Box::new(SimpleVariableScope::new())).is_err());
    }
}
