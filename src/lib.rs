//! # varstore - Hierarchical Variable Storage for Script Runtimes
//!
//! varstore is the variable engine of a scripting runtime: scripts read and
//! write variables through uniform `::`-separated path expressions, with
//! ephemeral per-execution variables and durable variables that survive
//! restarts and stay eventually consistent across processes sharing one
//! database.
//!
//! ## Architecture
//!
//! The engine consists of several key components:
//!
//! - **VariablePath**: Parsed, cacheable paths with literal and dynamic segments
//! - **ListVariable**: Hybrid array-or-map container for list variables
//! - **Scopes**: In-memory, per-execution-context, and prefix-routed global namespaces
//! - **Storages**: Pluggable SQL persistence (embedded SQLite, networked MySQL)
//!   with background write, monitor, and commit threads
//!
//! ## Example Usage
//!
//! ```rust
//! use varstore::{Ctx, Value, VariablePath, Variables};
//!
//! # fn main() -> Result<(), varstore::Error> {
//! let mut vars = Variables::new();
//!
//! // Global variables are visible to every execution
//! let path = VariablePath::parse("motd")?;
//! vars.set(&path, None, Value::from("hello"))?;
//! assert!(vars.get(&path, None)?.is_some());
//!
//! // Local variables live and die with one execution context
//! let ctx = Ctx::new();
//! let local = VariablePath::parse("_count")?;
//! vars.set(&local, Some(&ctx), Value::from(1i64))?;
//! vars.end_context(&ctx);
//!
//! vars.close()?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

// Module declarations
pub mod config;
pub mod ctx;
pub mod error;
pub mod list;
pub mod path;
pub mod scope;
pub mod serialize;
pub mod storage;
pub mod value;

// Re-exports
pub use config::{ConfigSection, StorageOptions};
pub use ctx::Ctx;
pub use error::{Error, Result};
pub use list::{Item, ListRef, ListVariable, VariableEntry};
pub use path::{PathKey, Segment, VariablePath};
pub use scope::{
    ChangeSink, GlobalVariableScope, LocalVariableScope, SimpleVariableScope, VariableScope,
};
pub use serialize::{TypeRegistry, ValueCodec};
#[cfg(feature = "mysql-backend")]
pub use storage::MySqlDialect;
#[cfg(feature = "sqlite")]
pub use storage::SqliteDialect;
pub use storage::{
    ChangeQueue, ReplaySink, SerializedVariable, SqlDialect, SqlStorage, VariablesStorage,
};
pub use value::Value;

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// State shared between the facade, the storage load path, and the monitor
/// replay callbacks.
struct Shared {
    global: Mutex<GlobalVariableScope>,
    locals: Mutex<LocalVariableScope>,
    registry: Arc<TypeRegistry>,
    /// Non-empty routed prefixes in registration order, mirroring the
    /// global scope's entries, plus the storage owning each.
    routes: Mutex<Vec<(Vec<PathKey>, Arc<str>)>>,
    /// The catch-all storage backing the default scope, if any.
    default_storage: Mutex<Option<Arc<str>>>,
    /// Write queues by storage name, for migration of loaded variables.
    queues: Mutex<HashMap<String, ChangeQueue>>,
}

impl Shared {
    /// The storage a flattened name routes to: the last registered
    /// matching prefix wins; with none, the catch-all storage.
    fn route_storage(&self, keys: &[PathKey]) -> Option<Arc<str>> {
        let routes = self.routes.lock();
        let mut target = None;
        for (prefix, storage) in routes.iter() {
            let matches = prefix.len() <= keys.len()
                && prefix.iter().zip(keys).all(|(p, k)| p.same_entry(k));
            if matches {
                target = Some(Arc::clone(storage));
            }
        }
        target.or_else(|| self.default_storage.lock().clone())
    }

    /// Applies one record arriving from storage (initial load or monitor
    /// replay). If the variable's name now routes to a different storage
    /// than the one it came from, it is persisted to its new home and
    /// deleted from the old one.
    fn load_variable(&self, name: &str, value: Option<Value>, source: &str) {
        let path = match VariablePath::parse(name) {
            Ok(path) => path,
            Err(e) => {
                log::error!("skipping persisted variable with invalid name '{}': {}", name, e);
                return;
            }
        };
        let keys = match path.resolve(None) {
            Ok(keys) => keys,
            Err(e) => {
                log::error!("skipping persisted variable '{}': {}", name, e);
                return;
            }
        };
        if keys[0].is_local_root() {
            log::warn!("skipping persisted variable '{}': local names are never durable", name);
            return;
        }
        if let Some(value) = &value {
            let target = self.route_storage(&keys);
            if target.as_deref() != Some(source) {
                let queues = self.queues.lock();
                if let Some(target) = &target {
                    if let Some(queue) = queues.get(&**target) {
                        queue.push(name, Some(value));
                    }
                }
                if let Some(queue) = queues.get(source) {
                    queue.push(name, None);
                }
                log::info!(
                    "moving variable '{}' from storage '{}' to '{}'",
                    name,
                    source,
                    target.as_deref().unwrap_or("<memory>")
                );
            }
        }
        if let Err(e) = self.global.lock().apply_loaded(&path, value) {
            log::error!("cannot apply persisted variable '{}': {}", name, e);
        }
    }
}

/// The variable engine: the explicitly owned, explicitly closed object
/// every script-facing variable access goes through.
///
/// Paths rooted at a `_`-prefixed name are execution-local and require a
/// context; everything else lives in the global scope, routed by prefix to
/// registered storages.
///
/// # Thread Safety
///
/// Operations take `&self` and serialize internally, so a `Variables` can
/// be shared across the runtime's threads behind an `Arc`.
pub struct Variables {
    shared: Arc<Shared>,
    storages: Vec<Box<dyn VariablesStorage>>,
    closed: bool,
}

impl Variables {
    /// Creates an engine with the default codec registry and no storages —
    /// all variables are in-memory until a storage is registered.
    pub fn new() -> Self {
        Self::with_registry(Arc::new(TypeRegistry::with_defaults()))
    }

    /// Creates an engine around a custom codec registry.
    pub fn with_registry(registry: Arc<TypeRegistry>) -> Self {
        Self {
            shared: Arc::new(Shared {
                global: Mutex::new(GlobalVariableScope::new()),
                locals: Mutex::new(LocalVariableScope::new()),
                registry,
                routes: Mutex::new(Vec::new()),
                default_storage: Mutex::new(None),
                queues: Mutex::new(HashMap::new()),
            }),
            storages: Vec::new(),
            closed: false,
        }
    }

    /// The codec registry storages serialize through.
    pub fn registry(&self) -> Arc<TypeRegistry> {
        Arc::clone(&self.shared.registry)
    }

    /// Registers a storage and performs its full initial load,
    /// synchronously — no variable is readable before its storage finished
    /// loading. Variables whose names match one of `prefixes` (or, with an
    /// empty prefix list, every global variable) are persisted through
    /// this storage from now on; records already persisted elsewhere are
    /// migrated on load.
    ///
    /// Registration order matters twice: a later prefix overrides earlier
    /// ones for paths matching both, and a loaded record belonging to a
    /// different storage is moved to the one its name routes to now.
    pub fn register_storage(
        &mut self,
        mut storage: Box<dyn VariablesStorage>,
        prefixes: &[&str],
    ) -> Result<()> {
        if self.closed {
            return Err(Error::invalid_state("variables engine already closed"));
        }
        let name: Arc<str> = Arc::from(storage.name());
        let queue = storage.queue();
        {
            let mut queues = self.shared.queues.lock();
            if queues.contains_key(&*name) {
                return Err(Error::config(format!("a storage named '{}' is already registered", name)));
            }
            queues.insert(name.to_string(), queue.clone());
        }

        if prefixes.is_empty() {
            let sink_queue = queue.clone();
            let scope = SimpleVariableScope::with_sink(Arc::new(move |n, v| {
                sink_queue.push(n, v);
            }));
            self.shared.global.lock().set_default(Box::new(scope));
            *self.shared.default_storage.lock() = Some(Arc::clone(&name));
        } else {
            let mut global = self.shared.global.lock();
            let mut routes = self.shared.routes.lock();
            for prefix_text in prefixes {
                let prefix = VariablePath::parse(prefix_text)?;
                let keys = prefix.resolve(None)?;
                let sink_queue = queue.clone();
                let scope = SimpleVariableScope::with_sink(Arc::new(move |n, v| {
                    sink_queue.push(n, v);
                }));
                global.add_route(prefix, Box::new(scope))?;
                routes.push((keys, Arc::clone(&name)));
            }
        }

        // Initial load, on this thread, before the scope is ready.
        let shared = Arc::clone(&self.shared);
        let source = Arc::clone(&name);
        storage.load(&mut |var_name, value| {
            shared.load_variable(var_name, value, &source);
        })?;

        // Background machinery; the replay sink feeds monitor polls back
        // through the same path as the initial load.
        let shared = Arc::clone(&self.shared);
        let source = Arc::clone(&name);
        storage.start(Arc::new(move |var_name, value| {
            shared.load_variable(var_name, value, &source);
        }))?;

        self.storages.push(storage);
        Ok(())
    }

    fn is_local(&self, path: &VariablePath, ctx: Option<&Ctx>) -> Result<bool> {
        // The common case answers without resolving dynamic segments.
        if path.is_literal_local() {
            return Ok(true);
        }
        let keys = path.resolve(ctx)?;
        Ok(keys[0].is_local_root())
    }

    /// Reads the item at `path`. Absent variables read as `None`.
    pub fn get(&self, path: &VariablePath, ctx: Option<&Ctx>) -> Result<Option<Item>> {
        if self.is_local(path, ctx)? {
            self.shared.locals.lock().get(path, ctx)
        } else {
            self.shared.global.lock().get(path, ctx)
        }
    }

    /// Reads the scalar value at `path`, if the variable exists and is not
    /// a list.
    pub fn get_value(&self, path: &VariablePath, ctx: Option<&Ctx>) -> Result<Option<Value>> {
        Ok(self.get(path, ctx)?.and_then(|item| item.as_value().cloned()))
    }

    /// Writes a scalar value at `path`. The in-memory scope is updated
    /// synchronously; the durable write, if any, is queued.
    pub fn set(&self, path: &VariablePath, ctx: Option<&Ctx>, value: Value) -> Result<()> {
        if self.is_local(path, ctx)? {
            self.shared.locals.lock().set(path, ctx, value)
        } else {
            self.shared.global.lock().set(path, ctx, value)
        }
    }

    /// Appends a value to the list at `path`, creating it if absent.
    pub fn append(&self, path: &VariablePath, ctx: Option<&Ctx>, value: Value) -> Result<()> {
        if self.is_local(path, ctx)? {
            self.shared.locals.lock().append(path, ctx, value)
        } else {
            self.shared.global.lock().append(path, ctx, value)
        }
    }

    /// Deletes the variable at `path`; see
    /// [`VariableScope::delete`](crate::scope::VariableScope::delete).
    pub fn delete(&self, path: &VariablePath, ctx: Option<&Ctx>, delete_list: bool) -> Result<bool> {
        if self.is_local(path, ctx)? {
            self.shared.locals.lock().delete(path, ctx, delete_list)
        } else {
            self.shared.global.lock().delete(path, ctx, delete_list)
        }
    }

    /// Merges a list into the list at `path`.
    pub fn merge_list(
        &self,
        path: &VariablePath,
        ctx: Option<&Ctx>,
        list: ListVariable,
    ) -> Result<()> {
        if self.is_local(path, ctx)? {
            self.shared.locals.lock().merge_list(path, ctx, list)
        } else {
            self.shared.global.lock().merge_list(path, ctx, list)
        }
    }

    /// Tears down the local namespace of a finished execution context.
    /// Every dispatcher that creates a context must call this, or its
    /// namespace leaks. Returns whether a namespace existed.
    pub fn end_context(&self, ctx: &Ctx) -> bool {
        self.shared.locals.lock().remove(ctx)
    }

    /// Number of live local namespaces (used to verify teardown).
    pub fn local_context_count(&self) -> usize {
        self.shared.locals.lock().context_count()
    }

    /// Drains every storage's write queue, stops and joins all background
    /// threads, and closes the connections.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let mut first_error = None;
        for storage in &mut self.storages {
            if let Err(e) = storage.close() {
                log::error!("[{}] close failed: {}", storage.name(), e);
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
        }
        match first_error {
            None => Ok(()),
            Some(e) => Err(e),
        }
    }
}

impl Default for Variables {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Variables {
    fn drop(&mut self) {
        // Attempt a clean shutdown; errors cannot propagate from drop.
        if !self.closed {
            if let Err(e) = self.close() {
                log::error!("error closing variables engine during drop: {}", e);
            }
        }
    }
}
