//! Variable scopes: namespaces implementing the uniform access contract.
//!
//! Three implementations exist:
//!
//! - [`SimpleVariableScope`]: the in-memory workhorse every other scope
//!   ultimately delegates to.
//! - [`LocalVariableScope`]: one namespace per live execution context.
//! - [`GlobalVariableScope`]: routes paths across multiple backing scopes
//!   by name prefix.

mod global;
mod local;
mod simple;

pub use global::GlobalVariableScope;
pub use local::LocalVariableScope;
pub use simple::{ChangeSink, SimpleVariableScope};

use crate::ctx::Ctx;
use crate::list::{Item, ListVariable};
use crate::path::VariablePath;
use crate::value::Value;
use crate::Result;

/// The uniform access contract all scopes implement.
///
/// Every operation accepts an optional execution context and must be safe
/// to call with `None` when the path contains no dynamic segments — the
/// storage monitor replays changes from other processes with no script
/// running.
///
/// Scopes perform no internal locking and are not safe for concurrent
/// mutation; the surrounding engine serializes access.
pub trait VariableScope: Send {
    /// Reads the item at `path`, or `None` if the path does not exist.
    fn get(&mut self, path: &VariablePath, ctx: Option<&Ctx>) -> Result<Option<Item>>;

    /// Writes a scalar value at `path`, creating intermediate lists on
    /// demand.
    fn set(&mut self, path: &VariablePath, ctx: Option<&Ctx>, value: Value) -> Result<()>;

    /// Appends a value to the list at `path`, creating the list if absent.
    fn append(&mut self, path: &VariablePath, ctx: Option<&Ctx>, value: Value) -> Result<()>;

    /// Deletes the variable at `path`. With `delete_list`, a whole list
    /// (and everything inside it) is removed and invalidated; without it,
    /// only a scalar is removed. Returns whether anything was removed.
    fn delete(
        &mut self,
        path: &VariablePath,
        ctx: Option<&Ctx>,
        delete_list: bool,
    ) -> Result<bool>;

    /// Merges a list into the list at `path`, creating it if absent.
    /// Entries overwrite same-named existing entries; others are kept.
    fn merge_list(
        &mut self,
        path: &VariablePath,
        ctx: Option<&Ctx>,
        list: ListVariable,
    ) -> Result<()>;

    /// Applies a change that originated in storage (initial load or a
    /// monitor poll). `None` deletes. Never notifies durable sinks — the
    /// record is already persisted wherever it came from.
    fn apply_loaded(&mut self, path: &VariablePath, value: Option<Value>) -> Result<()>;
}
