//! Per-execution-context variable namespaces.
//!
//! Each live execution context gets its own [`SimpleVariableScope`],
//! created lazily on first access and keyed by the context's identity —
//! two structurally equal contexts never share state. The dispatcher that
//! ran the context must tear its namespace down afterwards, or the table
//! grows without bound.

use crate::ctx::Ctx;
use crate::list::{Item, ListVariable};
use crate::path::VariablePath;
use crate::scope::{SimpleVariableScope, VariableScope};
use crate::value::Value;
use crate::{Error, Result};
use std::collections::HashMap;

/// Routes every operation to the namespace of the supplied execution
/// context. All operations require a context; there is no such thing as a
/// local variable without an execution to be local to.
pub struct LocalVariableScope {
    scopes: HashMap<u64, SimpleVariableScope>,
}

impl LocalVariableScope {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self { scopes: HashMap::new() }
    }

    /// Number of live context namespaces.
    pub fn context_count(&self) -> usize {
        self.scopes.len()
    }

    /// Tears down the namespace of a finished execution context. Returns
    /// whether one existed.
    pub fn remove(&mut self, ctx: &Ctx) -> bool {
        self.scopes.remove(&ctx.id()).is_some()
    }

    fn scope_for<'a>(
        &mut self,
        ctx: Option<&'a Ctx>,
    ) -> Result<(&mut SimpleVariableScope, &'a Ctx)> {
        let ctx = ctx.ok_or_else(|| {
            Error::invalid_state("local variable access requires an execution context")
        })?;
        Ok((self.scopes.entry(ctx.id()).or_default(), ctx))
    }
}

impl Default for LocalVariableScope {
    fn default() -> Self {
        Self::new()
    }
}

impl VariableScope for LocalVariableScope {
    fn get(&mut self, path: &VariablePath, ctx: Option<&Ctx>) -> Result<Option<Item>> {
        let (scope, ctx) = self.scope_for(ctx)?;
        scope.get(path, Some(ctx))
    }

    fn set(&mut self, path: &VariablePath, ctx: Option<&Ctx>, value: Value) -> Result<()> {
        let (scope, ctx) = self.scope_for(ctx)?;
        scope.set(path, Some(ctx), value)
    }

    fn append(&mut self, path: &VariablePath, ctx: Option<&Ctx>, value: Value) -> Result<()> {
        let (scope, ctx) = self.scope_for(ctx)?;
        scope.append(path, Some(ctx), value)
    }

    fn delete(
        &mut self,
        path: &VariablePath,
        ctx: Option<&Ctx>,
        delete_list: bool,
    ) -> Result<bool> {
        let (scope, ctx) = self.scope_for(ctx)?;
        scope.delete(path, Some(ctx), delete_list)
    }

    fn merge_list(
        &mut self,
        path: &VariablePath,
        ctx: Option<&Ctx>,
        list: ListVariable,
    ) -> Result<()> {
        let (scope, ctx) = self.scope_for(ctx)?;
        scope.merge_list(path, Some(ctx), list)
    }

    fn apply_loaded(&mut self, _path: &VariablePath, _value: Option<Value>) -> Result<()> {
        // Local variables are never persisted, so nothing can be loaded
        // into them.
        Err(Error::invalid_state("local scopes have no storage to load from"))
    }
}
