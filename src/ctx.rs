//! Execution context handles.
//!
//! The engine itself never interprets scripts; it only needs a handle that
//! identifies one in-flight script execution. Local variables are keyed by
//! that identity, and dynamic path segments are evaluated against it.

use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_CTX_ID: AtomicU64 = AtomicU64::new(1);

/// A handle identifying one in-flight script execution.
///
/// Identity, not equality, is what matters: two contexts created separately
/// never share local variables, even if they look identical. Cloning a `Ctx`
/// clones the handle, not the execution — clones keep the same identity.
///
/// The dispatcher that created a context is responsible for calling
/// [`Variables::end_context`](crate::Variables::end_context) once the
/// execution finishes, or its local scope leaks.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Ctx {
    id: u64,
}

impl Ctx {
    /// Creates a fresh execution context with a new identity.
    pub fn new() -> Self {
        Self { id: NEXT_CTX_ID.fetch_add(1, Ordering::Relaxed) }
    }

    /// The unique identity of this context.
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Default for Ctx {
    fn default() -> Self {
        Self::new()
    }
}
