//! Variable paths.
//!
//! A path is an ordered sequence of segments addressing one variable,
//! possibly nested inside list variables: `quests::alice::2`. Segments are
//! either literal (a name or an index) or dynamic — an expression evaluated
//! lazily against the execution context each time the path is resolved.
//!
//! Parsed paths are cached by the script runtime and reused across many
//! executions, so the path object itself carries two caches: the most
//! recently resolved parent list, and the resolved global routing slot.
//! Both are advisory. The parent cache is honored only while the cached
//! list reports itself non-invalidated; a list that was deleted out from
//! under the cache is discarded and the walk restarts from the root.

use crate::ctx::Ctx;
use crate::list::{ListRef, ListVariable};
use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::sync::{Arc, Weak};

/// Separator between path segments in textual form.
pub const SEPARATOR: &str = "::";

/// A concrete, fully resolved path segment: a name or a numeric index.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PathKey {
    /// A string name.
    Name(String),

    /// A non-negative numeric index.
    Index(usize),
}

impl PathKey {
    /// The canonical string form of this key (`Index(3)` and `Name("3")`
    /// address the same entry).
    pub fn canonical(&self) -> String {
        match self {
            PathKey::Name(s) => s.clone(),
            PathKey::Index(i) => i.to_string(),
        }
    }

    /// Whether two keys address the same entry.
    pub fn same_entry(&self, other: &PathKey) -> bool {
        match (self, other) {
            (PathKey::Name(a), PathKey::Name(b)) => a == b,
            (PathKey::Index(a), PathKey::Index(b)) => a == b,
            _ => self.canonical() == other.canonical(),
        }
    }

    /// Whether a path rooted at this key is execution-local.
    pub fn is_local_root(&self) -> bool {
        matches!(self, PathKey::Name(s) if s.starts_with('_'))
    }
}

impl fmt::Display for PathKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathKey::Name(s) => write!(f, "{}", s),
            PathKey::Index(i) => write!(f, "{}", i),
        }
    }
}

/// Joins resolved keys into the flattened textual name used by persistence.
pub fn join_keys(keys: &[PathKey]) -> String {
    let mut out = String::new();
    for (i, key) in keys.iter().enumerate() {
        if i > 0 {
            out.push_str(SEPARATOR);
        }
        out.push_str(&key.canonical());
    }
    out
}

/// The function type backing a dynamic segment. Evaluated once per access
/// against the supplied execution context; returning `None` is a
/// programming error and fails the whole resolution.
pub type DynamicFn = Arc<dyn Fn(&Ctx) -> Option<PathKey> + Send + Sync>;

/// One path segment: a literal key or a deferred expression.
#[derive(Clone)]
pub enum Segment {
    /// A constant name or index known at parse time.
    Literal(PathKey),

    /// An expression evaluated against the execution context at access
    /// time.
    Dynamic(DynamicFn),
}

impl Segment {
    /// A literal name segment.
    pub fn name(name: impl Into<String>) -> Self {
        Segment::Literal(PathKey::Name(name.into()))
    }

    /// A literal index segment.
    pub fn index(index: usize) -> Self {
        Segment::Literal(PathKey::Index(index))
    }

    /// A dynamic segment backed by the given expression.
    pub fn dynamic(f: impl Fn(&Ctx) -> Option<PathKey> + Send + Sync + 'static) -> Self {
        Segment::Dynamic(Arc::new(f))
    }
}

impl fmt::Debug for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Segment::Literal(key) => write!(f, "Literal({})", key),
            Segment::Dynamic(_) => write!(f, "Dynamic(..)"),
        }
    }
}

/// Where a path was last routed inside the global scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RouteSlot {
    /// Routed to the default backing scope.
    Default,
    /// Routed to the routed entry at this position.
    Entry(usize),
}

#[derive(Default)]
struct PathCache {
    parent: Option<Weak<RwLock<ListVariable>>>,
    /// Context the parent was resolved under, for context-sensitive paths.
    parent_ctx: u64,
    route: Option<RouteSlot>,
}

/// A parsed, cacheable path to one variable.
///
/// # Example
///
/// ```rust
/// use varstore::VariablePath;
///
/// let path = VariablePath::parse("quests::alice::2").unwrap();
/// assert_eq!(path.to_string(), "quests::alice::2");
/// assert!(!path.is_literal_local());
/// ```
pub struct VariablePath {
    segments: Vec<Segment>,
    /// Whether the parent list the path resolves through depends on the
    /// execution context: true for local paths (each context has its own
    /// namespace) and for paths with a dynamic non-final segment.
    ctx_sensitive: bool,
    cache: Mutex<PathCache>,
}

impl VariablePath {
    /// Parses a textual path. Segments made entirely of ASCII digits become
    /// indices; everything else is a name. Empty segments are rejected.
    pub fn parse(text: &str) -> crate::Result<Self> {
        if text.is_empty() {
            return Err(crate::Error::invalid_path("empty path"));
        }
        let mut segments = Vec::new();
        for part in text.split(SEPARATOR) {
            if part.is_empty() {
                return Err(crate::Error::invalid_path(format!(
                    "empty segment in path '{}'",
                    text
                )));
            }
            segments.push(Segment::Literal(parse_key(part)));
        }
        Ok(Self::from_segments(segments))
    }

    /// Builds a path from pre-constructed segments (used by the expression
    /// layer for paths with dynamic parts).
    pub fn from_segments(segments: Vec<Segment>) -> Self {
        debug_assert!(!segments.is_empty());
        let local_root = matches!(&segments[0], Segment::Literal(key) if key.is_local_root())
            || matches!(&segments[0], Segment::Dynamic(_));
        let dynamic_interior = segments.len() > 1
            && segments[..segments.len() - 1]
                .iter()
                .any(|s| matches!(s, Segment::Dynamic(_)));
        Self {
            segments,
            ctx_sensitive: local_root || dynamic_interior,
            cache: Mutex::new(PathCache::default()),
        }
    }

    /// Number of segments.
    pub fn len(&self) -> usize {
        self.segments.len()
    }

    /// Whether the path has no segments. Parsed paths never are.
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Whether the path's root is a literal local name (`_`-prefixed).
    /// Paths with a dynamic root answer `false` here; locality is decided
    /// from the resolved keys at access time.
    pub fn is_literal_local(&self) -> bool {
        matches!(&self.segments[0], Segment::Literal(key) if key.is_local_root())
    }

    /// Resolves every segment against the execution context.
    ///
    /// Literal segments resolve to themselves. Dynamic segments require a
    /// context and must produce a key; a dynamic segment resolving to
    /// nothing is a programming error and fails fast with
    /// [`Error::InvalidPath`](crate::Error::InvalidPath).
    pub fn resolve(&self, ctx: Option<&Ctx>) -> crate::Result<Vec<PathKey>> {
        let mut keys = Vec::with_capacity(self.segments.len());
        for (i, segment) in self.segments.iter().enumerate() {
            match segment {
                Segment::Literal(key) => keys.push(key.clone()),
                Segment::Dynamic(f) => {
                    let ctx = ctx.ok_or_else(|| {
                        crate::Error::invalid_path(format!(
                            "segment {} of '{}' is dynamic but no execution context was supplied",
                            i, self
                        ))
                    })?;
                    let key = f(ctx).ok_or_else(|| {
                        crate::Error::invalid_path(format!(
                            "segment {} of '{}' resolved to nothing",
                            i, self
                        ))
                    })?;
                    keys.push(key);
                }
            }
        }
        Ok(keys)
    }

    /// The cached parent list, if it is still alive and valid. A cached
    /// list that reports itself invalidated is discarded, never trusted.
    /// Context-sensitive paths additionally require the cache to have been
    /// filled under the same execution context.
    pub fn cached_parent(&self, ctx: Option<&Ctx>) -> Option<ListRef> {
        let mut cache = self.cache.lock();
        if self.ctx_sensitive && cache.parent_ctx != ctx.map(Ctx::id).unwrap_or(0) {
            return None;
        }
        if let Some(weak) = &cache.parent {
            if let Some(list) = weak.upgrade() {
                if !list.read().is_invalidated() {
                    return Some(list);
                }
            }
            cache.parent = None;
        }
        None
    }

    /// Remembers the parent list the final segment resolved against.
    pub fn cache_parent(&self, list: &ListRef, ctx: Option<&Ctx>) {
        let mut cache = self.cache.lock();
        cache.parent = Some(Arc::downgrade(list));
        cache.parent_ctx = ctx.map(Ctx::id).unwrap_or(0);
    }

    /// Whether any segment is dynamic. Such paths resolve to different
    /// keys per context, so per-path route caching would be wrong.
    pub(crate) fn has_dynamic(&self) -> bool {
        self.segments.iter().any(|s| matches!(s, Segment::Dynamic(_)))
    }

    pub(crate) fn cached_route(&self) -> Option<RouteSlot> {
        self.cache.lock().route
    }

    pub(crate) fn cache_route(&self, slot: RouteSlot) {
        self.cache.lock().route = Some(slot);
    }
}

impl fmt::Display for VariablePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, segment) in self.segments.iter().enumerate() {
            if i > 0 {
                write!(f, "{}", SEPARATOR)?;
            }
            match segment {
                Segment::Literal(key) => write!(f, "{}", key)?,
                Segment::Dynamic(_) => write!(f, "<dynamic>")?,
            }
        }
        Ok(())
    }
}

impl fmt::Debug for VariablePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VariablePath({})", self)
    }
}

fn parse_key(part: &str) -> PathKey {
    if !part.is_empty() && part.bytes().all(|b| b.is_ascii_digit()) {
        if let Ok(index) = part.parse::<usize>() {
            return PathKey::Index(index);
        }
    }
    PathKey::Name(part.to_string())
}
