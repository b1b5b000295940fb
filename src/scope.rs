//! Alias scopes.
//!
//! A [`Scope`] maps the source names a query level uses (`"trips"`,
//! `"stops"`) to the display aliases chosen for them in the final statement.
//! Scopes are chained outward: a correlated subquery resolves a name against
//! its own level first and then against every enclosing level.
//!
//! Scopes are created by the compiler while it walks a statement and are
//! immutable once shared, so a [`Query`](crate::query::Query) produced inside
//! a callback can keep a handle to the scope it was created in without
//! pointing back at the query that owns it.

use crate::error::{RelqError, RelqResult};
use crate::schema::RelationRef;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Upper bound on candidates tried by [`fresh_alias`].
pub const MAX_ALIAS_ATTEMPTS: usize = 1000;

/// A source name bound in one scope level.
#[derive(Debug, Clone)]
pub struct Binding {
    /// Alias the source is rendered under.
    pub display: String,
    /// Relation behind the source, when it is a registered table.
    pub relation: Option<RelationRef>,
}

/// One level of the scope chain.
#[derive(Debug, Clone, Default)]
pub struct Scope {
    bindings: BTreeMap<String, Binding>,
    parent: Option<Arc<Scope>>,
}

impl Scope {
    /// Create an empty root scope.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty scope nested inside `parent`.
    pub fn child(parent: Option<Arc<Scope>>) -> Self {
        Self {
            bindings: BTreeMap::new(),
            parent,
        }
    }

    /// Bind `source` to `display` in this level.
    pub fn bind(
        &mut self,
        source: impl Into<String>,
        display: impl Into<String>,
        relation: Option<RelationRef>,
    ) {
        self.bindings.insert(
            source.into(),
            Binding {
                display: display.into(),
                relation,
            },
        );
    }

    /// Builder form of [`Scope::bind`] without a relation.
    pub fn with_alias(mut self, source: impl Into<String>, display: impl Into<String>) -> Self {
        self.bind(source, display, None);
        self
    }

    /// The enclosing scope, if any.
    pub fn parent(&self) -> Option<&Arc<Scope>> {
        self.parent.as_ref()
    }

    /// Source names bound in this level only.
    pub fn sources(&self) -> impl Iterator<Item = &str> {
        self.bindings.keys().map(String::as_str)
    }

    /// Find the innermost binding for `source`.
    pub fn lookup(&self, source: &str) -> Option<&Binding> {
        let mut current = Some(self);
        while let Some(scope) = current {
            if let Some(binding) = scope.bindings.get(source) {
                return Some(binding);
            }
            current = scope.parent.as_deref();
        }
        None
    }

    /// Whether `source` is bound anywhere in the chain.
    pub fn is_bound(&self, source: &str) -> bool {
        self.lookup(source).is_some()
    }

    /// Resolve `source` to its display alias.
    pub fn resolve(&self, source: &str) -> RelqResult<&str> {
        self.lookup(source)
            .map(|binding| binding.display.as_str())
            .ok_or_else(|| RelqError::unresolved(source))
    }

    /// Every display alias in the chain, innermost level first.
    pub fn display_aliases(&self) -> Vec<String> {
        let mut aliases = Vec::new();
        let mut current = Some(self);
        while let Some(scope) = current {
            aliases.extend(scope.bindings.values().map(|b| b.display.clone()));
            current = scope.parent.as_deref();
        }
        aliases
    }
}

/// Pick an alias derived from `base` that `is_taken` rejects.
///
/// `base` itself is tried first, then `base_0`, `base_1`, ... up to
/// [`MAX_ALIAS_ATTEMPTS`] candidates.
pub fn fresh_alias(base: &str, is_taken: impl Fn(&str) -> bool) -> RelqResult<String> {
    if !is_taken(base) {
        return Ok(base.to_string());
    }
    for i in 0..MAX_ALIAS_ATTEMPTS {
        let candidate = format!("{}_{}", base, i);
        if !is_taken(&candidate) {
            return Ok(candidate);
        }
    }
    Err(RelqError::AliasSpaceExhausted {
        base: base.to_string(),
        attempts: MAX_ALIAS_ATTEMPTS,
    })
}
