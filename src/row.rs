//! Row handles passed to expression callbacks.
//!
//! A [`Row`] is created fresh for every callback invocation. It knows which
//! query it belongs to, the scope that query is being compiled in, and the
//! stack of alias substitutions that apply when the callback was authored
//! against a different query than the one it is now evaluated for.

use crate::error::{RelqError, RelqResult};
use crate::expr::{Expression, literal};
use crate::query::{DataSource, JoinClause, JoinKind, Query, Selection};
use crate::schema::{Association, RelationRef};
use crate::scope::{Scope, fresh_alias};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// One alias rename map (`authored alias -> alias in the accepting query`).
pub type Substitutions = BTreeMap<String, String>;

/// Aggregate functions usable on a row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Aggregate {
    Min,
    Max,
    Sum,
    Count,
    Mean,
}

impl Aggregate {
    /// SQL function name.
    pub fn function(self) -> &'static str {
        match self {
            Self::Min => "MIN",
            Self::Max => "MAX",
            Self::Sum => "SUM",
            Self::Count => "COUNT",
            Self::Mean => "AVG",
        }
    }

    /// Column alias of the aggregate in its subquery.
    pub fn alias(self) -> &'static str {
        match self {
            Self::Min => "min",
            Self::Max => "max",
            Self::Sum => "sum",
            Self::Count => "count",
            Self::Mean => "mean",
        }
    }
}

impl fmt::Display for Aggregate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.function())
    }
}

/// Resolution context for one query scope.
#[derive(Clone)]
pub struct Row {
    query: Query,
    substitutions: Vec<Arc<Substitutions>>,
    default_source: String,
    scope: Arc<Scope>,
    fetched: bool,
}

impl Row {
    /// A row over `query`, outside of any compilation.
    ///
    /// Every source of the query is bound to itself on top of the query's
    /// context scope.
    pub fn new(query: &Query) -> Self {
        let mut scope = Scope::child(query.context().cloned());
        for (source, data_source) in query.data_sources() {
            scope.bind(source.as_str(), source.as_str(), data_source.relation());
        }
        Self::bound(query, Arc::new(scope))
    }

    pub(crate) fn bound(query: &Query, scope: Arc<Scope>) -> Self {
        Self {
            query: query.clone(),
            substitutions: Vec::new(),
            default_source: query.default_source().to_string(),
            scope,
            fetched: false,
        }
    }

    pub fn query(&self) -> &Query {
        &self.query
    }

    pub fn scope(&self) -> &Arc<Scope> {
        &self.scope
    }

    pub fn default_source(&self) -> &str {
        &self.default_source
    }

    /// True for rows returned by [`Row::fetch`], whose query is a nested
    /// query rooted at the traversed relation.
    pub fn is_fetched(&self) -> bool {
        self.fetched
    }

    /// Push a substitution map; the most recently pushed map applies first.
    pub fn apply_substitutions(&self, substitutions: Substitutions) -> Row {
        let mut row = self.clone();
        row.substitutions.push(Arc::new(substitutions));
        row
    }

    pub(crate) fn rebased(&self, default_source: &str) -> Row {
        let mut row = self.clone();
        row.default_source = default_source.to_string();
        row
    }

    /// The alias `source` stands for after every substitution.
    pub fn substitute(&self, source: &str) -> String {
        self.substitutions
            .iter()
            .rev()
            .fold(source.to_string(), |current, map| {
                map.get(&current).cloned().unwrap_or(current)
            })
    }

    /// Column of the default source.
    pub fn col(&self, column: &str) -> Expression {
        self.col_of(&self.default_source, column)
    }

    /// Column of an explicit source.
    pub fn col_of(&self, source: &str, column: &str) -> Expression {
        Expression::Column {
            source: self.substitute(source),
            column: column.to_string(),
        }
    }

    /// `"alias".*` of the default source.
    pub fn star(&self) -> Expression {
        self.star_of(&self.default_source)
    }

    pub fn star_of(&self, source: &str) -> Expression {
        Expression::AllColumns {
            source: self.substitute(source),
        }
    }

    /// Traverse an association of the default source.
    ///
    /// On a plain row this starts a nested query over the target relation,
    /// correlated to this row's scope. On a fetched row the association is
    /// joined into the same nested query, so `a.fetch(x)?.fetch(y)?` reads
    /// as one chain.
    pub fn fetch(&self, association: &str) -> RelqResult<Row> {
        self.fetch_from(&self.default_source, association, None)
    }

    /// [`Row::fetch`] with an explicit alias for the target.
    pub fn fetch_as(&self, association: &str, alias: &str) -> RelqResult<Row> {
        self.fetch_from(&self.default_source, association, Some(alias))
    }

    /// Traverse an association of `source`.
    pub fn fetch_from(&self, source: &str, association: &str, alias: Option<&str>) -> RelqResult<Row> {
        let owner = self.substitute(source);
        let relation = self
            .relation_of(&owner)?
            .ok_or_else(|| RelqError::unknown_association(&owner, association))?;
        let assoc = relation.association(association)?.clone();
        let target = relation.sibling(assoc.target())?;

        let alias = match alias {
            Some(alias) if self.is_visible(alias) => {
                return Err(RelqError::AliasAlreadyUsed(alias.to_string()));
            }
            Some(alias) => alias.to_string(),
            None => fresh_alias(association, |candidate| self.is_visible(candidate))?,
        };
        tracing::trace!("Fetching '{}' from '{}' as '{}'", association, owner, alias);

        if self.fetched {
            let query = self.query.attach(
                &alias,
                DataSource::table(&target),
                Some(association_join(assoc, &owner, &alias, JoinKind::Inner)),
            );
            return Ok(Row {
                query,
                substitutions: self.substitutions.clone(),
                default_source: alias,
                scope: Arc::clone(&self.scope),
                fetched: true,
            });
        }

        let condition = association_join(assoc, &owner, &alias, JoinKind::Inner).on;
        let query = Query::from_relation(&target, Some(&alias))
            .with_context(Arc::clone(&self.scope))
            .filter(move |row| condition(row));
        Ok(Row {
            query,
            substitutions: Vec::new(),
            default_source: alias,
            scope: Arc::clone(&self.scope),
            fetched: true,
        })
    }

    /// Narrow this row's query.
    pub fn filter<F>(&self, predicate: F) -> Row
    where
        F: Fn(&Row) -> RelqResult<Expression> + Send + Sync + 'static,
    {
        let mut row = self.clone();
        row.query = self.query.filter(predicate);
        row
    }

    /// `(SELECT FN("alias"."column") AS "fn" FROM ...)` over this row's query.
    ///
    /// On a row that was not fetched this is the row's own query, predicates
    /// included, so it belongs in projections rather than in that query's
    /// own `filter`.
    pub fn aggregate(&self, function: Aggregate, column: &str) -> Expression {
        let argument = self.col(column);
        let query = self.query.select_none().select_with(move |_| {
            Ok(vec![Selection::aliased(
                Expression::unary(format!("{}(", function.function()), argument.clone(), ")"),
                function.alias(),
            )])
        });
        Expression::subquery(query)
    }

    pub fn min(&self, column: &str) -> Expression {
        self.aggregate(Aggregate::Min, column)
    }

    pub fn max(&self, column: &str) -> Expression {
        self.aggregate(Aggregate::Max, column)
    }

    pub fn sum(&self, column: &str) -> Expression {
        self.aggregate(Aggregate::Sum, column)
    }

    pub fn count(&self, column: &str) -> Expression {
        self.aggregate(Aggregate::Count, column)
    }

    /// Renders `AVG`.
    pub fn mean(&self, column: &str) -> Expression {
        self.aggregate(Aggregate::Mean, column)
    }

    /// `EXISTS (SELECT 1 FROM ...)` over this row's query.
    pub fn exists(&self) -> Expression {
        let query = self
            .query
            .select_none()
            .select_with(|_| Ok(vec![Selection::new(literal("1"))]));
        Expression::unary("EXISTS ", Expression::subquery(query), "")
    }

    /// Relation behind `source`, looked up in the query first and then
    /// outward through the scope chain.
    fn relation_of(&self, source: &str) -> RelqResult<Option<RelationRef>> {
        if let Some(data_source) = self.query.source(source) {
            return Ok(data_source.relation());
        }
        self.scope
            .lookup(source)
            .map(|binding| binding.relation.clone())
            .ok_or_else(|| RelqError::unresolved(source))
    }

    fn is_visible(&self, alias: &str) -> bool {
        self.query.source(alias).is_some() || self.scope.is_bound(alias)
    }
}

/// Join clause traversing `association` from `owner` to `alias`.
pub(crate) fn association_join(
    association: Association,
    owner: &str,
    alias: &str,
    kind: JoinKind,
) -> JoinClause {
    let (owner, target) = (owner.to_string(), alias.to_string());
    JoinClause {
        alias: alias.to_string(),
        kind,
        on: Arc::new(move |row: &Row| -> RelqResult<Expression> {
            Ok(association.condition(row, &owner, &target))
        }),
    }
}

impl fmt::Debug for Row {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Row")
            .field("default_source", &self.default_source)
            .field("substitutions", &self.substitutions)
            .field("fetched", &self.fetched)
            .finish()
    }
}
