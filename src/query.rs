//! Immutable query builder.
//!
//! Every builder method takes `&self` and returns a new [`Query`]. Fields are
//! shared behind `Arc`s and copied on write, so forking a query only clones
//! the vectors that the fork actually changes.
//!
//! ```
//! use relq::prelude::*;
//!
//! let base = Query::from_table("blah", TableOptions::default());
//! let big = base.filter(|row| Ok(row.col("x").gt(100)));
//! let small = base.filter(|row| Ok(row.col("x").lt(10)));
//!
//! assert_eq!(base.to_sql().unwrap(), "SELECT *\nFROM \"blah\" AS \"blah\"");
//! assert!(big.to_sql().unwrap().ends_with("WHERE \"blah\".\"x\" > (100)"));
//! assert!(small.to_sql().unwrap().ends_with("WHERE \"blah\".\"x\" < (10)"));
//! ```

use crate::error::{RelqError, RelqResult};
use crate::expr::{Expression, literal};
use crate::row::{Row, Substitutions, association_join};
use crate::schema::RelationRef;
use crate::scope::{Scope, fresh_alias};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Predicate callback.
pub type WhereFn = Arc<dyn Fn(&Row) -> RelqResult<Expression> + Send + Sync>;

/// Projection callback.
pub type SelectFn = Arc<dyn Fn(&Row) -> RelqResult<Vec<Selection>> + Send + Sync>;

/// Ordering callback.
pub type OrderByFn = Arc<dyn Fn(&Row) -> RelqResult<Vec<OrderBy>> + Send + Sync>;

/// Join type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum JoinKind {
    #[default]
    Inner,
    Left,
    Right,
    Full,
}

impl fmt::Display for JoinKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JoinKind::Inner => write!(f, "INNER"),
            JoinKind::Left => write!(f, "LEFT"),
            JoinKind::Right => write!(f, "RIGHT"),
            JoinKind::Full => write!(f, "FULL OUTER"),
        }
    }
}

/// Sort direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SortOrder {
    #[default]
    Asc,
    Desc,
}

impl fmt::Display for SortOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SortOrder::Asc => write!(f, "ASC"),
            SortOrder::Desc => write!(f, "DESC"),
        }
    }
}

/// One `ORDER BY` item.
#[derive(Debug, Clone)]
pub struct OrderBy {
    pub expr: Expression,
    pub order: SortOrder,
}

impl OrderBy {
    pub fn asc(expr: Expression) -> Self {
        Self {
            expr,
            order: SortOrder::Asc,
        }
    }

    pub fn desc(expr: Expression) -> Self {
        Self {
            expr,
            order: SortOrder::Desc,
        }
    }
}

/// One projection, optionally aliased.
#[derive(Debug, Clone)]
pub struct Selection {
    pub expr: Expression,
    pub alias: Option<String>,
}

impl Selection {
    pub fn new(expr: Expression) -> Self {
        Self { expr, alias: None }
    }

    pub fn aliased(expr: Expression, alias: impl Into<String>) -> Self {
        Self {
            expr,
            alias: Some(alias.into()),
        }
    }
}

impl From<Expression> for Selection {
    fn from(expr: Expression) -> Self {
        Self::new(expr)
    }
}

/// Argument accepted by [`Query::select`].
#[derive(Clone)]
pub enum SelectArg {
    /// Column of the default source.
    Column(String),
    /// Column of the default source under another name.
    Aliased { column: String, alias: String },
    /// Column of an explicit source.
    SourceQualified { source: String, column: String },
    /// Arbitrary projections built from the row.
    Computed(SelectFn),
}

impl SelectArg {
    pub fn aliased(column: impl Into<String>, alias: impl Into<String>) -> Self {
        Self::Aliased {
            column: column.into(),
            alias: alias.into(),
        }
    }

    pub fn qualified(source: impl Into<String>, column: impl Into<String>) -> Self {
        Self::SourceQualified {
            source: source.into(),
            column: column.into(),
        }
    }

    pub fn computed<F>(select: F) -> Self
    where
        F: Fn(&Row) -> RelqResult<Vec<Selection>> + Send + Sync + 'static,
    {
        Self::Computed(Arc::new(select))
    }

    fn selections(&self, row: &Row) -> RelqResult<Vec<Selection>> {
        Ok(match self {
            SelectArg::Column(column) => vec![Selection::new(row.col(column))],
            SelectArg::Aliased { column, alias } => {
                vec![Selection::aliased(row.col(column), alias.as_str())]
            }
            SelectArg::SourceQualified { source, column } => {
                vec![Selection::new(row.col_of(source, column))]
            }
            SelectArg::Computed(select) => select(row)?,
        })
    }
}

impl From<&str> for SelectArg {
    fn from(column: &str) -> Self {
        Self::Column(column.to_string())
    }
}

impl From<String> for SelectArg {
    fn from(column: String) -> Self {
        Self::Column(column)
    }
}

/// Where a source's rows come from.
#[derive(Debug, Clone)]
pub enum DataSource {
    /// A table, with its relation when it was registered in a schema.
    Table {
        name: String,
        relation: Option<RelationRef>,
    },
    /// A query kept as is; compiled into a `WITH` entry.
    Nested(Query),
}

impl DataSource {
    pub fn table(relation: &RelationRef) -> Self {
        Self::Table {
            name: relation.name().to_string(),
            relation: Some(relation.clone()),
        }
    }

    /// Relation behind the source; for nested queries, the relation of
    /// their default source.
    pub fn relation(&self) -> Option<RelationRef> {
        match self {
            DataSource::Table { relation, .. } => relation.clone(),
            DataSource::Nested(query) => query.default_relation(),
        }
    }
}

/// A joined source of a query level.
#[derive(Clone)]
pub struct JoinClause {
    pub alias: String,
    pub kind: JoinKind,
    pub on: WhereFn,
}

impl fmt::Debug for JoinClause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JoinClause")
            .field("alias", &self.alias)
            .field("kind", &self.kind)
            .finish()
    }
}

/// Options for [`Query::from_table`].
#[derive(Debug, Clone, Default)]
pub struct TableOptions {
    pub alias: Option<String>,
    /// Default projection; `*` when empty.
    pub columns: Vec<String>,
}

impl TableOptions {
    pub fn alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    pub fn columns<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.columns = columns.into_iter().map(Into::into).collect();
        self
    }
}

/// Options for [`Query::join`].
#[derive(Clone, Default)]
pub struct JoinOptions {
    pub alias: Option<String>,
    pub on: Option<WhereFn>,
    pub kind: JoinKind,
}

impl JoinOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    pub fn on<F>(mut self, condition: F) -> Self
    where
        F: Fn(&Row) -> RelqResult<Expression> + Send + Sync + 'static,
    {
        self.on = Some(Arc::new(condition));
        self
    }

    pub fn kind(mut self, kind: JoinKind) -> Self {
        self.kind = kind;
        self
    }
}

/// What [`Query::join`] joins.
#[derive(Debug, Clone)]
pub enum JoinTarget {
    /// An association registered on the default source's relation.
    Association(String),
    /// A plain table; needs an explicit `on`.
    Table(String),
    Relation(RelationRef),
    Query(Query),
}

impl From<&str> for JoinTarget {
    fn from(association: &str) -> Self {
        Self::Association(association.to_string())
    }
}

impl From<RelationRef> for JoinTarget {
    fn from(relation: RelationRef) -> Self {
        Self::Relation(relation)
    }
}

impl From<&RelationRef> for JoinTarget {
    fn from(relation: &RelationRef) -> Self {
        Self::Relation(relation.clone())
    }
}

impl From<Query> for JoinTarget {
    fn from(query: Query) -> Self {
        Self::Query(query)
    }
}

/// An immutable, branchable SELECT statement.
#[derive(Clone)]
pub struct Query {
    name: Option<String>,
    data_sources: Arc<Vec<(String, DataSource)>>,
    where_clauses: Arc<Vec<WhereFn>>,
    order_by: Option<OrderByFn>,
    select_expressions: Arc<Vec<SelectFn>>,
    joins: Arc<Vec<JoinClause>>,
    includes: Arc<Vec<Query>>,
    context: Option<Arc<Scope>>,
    base_source: String,
    default_source: String,
    limit: Option<u64>,
}

impl Query {
    fn over(alias: String, source: DataSource) -> Self {
        Self {
            name: None,
            data_sources: Arc::new(vec![(alias.clone(), source)]),
            where_clauses: Arc::new(Vec::new()),
            order_by: None,
            select_expressions: Arc::new(Vec::new()),
            joins: Arc::new(Vec::new()),
            includes: Arc::new(Vec::new()),
            context: None,
            base_source: alias.clone(),
            default_source: alias,
            limit: None,
        }
    }

    /// Base query over a plain table.
    pub fn from_table(table: &str, options: TableOptions) -> Self {
        let alias = options.alias.unwrap_or_else(|| table.to_string());
        let query = Self::over(
            alias.clone(),
            DataSource::Table {
                name: table.to_string(),
                relation: None,
            },
        );
        if options.columns.is_empty() {
            return query;
        }
        let columns = options.columns;
        query.select_with(move |row| {
            Ok(columns
                .iter()
                .map(|column| Selection::new(row.col_of(&alias, column)))
                .collect())
        })
    }

    /// Base query over a registered relation, aliased by its name unless
    /// `alias` is given.
    pub fn from_relation(relation: &RelationRef, alias: Option<&str>) -> Self {
        let alias = alias.unwrap_or(relation.name()).to_string();
        Self::over(alias, DataSource::table(relation))
    }

    /// Name used as the default alias when this query is joined.
    pub fn named(&self, name: impl Into<String>) -> Query {
        let mut query = self.clone();
        query.name = Some(name.into());
        query
    }

    /// Add a predicate; predicates are AND-ed.
    pub fn filter<F>(&self, predicate: F) -> Query
    where
        F: Fn(&Row) -> RelqResult<Expression> + Send + Sync + 'static,
    {
        let mut query = self.clone();
        Arc::make_mut(&mut query.where_clauses).push(Arc::new(predicate));
        query
    }

    /// Replace the ordering.
    pub fn order_by<F>(&self, order: F) -> Query
    where
        F: Fn(&Row) -> RelqResult<Vec<OrderBy>> + Send + Sync + 'static,
    {
        let mut query = self.clone();
        query.order_by = Some(Arc::new(order));
        query
    }

    pub fn limit(&self, limit: u64) -> Query {
        let mut query = self.clone();
        query.limit = Some(limit);
        query
    }

    /// Replace the projection list.
    pub fn select<I, S>(&self, args: I) -> Query
    where
        I: IntoIterator<Item = S>,
        S: Into<SelectArg>,
    {
        let mut query = self.select_none();
        Arc::make_mut(&mut query.select_expressions).push(Self::select_args(args));
        query
    }

    /// Append to the projection list; an empty list stands for `*`, which
    /// is kept in front of the new projections.
    pub fn and_select<I, S>(&self, args: I) -> Query
    where
        I: IntoIterator<Item = S>,
        S: Into<SelectArg>,
    {
        let mut query = self.seeded_selection();
        Arc::make_mut(&mut query.select_expressions).push(Self::select_args(args));
        query
    }

    pub fn select_with<F>(&self, select: F) -> Query
    where
        F: Fn(&Row) -> RelqResult<Vec<Selection>> + Send + Sync + 'static,
    {
        let mut query = self.select_none();
        Arc::make_mut(&mut query.select_expressions).push(Arc::new(select));
        query
    }

    pub fn and_select_with<F>(&self, select: F) -> Query
    where
        F: Fn(&Row) -> RelqResult<Vec<Selection>> + Send + Sync + 'static,
    {
        let mut query = self.seeded_selection();
        Arc::make_mut(&mut query.select_expressions).push(Arc::new(select));
        query
    }

    /// Drop every projection; renders as `*` until one is added.
    pub fn select_none(&self) -> Query {
        let mut query = self.clone();
        query.select_expressions = Arc::new(Vec::new());
        query
    }

    /// Record a related query to fetch alongside this one.
    pub fn include(&self, query: Query) -> Query {
        let mut this = self.clone();
        Arc::make_mut(&mut this.includes).push(query);
        this
    }

    pub(crate) fn with_context(&self, scope: Arc<Scope>) -> Query {
        let mut query = self.clone();
        query.context = Some(scope);
        query
    }

    /// Join an association, table, relation or query.
    ///
    /// Without an `on` condition, the condition is derived from the
    /// association between the default source's relation and the target's
    /// relation; [`RelqError::MissingJoinCondition`] when there is none.
    pub fn join(&self, target: impl Into<JoinTarget>, options: JoinOptions) -> RelqResult<Query> {
        match target.into() {
            JoinTarget::Association(name) => self.join_association(&name, options),
            JoinTarget::Table(name) => self.join_table(&name, options),
            JoinTarget::Relation(relation) => self.join_relation(&relation, options),
            JoinTarget::Query(query) => self.join_query(query, options),
        }
    }

    pub fn inner_join(&self, target: impl Into<JoinTarget>) -> RelqResult<Query> {
        self.join(target, JoinOptions::new())
    }

    pub fn left_join(&self, target: impl Into<JoinTarget>) -> RelqResult<Query> {
        self.join(target, JoinOptions::new().kind(JoinKind::Left))
    }

    /// Join an association registered on the default source's relation.
    pub fn join_association(&self, name: &str, options: JoinOptions) -> RelqResult<Query> {
        let owner = self.default_source.clone();
        let relation = self
            .default_relation()
            .ok_or_else(|| RelqError::unknown_association(&owner, name))?;
        let association = relation.association(name)?.clone();
        let target = relation.sibling(association.target())?;
        let alias = self.claim_alias(options.alias, name)?;

        let mut join = association_join(association, &owner, &alias, options.kind);
        if let Some(on) = options.on {
            join.on = on;
        }
        tracing::debug!("Joining association '{}' of '{}' as '{}'", name, owner, alias);
        Ok(self.attach(&alias, DataSource::table(&target), Some(join)))
    }

    /// Join a plain table; `on` is required.
    pub fn join_table(&self, table: &str, options: JoinOptions) -> RelqResult<Query> {
        let alias = self.claim_alias(options.alias, table)?;
        let on = options
            .on
            .ok_or_else(|| RelqError::MissingJoinCondition(table.to_string()))?;
        let source = DataSource::Table {
            name: table.to_string(),
            relation: None,
        };
        let join = JoinClause {
            alias: alias.clone(),
            kind: options.kind,
            on,
        };
        Ok(self.attach(&alias, source, Some(join)))
    }

    pub fn join_relation(&self, relation: &RelationRef, options: JoinOptions) -> RelqResult<Query> {
        let alias = self.claim_alias(options.alias, relation.name())?;
        let on = match options.on {
            Some(on) => on,
            None => self.derive_on(Some(relation), relation.name(), &alias)?,
        };
        let join = JoinClause {
            alias: alias.clone(),
            kind: options.kind,
            on,
        };
        Ok(self.attach(&alias, DataSource::table(relation), Some(join)))
    }

    /// Join another query.
    ///
    /// A target over a single table with no ordering or limit, joined
    /// INNER or carrying no predicates, is flattened: its table is joined
    /// directly and its predicates and projections are rewritten onto the
    /// new alias. Anything else is kept as a nested source and becomes a
    /// `WITH` entry. A flattened target's includes move to the result.
    pub fn join_query(&self, target: Query, options: JoinOptions) -> RelqResult<Query> {
        let base = target
            .name
            .clone()
            .unwrap_or_else(|| target.default_source.clone());
        let alias = self.claim_alias(options.alias, &base)?;
        let on = match options.on {
            Some(on) => on,
            None => self.derive_on(target.default_relation().as_ref(), &base, &alias)?,
        };
        let join = JoinClause {
            alias: alias.clone(),
            kind: options.kind,
            on,
        };

        let Some(table) = target.flattenable(options.kind).cloned() else {
            tracing::debug!("Keeping joined query '{}' nested as '{}'", base, alias);
            return Ok(self.attach(&alias, DataSource::Nested(target), Some(join)));
        };
        tracing::debug!("Flattening joined query '{}' into '{}'", base, alias);

        let substitutions: Substitutions =
            BTreeMap::from([(target.base_source.clone(), alias.clone())]);
        let mut query = self.attach(&alias, table, Some(join));
        if !target.includes.is_empty() {
            Arc::make_mut(&mut query.includes).extend(target.includes.iter().cloned());
        }

        for predicate in target.where_clauses.iter().cloned() {
            let substitutions = substitutions.clone();
            let default = target.default_source.clone();
            query = query.filter(move |row| {
                predicate(&row.rebased(&default).apply_substitutions(substitutions.clone()))
            });
        }

        if self.select_expressions.is_empty() {
            return Ok(query);
        }
        if target.select_expressions.is_empty() {
            let star = alias.clone();
            return Ok(query.and_select_with(move |row| Ok(vec![Selection::new(row.star_of(&star))])));
        }
        for select in target.select_expressions.iter().cloned() {
            let substitutions = substitutions.clone();
            let default = target.default_source.clone();
            let prefix = alias.clone();
            query = query.and_select_with(move |row| {
                let row = row.rebased(&default).apply_substitutions(substitutions.clone());
                Ok(select(&row)?
                    .into_iter()
                    .map(|selection| prefixed(selection, &prefix))
                    .collect())
            });
        }
        Ok(query)
    }

    /// The single table of a target that may be merged into its parent.
    fn flattenable(&self, kind: JoinKind) -> Option<&DataSource> {
        let [(_, table @ DataSource::Table { .. })] = self.data_sources.as_slice() else {
            return None;
        };
        let mergeable = (kind == JoinKind::Inner || self.where_clauses.is_empty())
            && self.joins.is_empty()
            && self.order_by.is_none()
            && self.limit.is_none();
        mergeable.then_some(table)
    }

    fn derive_on(
        &self,
        target: Option<&RelationRef>,
        target_name: &str,
        alias: &str,
    ) -> RelqResult<WhereFn> {
        let missing = || RelqError::MissingJoinCondition(target_name.to_string());
        let owner = self.default_relation().ok_or_else(missing)?;
        let target = target.ok_or_else(missing)?;
        let association = owner.association_to(target).ok_or_else(missing)?.clone();
        Ok(association_join(association, &self.default_source, alias, JoinKind::Inner).on)
    }

    /// Alias for a new source: `requested` if free, else a fresh one
    /// derived from `fallback`.
    fn claim_alias(&self, requested: Option<String>, fallback: &str) -> RelqResult<String> {
        match requested {
            Some(alias) if self.is_taken(&alias) => Err(RelqError::AliasAlreadyUsed(alias)),
            Some(alias) => Ok(alias),
            None => fresh_alias(fallback, |candidate| self.is_taken(candidate)),
        }
    }

    fn is_taken(&self, alias: &str) -> bool {
        self.source(alias).is_some()
            || self
                .context
                .as_ref()
                .is_some_and(|scope| scope.is_bound(alias))
    }

    pub(crate) fn attach(&self, alias: &str, source: DataSource, join: Option<JoinClause>) -> Query {
        let mut query = self.clone();
        Arc::make_mut(&mut query.data_sources).push((alias.to_string(), source));
        if let Some(join) = join {
            Arc::make_mut(&mut query.joins).push(join);
        }
        query
    }

    fn seeded_selection(&self) -> Query {
        let mut query = self.clone();
        if query.select_expressions.is_empty() {
            let star: SelectFn = Arc::new(|_: &Row| -> RelqResult<Vec<Selection>> {
                Ok(vec![Selection::new(literal("*"))])
            });
            Arc::make_mut(&mut query.select_expressions).push(star);
        }
        query
    }

    fn select_args<I, S>(args: I) -> SelectFn
    where
        I: IntoIterator<Item = S>,
        S: Into<SelectArg>,
    {
        let args: Vec<SelectArg> = args.into_iter().map(Into::into).collect();
        Arc::new(move |row: &Row| -> RelqResult<Vec<Selection>> {
            let mut selections = Vec::new();
            for arg in &args {
                selections.extend(arg.selections(row)?);
            }
            Ok(selections)
        })
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn data_sources(&self) -> &[(String, DataSource)] {
        &self.data_sources
    }

    /// Data source bound under `alias` in this level.
    pub fn source(&self, alias: &str) -> Option<&DataSource> {
        self.data_sources
            .iter()
            .find(|(source, _)| source == alias)
            .map(|(_, data_source)| data_source)
    }

    pub fn where_clauses(&self) -> &[WhereFn] {
        &self.where_clauses
    }

    pub fn select_expressions(&self) -> &[SelectFn] {
        &self.select_expressions
    }

    pub fn joins(&self) -> &[JoinClause] {
        &self.joins
    }

    pub fn ordering(&self) -> Option<&OrderByFn> {
        self.order_by.as_ref()
    }

    pub fn limit_value(&self) -> Option<u64> {
        self.limit
    }

    pub fn includes(&self) -> &[Query] {
        &self.includes
    }

    /// Scope the query was created in, for queries built inside a callback.
    pub fn context(&self) -> Option<&Arc<Scope>> {
        self.context.as_ref()
    }

    pub fn base_source(&self) -> &str {
        &self.base_source
    }

    pub fn default_source(&self) -> &str {
        &self.default_source
    }

    pub fn default_relation(&self) -> Option<RelationRef> {
        self.source(&self.default_source)
            .and_then(DataSource::relation)
    }
}

/// Selection of a flattened query, renamed under its join alias.
fn prefixed(selection: Selection, prefix: &str) -> Selection {
    let alias = match (&selection.alias, &selection.expr) {
        (Some(alias), _) => Some(format!("{}.{}", prefix, alias)),
        (None, Expression::Column { column, .. }) => Some(format!("{}.{}", prefix, column)),
        (None, _) => None,
    };
    Selection {
        expr: selection.expr,
        alias,
    }
}

impl fmt::Debug for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Query")
            .field("name", &self.name)
            .field("data_sources", &self.data_sources)
            .field("where_clauses", &self.where_clauses.len())
            .field("select_expressions", &self.select_expressions.len())
            .field("joins", &self.joins)
            .field("includes", &self.includes.len())
            .field("default_source", &self.default_source)
            .field("limit", &self.limit)
            .finish()
    }
}
