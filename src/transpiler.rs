//! SQL compiler for queries.
//!
//! Compilation walks one query level at a time. Every data source of a
//! level first claims a display alias that is unique across the whole
//! statement, and nested sources are compiled on the spot into `WITH`
//! entries (children before parents). The level is then rendered against a
//! fresh [`Scope`] chained to its parent, with a new [`Row`] per callback.

use crate::error::{RelqError, RelqResult};
use crate::expr::quote_identifier;
use crate::query::{DataSource, Query};
use crate::row::Row;
use crate::scope::{Scope, fresh_alias};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// Trait for compiling a value into SQL text.
pub trait ToSql {
    /// Compile into a complete SQL statement.
    fn to_sql(&self) -> RelqResult<String>;
}

impl ToSql for Query {
    fn to_sql(&self) -> RelqResult<String> {
        Compiler::new().statement(self)
    }
}

/// Per-statement compilation state.
pub(crate) struct Compiler {
    /// Display aliases claimed so far, across every level.
    used: BTreeSet<String>,
    /// Table names the statement reads; `WITH` names must not shadow them.
    tables: BTreeSet<String>,
    /// `WITH` names handed out so far.
    cte_names: BTreeSet<String>,
    /// `WITH` entries in dependency order.
    ctes: Vec<(String, String)>,
    /// Subqueries carry their own `WITH` clause instead of hoisting it.
    inline_ctes: bool,
}

impl Compiler {
    pub(crate) fn new() -> Self {
        Self {
            used: BTreeSet::new(),
            tables: BTreeSet::new(),
            cte_names: BTreeSet::new(),
            ctes: Vec::new(),
            inline_ctes: false,
        }
    }

    /// Compiler for rendering a lone expression against `scope`.
    pub(crate) fn standalone(scope: &Scope) -> Self {
        Self {
            used: scope.display_aliases().into_iter().collect(),
            tables: BTreeSet::new(),
            cte_names: BTreeSet::new(),
            ctes: Vec::new(),
            inline_ctes: true,
        }
    }

    pub(crate) fn statement(mut self, query: &Query) -> RelqResult<String> {
        if let Some(context) = query.context() {
            self.used.extend(context.display_aliases());
        }
        self.reserve_tables(query);
        let body = self.compile_level(query, query.context().cloned())?;
        let sql = format!("{}{}", with_clause(&self.ctes), body);
        tracing::debug!("Compiled statement with {} CTEs:\n{}", self.ctes.len(), sql);
        Ok(sql)
    }

    /// Parenthesized subquery correlated to `outer`, or to the scope the
    /// query was built in.
    pub(crate) fn subquery(&mut self, query: &Query, outer: &Arc<Scope>) -> RelqResult<String> {
        let parent = query.context().cloned().unwrap_or_else(|| Arc::clone(outer));
        self.reserve_tables(query);
        let start = self.ctes.len();
        let mut body = self.compile_level(query, Some(parent))?;
        if self.inline_ctes {
            let ctes = self.ctes.split_off(start);
            body = format!("{}{}", with_clause(&ctes), body);
        }
        Ok(format!("({})", body.replace('\n', "\n    ")))
    }

    /// Record every table `query` reads through its sources, plus every
    /// relation of the schemas behind them, since association traversals
    /// inside callbacks only reach relations of those schemas.
    fn reserve_tables(&mut self, query: &Query) {
        for (_, data_source) in query.data_sources() {
            match data_source {
                DataSource::Table { name, relation } => {
                    self.tables.insert(name.clone());
                    if let Some(relation) = relation {
                        self.tables.extend(
                            relation
                                .schema()
                                .relations()
                                .map(|r| r.name().to_string()),
                        );
                    }
                }
                DataSource::Nested(nested) => self.reserve_tables(nested),
            }
        }
    }

    fn claim(&mut self, source: &str, cte: bool) -> RelqResult<String> {
        let display = fresh_alias(source, |candidate| {
            self.used.contains(candidate) || (cte && self.tables.contains(candidate))
        })?;
        if display != source {
            let rendered = &display;
            tracing::trace!("Source '{}' rendered as '{}'", source, rendered);
        }
        self.used.insert(display.clone());
        if cte {
            self.cte_names.insert(display.clone());
        }
        Ok(display)
    }

    fn compile_level(&mut self, query: &Query, parent: Option<Arc<Scope>>) -> RelqResult<String> {
        let mut scope = Scope::child(parent);
        let mut tables: BTreeMap<&str, String> = BTreeMap::new();

        for (source, data_source) in query.data_sources() {
            let cte = matches!(data_source, DataSource::Nested(_));
            let display = self.claim(source, cte)?;
            let table = match data_source {
                DataSource::Table { name, .. } => {
                    // Only reachable for tables first seen inside a callback.
                    if self.cte_names.contains(name) {
                        return Err(RelqError::AliasAlreadyUsed(name.clone()));
                    }
                    self.tables.insert(name.clone());
                    quote_identifier(name)
                }
                DataSource::Nested(nested) => {
                    let body = self.compile_level(nested, nested.context().cloned())?;
                    self.ctes.push((display.clone(), body));
                    quote_identifier(&display)
                }
            };
            scope.bind(source.as_str(), display, data_source.relation());
            tables.insert(source.as_str(), table);
        }

        let scope = Arc::new(scope);
        let row = || Row::bound(query, Arc::clone(&scope));

        let mut projections = Vec::new();
        for select in query.select_expressions() {
            for selection in select(&row())? {
                let expr = selection.expr.write_sql(&scope, self)?;
                projections.push(match selection.alias {
                    Some(alias) => format!("{} AS {}", expr, quote_identifier(&alias)),
                    None => expr,
                });
            }
        }

        let mut sql = String::from("SELECT ");
        if projections.is_empty() {
            sql.push('*');
        } else {
            sql.push_str(&projections.join(",\n    "));
        }

        let base = query.base_source();
        sql.push_str(&format!(
            "\nFROM {} AS {}",
            table_of(&tables, base)?,
            quote_identifier(scope.resolve(base)?)
        ));

        for join in query.joins() {
            let on = (join.on)(&row())?.write_sql(&scope, self)?;
            sql.push_str(&format!(
                "\n    {} JOIN {} AS {} ON {}",
                join.kind,
                table_of(&tables, &join.alias)?,
                quote_identifier(scope.resolve(&join.alias)?),
                on
            ));
        }

        let mut predicates = Vec::new();
        for predicate in query.where_clauses() {
            predicates.push(predicate(&row())?);
        }
        if !predicates.is_empty() {
            let grouped = predicates.len() > 1;
            let mut rendered = Vec::with_capacity(predicates.len());
            for predicate in &predicates {
                let text = predicate.write_sql(&scope, self)?;
                rendered.push(if grouped && !predicate.is_atomic() {
                    format!("({})", text)
                } else {
                    text
                });
            }
            sql.push_str("\nWHERE ");
            sql.push_str(&rendered.join("\n    AND "));
        }

        if let Some(order_by) = query.ordering() {
            let mut items = Vec::new();
            for item in order_by(&row())? {
                items.push(format!("{} {}", item.expr.write_sql(&scope, self)?, item.order));
            }
            if !items.is_empty() {
                sql.push_str("\nORDER BY ");
                sql.push_str(&items.join(", "));
            }
        }

        if let Some(n) = query.limit_value() {
            sql.push_str(&format!("\nLIMIT {}", n));
        }

        Ok(sql)
    }
}

fn table_of(tables: &BTreeMap<&str, String>, source: &str) -> RelqResult<String> {
    tables
        .get(source)
        .cloned()
        .ok_or_else(|| RelqError::unresolved(source))
}

/// `WITH "a" AS (...), "b" AS (...)` followed by a newline, or nothing.
fn with_clause(ctes: &[(String, String)]) -> String {
    if ctes.is_empty() {
        return String::new();
    }
    let entries: Vec<String> = ctes
        .iter()
        .map(|(name, body)| {
            format!(
                "{} AS (\n    {}\n)",
                quote_identifier(name),
                body.replace('\n', "\n    ")
            )
        })
        .collect();
    format!("WITH {}\n", entries.join(",\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::literal;
    use crate::query::{JoinKind, JoinOptions, OrderBy, TableOptions};

    fn blah() -> Query {
        Query::from_table("blah", TableOptions::default())
    }

    #[test]
    fn test_select_star() {
        assert_eq!(blah().to_sql().unwrap(), "SELECT *\nFROM \"blah\" AS \"blah\"");
    }

    #[test]
    fn test_single_predicate_is_bare() {
        let sql = blah().filter(|row| Ok(row.col("x").eq(100))).to_sql().unwrap();
        assert_eq!(
            sql,
            "SELECT *\nFROM \"blah\" AS \"blah\"\nWHERE \"blah\".\"x\" = (100)"
        );
    }

    #[test]
    fn test_multiple_predicates_are_grouped() {
        let sql = blah()
            .filter(|row| Ok(row.col("x").eq(1)))
            .filter(|_| Ok(literal("TRUE")))
            .to_sql()
            .unwrap();
        assert!(sql.ends_with("WHERE (\"blah\".\"x\" = (1))\n    AND TRUE"));
    }

    #[test]
    fn test_table_columns_projection() {
        let sql = Query::from_table("blah", TableOptions::default().columns(["a", "b"]))
            .to_sql()
            .unwrap();
        assert_eq!(
            sql,
            "SELECT \"blah\".\"a\",\n    \"blah\".\"b\"\nFROM \"blah\" AS \"blah\""
        );
    }

    #[test]
    fn test_order_by_and_limit() {
        let sql = blah()
            .order_by(|row| Ok(vec![OrderBy::desc(row.col("x")), OrderBy::asc(row.col("y"))]))
            .limit(10)
            .to_sql()
            .unwrap();
        assert!(sql.ends_with("\nORDER BY \"blah\".\"x\" DESC, \"blah\".\"y\" ASC\nLIMIT 10"));
    }

    #[test]
    fn test_join_line_per_clause() {
        let sql = blah()
            .join(
                crate::query::JoinTarget::Table("other".into()),
                JoinOptions::new()
                    .kind(JoinKind::Full)
                    .on(|row| Ok(row.col("id").eq(row.col_of("other", "blahId")))),
            )
            .unwrap()
            .to_sql()
            .unwrap();
        assert!(sql.contains(
            "\n    FULL OUTER JOIN \"other\" AS \"other\" ON \"blah\".\"id\" = (\"other\".\"blahId\")"
        ));
    }

    #[test]
    fn test_nested_source_becomes_cte() {
        let inner = blah().limit(1);
        let sql = Query::from_table("outer", TableOptions::default())
            .join(inner, JoinOptions::new().on(|_| Ok(literal("TRUE"))))
            .unwrap()
            .to_sql()
            .unwrap();
        assert_eq!(
            sql,
            "WITH \"blah_0\" AS (\n    SELECT *\n    FROM \"blah\" AS \"blah\"\n    LIMIT 1\n)\n\
             SELECT *\nFROM \"outer\" AS \"outer\"\n    INNER JOIN \"blah_0\" AS \"blah_0\" ON TRUE"
        );
    }

    #[test]
    fn test_cte_shadowing_late_table_is_rejected() {
        let cached = Query::from_table("cached", TableOptions::default())
            .limit(1)
            .named("depots");
        let query = blah()
            .join(cached, JoinOptions::new().on(|_| Ok(literal("TRUE"))))
            .unwrap()
            .filter(|_| {
                Ok(crate::expr::Expression::subquery(Query::from_table(
                    "depots",
                    TableOptions::default(),
                ))
                .eq(1))
            });
        let err = query.to_sql().unwrap_err();
        assert!(matches!(err, RelqError::AliasAlreadyUsed(name) if name == "depots"));
    }

    #[test]
    fn test_with_clause_empty() {
        assert_eq!(with_clause(&[]), "");
    }
}
