//! # relq
//!
//! An immutable relational query builder. Queries are composed from
//! closures over [`Row`](row::Row) handles, branch freely, and compile into
//! SQL with statement-wide unique aliases, correlated subqueries for
//! association traversals and `WITH` entries for nested queries.
//!
//! ## Quick Example
//!
//! ```
//! use relq::prelude::*;
//! use std::sync::Arc;
//!
//! let mut schema = Schema::new();
//! let trips = schema.add_table("trips");
//! let stops = schema.add_table("stops");
//! schema.has_many(trips, stops, AssociationOptions::default())?;
//! schema.belongs_to(stops, trips, AssociationOptions::default())?;
//! let schema = Arc::new(schema);
//!
//! let early = schema
//!     .query(trips)?
//!     .filter(|t| Ok(t.fetch("stops")?.min("departure").lt("07:00")));
//!
//! let sql = early.to_sql()?;
//! assert!(sql.contains("(SELECT MIN(\"stops\".\"departure\") AS \"min\""));
//! # Ok::<(), RelqError>(())
//! ```

pub mod config;
pub mod engine;
pub mod error;
pub mod expr;
pub mod query;
pub mod row;
pub mod schema;
pub mod scope;
pub mod transpiler;

pub mod prelude {
    pub use crate::config::RelqConfig;
    pub use crate::engine::{Executor, Record, SqlxExecutor, StatementKind};
    pub use crate::error::*;
    pub use crate::expr::{Expression, IntoExpression, literal, neg, not, to_expression};
    pub use crate::query::{
        JoinKind, JoinOptions, JoinTarget, OrderBy, Query, SelectArg, Selection, SortOrder,
        TableOptions,
    };
    pub use crate::row::{Aggregate, Row};
    pub use crate::schema::{AssociationOptions, Direction, RelationId, RelationRef, Schema};
    pub use crate::scope::Scope;
    pub use crate::transpiler::ToSql;
}
