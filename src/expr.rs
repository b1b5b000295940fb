//! Expression AST.
//!
//! Expressions are plain values: they name sources by the alias used in the
//! query that built them, and only learn the final display alias when the
//! compiler renders them against a [`Scope`].
//!
//! ```
//! use relq::prelude::*;
//!
//! let scope = Scope::new().with_alias("t", "t");
//! let expr = literal("\"t\".\"x\"").plus(1).gt(10);
//! assert_eq!(expr.to_sql(&scope).unwrap(), "(\"t\".\"x\" + (1)) > (10)");
//! ```

use crate::error::{RelqError, RelqResult};
use crate::query::Query;
use crate::scope::Scope;
use crate::transpiler::Compiler;
use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, TimeZone, Utc};
use std::sync::Arc;

/// A node of the expression tree.
#[derive(Debug, Clone)]
pub enum Expression {
    /// A column of a bound source (`"alias"."column"`).
    Column { source: String, column: String },
    /// Every column of a source (`"alias".*`).
    AllColumns { source: String },
    /// Raw SQL text, emitted as is.
    Literal(String),
    UnaryOp {
        prefix: String,
        operand: Box<Expression>,
        suffix: String,
    },
    /// `parts[0] left parts[1] right parts[2]`
    BinaryOp {
        parts: [String; 3],
        left: Box<Expression>,
        right: Box<Expression>,
    },
    /// A nested query rendered as a parenthesized subquery.
    Subquery(Box<Query>),
}

impl Expression {
    /// Build a binary operator from its three text fragments.
    ///
    /// Fails with [`RelqError::MalformedBinaryOp`] unless exactly three
    /// fragments are given.
    pub fn binary(
        parts: &[&str],
        left: impl IntoExpression,
        right: impl IntoExpression,
    ) -> RelqResult<Self> {
        let [before, middle, after] = parts else {
            return Err(RelqError::MalformedBinaryOp {
                fragments: parts.len(),
            });
        };
        Ok(Self::BinaryOp {
            parts: [before.to_string(), middle.to_string(), after.to_string()],
            left: Box::new(left.into_expression()),
            right: Box::new(right.into_expression()),
        })
    }

    pub fn unary(
        prefix: impl Into<String>,
        operand: impl IntoExpression,
        suffix: impl Into<String>,
    ) -> Self {
        Self::UnaryOp {
            prefix: prefix.into(),
            operand: Box::new(operand.into_expression()),
            suffix: suffix.into(),
        }
    }

    /// Wrap a query as a scalar subquery.
    pub fn subquery(query: Query) -> Self {
        Self::Subquery(Box::new(query))
    }

    /// Nodes that never need parentheses on the left of an operator.
    pub fn is_atomic(&self) -> bool {
        matches!(
            self,
            Self::Column { .. } | Self::AllColumns { .. } | Self::Literal(_) | Self::Subquery(_)
        )
    }

    fn infix(self, op: &str, that: impl IntoExpression) -> Self {
        let (open, close) = if self.is_atomic() { ("", "") } else { ("(", ")") };
        Self::BinaryOp {
            parts: [open.to_string(), format!("{} {} (", close, op), ")".to_string()],
            left: Box::new(self),
            right: Box::new(that.into_expression()),
        }
    }

    pub fn plus(self, that: impl IntoExpression) -> Self {
        self.infix("+", that)
    }

    pub fn minus(self, that: impl IntoExpression) -> Self {
        self.infix("-", that)
    }

    pub fn gt(self, that: impl IntoExpression) -> Self {
        self.infix(">", that)
    }

    pub fn gte(self, that: impl IntoExpression) -> Self {
        self.infix(">=", that)
    }

    pub fn lt(self, that: impl IntoExpression) -> Self {
        self.infix("<", that)
    }

    pub fn lte(self, that: impl IntoExpression) -> Self {
        self.infix("<=", that)
    }

    pub fn eq(self, that: impl IntoExpression) -> Self {
        self.infix("=", that)
    }

    pub fn ne(self, that: impl IntoExpression) -> Self {
        self.infix("<>", that)
    }

    pub fn and(self, that: impl IntoExpression) -> Self {
        self.infix("AND", that)
    }

    pub fn or(self, that: impl IntoExpression) -> Self {
        self.infix("OR", that)
    }

    /// Render against `scope`.
    ///
    /// Subqueries reached from here carry their own `WITH` clause, since
    /// there is no enclosing statement to hoist it into.
    pub fn to_sql(&self, scope: &Scope) -> RelqResult<String> {
        let mut compiler = Compiler::standalone(scope);
        self.write_sql(&Arc::new(scope.clone()), &mut compiler)
    }

    pub(crate) fn write_sql(&self, scope: &Arc<Scope>, compiler: &mut Compiler) -> RelqResult<String> {
        match self {
            Self::Column { source, column } => Ok(format!(
                "{}.{}",
                quote_identifier(scope.resolve(source)?),
                quote_identifier(column)
            )),
            Self::AllColumns { source } => {
                Ok(format!("{}.*", quote_identifier(scope.resolve(source)?)))
            }
            Self::Literal(sql) => Ok(sql.clone()),
            Self::UnaryOp {
                prefix,
                operand,
                suffix,
            } => Ok(format!(
                "{}{}{}",
                prefix,
                operand.write_sql(scope, compiler)?,
                suffix
            )),
            Self::BinaryOp { parts, left, right } => Ok(format!(
                "{}{}{}{}{}",
                parts[0],
                left.write_sql(scope, compiler)?,
                parts[1],
                right.write_sql(scope, compiler)?,
                parts[2]
            )),
            Self::Subquery(query) => compiler.subquery(query, scope),
        }
    }
}

impl std::ops::Not for Expression {
    type Output = Expression;

    fn not(self) -> Expression {
        Expression::unary("NOT (", self, ")")
    }
}

impl std::ops::Neg for Expression {
    type Output = Expression;

    fn neg(self) -> Expression {
        Expression::unary("-(", self, ")")
    }
}

/// `NOT (expr)`
pub fn not(expr: impl IntoExpression) -> Expression {
    !expr.into_expression()
}

/// `-(expr)`
pub fn neg(expr: impl IntoExpression) -> Expression {
    -expr.into_expression()
}

/// Raw SQL text.
pub fn literal(sql: impl Into<String>) -> Expression {
    Expression::Literal(sql.into())
}

/// Lift a value into an expression.
pub fn to_expression(value: impl IntoExpression) -> Expression {
    value.into_expression()
}

/// Quote an identifier, doubling embedded double quotes.
pub fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Quote a string literal, doubling embedded single quotes.
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Values usable wherever an expression is expected.
pub trait IntoExpression {
    fn into_expression(self) -> Expression;
}

impl IntoExpression for Expression {
    fn into_expression(self) -> Expression {
        self
    }
}

impl IntoExpression for &str {
    fn into_expression(self) -> Expression {
        Expression::Literal(quote_literal(self))
    }
}

impl IntoExpression for String {
    fn into_expression(self) -> Expression {
        self.as_str().into_expression()
    }
}

impl IntoExpression for &String {
    fn into_expression(self) -> Expression {
        self.as_str().into_expression()
    }
}

macro_rules! numeric_literal {
    ($($ty:ty),*) => {
        $(
            impl IntoExpression for $ty {
                fn into_expression(self) -> Expression {
                    Expression::Literal(self.to_string())
                }
            }
        )*
    };
}

numeric_literal!(i8, i16, i32, i64, isize, u8, u16, u32, u64, usize);

/// Floats go through `TryFrom`: `NaN` and the infinities have no SQL
/// literal form and are rejected with [`RelqError::UnsupportedLiteralType`].
macro_rules! float_literal {
    ($($ty:ty),*) => {
        $(
            impl TryFrom<$ty> for Expression {
                type Error = RelqError;

                fn try_from(value: $ty) -> RelqResult<Self> {
                    if value.is_finite() {
                        Ok(Expression::Literal(value.to_string()))
                    } else {
                        Err(RelqError::UnsupportedLiteralType(format!(
                            "non-finite {} {}",
                            stringify!($ty),
                            value
                        )))
                    }
                }
            }
        )*
    };
}

float_literal!(f32, f64);

impl IntoExpression for NaiveDate {
    fn into_expression(self) -> Expression {
        Expression::Literal(quote_literal(&self.format("%Y-%m-%d").to_string()))
    }
}

impl IntoExpression for NaiveDateTime {
    fn into_expression(self) -> Expression {
        Expression::Literal(quote_literal(
            &self.format("%Y-%m-%dT%H:%M:%S%.3f").to_string(),
        ))
    }
}

impl<Tz: TimeZone> IntoExpression for DateTime<Tz> {
    fn into_expression(self) -> Expression {
        let utc = self.with_timezone(&Utc);
        Expression::Literal(quote_literal(
            &utc.to_rfc3339_opts(SecondsFormat::Millis, true),
        ))
    }
}

/// Dynamic conversion for values whose type is only known at runtime.
///
/// Strings and numbers are accepted; anything else is
/// [`RelqError::UnsupportedLiteralType`].
impl TryFrom<&serde_json::Value> for Expression {
    type Error = RelqError;

    fn try_from(value: &serde_json::Value) -> RelqResult<Self> {
        match value {
            serde_json::Value::String(s) => Ok(s.into_expression()),
            serde_json::Value::Number(n) => Ok(Expression::Literal(n.to_string())),
            serde_json::Value::Null => Err(RelqError::UnsupportedLiteralType("null".into())),
            serde_json::Value::Bool(_) => Err(RelqError::UnsupportedLiteralType("bool".into())),
            serde_json::Value::Array(_) => Err(RelqError::UnsupportedLiteralType("array".into())),
            serde_json::Value::Object(_) => {
                Err(RelqError::UnsupportedLiteralType("object".into()))
            }
        }
    }
}
