//! Error types for relq.

use thiserror::Error;

/// The main error type for relq operations.
///
/// Compile errors abort the whole `to_sql()` call; there are no partial
/// statements. Executor errors (`Database`, `Connection`, `Execution`) are
/// passed through from the execution boundary untouched.
#[derive(Debug, Error)]
pub enum RelqError {
    /// A column or join references an alias not bound in the scope chain.
    #[error("Unresolved source: '{0}' is not bound in the current scope")]
    UnresolvedSource(String),

    /// An explicit alias collides with one already bound in the target scope.
    #[error("Alias '{0}' has already been used")]
    AliasAlreadyUsed(String),

    /// The deterministic alias generator ran out of candidates.
    #[error("No free alias found for '{base}' after {attempts} attempts")]
    AliasSpaceExhausted { base: String, attempts: usize },

    /// An association could not infer the key on its master relation.
    #[error("Target key must be defined: relation '{master}' has no primary key")]
    MissingTargetKey { master: String },

    /// A relationship name is not registered on the relation.
    #[error("Unknown association '{association}' on relation '{relation}'")]
    UnknownAssociation {
        relation: String,
        association: String,
    },

    /// A value cannot be lifted into a literal expression.
    #[error("Unsupported literal type: {0}")]
    UnsupportedLiteralType(String),

    /// A binary operator was given other than three text fragments.
    #[error("Binary operator needs exactly 3 text fragments, got {fragments}")]
    MalformedBinaryOp { fragments: usize },

    /// A relation id or name is not registered in the schema.
    #[error("Unknown relation: '{0}'")]
    UnknownRelation(String),

    /// A join has no `on` condition and none can be derived from associations.
    #[error("No join condition given or derivable for '{0}'")]
    MissingJoinCondition(String),

    /// Database error.
    #[error("Database error: {0}")]
    Database(String),

    /// Connection error.
    #[error("Connection error: {0}")]
    Connection(String),

    /// Query execution error.
    #[error("Execution error: {0}")]
    Execution(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl RelqError {
    /// Create an unresolved source error.
    pub fn unresolved(source: impl Into<String>) -> Self {
        Self::UnresolvedSource(source.into())
    }

    /// Create an unknown association error.
    pub fn unknown_association(relation: impl Into<String>, association: impl Into<String>) -> Self {
        Self::UnknownAssociation {
            relation: relation.into(),
            association: association.into(),
        }
    }
}

/// Result type alias for relq operations.
pub type RelqResult<T> = Result<T, RelqError>;
