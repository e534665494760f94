use std::fmt;

use strata_query::QueryError;

#[derive(Debug, Clone, PartialEq)]
pub enum PathError {
    /// The same path appears twice in one specification.
    PathCollision(String),
    /// One path is a strict prefix of another (`"a"` vs `"a.b"`).
    PartialPathCollision { shorter: String, longer: String },
    /// Inclusion and exclusion leaves in the same tree without opt-in.
    MixedInclusionExclusion(String),
    /// A field name the tree grammar forbids (`$`-prefixed, empty segment).
    BadFieldName(String),
    /// Path depth beyond the configured bound.
    DepthExceeded(usize),
    /// An operator spec with the wrong shape (`$slice`, `$elemMatch`, ...).
    BadOperator(String),
    /// A value in the spec has the wrong type.
    BadValue(String),
    /// The `$` positional operator had no query to resolve against.
    PositionalNoQuery,
    /// The `$` positional operator matched no array element.
    PositionalUnmatched(String),
    /// Expression evaluation failure (bad operand types, division by zero).
    Expression(String),
    Query(QueryError),
    Raw(String),
}

impl fmt::Display for PathError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathError::PathCollision(path) => {
                write!(f, "path collision at '{path}'")
            }
            PathError::PartialPathCollision { shorter, longer } => {
                write!(f, "path collision: '{shorter}' conflicts with '{longer}'")
            }
            PathError::MixedInclusionExclusion(path) => {
                write!(f, "cannot mix inclusion and exclusion ('{path}')")
            }
            PathError::BadFieldName(name) => write!(f, "invalid field name '{name}'"),
            PathError::DepthExceeded(max) => {
                write!(f, "path depth exceeds the maximum of {max}")
            }
            PathError::BadOperator(msg) => write!(f, "invalid projection operator: {msg}"),
            PathError::BadValue(msg) => write!(f, "bad value: {msg}"),
            PathError::PositionalNoQuery => {
                write!(f, "positional projection requires a query predicate on the array")
            }
            PathError::PositionalUnmatched(path) => {
                write!(f, "positional operator matched no element of '{path}'")
            }
            PathError::Expression(msg) => write!(f, "expression error: {msg}"),
            PathError::Query(e) => write!(f, "{e}"),
            PathError::Raw(msg) => write!(f, "malformed document: {msg}"),
        }
    }
}

impl std::error::Error for PathError {}

impl From<QueryError> for PathError {
    fn from(e: QueryError) -> Self {
        PathError::Query(e)
    }
}

impl From<bson::raw::Error> for PathError {
    fn from(e: bson::raw::Error) -> Self {
        PathError::Raw(e.to_string())
    }
}
