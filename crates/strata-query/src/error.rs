use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub enum QueryError {
    /// A value in the spec has the wrong shape or type.
    BadValue(String),
    /// The spec document itself could not be interpreted.
    FailedToParse(String),
    /// A `$regex` pattern the regex engine rejects.
    BadRegex(String),
    /// The expression needs a capability this context does not provide
    /// (e.g. `$expr` evaluated without an expression hook).
    Unsupported(String),
}

impl fmt::Display for QueryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueryError::BadValue(msg) => write!(f, "bad value: {msg}"),
            QueryError::FailedToParse(msg) => write!(f, "failed to parse: {msg}"),
            QueryError::BadRegex(msg) => write!(f, "invalid regex: {msg}"),
            QueryError::Unsupported(msg) => write!(f, "unsupported: {msg}"),
        }
    }
}

impl std::error::Error for QueryError {}

impl From<bson::raw::Error> for QueryError {
    fn from(e: bson::raw::Error) -> Self {
        QueryError::FailedToParse(e.to_string())
    }
}
