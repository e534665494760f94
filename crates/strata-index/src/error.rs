use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub enum IndexError {
    BadValue(String),
    /// An index with this name exists with a different specification.
    IndexOptionsConflict(String),
    UnknownAccessMethod(String),
    /// The registry already holds the maximum number of alternate AMs.
    RegistryFull,
    DuplicateAccessMethod(String),
    /// No registered access method can serve the spec.
    UnableToFindIndex(String),
    Path(strata_path::PathError),
    Query(strata_query::QueryError),
}

impl fmt::Display for IndexError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IndexError::BadValue(msg) => write!(f, "bad index spec: {msg}"),
            IndexError::IndexOptionsConflict(name) => {
                write!(f, "index '{name}' already exists with different options")
            }
            IndexError::UnknownAccessMethod(name) => {
                write!(f, "unknown index access method '{name}'")
            }
            IndexError::RegistryFull => write!(f, "alternate access-method slots exhausted"),
            IndexError::DuplicateAccessMethod(name) => {
                write!(f, "access method '{name}' registered twice")
            }
            IndexError::UnableToFindIndex(what) => {
                write!(f, "no access method supports {what}")
            }
            IndexError::Path(e) => write!(f, "{e}"),
            IndexError::Query(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for IndexError {}

impl From<strata_path::PathError> for IndexError {
    fn from(e: strata_path::PathError) -> Self {
        IndexError::Path(e)
    }
}

impl From<strata_query::QueryError> for IndexError {
    fn from(e: strata_query::QueryError) -> Self {
        IndexError::Query(e)
    }
}

impl From<bson::raw::Error> for IndexError {
    fn from(e: bson::raw::Error) -> Self {
        IndexError::BadValue(e.to_string())
    }
}
