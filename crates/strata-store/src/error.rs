use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub enum StoreError {
    NamespaceNotFound(String),
    /// Primary-key conflict on insert.
    Conflict(String),
    IndexNotFound(String),
    /// Unique-index violation.
    DuplicateKey(String),
    InvalidDocument(String),
    DiskFull(String),
    Internal(String),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::NamespaceNotFound(ns) => write!(f, "namespace not found: {ns}"),
            StoreError::Conflict(id) => write!(f, "primary key conflict: {id}"),
            StoreError::IndexNotFound(name) => write!(f, "index not found: {name}"),
            StoreError::DuplicateKey(msg) => write!(f, "duplicate key: {msg}"),
            StoreError::InvalidDocument(msg) => write!(f, "invalid document: {msg}"),
            StoreError::DiskFull(msg) => write!(f, "disk full: {msg}"),
            StoreError::Internal(msg) => write!(f, "internal store error: {msg}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<bson::raw::Error> for StoreError {
    fn from(e: bson::raw::Error) -> Self {
        StoreError::InvalidDocument(e.to_string())
    }
}
