use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub enum CursorError {
    CursorNotFound(i64),
    CursorKilled(i64),
    /// The operation observed a cancellation signal; retryable.
    Cancelled,
    DiskFull(String),
    BadContinuation(String),
    Internal(String),
}

impl fmt::Display for CursorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CursorError::CursorNotFound(id) => write!(f, "cursor {id} not found"),
            CursorError::CursorKilled(id) => write!(f, "cursor {id} was killed"),
            CursorError::Cancelled => write!(f, "operation was cancelled"),
            CursorError::DiskFull(msg) => write!(f, "disk full: {msg}"),
            CursorError::BadContinuation(msg) => {
                write!(f, "malformed continuation token: {msg}")
            }
            CursorError::Internal(msg) => write!(f, "internal cursor error: {msg}"),
        }
    }
}

impl std::error::Error for CursorError {}

impl From<std::io::Error> for CursorError {
    fn from(e: std::io::Error) -> Self {
        if e.kind() == std::io::ErrorKind::StorageFull {
            CursorError::DiskFull(e.to_string())
        } else {
            CursorError::Internal(e.to_string())
        }
    }
}

impl From<bson::raw::Error> for CursorError {
    fn from(e: bson::raw::Error) -> Self {
        CursorError::BadContinuation(e.to_string())
    }
}
