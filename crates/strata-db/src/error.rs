use std::fmt;

use strata_cursor::CursorError;
use strata_index::IndexError;
use strata_path::PathError;
use strata_pipeline::PipelineError;
use strata_query::QueryError;
use strata_store::StoreError;

/// Wire-visible error categories with their numeric codes and codeNames.
///
/// Codes follow the MongoDB numbering where one exists;
/// `Location(n)` covers the precisely-numbered compatibility errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    InternalError,
    BadValue,
    FailedToParse,
    TypeMismatch,
    NamespaceNotFound,
    IndexNotFound,
    PathCollision,
    PartialPathCollision,
    UnableToFindIndex,
    IndexOptionsConflict,
    NotWritablePrimary,
    DuplicateKey,
    CursorNotFound,
    CommandNotSupported,
    CursorKilled,
    OperationNotSupportedInTransaction,
    StaleConfig,
    DiskFull,
    Cancelled,
    Location(i32),
}

impl ErrorCode {
    pub fn code(self) -> i32 {
        match self {
            ErrorCode::InternalError => 1,
            ErrorCode::BadValue => 2,
            ErrorCode::FailedToParse => 9,
            ErrorCode::TypeMismatch => 14,
            ErrorCode::NamespaceNotFound => 26,
            ErrorCode::IndexNotFound => 27,
            ErrorCode::PathCollision => 31250,
            ErrorCode::PartialPathCollision => 31249,
            ErrorCode::UnableToFindIndex => 331600,
            ErrorCode::IndexOptionsConflict => 85,
            ErrorCode::NotWritablePrimary => 10107,
            ErrorCode::DuplicateKey => 11000,
            ErrorCode::CursorNotFound => 43,
            ErrorCode::CommandNotSupported => 115,
            ErrorCode::CursorKilled => 237,
            ErrorCode::OperationNotSupportedInTransaction => 263,
            ErrorCode::StaleConfig => 13388,
            ErrorCode::DiskFull => 14031,
            ErrorCode::Cancelled => 11601,
            ErrorCode::Location(n) => n,
        }
    }

    pub fn code_name(self) -> String {
        match self {
            ErrorCode::InternalError => "InternalError".into(),
            ErrorCode::BadValue => "BadValue".into(),
            ErrorCode::FailedToParse => "FailedToParse".into(),
            ErrorCode::TypeMismatch => "TypeMismatch".into(),
            ErrorCode::NamespaceNotFound => "NamespaceNotFound".into(),
            ErrorCode::IndexNotFound => "IndexNotFound".into(),
            ErrorCode::PathCollision => "Location31250".into(),
            ErrorCode::PartialPathCollision => "Location31249".into(),
            ErrorCode::UnableToFindIndex => "UnableToFindIndex".into(),
            ErrorCode::IndexOptionsConflict => "IndexOptionsConflict".into(),
            ErrorCode::NotWritablePrimary => "NotWritablePrimary".into(),
            ErrorCode::DuplicateKey => "DuplicateKey".into(),
            ErrorCode::CursorNotFound => "CursorNotFound".into(),
            ErrorCode::CommandNotSupported => "CommandNotSupported".into(),
            ErrorCode::CursorKilled => "CursorKilled".into(),
            ErrorCode::OperationNotSupportedInTransaction => {
                "OperationNotSupportedInTransaction".into()
            }
            ErrorCode::StaleConfig => "StaleConfig".into(),
            ErrorCode::DiskFull => "OutOfDiskSpace".into(),
            ErrorCode::Cancelled => "Interrupted".into(),
            ErrorCode::Location(n) => format!("Location{n}"),
        }
    }

    /// Cancellation is the one retryable category surfaced here.
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorCode::Cancelled)
    }
}

/// A failed operation as the Protocol Frontend sees it.
#[derive(Debug, Clone, PartialEq)]
pub struct DbError {
    pub code: ErrorCode,
    pub message: String,
}

impl DbError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn bad_value(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::BadValue, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InternalError, message)
    }

    /// The `{ok: 0, errmsg, code, codeName}` reply document.
    pub fn to_response(&self) -> bson::raw::RawDocumentBuf {
        let mut w = strata_bson::DocumentWriter::new();
        w.append("ok", 0.0f64);
        w.append("errmsg", self.message.as_str());
        w.append("code", self.code.code());
        w.append("codeName", self.code.code_name());
        w.into_buf()
    }
}

impl fmt::Display for DbError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}): {}", self.code.code_name(), self.code.code(), self.message)
    }
}

impl std::error::Error for DbError {}

pub type Result<T> = std::result::Result<T, DbError>;

impl From<QueryError> for DbError {
    fn from(e: QueryError) -> Self {
        let code = match &e {
            QueryError::BadValue(_) | QueryError::BadRegex(_) => ErrorCode::BadValue,
            QueryError::FailedToParse(_) => ErrorCode::FailedToParse,
            QueryError::Unsupported(_) => ErrorCode::CommandNotSupported,
        };
        DbError::new(code, e.to_string())
    }
}

impl From<PathError> for DbError {
    fn from(e: PathError) -> Self {
        let code = match &e {
            PathError::PathCollision(_) => ErrorCode::PathCollision,
            PathError::PartialPathCollision { .. } => ErrorCode::PartialPathCollision,
            PathError::DepthExceeded(_) => ErrorCode::FailedToParse,
            PathError::Query(inner) => return DbError::from(inner.clone()),
            PathError::Raw(_) => ErrorCode::TypeMismatch,
            _ => ErrorCode::BadValue,
        };
        DbError::new(code, e.to_string())
    }
}

impl From<PipelineError> for DbError {
    fn from(e: PipelineError) -> Self {
        let code = match &e {
            PipelineError::StageSpecInvalid(_) => ErrorCode::BadValue,
            PipelineError::StageNotSupported(_) => ErrorCode::CommandNotSupported,
            PipelineError::UnknownStage(_) => ErrorCode::Location(40324),
            PipelineError::NamespaceNotFound(_) => ErrorCode::NamespaceNotFound,
            PipelineError::CollationMismatch => ErrorCode::BadValue,
            PipelineError::NestedLimit(_) => ErrorCode::FailedToParse,
            PipelineError::NotAllowedHere { .. } => ErrorCode::BadValue,
            PipelineError::Path(inner) => return DbError::from(inner.clone()),
            PipelineError::Query(inner) => return DbError::from(inner.clone()),
            PipelineError::Index(inner) => return DbError::from(inner.clone()),
            PipelineError::Raw(_) => ErrorCode::TypeMismatch,
        };
        DbError::new(code, e.to_string())
    }
}

impl From<StoreError> for DbError {
    fn from(e: StoreError) -> Self {
        let code = match &e {
            StoreError::NamespaceNotFound(_) => ErrorCode::NamespaceNotFound,
            StoreError::Conflict(_) | StoreError::DuplicateKey(_) => ErrorCode::DuplicateKey,
            StoreError::IndexNotFound(_) => ErrorCode::IndexNotFound,
            StoreError::InvalidDocument(_) => ErrorCode::BadValue,
            StoreError::DiskFull(_) => ErrorCode::DiskFull,
            StoreError::Internal(_) => ErrorCode::InternalError,
        };
        DbError::new(code, e.to_string())
    }
}

impl From<CursorError> for DbError {
    fn from(e: CursorError) -> Self {
        let code = match &e {
            CursorError::CursorNotFound(_) => ErrorCode::CursorNotFound,
            CursorError::CursorKilled(_) => ErrorCode::CursorKilled,
            CursorError::Cancelled => ErrorCode::Cancelled,
            CursorError::DiskFull(_) => ErrorCode::DiskFull,
            CursorError::BadContinuation(_) => ErrorCode::BadValue,
            CursorError::Internal(_) => ErrorCode::InternalError,
        };
        DbError::new(code, e.to_string())
    }
}

impl From<IndexError> for DbError {
    fn from(e: IndexError) -> Self {
        let code = match &e {
            IndexError::BadValue(_) => ErrorCode::BadValue,
            IndexError::IndexOptionsConflict(_) => ErrorCode::IndexOptionsConflict,
            IndexError::UnknownAccessMethod(_) => ErrorCode::BadValue,
            IndexError::RegistryFull | IndexError::DuplicateAccessMethod(_) => {
                ErrorCode::InternalError
            }
            IndexError::UnableToFindIndex(_) => ErrorCode::UnableToFindIndex,
            IndexError::Path(inner) => return DbError::from(inner.clone()),
            IndexError::Query(inner) => return DbError::from(inner.clone()),
        };
        DbError::new(code, e.to_string())
    }
}

impl From<strata_bson::ValueError> for DbError {
    fn from(e: strata_bson::ValueError) -> Self {
        DbError::new(ErrorCode::TypeMismatch, e.to_string())
    }
}

impl From<bson::raw::Error> for DbError {
    fn from(e: bson::raw::Error) -> Self {
        DbError::new(ErrorCode::TypeMismatch, e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_and_names() {
        assert_eq!(ErrorCode::BadValue.code(), 2);
        assert_eq!(ErrorCode::CursorNotFound.code(), 43);
        assert_eq!(ErrorCode::DuplicateKey.code_name(), "DuplicateKey");
        assert_eq!(ErrorCode::Location(40324).code_name(), "Location40324");
        assert!(ErrorCode::Cancelled.is_retryable());
        assert!(!ErrorCode::BadValue.is_retryable());
    }

    #[test]
    fn response_document_shape() {
        let err = DbError::new(ErrorCode::NamespaceNotFound, "db.missing");
        let doc = err.to_response();
        assert_eq!(doc.get("ok").unwrap(), Some(bson::raw::RawBsonRef::Double(0.0)));
        assert_eq!(
            doc.get("code").unwrap(),
            Some(bson::raw::RawBsonRef::Int32(26))
        );
        assert_eq!(
            doc.get("codeName").unwrap(),
            Some(bson::raw::RawBsonRef::String("NamespaceNotFound"))
        );
    }

    #[test]
    fn layer_errors_map_to_codes() {
        let e: DbError = StoreError::DiskFull("spill".into()).into();
        assert_eq!(e.code, ErrorCode::DiskFull);

        let e: DbError = CursorError::Cancelled.into();
        assert_eq!(e.code, ErrorCode::Cancelled);

        let e: DbError = PathError::PathCollision("a".into()).into();
        assert_eq!(e.code.code(), 31250);
    }
}
