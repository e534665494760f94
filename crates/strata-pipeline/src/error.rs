use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub enum PipelineError {
    /// A stage spec has the wrong shape.
    StageSpecInvalid(String),
    /// The stage exists but this deployment cannot serve it.
    StageNotSupported(String),
    /// Unknown stage name.
    UnknownStage(String),
    NamespaceNotFound(String),
    /// A nested pipeline declares a collation conflicting with its parent.
    CollationMismatch,
    /// Pipeline nesting beyond the allowed depth.
    NestedLimit(usize),
    /// The stage is not allowed in this nested context.
    NotAllowedHere { stage: String, parent: String },
    Path(strata_path::PathError),
    Query(strata_query::QueryError),
    Index(strata_index::IndexError),
    Raw(String),
}

impl fmt::Display for PipelineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineError::StageSpecInvalid(msg) => write!(f, "invalid stage spec: {msg}"),
            PipelineError::StageNotSupported(name) => {
                write!(f, "stage {name} is not supported in this deployment")
            }
            PipelineError::UnknownStage(name) => {
                write!(f, "unrecognized pipeline stage name: {name}")
            }
            PipelineError::NamespaceNotFound(ns) => write!(f, "namespace not found: {ns}"),
            PipelineError::CollationMismatch => {
                write!(f, "nested pipeline declares a conflicting collation")
            }
            PipelineError::NestedLimit(max) => {
                write!(f, "pipeline nesting exceeds the maximum depth of {max}")
            }
            PipelineError::NotAllowedHere { stage, parent } => {
                write!(f, "{stage} is not allowed inside {parent}")
            }
            PipelineError::Path(e) => write!(f, "{e}"),
            PipelineError::Query(e) => write!(f, "{e}"),
            PipelineError::Index(e) => write!(f, "{e}"),
            PipelineError::Raw(msg) => write!(f, "malformed pipeline document: {msg}"),
        }
    }
}

impl std::error::Error for PipelineError {}

impl From<strata_path::PathError> for PipelineError {
    fn from(e: strata_path::PathError) -> Self {
        PipelineError::Path(e)
    }
}

impl From<strata_query::QueryError> for PipelineError {
    fn from(e: strata_query::QueryError) -> Self {
        PipelineError::Query(e)
    }
}

impl From<strata_index::IndexError> for PipelineError {
    fn from(e: strata_index::IndexError) -> Self {
        PipelineError::Index(e)
    }
}

impl From<bson::raw::Error> for PipelineError {
    fn from(e: bson::raw::Error) -> Self {
        PipelineError::Raw(e.to_string())
    }
}
