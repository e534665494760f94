use std::fmt;

/// What went wrong while decoding or validating a BSON value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueErrorKind {
    /// The document's length prefix disagrees with its contents.
    LengthMismatch,
    /// An element carries a type tag outside the closed set.
    UnknownTypeTag(u8),
    /// A field name or string is not valid UTF-8 or lacks its terminator.
    BadString,
    /// The buffer ended before the element it promised.
    Truncated,
    /// Nesting exceeds the configured depth bound.
    DepthExceeded,
    /// A value's fixed-size payload has the wrong length.
    BadPayload,
}

/// Structured decode error: the kind plus the byte offset it was detected at.
///
/// Decoding never panics; every malformed input maps to one of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValueError {
    pub kind: ValueErrorKind,
    pub offset: usize,
}

impl ValueError {
    pub(crate) fn new(kind: ValueErrorKind, offset: usize) -> Self {
        Self { kind, offset }
    }
}

impl fmt::Display for ValueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            ValueErrorKind::LengthMismatch => {
                write!(f, "length prefix mismatch at offset {}", self.offset)
            }
            ValueErrorKind::UnknownTypeTag(tag) => {
                write!(f, "unknown type tag 0x{tag:02x} at offset {}", self.offset)
            }
            ValueErrorKind::BadString => {
                write!(f, "malformed string at offset {}", self.offset)
            }
            ValueErrorKind::Truncated => {
                write!(f, "document truncated at offset {}", self.offset)
            }
            ValueErrorKind::DepthExceeded => {
                write!(f, "nesting depth bound exceeded at offset {}", self.offset)
            }
            ValueErrorKind::BadPayload => {
                write!(f, "bad value payload at offset {}", self.offset)
            }
        }
    }
}

impl std::error::Error for ValueError {}
