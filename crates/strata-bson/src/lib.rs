//! BSON value model: canonical comparison and hashing, dotted-path
//! extraction, document/array builders, encoding validation, and
//! order-preserving index-key encodings.
//!
//! Everything operates on the `bson` crate's zero-copy raw types; bytes
//! are only copied when constructing new values.

mod collation;
mod compare;
mod decimal;
mod error;
mod hash;
mod path;
mod sortable;
mod validate;
mod writer;

pub use collation::{Collation, CollationError, MAX_COLLATION_STRING};
pub use compare::{compare, is_numeric, sort_class, values_equal};
pub use error::{ValueError, ValueErrorKind};
pub use hash::hash_value;
pub use path::{PathSpread, extract_path, extract_path_spread, extract_path_values};
pub use sortable::{
    decode_f64_sortable, decode_i64_sortable, encode_f64_sortable, encode_i64_sortable,
    encode_index_key,
};
pub use validate::{DEFAULT_MAX_DEPTH, validate, validate_with_depth};
pub use writer::{ArrayWriter, DocumentWriter};
