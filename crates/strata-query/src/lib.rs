//! Find-query layer: filter parsing and evaluation, sort specifications,
//! and update (mutation) operators, all over raw BSON documents.

mod error;
mod eval;
mod filter;
mod mutation;
mod parse;
mod sort;

pub use error::QueryError;
pub use eval::{ExprHook, first_match_index, matches, matches_with};
pub use filter::{
    BitsOp, CompareOp, CompiledRegex, Expression, FieldPredicate, TypeMatch,
};
pub use mutation::{FieldUpdate, UpdateOp, UpdateSpec, apply_update, parse_update};
pub use parse::parse_filter;
pub use sort::{SortKey, compare_docs, parse_sort};
