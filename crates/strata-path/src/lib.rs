//! BSON path trees and the projection engine.
//!
//! A path tree compiles a field-path specification (dotted paths,
//! wildcards, projection operators) into an executable trie; the
//! projection engine drives it over source documents. Aggregation
//! expression compilation and evaluation live here too, since expression
//! leaves are part of the tree.

mod build;
mod error;
mod expr;
mod ops;
mod project;
mod tree;
mod vars;

pub use build::{
    BuildOptions, DEFAULT_MAX_PATH_DEPTH, build_projection_tree, build_update_tree,
    normalize_wildcard_projection,
};
pub use error::PathError;
pub use expr::{CompiledExpression, ExprOp, compile, compile_constant, eval};
pub use ops::{OperatorContext, SliceArgs};
pub use project::{ProjectionContext, project};
pub use tree::{ArrayFieldNode, IntermediateNode, PathNode, PathTree, ProjectionMode};
pub use vars::{TimeSnapshot, VarScope};
