//! Aggregation pipeline compiler: declarative stages in, a relational
//! query tree out. Per-stage handlers transform the in-progress tree
//! under a shared build context; an optimizer pre-pass merges and fuses
//! adjacent stages before handlers run.

mod compile;
mod context;
mod error;
mod handlers;
mod stage;
mod tree;

pub use compile::{compile_pipeline_value, compile_stages};
pub use context::{BuildContext, MAX_NESTED_PIPELINE_LEVEL};
pub use error::PipelineError;
pub use stage::{ParentStage, ParsedStage, Stage, UnwindSpec, parse_stage, parse_unwind};
pub use tree::{
    Accumulator, AccumulatorOp, CollectionRef, LookupJoin, MergeMatched, MergeNotMatched,
    OutputMode, QueryTree, StatsKind, WindowBounds, WindowOutput,
};
