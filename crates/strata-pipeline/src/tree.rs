use bson::RawBson;
use bson::raw::RawDocumentBuf;

use strata_path::{CompiledExpression, PathTree};
use strata_query::{Expression, SortKey};

use crate::stage::UnwindSpec;

/// A collection reference inside a query tree.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CollectionRef {
    pub database: String,
    pub collection: String,
}

impl CollectionRef {
    pub fn new(database: impl Into<String>, collection: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            collection: collection.into(),
        }
    }

    pub fn namespace(&self) -> String {
        format!("{}.{}", self.database, self.collection)
    }
}

/// The relational query tree the pipeline compiler emits.
///
/// A pre-existing planner/executor consumes this; the compiler guarantees
/// shape and semantics, nothing about physical access paths except where
/// a node pins one (`PointRead`, `IndexScan`).
#[derive(Debug, Clone)]
pub enum QueryTree {
    /// Full scan of a collection's table in primary-key order.
    Scan { collection: CollectionRef },
    /// Single-row read by primary key.
    PointRead {
        collection: CollectionRef,
        object_id: RawBson,
    },
    /// Ordered secondary-index range scan.
    IndexScan {
        collection: CollectionRef,
        index_path: String,
        lower: Option<(RawBson, bool)>,
        upper: Option<(RawBson, bool)>,
        reverse: bool,
        /// Filter re-checked on fetched rows (residual predicates).
        residual: Option<Expression>,
    },
    /// Caller-provided documents (`$documents`).
    Documents { docs: Vec<RawDocumentBuf> },

    Filter {
        predicate: Expression,
        input: Box<QueryTree>,
    },
    Project {
        projection: PathTree,
        input: Box<QueryTree>,
    },
    /// Merge computed fields into the document (`$addFields` / `$set`).
    AddFields {
        additions: PathTree,
        input: Box<QueryTree>,
    },
    ReplaceRoot {
        expression: CompiledExpression,
        input: Box<QueryTree>,
    },
    Redact {
        expression: CompiledExpression,
        input: Box<QueryTree>,
    },
    Sort {
        keys: Vec<SortKey>,
        input: Box<QueryTree>,
    },
    Limit {
        limit: u64,
        input: Box<QueryTree>,
    },
    Skip {
        skip: u64,
        input: Box<QueryTree>,
    },
    Sample {
        size: u64,
        input: Box<QueryTree>,
    },
    Group {
        key: CompiledExpression,
        accumulators: Vec<Accumulator>,
        input: Box<QueryTree>,
    },
    /// `$bucketAuto`: evenly sized buckets over the sorted groupBy value;
    /// boundaries are data-dependent, so the split happens at execution.
    BucketAuto {
        group_by: CompiledExpression,
        buckets: u64,
        accumulators: Vec<Accumulator>,
        input: Box<QueryTree>,
    },
    Unwind {
        spec: UnwindSpec,
        input: Box<QueryTree>,
    },
    /// `$lookup`: a left lateral join collecting matches into an array
    /// field.
    Lookup {
        join: LookupJoin,
        input: Box<QueryTree>,
    },
    /// Fused `$lookup` + `$unwind` on the lookup's `as` field: lowers to
    /// an inner or left join with the unwound shape inlined.
    LookupUnwind {
        join: LookupJoin,
        unwind: UnwindSpec,
        input: Box<QueryTree>,
    },
    /// `$graphLookup`: recursive traversal seeded from the input row.
    RecursiveTraverse {
        from: CollectionRef,
        start_with: CompiledExpression,
        connect_from_field: String,
        connect_to_field: String,
        as_field: String,
        max_depth: Option<u64>,
        depth_field: Option<String>,
        restrict: Option<Expression>,
        input: Box<QueryTree>,
    },
    UnionAll {
        input: Box<QueryTree>,
        other: Box<QueryTree>,
    },
    /// `$facet`: evaluate each arm over the same input, collect each
    /// arm's rows as an array field of a single output row.
    Facet {
        arms: Vec<(String, QueryTree)>,
        input: Box<QueryTree>,
    },
    /// `$setWindowFields` lowering: window expressions over partitions.
    WindowFields {
        partition_by: Option<CompiledExpression>,
        sort: Vec<SortKey>,
        outputs: Vec<WindowOutput>,
        /// Partition keys align with the shard key; the partition may be
        /// delegated shard-local.
        shard_aligned: bool,
        input: Box<QueryTree>,
    },
    /// Collection statistics surface (`$collStats` / `$indexStats`).
    MetaStats {
        kind: StatsKind,
        collection: CollectionRef,
    },
    /// `$out` / `$merge` terminal stage.
    Output {
        target: CollectionRef,
        mode: OutputMode,
        input: Box<QueryTree>,
    },
    /// Materialization barrier: the inner output is a table for the next
    /// stage.
    Subquery { input: Box<QueryTree> },
    /// Fence that stops the optimizer from transforming across it.
    OptimizationFence { input: Box<QueryTree> },
}

#[derive(Debug, Clone)]
pub struct LookupJoin {
    pub from: CollectionRef,
    pub as_field: String,
    /// Equality join on `local_field = foreign_field`, when given.
    pub local_field: Option<String>,
    pub foreign_field: Option<String>,
    /// Correlated sub-pipeline over the foreign collection.
    pub pipeline: Option<Box<QueryTree>>,
    /// `let` bindings visible to the sub-pipeline.
    pub let_vars: Vec<(String, CompiledExpression)>,
}

#[derive(Debug, Clone)]
pub struct Accumulator {
    pub field: String,
    pub op: AccumulatorOp,
    pub argument: CompiledExpression,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccumulatorOp {
    Sum,
    Avg,
    Min,
    Max,
    First,
    Last,
    Push,
    AddToSet,
    Count,
}

#[derive(Debug, Clone)]
pub struct WindowOutput {
    pub field: String,
    pub op: AccumulatorOp,
    pub argument: CompiledExpression,
    pub window: WindowBounds,
}

/// Window frame over the partition's sort order.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum WindowBounds {
    /// The whole partition.
    #[default]
    Unbounded,
    /// `documents: [lower, upper]` offsets relative to the current row;
    /// `None` = unbounded on that side.
    Documents(Option<i64>, Option<i64>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatsKind {
    Collection,
    Indexes,
}

#[derive(Debug, Clone, PartialEq)]
pub enum OutputMode {
    /// `$out`: replace the target collection's contents.
    Replace,
    /// `$merge`.
    Merge {
        on: Vec<String>,
        when_matched: MergeMatched,
        when_not_matched: MergeNotMatched,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeMatched {
    Replace,
    KeepExisting,
    Merge,
    Fail,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeNotMatched {
    Insert,
    Discard,
    Fail,
}

impl QueryTree {
    pub fn boxed(self) -> Box<QueryTree> {
        Box::new(self)
    }

    /// The input of a unary node, if this node has one.
    pub fn input(&self) -> Option<&QueryTree> {
        match self {
            QueryTree::Filter { input, .. }
            | QueryTree::Project { input, .. }
            | QueryTree::AddFields { input, .. }
            | QueryTree::ReplaceRoot { input, .. }
            | QueryTree::Redact { input, .. }
            | QueryTree::Sort { input, .. }
            | QueryTree::Limit { input, .. }
            | QueryTree::Skip { input, .. }
            | QueryTree::Sample { input, .. }
            | QueryTree::Group { input, .. }
            | QueryTree::BucketAuto { input, .. }
            | QueryTree::Unwind { input, .. }
            | QueryTree::Lookup { input, .. }
            | QueryTree::LookupUnwind { input, .. }
            | QueryTree::RecursiveTraverse { input, .. }
            | QueryTree::UnionAll { input, .. }
            | QueryTree::Facet { input, .. }
            | QueryTree::WindowFields { input, .. }
            | QueryTree::Output { input, .. }
            | QueryTree::Subquery { input }
            | QueryTree::OptimizationFence { input } => Some(input),
            QueryTree::Scan { .. }
            | QueryTree::PointRead { .. }
            | QueryTree::IndexScan { .. }
            | QueryTree::Documents { .. }
            | QueryTree::MetaStats { .. } => None,
        }
    }

    /// Depth-first check for a node satisfying the predicate.
    pub fn any_node(&self, pred: &dyn Fn(&QueryTree) -> bool) -> bool {
        if pred(self) {
            return true;
        }
        match self {
            QueryTree::UnionAll { input, other } => {
                input.any_node(pred) || other.any_node(pred)
            }
            QueryTree::Facet { arms, input } => {
                input.any_node(pred) || arms.iter().any(|(_, arm)| arm.any_node(pred))
            }
            QueryTree::Lookup { join, input } | QueryTree::LookupUnwind { join, input, .. } => {
                input.any_node(pred)
                    || join
                        .pipeline
                        .as_ref()
                        .is_some_and(|p| p.any_node(pred))
            }
            other => other.input().is_some_and(|i| i.any_node(pred)),
        }
    }
}
