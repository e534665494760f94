pub(crate) mod doc_utils;
mod nodes;

use std::collections::HashMap;
use std::time::Instant;

use bson::RawBson;
use bson::raw::RawDocumentBuf;

use strata_cursor::CancellationToken;
use strata_path::{TimeSnapshot, VarScope};
use strata_pipeline::QueryTree;
use strata_store::{RowPosition, RowStore};

use crate::error::{DbError, ErrorCode, Result};

/// The filter predicate nearest above the tree's base access, if any.
fn upstream_predicate(tree: &QueryTree) -> Option<&strata_query::Expression> {
    match tree {
        QueryTree::Filter { predicate, .. } => Some(predicate),
        QueryTree::IndexScan { residual, .. } => residual.as_ref(),
        other => other.input().and_then(upstream_predicate),
    }
}

/// A row flowing through the reference backend: the document plus, while
/// the plan is a streaming chain, the primary-key position it came from
/// (continuation support). Blocking nodes clear positions.
#[derive(Debug, Clone)]
pub struct SourcedDoc {
    pub position: Option<RowPosition>,
    pub doc: RawDocumentBuf,
}

impl SourcedDoc {
    pub fn new(doc: RawDocumentBuf) -> Self {
        Self {
            position: None,
            doc,
        }
    }

    pub fn at(position: RowPosition, doc: RawDocumentBuf) -> Self {
        Self {
            position: Some(position),
            doc,
        }
    }
}

/// Evaluates query trees against the Row Store.
///
/// This is the reference backend used by tests and the cursor layer; a
/// relational substrate with its own optimizer replaces it in a full
/// deployment. Cancellation and the statement deadline are observed
/// between rows.
pub struct Executor<'a> {
    pub(crate) store: &'a dyn RowStore,
    pub(crate) snapshot: TimeSnapshot,
    pub(crate) variables: HashMap<String, RawBson>,
    pub(crate) cancellation: CancellationToken,
    pub(crate) deadline: Option<Instant>,
}

impl<'a> Executor<'a> {
    pub fn new(store: &'a dyn RowStore, snapshot: TimeSnapshot) -> Self {
        Self {
            store,
            snapshot,
            variables: HashMap::new(),
            cancellation: CancellationToken::new(),
            deadline: None,
        }
    }

    pub fn with_variables(mut self, variables: HashMap<String, RawBson>) -> Self {
        self.variables = variables;
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub(crate) fn scope(&self) -> VarScope<'_> {
        VarScope::with_vars(self.variables.clone())
    }

    pub(crate) fn check_interrupt(&self) -> Result<()> {
        if self.cancellation.is_cancelled() {
            return Err(DbError::new(ErrorCode::Cancelled, "operation was cancelled"));
        }
        if self.deadline.is_some_and(|d| Instant::now() > d) {
            self.cancellation.cancel();
            return Err(DbError::new(
                ErrorCode::Cancelled,
                "operation exceeded its time limit",
            ));
        }
        Ok(())
    }

    /// Execute a tree, optionally resuming the base table access strictly
    /// after `resume` (streamable getMore).
    pub fn execute(
        &self,
        tree: &QueryTree,
        resume: Option<&RowPosition>,
    ) -> Result<Vec<SourcedDoc>> {
        self.check_interrupt()?;
        match tree {
            QueryTree::Scan { collection } => nodes::scan::scan(self, collection, resume),
            QueryTree::PointRead {
                collection,
                object_id,
            } => nodes::scan::point_read(self, collection, object_id),
            QueryTree::IndexScan {
                collection,
                index_path,
                lower,
                upper,
                reverse,
                residual,
            } => nodes::scan::index_scan(
                self, collection, index_path, lower, upper, *reverse, residual, resume,
            ),
            QueryTree::Documents { docs } => Ok(docs
                .iter()
                .map(|d| SourcedDoc::new(d.clone()))
                .collect()),
            QueryTree::MetaStats { kind, collection } => {
                nodes::stats::meta_stats(self, *kind, collection)
            }

            QueryTree::Filter { predicate, input } => {
                let rows = self.execute(input, resume)?;
                nodes::filter::filter(self, predicate, rows)
            }
            QueryTree::Project { projection, input } => {
                let rows = self.execute(input, resume)?;
                // The positional operator resolves against the query that
                // selected the rows.
                let query = upstream_predicate(input);
                nodes::project::project(self, projection, query, rows)
            }
            QueryTree::AddFields { additions, input } => {
                let rows = self.execute(input, resume)?;
                nodes::project::add_fields(self, additions, rows)
            }
            QueryTree::ReplaceRoot { expression, input } => {
                let rows = self.execute(input, resume)?;
                nodes::project::replace_root(self, expression, rows)
            }
            QueryTree::Redact { expression, input } => {
                let rows = self.execute(input, resume)?;
                nodes::project::redact(self, expression, rows)
            }

            QueryTree::Sort { keys, input } => {
                let rows = self.execute(input, resume)?;
                nodes::sort_limit::sort(keys, rows)
            }
            QueryTree::Limit { limit, input } => {
                let mut rows = self.execute(input, resume)?;
                rows.truncate(*limit as usize);
                // A limit is relative to the whole stream; resuming the
                // base scan would re-apply it, so positions stop here.
                for row in &mut rows {
                    row.position = None;
                }
                Ok(rows)
            }
            QueryTree::Skip { skip, input } => {
                let rows = self.execute(input, resume)?;
                let mut rows: Vec<SourcedDoc> =
                    rows.into_iter().skip(*skip as usize).collect();
                for row in &mut rows {
                    row.position = None;
                }
                Ok(rows)
            }
            QueryTree::Sample { size, input } => {
                let rows = self.execute(input, resume)?;
                nodes::sort_limit::sample(*size, rows)
            }

            QueryTree::Group {
                key,
                accumulators,
                input,
            } => {
                let rows = self.execute(input, None)?;
                nodes::group::group(self, key, accumulators, rows)
            }
            QueryTree::BucketAuto {
                group_by,
                buckets,
                accumulators,
                input,
            } => {
                let rows = self.execute(input, None)?;
                nodes::group::bucket_auto(self, group_by, *buckets, accumulators, rows)
            }

            QueryTree::Unwind { spec, input } => {
                let rows = self.execute(input, resume)?;
                nodes::unwind::unwind(spec, rows)
            }

            QueryTree::Lookup { join, input } => {
                let rows = self.execute(input, None)?;
                nodes::lookup::lookup(self, join, rows)
            }
            QueryTree::LookupUnwind {
                join,
                unwind,
                input,
            } => {
                let rows = self.execute(input, None)?;
                nodes::lookup::lookup_unwind(self, join, unwind, rows)
            }
            QueryTree::RecursiveTraverse {
                from,
                start_with,
                connect_from_field,
                connect_to_field,
                as_field,
                max_depth,
                depth_field,
                restrict,
                input,
            } => {
                let rows = self.execute(input, None)?;
                nodes::lookup::graph_lookup(
                    self,
                    from,
                    start_with,
                    connect_from_field,
                    connect_to_field,
                    as_field,
                    *max_depth,
                    depth_field.as_deref(),
                    restrict.as_ref(),
                    rows,
                )
            }

            QueryTree::UnionAll { input, other } => {
                let mut rows = self.execute(input, None)?;
                rows.extend(self.execute(other, None)?);
                for row in &mut rows {
                    row.position = None;
                }
                Ok(rows)
            }
            QueryTree::Facet { arms, input } => nodes::combine::facet(self, arms, input),
            QueryTree::WindowFields {
                partition_by,
                sort,
                outputs,
                input,
                ..
            } => {
                let rows = self.execute(input, None)?;
                nodes::window::window_fields(self, partition_by.as_ref(), sort, outputs, rows)
            }
            QueryTree::Output {
                target,
                mode,
                input,
            } => {
                let rows = self.execute(input, None)?;
                nodes::output::output(self, target, mode, rows)
            }

            // Materialization barriers are explicit in the tree; the
            // reference backend materializes everywhere, so they pass
            // rows through (positions cleared to keep continuation
            // honest).
            QueryTree::Subquery { input } | QueryTree::OptimizationFence { input } => {
                let mut rows = self.execute(input, resume)?;
                if matches!(tree, QueryTree::Subquery { .. }) {
                    for row in &mut rows {
                        row.position = None;
                    }
                }
                Ok(rows)
            }
        }
    }
}
