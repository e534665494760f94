use strata_bson::Collation;
use strata_query::SortKey;

use crate::error::PipelineError;
use crate::stage::ParentStage;
use crate::tree::CollectionRef;

/// Deepest pipeline nesting `$lookup`/`$facet`/`$unionWith` may reach.
pub const MAX_NESTED_PIPELINE_LEVEL: usize = 20;

/// Shared state threaded through every stage handler while a pipeline
/// compiles.
#[derive(Debug, Clone)]
pub struct BuildContext {
    /// Current stage number, for diagnostics and parameter tagging.
    pub stage_number: usize,
    /// Nesting depth of this pipeline (0 at top level).
    pub nested_level: usize,
    pub parent_stage: ParentStage,

    /// Inject a subquery before the next stage.
    pub requires_subquery: bool,
    /// One more projection-class transform is free; after that, force a
    /// subquery.
    pub requires_subquery_after_project: bool,

    /// The ordering in effect, when a preceding `$sort` established one.
    pub sort_spec: Option<Vec<SortKey>>,

    /// ICU collation identifier for string comparison, bounded length.
    pub collation: Option<String>,

    pub database: String,
    /// The collection this pipeline currently reads from; `None` for
    /// collectionless pipelines (`$documents`, `$currentOp`).
    pub collection: Option<CollectionRef>,
    /// Path of the target collection's distribution column.
    pub shard_key_path: String,

    pub is_point_read: bool,
    pub requires_persistent_cursor: bool,
    pub is_single_row_result: bool,
    pub requires_tailable_cursor: bool,

    /// Counter for parameterized-query emission; increment before use.
    pub param_counter: usize,

    /// Pipeline-level `let` bindings, as given.
    pub variable_spec: Option<bson::raw::RawDocumentBuf>,

    /// Whether the optimizer pre-pass may transform stages.
    pub optimize: bool,
}

impl BuildContext {
    pub fn new(database: impl Into<String>, collection: Option<CollectionRef>) -> Self {
        Self {
            stage_number: 0,
            nested_level: 0,
            parent_stage: ParentStage::None,
            requires_subquery: false,
            requires_subquery_after_project: false,
            sort_spec: None,
            collation: None,
            database: database.into(),
            collection,
            shard_key_path: "_id".to_string(),
            is_point_read: false,
            requires_persistent_cursor: false,
            is_single_row_result: false,
            requires_tailable_cursor: false,
            param_counter: 0,
            variable_spec: None,
            optimize: true,
        }
    }

    pub fn set_collation(&mut self, collation: &Collation) {
        self.collation = Some(collation.icu_string());
    }

    /// A child context for a pipeline nested under `parent`. Fails once
    /// nesting exceeds [`MAX_NESTED_PIPELINE_LEVEL`].
    pub fn nested(
        &self,
        parent: ParentStage,
        collection: Option<CollectionRef>,
    ) -> Result<BuildContext, PipelineError> {
        let level = self.nested_level + 1;
        if level > MAX_NESTED_PIPELINE_LEVEL {
            return Err(PipelineError::NestedLimit(MAX_NESTED_PIPELINE_LEVEL));
        }
        Ok(BuildContext {
            stage_number: 0,
            nested_level: level,
            parent_stage: parent,
            requires_subquery: false,
            requires_subquery_after_project: false,
            sort_spec: None,
            collation: self.collation.clone(),
            database: self.database.clone(),
            collection,
            shard_key_path: "_id".to_string(),
            is_point_read: false,
            requires_persistent_cursor: false,
            is_single_row_result: false,
            requires_tailable_cursor: false,
            param_counter: 0,
            variable_spec: self.variable_spec.clone(),
            optimize: self.optimize,
        })
    }

    /// Reserve the next parameter number.
    pub fn next_param(&mut self) -> usize {
        self.param_counter += 1;
        self.param_counter
    }

    /// Whether a window-function partition on these paths aligns with the
    /// shard key, letting the partition run shard-local.
    pub fn partition_matches_shard_key(&self, partition_paths: &[String]) -> bool {
        partition_paths.iter().any(|p| *p == self.shard_key_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nested_depth_enforced() {
        let mut ctx = BuildContext::new("db", None);
        for _ in 0..MAX_NESTED_PIPELINE_LEVEL {
            ctx = ctx.nested(ParentStage::Lookup, None).unwrap();
        }
        assert!(matches!(
            ctx.nested(ParentStage::Lookup, None),
            Err(PipelineError::NestedLimit(_))
        ));
    }

    #[test]
    fn nested_inherits_collation() {
        let mut ctx = BuildContext::new("db", None);
        ctx.collation = Some("en-u-ks-level1".into());
        let child = ctx.nested(ParentStage::Facet, None).unwrap();
        assert_eq!(child.collation.as_deref(), Some("en-u-ks-level1"));
        assert_eq!(child.nested_level, 1);
        assert_eq!(child.parent_stage, ParentStage::Facet);
    }

    #[test]
    fn param_counter_increments_before_use() {
        let mut ctx = BuildContext::new("db", None);
        assert_eq!(ctx.next_param(), 1);
        assert_eq!(ctx.next_param(), 2);
    }
}
