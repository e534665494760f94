use bson::raw::RawBsonRef;

use crate::compile::compile_pipeline_value;
use crate::context::BuildContext;
use crate::error::PipelineError;
use crate::stage::ParentStage;
use crate::tree::{CollectionRef, QueryTree};

/// `$facet`: N sub-pipelines over the same materialized input, each arm
/// collected into an array field of one output row.
pub(super) fn facet(
    spec: RawBsonRef<'_>,
    input: QueryTree,
    ctx: &mut BuildContext,
) -> Result<QueryTree, PipelineError> {
    let RawBsonRef::Document(doc) = spec else {
        return Err(PipelineError::StageSpecInvalid("$facet needs a document".into()));
    };

    let shared_input = QueryTree::Subquery {
        input: input.boxed(),
    };
    let mut arms = Vec::new();
    for entry in doc.iter() {
        let (name, pipeline) = entry?;
        if name.is_empty() || name.starts_with('$') || name.contains('.') {
            return Err(PipelineError::StageSpecInvalid(format!(
                "invalid $facet output field '{name}'"
            )));
        }
        if !matches!(pipeline, RawBsonRef::Array(_)) {
            return Err(PipelineError::StageSpecInvalid(format!(
                "$facet arm '{name}' must be a pipeline array"
            )));
        }
        let mut arm_ctx = ctx.nested(ParentStage::Facet, ctx.collection.clone())?;
        // Each arm re-reads the shared materialized input.
        let seed = QueryTree::Subquery {
            input: shared_input.clone().boxed(),
        };
        let arm = compile_pipeline_value(pipeline, seed, &mut arm_ctx)?;
        arms.push((name.to_string(), arm));
    }

    if arms.is_empty() {
        return Err(PipelineError::StageSpecInvalid(
            "$facet requires at least one arm".into(),
        ));
    }
    ctx.is_single_row_result = true;
    Ok(QueryTree::Facet {
        arms,
        input: shared_input.boxed(),
    })
}

/// `$unionWith`: append another collection's (optionally piped) rows.
pub(super) fn union_with(
    spec: RawBsonRef<'_>,
    input: QueryTree,
    ctx: &mut BuildContext,
) -> Result<QueryTree, PipelineError> {
    let (collection, pipeline_spec) = match spec {
        RawBsonRef::String(coll) => (CollectionRef::new(ctx.database.clone(), coll), None),
        RawBsonRef::Document(doc) => {
            let mut coll = None;
            let mut pipeline = None;
            for entry in doc.iter() {
                let (field, value) = entry?;
                match (field, value) {
                    ("coll", RawBsonRef::String(name)) => {
                        coll = Some(CollectionRef::new(ctx.database.clone(), name));
                    }
                    ("pipeline", RawBsonRef::Array(_)) => pipeline = Some(value.to_raw_bson()),
                    (other, _) => {
                        return Err(PipelineError::StageSpecInvalid(format!(
                            "unknown or badly typed $unionWith field '{other}'"
                        )));
                    }
                }
            }
            let coll = coll.ok_or_else(|| {
                PipelineError::StageSpecInvalid("$unionWith requires 'coll'".into())
            })?;
            (coll, pipeline)
        }
        _ => {
            return Err(PipelineError::StageSpecInvalid(
                "$unionWith needs a collection name or options document".into(),
            ));
        }
    };

    let seed = QueryTree::Scan {
        collection: collection.clone(),
    };
    let other = match pipeline_spec {
        Some(pipeline) => {
            let mut child_ctx = ctx.nested(ParentStage::UnionWith, Some(collection))?;
            compile_pipeline_value(pipeline.as_raw_bson_ref(), seed, &mut child_ctx)?
        }
        None => seed,
    };

    // Union output has no defined ordering.
    ctx.sort_spec = None;
    Ok(QueryTree::UnionAll {
        input: input.boxed(),
        other: other.boxed(),
    })
}
