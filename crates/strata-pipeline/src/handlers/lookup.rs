use bson::raw::RawBsonRef;

use strata_path::compile;
use strata_query::parse_filter;

use crate::compile::compile_pipeline_value;
use crate::context::BuildContext;
use crate::error::PipelineError;
use crate::stage::{ParentStage, ParsedStage};
use crate::tree::{CollectionRef, LookupJoin, QueryTree};

/// `$lookup`, plus the fused `$lookup`+`$unwind` form when the parse
/// carries a folded unwind.
pub(super) fn lookup(
    parsed: &ParsedStage,
    input: QueryTree,
    ctx: &mut BuildContext,
) -> Result<QueryTree, PipelineError> {
    let RawBsonRef::Document(doc) = parsed.spec.as_raw_bson_ref() else {
        return Err(PipelineError::StageSpecInvalid("$lookup needs a document".into()));
    };

    let mut from = None;
    let mut local_field = None;
    let mut foreign_field = None;
    let mut as_field = None;
    let mut let_vars = Vec::new();
    let mut pipeline_spec = None;

    for entry in doc.iter() {
        let (field, value) = entry?;
        match (field, value) {
            ("from", RawBsonRef::String(coll)) => {
                from = Some(CollectionRef::new(ctx.database.clone(), coll));
            }
            ("localField", RawBsonRef::String(path)) => local_field = Some(path.to_string()),
            ("foreignField", RawBsonRef::String(path)) => foreign_field = Some(path.to_string()),
            ("as", RawBsonRef::String(path)) => as_field = Some(path.to_string()),
            ("let", RawBsonRef::Document(vars)) => {
                for var in vars.iter() {
                    let (name, spec) = var?;
                    let_vars.push((name.to_string(), compile(spec)?));
                }
            }
            ("pipeline", RawBsonRef::Array(_)) => pipeline_spec = Some(value.to_raw_bson()),
            (other, _) => {
                return Err(PipelineError::StageSpecInvalid(format!(
                    "unknown or badly typed $lookup field '{other}'"
                )));
            }
        }
    }

    let from = from.ok_or_else(|| {
        PipelineError::StageSpecInvalid("$lookup requires 'from'".into())
    })?;
    let as_field = as_field.ok_or_else(|| {
        PipelineError::StageSpecInvalid("$lookup requires 'as'".into())
    })?;
    if local_field.is_some() != foreign_field.is_some() {
        return Err(PipelineError::StageSpecInvalid(
            "$lookup needs both localField and foreignField or neither".into(),
        ));
    }
    if local_field.is_none() && pipeline_spec.is_none() {
        return Err(PipelineError::StageSpecInvalid(
            "$lookup needs localField/foreignField or a pipeline".into(),
        ));
    }

    let pipeline = match pipeline_spec {
        Some(spec) => {
            let mut child_ctx = ctx.nested(ParentStage::Lookup, Some(from.clone()))?;
            let seed = QueryTree::Scan {
                collection: from.clone(),
            };
            Some(
                compile_pipeline_value(spec.as_raw_bson_ref(), seed, &mut child_ctx)?.boxed(),
            )
        }
        None => None,
    };

    let join = LookupJoin {
        from,
        as_field,
        local_field,
        foreign_field,
        pipeline,
        let_vars,
    };

    match &parsed.fused_unwind {
        Some(unwind) => Ok(QueryTree::LookupUnwind {
            join,
            unwind: unwind.clone(),
            input: input.boxed(),
        }),
        None => Ok(QueryTree::Lookup {
            join,
            input: input.boxed(),
        }),
    }
}

pub(super) fn graph_lookup(
    spec: RawBsonRef<'_>,
    input: QueryTree,
    ctx: &mut BuildContext,
) -> Result<QueryTree, PipelineError> {
    let RawBsonRef::Document(doc) = spec else {
        return Err(PipelineError::StageSpecInvalid(
            "$graphLookup needs a document".into(),
        ));
    };

    let mut from = None;
    let mut start_with = None;
    let mut connect_from = None;
    let mut connect_to = None;
    let mut as_field = None;
    let mut max_depth = None;
    let mut depth_field = None;
    let mut restrict = None;

    for entry in doc.iter() {
        let (field, value) = entry?;
        match (field, value) {
            ("from", RawBsonRef::String(coll)) => {
                from = Some(CollectionRef::new(ctx.database.clone(), coll));
            }
            ("startWith", v) => start_with = Some(compile(v)?),
            ("connectFromField", RawBsonRef::String(path)) => {
                connect_from = Some(path.to_string());
            }
            ("connectToField", RawBsonRef::String(path)) => connect_to = Some(path.to_string()),
            ("as", RawBsonRef::String(path)) => as_field = Some(path.to_string()),
            ("maxDepth", v) => {
                max_depth = super::core::integer_of(v).filter(|n| *n >= 0).map(|n| n as u64);
                if max_depth.is_none() {
                    return Err(PipelineError::StageSpecInvalid(
                        "$graphLookup maxDepth must be a non-negative integer".into(),
                    ));
                }
            }
            ("depthField", RawBsonRef::String(name)) => depth_field = Some(name.to_string()),
            ("restrictSearchWithMatch", RawBsonRef::Document(filter)) => {
                restrict = Some(parse_filter(filter)?);
            }
            (other, _) => {
                return Err(PipelineError::StageSpecInvalid(format!(
                    "unknown or badly typed $graphLookup field '{other}'"
                )));
            }
        }
    }

    let missing = |name: &str| {
        PipelineError::StageSpecInvalid(format!("$graphLookup requires '{name}'"))
    };
    Ok(QueryTree::RecursiveTraverse {
        from: from.ok_or_else(|| missing("from"))?,
        start_with: start_with.ok_or_else(|| missing("startWith"))?,
        connect_from_field: connect_from.ok_or_else(|| missing("connectFromField"))?,
        connect_to_field: connect_to.ok_or_else(|| missing("connectToField"))?,
        as_field: as_field.ok_or_else(|| missing("as"))?,
        max_depth,
        depth_field,
        restrict,
        input: input.boxed(),
    })
}
