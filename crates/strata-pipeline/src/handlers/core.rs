use bson::raw::{RawBsonRef, RawDocumentBuf};

use strata_path::{BuildOptions, build_projection_tree, compile};
use strata_query::{parse_filter, parse_sort};

use crate::context::BuildContext;
use crate::error::PipelineError;
use crate::stage::parse_unwind;
use crate::tree::{Accumulator, AccumulatorOp, QueryTree};

pub(super) fn match_stage(
    spec: RawBsonRef<'_>,
    input: QueryTree,
    _ctx: &mut BuildContext,
) -> Result<QueryTree, PipelineError> {
    let RawBsonRef::Document(filter_doc) = spec else {
        return Err(PipelineError::StageSpecInvalid("$match needs a document".into()));
    };
    let predicate = parse_filter(filter_doc)?;
    Ok(QueryTree::Filter {
        predicate,
        input: input.boxed(),
    })
}

pub(super) fn sort(
    spec: RawBsonRef<'_>,
    input: QueryTree,
    ctx: &mut BuildContext,
) -> Result<QueryTree, PipelineError> {
    let RawBsonRef::Document(sort_doc) = spec else {
        return Err(PipelineError::StageSpecInvalid("$sort needs a document".into()));
    };
    let keys = parse_sort(sort_doc)?;
    if keys.is_empty() {
        return Err(PipelineError::StageSpecInvalid("$sort must name a key".into()));
    }
    ctx.sort_spec = Some(keys.clone());
    Ok(QueryTree::Sort {
        keys,
        input: input.boxed(),
    })
}

pub(super) fn limit(spec: RawBsonRef<'_>, input: QueryTree) -> Result<QueryTree, PipelineError> {
    let n = non_negative_int(spec, "$limit")?;
    Ok(QueryTree::Limit {
        limit: n,
        input: input.boxed(),
    })
}

pub(super) fn skip(spec: RawBsonRef<'_>, input: QueryTree) -> Result<QueryTree, PipelineError> {
    let n = non_negative_int(spec, "$skip")?;
    Ok(QueryTree::Skip {
        skip: n,
        input: input.boxed(),
    })
}

pub(super) fn sample(spec: RawBsonRef<'_>, input: QueryTree) -> Result<QueryTree, PipelineError> {
    let RawBsonRef::Document(doc) = spec else {
        return Err(PipelineError::StageSpecInvalid("$sample needs {size: n}".into()));
    };
    let size = doc
        .get("size")
        .ok()
        .flatten()
        .and_then(|v| integer_of(v))
        .filter(|n| *n >= 0)
        .ok_or_else(|| PipelineError::StageSpecInvalid("$sample needs {size: n}".into()))?;
    Ok(QueryTree::Sample {
        size: size as u64,
        input: input.boxed(),
    })
}

pub(super) fn project(spec: RawBsonRef<'_>, input: QueryTree) -> Result<QueryTree, PipelineError> {
    let RawBsonRef::Document(doc) = spec else {
        return Err(PipelineError::StageSpecInvalid("$project needs a document".into()));
    };
    if doc.iter().next().is_none() {
        return Err(PipelineError::StageSpecInvalid(
            "$project requires at least one field".into(),
        ));
    }
    let projection = build_projection_tree(doc, &BuildOptions::find_projection())?;
    Ok(QueryTree::Project {
        projection,
        input: input.boxed(),
    })
}

pub(super) fn add_fields(
    spec: RawBsonRef<'_>,
    input: QueryTree,
) -> Result<QueryTree, PipelineError> {
    let RawBsonRef::Document(doc) = spec else {
        return Err(PipelineError::StageSpecInvalid(
            "$addFields needs a document".into(),
        ));
    };
    if doc.iter().next().is_none() {
        return Err(PipelineError::StageSpecInvalid(
            "$addFields requires at least one field".into(),
        ));
    }
    let additions = build_projection_tree(doc, &BuildOptions::field_expressions())?;
    Ok(QueryTree::AddFields {
        additions,
        input: input.boxed(),
    })
}

pub(super) fn unset(spec: RawBsonRef<'_>, input: QueryTree) -> Result<QueryTree, PipelineError> {
    let mut exclusion = RawDocumentBuf::new();
    match spec {
        RawBsonRef::String(path) if !path.is_empty() => {
            exclusion.append(path, 0i32);
        }
        RawBsonRef::Array(paths) => {
            let mut any = false;
            for p in paths {
                match p? {
                    RawBsonRef::String(path) if !path.is_empty() => {
                        exclusion.append(path, 0i32);
                        any = true;
                    }
                    _ => {
                        return Err(PipelineError::StageSpecInvalid(
                            "$unset array elements must be non-empty strings".into(),
                        ));
                    }
                }
            }
            if !any {
                return Err(PipelineError::StageSpecInvalid(
                    "$unset array must not be empty".into(),
                ));
            }
        }
        _ => {
            return Err(PipelineError::StageSpecInvalid(
                "$unset needs a field path or array of field paths".into(),
            ));
        }
    }
    let projection = build_projection_tree(&exclusion, &BuildOptions::default())?;
    Ok(QueryTree::Project {
        projection,
        input: input.boxed(),
    })
}

pub(super) fn replace_root(
    spec: RawBsonRef<'_>,
    input: QueryTree,
) -> Result<QueryTree, PipelineError> {
    let RawBsonRef::Document(doc) = spec else {
        return Err(PipelineError::StageSpecInvalid(
            "$replaceRoot needs {newRoot: <expression>}".into(),
        ));
    };
    let new_root = doc.get("newRoot").ok().flatten().ok_or_else(|| {
        PipelineError::StageSpecInvalid("$replaceRoot needs {newRoot: <expression>}".into())
    })?;
    Ok(QueryTree::ReplaceRoot {
        expression: compile(new_root)?,
        input: input.boxed(),
    })
}

pub(super) fn replace_with(
    spec: RawBsonRef<'_>,
    input: QueryTree,
) -> Result<QueryTree, PipelineError> {
    Ok(QueryTree::ReplaceRoot {
        expression: compile(spec)?,
        input: input.boxed(),
    })
}

pub(super) fn redact(spec: RawBsonRef<'_>, input: QueryTree) -> Result<QueryTree, PipelineError> {
    Ok(QueryTree::Redact {
        expression: compile(spec)?,
        input: input.boxed(),
    })
}

/// `$count` lowers to a null-keyed group plus a projection renaming the
/// counter.
pub(super) fn count(spec: RawBsonRef<'_>, input: QueryTree) -> Result<QueryTree, PipelineError> {
    let RawBsonRef::String(name) = spec else {
        return Err(PipelineError::StageSpecInvalid(
            "$count needs a field name".into(),
        ));
    };
    if name.is_empty() || name.starts_with('$') || name.contains('.') {
        return Err(PipelineError::StageSpecInvalid(format!(
            "invalid $count field name '{name}'"
        )));
    }
    let grouped = QueryTree::Group {
        key: strata_path::CompiledExpression::Constant(bson::RawBson::Null),
        accumulators: vec![Accumulator {
            field: name.to_string(),
            op: AccumulatorOp::Count,
            argument: strata_path::CompiledExpression::Constant(bson::RawBson::Int32(1)),
        }],
        input: input.boxed(),
    };
    let mut projection_spec = RawDocumentBuf::new();
    projection_spec.append("_id", 0i32);
    projection_spec.append(name, 1i32);
    let options = BuildOptions {
        allow_inclusion_exclusion: true,
        ..BuildOptions::default()
    };
    let projection = build_projection_tree(&projection_spec, &options)?;
    Ok(QueryTree::Project {
        projection,
        input: grouped.boxed(),
    })
}

pub(super) fn documents(
    spec: RawBsonRef<'_>,
    ctx: &mut BuildContext,
) -> Result<QueryTree, PipelineError> {
    if ctx.stage_number != 1 {
        return Err(PipelineError::StageSpecInvalid(
            "$documents must be the first stage".into(),
        ));
    }
    let RawBsonRef::Array(arr) = spec else {
        return Err(PipelineError::StageSpecInvalid(
            "$documents needs an array of documents".into(),
        ));
    };
    let mut docs = Vec::new();
    for elem in arr {
        match elem? {
            RawBsonRef::Document(d) => docs.push(d.to_raw_document_buf()),
            _ => {
                return Err(PipelineError::StageSpecInvalid(
                    "$documents elements must be documents".into(),
                ));
            }
        }
    }
    Ok(QueryTree::Documents { docs })
}

pub(super) fn unwind(spec: RawBsonRef<'_>, input: QueryTree) -> Result<QueryTree, PipelineError> {
    let unwind_spec = parse_unwind(spec)?;
    Ok(QueryTree::Unwind {
        spec: unwind_spec,
        input: input.boxed(),
    })
}

pub(super) fn non_negative_int(
    spec: RawBsonRef<'_>,
    stage: &str,
) -> Result<u64, PipelineError> {
    match integer_of(spec) {
        Some(n) if n >= 0 => Ok(n as u64),
        _ => Err(PipelineError::StageSpecInvalid(format!(
            "{stage} needs a non-negative integer"
        ))),
    }
}

pub(super) fn integer_of(value: RawBsonRef<'_>) -> Option<i64> {
    match value {
        RawBsonRef::Int32(n) => Some(i64::from(n)),
        RawBsonRef::Int64(n) => Some(n),
        RawBsonRef::Double(d) if d.fract() == 0.0 => Some(d as i64),
        _ => None,
    }
}
