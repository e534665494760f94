use bson::raw::RawBsonRef;

use strata_path::{CompiledExpression, compile};
use strata_query::parse_sort;

use crate::context::BuildContext;
use crate::error::PipelineError;
use crate::handlers::group::parse_accumulator;
use crate::tree::{QueryTree, WindowBounds, WindowOutput};

/// `$setWindowFields`: window-function expressions over partitions and
/// sort keys. When the partition aligns with the shard key the partition
/// can run shard-local.
pub(super) fn set_window_fields(
    spec: RawBsonRef<'_>,
    input: QueryTree,
    ctx: &mut BuildContext,
) -> Result<QueryTree, PipelineError> {
    let RawBsonRef::Document(doc) = spec else {
        return Err(PipelineError::StageSpecInvalid(
            "$setWindowFields needs a document".into(),
        ));
    };

    let mut partition_by = None;
    let mut sort = Vec::new();
    let mut outputs = Vec::new();

    for entry in doc.iter() {
        let (field, value) = entry?;
        match field {
            "partitionBy" => partition_by = Some(compile(value)?),
            "sortBy" => {
                let RawBsonRef::Document(sort_doc) = value else {
                    return Err(PipelineError::StageSpecInvalid(
                        "$setWindowFields sortBy must be a document".into(),
                    ));
                };
                sort = parse_sort(sort_doc)?;
            }
            "output" => {
                let RawBsonRef::Document(out_doc) = value else {
                    return Err(PipelineError::StageSpecInvalid(
                        "$setWindowFields output must be a document".into(),
                    ));
                };
                for out_entry in out_doc.iter() {
                    let (name, window_spec) = out_entry?;
                    outputs.push(parse_window_output(name, window_spec)?);
                }
            }
            other => {
                return Err(PipelineError::StageSpecInvalid(format!(
                    "unknown $setWindowFields field '{other}'"
                )));
            }
        }
    }

    if outputs.is_empty() {
        return Err(PipelineError::StageSpecInvalid(
            "$setWindowFields requires 'output'".into(),
        ));
    }

    let shard_aligned = match &partition_by {
        Some(CompiledExpression::FieldPath(path)) => {
            ctx.partition_matches_shard_key(std::slice::from_ref(path))
        }
        _ => false,
    };

    Ok(QueryTree::WindowFields {
        partition_by,
        sort,
        outputs,
        shard_aligned,
        input: input.boxed(),
    })
}

fn parse_window_output(
    name: &str,
    spec: RawBsonRef<'_>,
) -> Result<WindowOutput, PipelineError> {
    let RawBsonRef::Document(doc) = spec else {
        return Err(PipelineError::StageSpecInvalid(format!(
            "window output '{name}' needs a document"
        )));
    };

    let mut accumulator = None;
    let mut window = WindowBounds::Unbounded;

    for entry in doc.iter() {
        let (field, value) = entry?;
        if field == "window" {
            window = parse_window_bounds(value)?;
            continue;
        }
        // The remaining single entry is the accumulator operator.
        let mut op_doc = bson::raw::RawDocumentBuf::new();
        op_doc.append_ref(field, value);
        accumulator = Some(parse_accumulator(name, RawBsonRef::Document(&op_doc))?);
    }

    let accumulator = accumulator.ok_or_else(|| {
        PipelineError::StageSpecInvalid(format!("window output '{name}' needs an operator"))
    })?;
    Ok(WindowOutput {
        field: accumulator.field,
        op: accumulator.op,
        argument: accumulator.argument,
        window,
    })
}

fn parse_window_bounds(value: RawBsonRef<'_>) -> Result<WindowBounds, PipelineError> {
    let RawBsonRef::Document(doc) = value else {
        return Err(PipelineError::StageSpecInvalid(
            "'window' must be a document".into(),
        ));
    };
    for entry in doc.iter() {
        let (field, bounds) = entry?;
        match field {
            "documents" => {
                let RawBsonRef::Array(arr) = bounds else {
                    return Err(PipelineError::StageSpecInvalid(
                        "window.documents must be a two-element array".into(),
                    ));
                };
                let parts: Vec<RawBsonRef<'_>> = arr.into_iter().collect::<Result<_, _>>()?;
                if parts.len() != 2 {
                    return Err(PipelineError::StageSpecInvalid(
                        "window.documents must be a two-element array".into(),
                    ));
                }
                let lower = parse_bound(parts[0])?;
                let upper = parse_bound(parts[1])?;
                return Ok(WindowBounds::Documents(lower, upper));
            }
            other => {
                return Err(PipelineError::StageSpecInvalid(format!(
                    "unsupported window kind '{other}'"
                )));
            }
        }
    }
    Ok(WindowBounds::Unbounded)
}

/// `"unbounded"`, `"current"`, or an integer offset.
fn parse_bound(value: RawBsonRef<'_>) -> Result<Option<i64>, PipelineError> {
    match value {
        RawBsonRef::String("unbounded") => Ok(None),
        RawBsonRef::String("current") => Ok(Some(0)),
        other => super::core::integer_of(other).map(Some).ok_or_else(|| {
            PipelineError::StageSpecInvalid(
                "window bound must be 'unbounded', 'current', or an integer".into(),
            )
        }),
    }
}
