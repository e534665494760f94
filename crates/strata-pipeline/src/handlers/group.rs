use bson::RawBson;
use bson::raw::{RawBsonRef, RawDocument};

use strata_path::{CompiledExpression, ExprOp, compile};

use crate::error::PipelineError;
use crate::tree::{Accumulator, AccumulatorOp, QueryTree};

pub(super) fn group(spec: RawBsonRef<'_>, input: QueryTree) -> Result<QueryTree, PipelineError> {
    let RawBsonRef::Document(doc) = spec else {
        return Err(PipelineError::StageSpecInvalid("$group needs a document".into()));
    };
    let mut key = None;
    let mut accumulators = Vec::new();

    for entry in doc.iter() {
        let (field, value) = entry?;
        if field == "_id" {
            key = Some(compile(value)?);
            continue;
        }
        accumulators.push(parse_accumulator(field, value)?);
    }

    let key = key.ok_or_else(|| {
        PipelineError::StageSpecInvalid("$group requires an _id expression".into())
    })?;
    Ok(QueryTree::Group {
        key,
        accumulators,
        input: input.boxed(),
    })
}

pub(super) fn parse_accumulator(
    field: &str,
    value: RawBsonRef<'_>,
) -> Result<Accumulator, PipelineError> {
    if field.contains('.') || field.starts_with('$') {
        return Err(PipelineError::StageSpecInvalid(format!(
            "invalid accumulator field name '{field}'"
        )));
    }
    let RawBsonRef::Document(op_doc) = value else {
        return Err(PipelineError::StageSpecInvalid(format!(
            "accumulator '{field}' needs an operator document"
        )));
    };
    let mut iter = op_doc.iter();
    let Some(first) = iter.next() else {
        return Err(PipelineError::StageSpecInvalid(format!(
            "accumulator '{field}' must not be empty"
        )));
    };
    let (op_name, argument) = first?;
    if iter.next().is_some() {
        return Err(PipelineError::StageSpecInvalid(format!(
            "accumulator '{field}' must contain exactly one operator"
        )));
    }
    let op = match op_name {
        "$sum" => AccumulatorOp::Sum,
        "$avg" => AccumulatorOp::Avg,
        "$min" => AccumulatorOp::Min,
        "$max" => AccumulatorOp::Max,
        "$first" => AccumulatorOp::First,
        "$last" => AccumulatorOp::Last,
        "$push" => AccumulatorOp::Push,
        "$addToSet" => AccumulatorOp::AddToSet,
        "$count" => AccumulatorOp::Count,
        other => {
            return Err(PipelineError::StageSpecInvalid(format!(
                "unknown accumulator operator {other}"
            )));
        }
    };
    Ok(Accumulator {
        field: field.to_string(),
        op,
        argument: compile(argument)?,
    })
}

/// `$bucket` lowers to a group whose key is a boundary-selection
/// conditional chain over the groupBy expression.
pub(super) fn bucket(spec: RawBsonRef<'_>, input: QueryTree) -> Result<QueryTree, PipelineError> {
    let RawBsonRef::Document(doc) = spec else {
        return Err(PipelineError::StageSpecInvalid("$bucket needs a document".into()));
    };
    let mut group_by = None;
    let mut boundaries: Vec<RawBson> = Vec::new();
    let mut default = None;
    let mut output = None;

    for entry in doc.iter() {
        let (field, value) = entry?;
        match field {
            "groupBy" => group_by = Some(compile(value)?),
            "boundaries" => {
                let RawBsonRef::Array(arr) = value else {
                    return Err(PipelineError::StageSpecInvalid(
                        "$bucket boundaries must be an array".into(),
                    ));
                };
                for b in arr {
                    boundaries.push(b?.to_raw_bson());
                }
            }
            "default" => default = Some(value.to_raw_bson()),
            "output" => match value {
                RawBsonRef::Document(out_doc) => output = Some(parse_output(out_doc)?),
                _ => {
                    return Err(PipelineError::StageSpecInvalid(
                        "$bucket output must be a document".into(),
                    ));
                }
            },
            other => {
                return Err(PipelineError::StageSpecInvalid(format!(
                    "unknown $bucket field '{other}'"
                )));
            }
        }
    }

    let group_by = group_by.ok_or_else(|| {
        PipelineError::StageSpecInvalid("$bucket requires groupBy".into())
    })?;
    if boundaries.len() < 2 {
        return Err(PipelineError::StageSpecInvalid(
            "$bucket requires at least 2 boundaries".into(),
        ));
    }
    for pair in boundaries.windows(2) {
        if strata_bson::compare(pair[0].as_raw_bson_ref(), pair[1].as_raw_bson_ref(), None)
            != std::cmp::Ordering::Less
        {
            return Err(PipelineError::StageSpecInvalid(
                "$bucket boundaries must be sorted and unique".into(),
            ));
        }
    }

    // Innermost alternative: the default bucket, or an out-of-range
    // marker the executor rejects at runtime.
    let fallback = match default {
        Some(d) => CompiledExpression::Constant(d),
        None => CompiledExpression::Constant(RawBson::MaxKey),
    };
    let mut key = fallback;
    for pair in boundaries.windows(2).rev() {
        let lower = CompiledExpression::Constant(pair[0].clone());
        let upper = CompiledExpression::Constant(pair[1].clone());
        key = CompiledExpression::Cond {
            condition: Box::new(CompiledExpression::Op(
                ExprOp::And,
                vec![
                    CompiledExpression::Op(
                        ExprOp::Gte,
                        vec![group_by.clone(), lower.clone()],
                    ),
                    CompiledExpression::Op(ExprOp::Lt, vec![group_by.clone(), upper]),
                ],
            )),
            then: Box::new(lower),
            otherwise: Box::new(key),
        };
    }

    Ok(QueryTree::Group {
        key,
        accumulators: output.unwrap_or_else(default_count_output),
        input: input.boxed(),
    })
}

pub(super) fn bucket_auto(
    spec: RawBsonRef<'_>,
    input: QueryTree,
) -> Result<QueryTree, PipelineError> {
    let RawBsonRef::Document(doc) = spec else {
        return Err(PipelineError::StageSpecInvalid("$bucketAuto needs a document".into()));
    };
    let mut group_by = None;
    let mut buckets = None;
    let mut output = None;
    for entry in doc.iter() {
        let (field, value) = entry?;
        match field {
            "groupBy" => group_by = Some(compile(value)?),
            "buckets" => {
                buckets = super::core::integer_of(value).filter(|n| *n > 0);
                if buckets.is_none() {
                    return Err(PipelineError::StageSpecInvalid(
                        "$bucketAuto buckets must be a positive integer".into(),
                    ));
                }
            }
            "output" => match value {
                RawBsonRef::Document(out_doc) => output = Some(parse_output(out_doc)?),
                _ => {
                    return Err(PipelineError::StageSpecInvalid(
                        "$bucketAuto output must be a document".into(),
                    ));
                }
            },
            // Granularity shapes boundary rounding; the reference backend
            // buckets by even document counts.
            "granularity" => {}
            other => {
                return Err(PipelineError::StageSpecInvalid(format!(
                    "unknown $bucketAuto field '{other}'"
                )));
            }
        }
    }
    let group_by = group_by.ok_or_else(|| {
        PipelineError::StageSpecInvalid("$bucketAuto requires groupBy".into())
    })?;
    let buckets = buckets.ok_or_else(|| {
        PipelineError::StageSpecInvalid("$bucketAuto requires buckets".into())
    })?;
    Ok(QueryTree::BucketAuto {
        group_by,
        buckets: buckets as u64,
        accumulators: output.unwrap_or_else(default_count_output),
        input: input.boxed(),
    })
}

/// `$sortByCount` is sugar for a count-group plus a descending sort on
/// the counter.
pub(super) fn sort_by_count(
    spec: RawBsonRef<'_>,
    input: QueryTree,
) -> Result<QueryTree, PipelineError> {
    if let RawBsonRef::Document(d) = spec {
        let operator_doc = matches!(d.iter().next(), Some(Ok((k, _))) if k.starts_with('$'));
        if !operator_doc {
            return Err(PipelineError::StageSpecInvalid(
                "$sortByCount needs an expression".into(),
            ));
        }
    }
    let grouped = QueryTree::Group {
        key: compile(spec)?,
        accumulators: vec![Accumulator {
            field: "count".to_string(),
            op: AccumulatorOp::Count,
            argument: CompiledExpression::Constant(RawBson::Int32(1)),
        }],
        input: input.boxed(),
    };
    Ok(QueryTree::Sort {
        keys: vec![strata_query::SortKey {
            path: "count".to_string(),
            ascending: false,
        }],
        input: grouped.boxed(),
    })
}

fn parse_output(doc: &RawDocument) -> Result<Vec<Accumulator>, PipelineError> {
    let mut out = Vec::new();
    for entry in doc.iter() {
        let (field, value) = entry?;
        out.push(parse_accumulator(field, value)?);
    }
    Ok(out)
}

fn default_count_output() -> Vec<Accumulator> {
    vec![Accumulator {
        field: "count".to_string(),
        op: AccumulatorOp::Count,
        argument: CompiledExpression::Constant(RawBson::Int32(1)),
    }]
}
