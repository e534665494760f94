use bson::RawBson;
use bson::raw::{RawArrayBuf, RawBsonRef, RawDocumentBuf};
use tracing::debug;

use strata_query::{CompareOp, Expression, FieldPredicate};

use crate::context::BuildContext;
use crate::error::PipelineError;
use crate::handlers::handle_stage;
use crate::stage::{ParsedStage, Stage, parse_stage, parse_unwind};
use crate::tree::QueryTree;

/// Compile a pipeline array value against an initial tree (usually a
/// `Scan` of the target collection).
pub fn compile_pipeline_value(
    pipeline: RawBsonRef<'_>,
    initial: QueryTree,
    ctx: &mut BuildContext,
) -> Result<QueryTree, PipelineError> {
    let RawBsonRef::Array(arr) = pipeline else {
        return Err(PipelineError::StageSpecInvalid(
            "pipeline must be an array".into(),
        ));
    };
    let mut stages = Vec::new();
    for elem in arr {
        match elem? {
            RawBsonRef::Document(stage_doc) => stages.push(parse_stage(stage_doc)?),
            _ => {
                return Err(PipelineError::StageSpecInvalid(
                    "pipeline elements must be documents".into(),
                ));
            }
        }
    }
    compile_stages(stages, initial, ctx)
}

/// Compile parsed stages: optimizer pre-pass, then one handler per stage
/// with the subquery-injection policy applied between them.
pub fn compile_stages(
    mut stages: Vec<ParsedStage>,
    initial: QueryTree,
    ctx: &mut BuildContext,
) -> Result<QueryTree, PipelineError> {
    let fenced = stages
        .iter()
        .any(|s| s.stage == Stage::InhibitOptimization);
    if ctx.optimize && !fenced {
        stages = optimize_stages(stages)?;
    }

    let total = stages.len();
    let mut tree = initial;
    for (position, parsed) in stages.iter().enumerate() {
        ctx.stage_number += 1;
        debug!(stage = parsed.stage.name(), number = ctx.stage_number, "compiling stage");

        if !parsed.stage.allowed_under(ctx.parent_stage) {
            return Err(PipelineError::NotAllowedHere {
                stage: parsed.stage.name().to_string(),
                parent: ctx.parent_stage.name().to_string(),
            });
        }
        if parsed.stage.is_output_stage() {
            if position != total - 1 {
                return Err(PipelineError::StageSpecInvalid(format!(
                    "{} must be the last stage",
                    parsed.stage.name()
                )));
            }
            if ctx.nested_level > 0 {
                return Err(PipelineError::NotAllowedHere {
                    stage: parsed.stage.name().to_string(),
                    parent: ctx.parent_stage.name().to_string(),
                });
            }
        }

        // Subquery injection: a pending barrier wraps the query so this
        // stage sees the previous output as a table; a second
        // projection-class transform in a row forces the same.
        if ctx.requires_subquery {
            tree = QueryTree::Subquery { input: tree.boxed() };
            ctx.requires_subquery = false;
            ctx.requires_subquery_after_project = false;
        } else if parsed.stage.is_projection_class() && ctx.requires_subquery_after_project {
            tree = QueryTree::Subquery { input: tree.boxed() };
            ctx.requires_subquery_after_project = false;
        }

        tree = handle_stage(parsed, tree, ctx)?;

        if parsed.stage.is_projection_class() {
            ctx.requires_subquery_after_project = true;
        }
        if parsed.stage.is_group_class() {
            ctx.requires_subquery = true;
        }
        if parsed.stage.invalidates_sort() {
            ctx.sort_spec = None;
        }
        if requires_persistent_cursor(parsed.stage) {
            ctx.requires_persistent_cursor = true;
        }
    }

    if ctx.nested_level == 0 {
        recognize_point_read(&mut tree, ctx);
    }
    Ok(tree)
}

fn requires_persistent_cursor(stage: Stage) -> bool {
    matches!(
        stage,
        Stage::Sort
            | Stage::Group
            | Stage::Bucket
            | Stage::BucketAuto
            | Stage::Facet
            | Stage::SortByCount
            | Stage::SetWindowFields
            | Stage::Sample
            | Stage::Lookup
            | Stage::LookupUnwind
            | Stage::GraphLookup
            | Stage::UnionWith
    )
}

// ── Optimizer pre-pass ──────────────────────────────────────────

/// Stage-list rewrites that don't change semantics: adjacent `$match`
/// merge, `$limit`/`$skip` coalescing, and `$lookup`+`$unwind` fusion.
fn optimize_stages(stages: Vec<ParsedStage>) -> Result<Vec<ParsedStage>, PipelineError> {
    let mut out: Vec<ParsedStage> = Vec::with_capacity(stages.len());

    for stage in stages {
        let Some(prev) = out.last_mut() else {
            out.push(stage);
            continue;
        };
        match (prev.stage, stage.stage) {
            (Stage::Match, Stage::Match) => {
                prev.spec = merge_match_specs(&prev.spec, &stage.spec)?;
            }
            (Stage::Limit, Stage::Limit) => {
                let a = limit_value(&prev.spec)?;
                let b = limit_value(&stage.spec)?;
                prev.spec = RawBson::Int64(a.min(b) as i64);
            }
            (Stage::Skip, Stage::Skip) => {
                let a = limit_value(&prev.spec)?;
                let b = limit_value(&stage.spec)?;
                prev.spec = RawBson::Int64(a.saturating_add(b) as i64);
            }
            (Stage::Lookup, Stage::Unwind) if prev.fused_unwind.is_none() => {
                let unwind = parse_unwind(stage.spec.as_raw_bson_ref())?;
                // Fusable only when the unwind targets the lookup's `as`
                // field and doesn't ask for the element index.
                if unwind.include_array_index.is_none()
                    && lookup_as_field(&prev.spec)?.as_deref() == Some(unwind.path.as_str())
                {
                    prev.stage = Stage::LookupUnwind;
                    prev.fused_unwind = Some(unwind);
                } else {
                    out.push(stage);
                }
            }
            _ => out.push(stage),
        }
    }
    Ok(out)
}

fn merge_match_specs(a: &RawBson, b: &RawBson) -> Result<RawBson, PipelineError> {
    let (RawBsonRef::Document(da), RawBsonRef::Document(db)) =
        (a.as_raw_bson_ref(), b.as_raw_bson_ref())
    else {
        return Err(PipelineError::StageSpecInvalid("$match needs a document".into()));
    };
    let mut both = RawArrayBuf::new();
    both.push(da.to_raw_document_buf());
    both.push(db.to_raw_document_buf());
    let mut merged = RawDocumentBuf::new();
    merged.append("$and", RawBson::Array(both));
    Ok(RawBson::Document(merged))
}

fn limit_value(spec: &RawBson) -> Result<u64, PipelineError> {
    match spec.as_raw_bson_ref() {
        RawBsonRef::Int32(n) if n >= 0 => Ok(n as u64),
        RawBsonRef::Int64(n) if n >= 0 => Ok(n as u64),
        RawBsonRef::Double(d) if d.fract() == 0.0 && d >= 0.0 => Ok(d as u64),
        _ => Err(PipelineError::StageSpecInvalid(
            "$limit/$skip needs a non-negative integer".into(),
        )),
    }
}

fn lookup_as_field(spec: &RawBson) -> Result<Option<String>, PipelineError> {
    let RawBsonRef::Document(doc) = spec.as_raw_bson_ref() else {
        return Ok(None);
    };
    match doc.get("as")? {
        Some(RawBsonRef::String(s)) => Ok(Some(s.to_string())),
        _ => Ok(None),
    }
}

// ── Point-read recognition ──────────────────────────────────────

/// When the final tree's sole filter is `_id = <literal>` over the scan of
/// an `_id`-sharded collection, replace it with a `PointRead` and flag the
/// context so the cursor layer can bypass the iterator machinery.
fn recognize_point_read(tree: &mut QueryTree, ctx: &mut BuildContext) {
    if ctx.shard_key_path != "_id" {
        return;
    }
    if try_point_read(tree) {
        ctx.is_point_read = true;
        ctx.is_single_row_result = true;
    }
}

fn try_point_read(node: &mut QueryTree) -> bool {
    match node {
        QueryTree::Filter { predicate, input } => {
            let QueryTree::Scan { collection } = input.as_ref() else {
                return false;
            };
            let Some(object_id) = id_equality_literal(predicate) else {
                return false;
            };
            *node = QueryTree::PointRead {
                collection: collection.clone(),
                object_id,
            };
            true
        }
        // A projection or limit over the point shape doesn't change the
        // single-row access path.
        QueryTree::Project { input, .. } | QueryTree::Limit { input, .. } => {
            try_point_read(input)
        }
        _ => false,
    }
}

fn id_equality_literal(predicate: &Expression) -> Option<RawBson> {
    match predicate {
        Expression::Field(path, FieldPredicate::Compare(CompareOp::Eq, value))
            if path == "_id" =>
        {
            Some(value.clone())
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use bson::rawdoc;

    use crate::tree::CollectionRef;

    use super::*;

    fn scan(ctx: &BuildContext) -> QueryTree {
        QueryTree::Scan {
            collection: ctx.collection.clone().unwrap(),
        }
    }

    fn ctx_for(coll: &str) -> BuildContext {
        BuildContext::new("db", Some(CollectionRef::new("db", coll)))
    }

    fn pipeline_doc(stages: Vec<RawDocumentBuf>) -> RawBson {
        let mut arr = RawArrayBuf::new();
        for s in stages {
            arr.push(s);
        }
        RawBson::Array(arr)
    }

    fn compile(stages: Vec<RawDocumentBuf>, ctx: &mut BuildContext) -> QueryTree {
        let seed = scan(ctx);
        compile_pipeline_value(pipeline_doc(stages).as_raw_bson_ref(), seed, ctx).unwrap()
    }

    #[test]
    fn match_lowers_to_filter() {
        let mut ctx = ctx_for("users");
        let tree = compile(vec![rawdoc! { "$match": { "age": { "$gte": 21 } } }], &mut ctx);
        assert!(matches!(tree, QueryTree::Filter { .. }));
    }

    #[test]
    fn adjacent_matches_merge() {
        let mut ctx = ctx_for("users");
        let tree = compile(
            vec![
                rawdoc! { "$match": { "a": 1 } },
                rawdoc! { "$match": { "b": 2 } },
            ],
            &mut ctx,
        );
        // One Filter over the Scan, with an $and of both specs.
        let QueryTree::Filter { predicate, input } = tree else {
            panic!("expected a single filter");
        };
        assert!(matches!(*input, QueryTree::Scan { .. }));
        assert!(matches!(predicate, Expression::And(ref v) if v.len() == 2));
    }

    #[test]
    fn limits_and_skips_coalesce() {
        let mut ctx = ctx_for("users");
        let tree = compile(
            vec![
                rawdoc! { "$limit": 10 },
                rawdoc! { "$limit": 3 },
                rawdoc! { "$skip": 2 },
                rawdoc! { "$skip": 5 },
            ],
            &mut ctx,
        );
        let QueryTree::Skip { skip, input } = tree else { panic!() };
        assert_eq!(skip, 7);
        let QueryTree::Limit { limit, .. } = *input else { panic!() };
        assert_eq!(limit, 3);
    }

    #[test]
    fn inhibit_optimization_disables_merging() {
        let mut ctx = ctx_for("users");
        let tree = compile(
            vec![
                rawdoc! { "$_internalInhibitOptimization": 1 },
                rawdoc! { "$match": { "a": 1 } },
                rawdoc! { "$match": { "b": 2 } },
            ],
            &mut ctx,
        );
        // Two separate filters survive above the fence.
        let QueryTree::Filter { input: outer, .. } = tree else { panic!() };
        assert!(matches!(*outer, QueryTree::Filter { .. }));
    }

    #[test]
    fn lookup_unwind_fuses() {
        let mut ctx = ctx_for("orders");
        let tree = compile(
            vec![
                rawdoc! { "$lookup": {
                    "from": "customers",
                    "localField": "x",
                    "foreignField": "y",
                    "as": "j"
                } },
                rawdoc! { "$unwind": "$j" },
            ],
            &mut ctx,
        );
        let QueryTree::LookupUnwind { join, unwind, .. } = tree else {
            panic!("expected fused lookup-unwind, got {tree:?}");
        };
        assert_eq!(join.as_field, "j");
        assert_eq!(join.local_field.as_deref(), Some("x"));
        assert!(!unwind.preserve_null_and_empty);
    }

    #[test]
    fn lookup_unwind_fusion_captures_preserve_flag() {
        let mut ctx = ctx_for("orders");
        let tree = compile(
            vec![
                rawdoc! { "$lookup": {
                    "from": "customers", "localField": "x",
                    "foreignField": "y", "as": "j"
                } },
                rawdoc! { "$unwind": { "path": "$j", "preserveNullAndEmptyArrays": true } },
            ],
            &mut ctx,
        );
        let QueryTree::LookupUnwind { unwind, .. } = tree else { panic!() };
        assert!(unwind.preserve_null_and_empty);
    }

    #[test]
    fn unwind_on_other_field_does_not_fuse() {
        let mut ctx = ctx_for("orders");
        let tree = compile(
            vec![
                rawdoc! { "$lookup": {
                    "from": "customers", "localField": "x",
                    "foreignField": "y", "as": "j"
                } },
                rawdoc! { "$unwind": "$tags" },
            ],
            &mut ctx,
        );
        let QueryTree::Unwind { spec, input } = tree else { panic!() };
        assert_eq!(spec.path, "tags");
        assert!(matches!(*input, QueryTree::Lookup { .. }));
    }

    #[test]
    fn point_read_recognized() {
        let mut ctx = ctx_for("users");
        let tree = compile(
            vec![rawdoc! { "$match": { "_id": 42 } }],
            &mut ctx,
        );
        assert!(ctx.is_point_read);
        assert!(ctx.is_single_row_result);
        let QueryTree::PointRead { object_id, .. } = tree else {
            panic!("expected point read, got {tree:?}");
        };
        assert_eq!(object_id, RawBson::Int32(42));
    }

    #[test]
    fn point_read_survives_projection() {
        let mut ctx = ctx_for("users");
        let tree = compile(
            vec![
                rawdoc! { "$match": { "_id": 7 } },
                rawdoc! { "$project": { "name": 1 } },
            ],
            &mut ctx,
        );
        assert!(ctx.is_point_read);
        let QueryTree::Project { input, .. } = tree else { panic!() };
        assert!(matches!(*input, QueryTree::PointRead { .. }));
    }

    #[test]
    fn range_filter_is_not_a_point_read() {
        let mut ctx = ctx_for("users");
        let _ = compile(
            vec![rawdoc! { "$match": { "_id": { "$gt": 42 } } }],
            &mut ctx,
        );
        assert!(!ctx.is_point_read);

        let mut ctx = ctx_for("users");
        let _ = compile(
            vec![rawdoc! { "$match": { "_id": 42, "other": 1 } }],
            &mut ctx,
        );
        assert!(!ctx.is_point_read);
    }

    #[test]
    fn group_forces_subquery_before_next_stage() {
        let mut ctx = ctx_for("sales");
        let tree = compile(
            vec![
                rawdoc! { "$group": { "_id": "$region", "total": { "$sum": "$amount" } } },
                rawdoc! { "$match": { "total": { "$gt": 100 } } },
            ],
            &mut ctx,
        );
        let QueryTree::Filter { input, .. } = tree else { panic!() };
        assert!(matches!(*input, QueryTree::Subquery { .. }));
    }

    #[test]
    fn second_projection_in_a_row_forces_subquery() {
        let mut ctx = ctx_for("users");
        let tree = compile(
            vec![
                rawdoc! { "$addFields": { "a": 1 } },
                rawdoc! { "$addFields": { "b": 2 } },
            ],
            &mut ctx,
        );
        let QueryTree::AddFields { input, .. } = tree else { panic!() };
        assert!(matches!(*input, QueryTree::Subquery { .. }));
    }

    #[test]
    fn match_after_single_projection_needs_no_subquery() {
        let mut ctx = ctx_for("users");
        let tree = compile(
            vec![
                rawdoc! { "$addFields": { "a": 1 } },
                rawdoc! { "$match": { "a": 1 } },
            ],
            &mut ctx,
        );
        let QueryTree::Filter { input, .. } = tree else { panic!() };
        assert!(matches!(*input, QueryTree::AddFields { .. }));
    }

    #[test]
    fn sort_records_ordering_and_group_clears_it() {
        let mut ctx = ctx_for("users");
        let _ = compile(vec![rawdoc! { "$sort": { "age": 1 } }], &mut ctx);
        assert!(ctx.sort_spec.is_some());

        let mut ctx = ctx_for("users");
        let _ = compile(
            vec![
                rawdoc! { "$sort": { "age": 1 } },
                rawdoc! { "$group": { "_id": "$age" } },
            ],
            &mut ctx,
        );
        assert!(ctx.sort_spec.is_none());
    }

    #[test]
    fn facet_compiles_arms_and_restricts_stages() {
        let mut ctx = ctx_for("products");
        let tree = compile(
            vec![rawdoc! { "$facet": {
                "by_price": [ { "$sort": { "price": 1 } }, { "$limit": 3 } ],
                "count": [ { "$count": "n" } ]
            } }],
            &mut ctx,
        );
        let QueryTree::Facet { arms, .. } = tree else { panic!() };
        assert_eq!(arms.len(), 2);
        assert!(ctx.is_single_row_result);

        let mut ctx = ctx_for("products");
        let err = compile_pipeline_value(
            pipeline_doc(vec![rawdoc! { "$facet": {
                "bad": [ { "$facet": { "inner": [] } } ]
            } }])
            .as_raw_bson_ref(),
            scan(&ctx_for("products")),
            &mut ctx,
        )
        .unwrap_err();
        assert!(matches!(err, PipelineError::NotAllowedHere { .. }));
    }

    #[test]
    fn out_must_be_last_and_top_level() {
        let mut ctx = ctx_for("src");
        let err = compile_pipeline_value(
            pipeline_doc(vec![
                rawdoc! { "$out": "dest" },
                rawdoc! { "$match": {} },
            ])
            .as_raw_bson_ref(),
            scan(&ctx),
            &mut ctx,
        )
        .unwrap_err();
        assert!(matches!(err, PipelineError::StageSpecInvalid(_)));
    }

    #[test]
    fn unknown_stage_name_errors() {
        let mut ctx = ctx_for("x");
        let err = compile_pipeline_value(
            pipeline_doc(vec![rawdoc! { "$frobnicate": 1 }]).as_raw_bson_ref(),
            scan(&ctx),
            &mut ctx,
        )
        .unwrap_err();
        assert!(matches!(err, PipelineError::UnknownStage(_)));
    }

    #[test]
    fn unsupported_stage_reports_as_such() {
        let mut ctx = ctx_for("x");
        let err = compile_pipeline_value(
            pipeline_doc(vec![rawdoc! { "$changeStream": {} }]).as_raw_bson_ref(),
            scan(&ctx),
            &mut ctx,
        )
        .unwrap_err();
        assert!(matches!(err, PipelineError::StageNotSupported(_)));
    }

    #[test]
    fn persistent_cursor_flagged_for_blocking_stages() {
        let mut ctx = ctx_for("users");
        let _ = compile(vec![rawdoc! { "$sort": { "a": 1 } }], &mut ctx);
        assert!(ctx.requires_persistent_cursor);

        let mut ctx = ctx_for("users");
        let _ = compile(vec![rawdoc! { "$match": { "a": 1 } }], &mut ctx);
        assert!(!ctx.requires_persistent_cursor);
    }

    #[test]
    fn graph_lookup_lowers_to_recursive_traverse() {
        let mut ctx = ctx_for("employees");
        let tree = compile(
            vec![rawdoc! { "$graphLookup": {
                "from": "employees",
                "startWith": "$reportsTo",
                "connectFromField": "reportsTo",
                "connectToField": "name",
                "as": "chain",
                "maxDepth": 5
            } }],
            &mut ctx,
        );
        let QueryTree::RecursiveTraverse { max_depth, as_field, .. } = tree else {
            panic!()
        };
        assert_eq!(max_depth, Some(5));
        assert_eq!(as_field, "chain");
    }

    #[test]
    fn nested_pipeline_depth_enforced() {
        // Build a $lookup nested one past the allowed depth.
        let mut innermost = rawdoc! { "$match": {} };
        for _ in 0..=crate::context::MAX_NESTED_PIPELINE_LEVEL {
            let mut arr = RawArrayBuf::new();
            arr.push(innermost);
            let mut lookup = RawDocumentBuf::new();
            let mut spec = RawDocumentBuf::new();
            spec.append("from", "other");
            spec.append("as", "j");
            spec.append("pipeline", RawBson::Array(arr));
            lookup.append("$lookup", RawBson::Document(spec));
            innermost = lookup;
        }
        let mut ctx = ctx_for("base");
        let err = compile_pipeline_value(
            pipeline_doc(vec![innermost]).as_raw_bson_ref(),
            scan(&ctx),
            &mut ctx,
        )
        .unwrap_err();
        assert!(matches!(err, PipelineError::NestedLimit(_)));
    }
}
