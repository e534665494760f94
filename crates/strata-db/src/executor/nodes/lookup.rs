use bson::RawBson;
use bson::raw::{RawBsonRef, RawDocumentBuf};

use strata_bson::{ArrayWriter, extract_path_values, values_equal};
use strata_path::{CompiledExpression, eval};
use strata_pipeline::{CollectionRef, LookupJoin, QueryTree, UnwindSpec};
use strata_query::Expression;
use strata_store::ScanOptions;

use crate::error::{DbError, Result};
use crate::executor::doc_utils;
use crate::executor::{Executor, SourcedDoc};

pub(crate) fn lookup(
    exec: &Executor<'_>,
    join: &LookupJoin,
    rows: Vec<SourcedDoc>,
) -> Result<Vec<SourcedDoc>> {
    let mut out = Vec::with_capacity(rows.len());
    for (i, row) in rows.into_iter().enumerate() {
        if i % 64 == 0 {
            exec.check_interrupt()?;
        }
        let matches = matches_for(exec, join, &row.doc)?;
        let mut arr = ArrayWriter::new();
        for m in matches {
            arr.push(RawBson::Document(m));
        }
        let doc = doc_utils::with_field_at_path(
            &row.doc,
            &join.as_field,
            RawBson::Array(arr.into_buf()),
        )?;
        out.push(SourcedDoc::new(doc));
    }
    Ok(out)
}

/// Fused `$lookup` + `$unwind` on the `as` field: one output row per
/// match (inner join), or a left join when nulls are preserved.
pub(crate) fn lookup_unwind(
    exec: &Executor<'_>,
    join: &LookupJoin,
    unwind: &UnwindSpec,
    rows: Vec<SourcedDoc>,
) -> Result<Vec<SourcedDoc>> {
    let mut out = Vec::new();
    for (i, row) in rows.into_iter().enumerate() {
        if i % 64 == 0 {
            exec.check_interrupt()?;
        }
        let matches = matches_for(exec, join, &row.doc)?;
        if matches.is_empty() {
            if unwind.preserve_null_and_empty {
                let doc = doc_utils::without_field_at_path(&row.doc, &join.as_field)?;
                out.push(SourcedDoc::new(doc));
            }
            continue;
        }
        for m in matches {
            let doc = doc_utils::with_field_at_path(
                &row.doc,
                &join.as_field,
                RawBson::Document(m),
            )?;
            out.push(SourcedDoc::new(doc));
        }
    }
    Ok(out)
}

/// The right-side rows joining one input document.
fn matches_for(
    exec: &Executor<'_>,
    join: &LookupJoin,
    doc: &bson::RawDocument,
) -> Result<Vec<RawDocumentBuf>> {
    // A missing lookup target resolves to an empty right side, not an
    // error.
    let handle = match exec
        .store
        .open_collection(&join.from.database, &join.from.collection)
    {
        Ok(h) => Some(h),
        Err(strata_store::StoreError::NamespaceNotFound(_)) => None,
        Err(e) => return Err(e.into()),
    };

    match (&join.local_field, &join.foreign_field, &join.pipeline) {
        (Some(local), Some(foreign), pipeline) => {
            let Some(handle) = handle else {
                return Ok(Vec::new());
            };
            let mut local_values: Vec<RawBson> = extract_path_values(doc, local)
                .into_iter()
                .map(|v| v.to_raw_bson())
                .collect();
            if local_values.is_empty() {
                local_values.push(RawBson::Null);
            }

            let mut matches = Vec::new();
            for row in exec.store.scan(&handle, ScanOptions::default())? {
                let (_, candidate) = row?;
                let mut foreign_values: Vec<RawBsonRef<'_>> =
                    extract_path_values(&candidate.doc, foreign);
                let null = RawBsonRef::Null;
                if foreign_values.is_empty() {
                    foreign_values.push(null);
                }
                let hit = local_values.iter().any(|lv| {
                    foreign_values
                        .iter()
                        .any(|fv| values_equal(lv.as_raw_bson_ref(), *fv, None))
                });
                if hit {
                    matches.push(candidate.doc);
                }
            }
            // An equality join plus a pipeline filters the matches
            // through the sub-pipeline.
            match pipeline {
                Some(sub) => run_sub_pipeline(exec, join, doc, sub, Some(matches)),
                None => Ok(matches),
            }
        }
        (None, None, Some(sub)) => run_sub_pipeline(exec, join, doc, sub, None),
        _ => Ok(Vec::new()),
    }
}

/// Execute the lookup's sub-pipeline with its `let` bindings evaluated
/// against the outer document. When `seed_rows` is given the pipeline's
/// base scan is replaced by those rows.
fn run_sub_pipeline(
    exec: &Executor<'_>,
    join: &LookupJoin,
    outer_doc: &bson::RawDocument,
    sub: &QueryTree,
    seed_rows: Option<Vec<RawDocumentBuf>>,
) -> Result<Vec<RawDocumentBuf>> {
    let scope = exec.scope();
    let mut variables = exec.variables.clone();
    for (name, var_expr) in &join.let_vars {
        let value =
            eval(var_expr, outer_doc, &scope, &exec.snapshot)?.unwrap_or(RawBson::Null);
        variables.insert(name.clone(), value);
    }
    let child = Executor {
        store: exec.store,
        snapshot: exec.snapshot,
        variables,
        cancellation: exec.cancellation.clone(),
        deadline: exec.deadline,
    };

    let rows = match seed_rows {
        Some(seed) => {
            let seeded = replace_base_scan(sub, &join.from, seed);
            child.execute(&seeded, None)?
        }
        None => child.execute(sub, None)?,
    };
    Ok(rows.into_iter().map(|r| r.doc).collect())
}

/// Swap the sub-pipeline's base `Scan` of the foreign collection for the
/// already-joined rows.
fn replace_base_scan(
    tree: &QueryTree,
    from: &CollectionRef,
    rows: Vec<RawDocumentBuf>,
) -> QueryTree {
    match tree {
        QueryTree::Scan { collection } if collection == from => {
            QueryTree::Documents { docs: rows }
        }
        other => {
            let mut cloned = other.clone();
            if let Some(input) = input_mut(&mut cloned) {
                *input = replace_base_scan(input, from, rows);
            }
            cloned
        }
    }
}

fn input_mut(tree: &mut QueryTree) -> Option<&mut QueryTree> {
    match tree {
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
        _ => None,
    }
}

#[allow(clippy::too_many_arguments)]
pub(crate) fn graph_lookup(
    exec: &Executor<'_>,
    from: &CollectionRef,
    start_with: &CompiledExpression,
    connect_from_field: &str,
    connect_to_field: &str,
    as_field: &str,
    max_depth: Option<u64>,
    depth_field: Option<&str>,
    restrict: Option<&Expression>,
    rows: Vec<SourcedDoc>,
) -> Result<Vec<SourcedDoc>> {
    let handle = match exec.store.open_collection(&from.database, &from.collection) {
        Ok(h) => Some(h),
        Err(strata_store::StoreError::NamespaceNotFound(_)) => None,
        Err(e) => return Err(e.into()),
    };
    let scope = exec.scope();

    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        exec.check_interrupt()?;
        let mut found: Vec<(RawDocumentBuf, u64)> = Vec::new();
        let mut visited_ids: Vec<RawBson> = Vec::new();

        if let Some(handle) = &handle {
            let seed = eval(start_with, &row.doc, &scope, &exec.snapshot)?;
            let mut frontier: Vec<RawBson> = flatten_values(seed);
            let mut depth: u64 = 0;

            while !frontier.is_empty() {
                if max_depth.is_some_and(|limit| depth > limit) {
                    break;
                }
                let mut next_frontier = Vec::new();
                for candidate in exec.store.scan(handle, ScanOptions::default())? {
                    let (_, candidate) = candidate?;
                    let to_values = extract_path_values(&candidate.doc, connect_to_field);
                    let hit = frontier.iter().any(|fv| {
                        to_values
                            .iter()
                            .any(|tv| values_equal(fv.as_raw_bson_ref(), *tv, None))
                    });
                    if !hit {
                        continue;
                    }
                    if let Some(filter) = restrict
                        && !strata_query::matches(&candidate.doc, filter)
                            .map_err(DbError::from)?
                    {
                        continue;
                    }
                    // Cycle detection by visited object id.
                    let id = candidate
                        .doc
                        .get("_id")?
                        .map(|v| v.to_raw_bson())
                        .unwrap_or(RawBson::Null);
                    let seen = visited_ids.iter().any(|v| {
                        values_equal(v.as_raw_bson_ref(), id.as_raw_bson_ref(), None)
                    });
                    if seen {
                        continue;
                    }
                    visited_ids.push(id);
                    for fv in extract_path_values(&candidate.doc, connect_from_field) {
                        next_frontier.push(fv.to_raw_bson());
                    }
                    found.push((candidate.doc, depth));
                }
                frontier = next_frontier;
                depth += 1;
            }
        }

        let mut arr = ArrayWriter::new();
        for (doc, depth) in found {
            match depth_field {
                Some(field) => {
                    let with_depth = doc_utils::with_field_at_path(
                        &doc,
                        field,
                        RawBson::Int64(depth as i64),
                    )?;
                    arr.push(RawBson::Document(with_depth));
                }
                None => arr.push(RawBson::Document(doc)),
            }
        }
        let doc =
            doc_utils::with_field_at_path(&row.doc, as_field, RawBson::Array(arr.into_buf()))?;
        out.push(SourcedDoc::new(doc));
    }
    Ok(out)
}

fn flatten_values(value: Option<RawBson>) -> Vec<RawBson> {
    match value {
        None => Vec::new(),
        Some(RawBson::Array(arr)) => arr
            .into_iter()
            .flatten()
            .map(|v| v.to_raw_bson())
            .collect(),
        Some(other) => vec![other],
    }
}
