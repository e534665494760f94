use bson::raw::RawDocumentBuf;

use strata_bson::{extract_path, values_equal};
use strata_pipeline::{CollectionRef, MergeMatched, MergeNotMatched, OutputMode};
use strata_store::ScanOptions;

use crate::error::{DbError, ErrorCode, Result};
use crate::executor::doc_utils;
use crate::executor::{Executor, SourcedDoc};

/// `$out` / `$merge`: write the pipeline's rows into the target
/// collection. Produces no output rows.
pub(crate) fn output(
    exec: &Executor<'_>,
    target: &CollectionRef,
    mode: &OutputMode,
    rows: Vec<SourcedDoc>,
) -> Result<Vec<SourcedDoc>> {
    match mode {
        OutputMode::Replace => replace(exec, target, rows)?,
        OutputMode::Merge {
            on,
            when_matched,
            when_not_matched,
        } => merge(exec, target, on, *when_matched, *when_not_matched, rows)?,
    }
    Ok(Vec::new())
}

fn replace(
    exec: &Executor<'_>,
    target: &CollectionRef,
    rows: Vec<SourcedDoc>,
) -> Result<()> {
    // $out replaces the whole target collection.
    let _ = exec
        .store
        .drop_collection(&target.database, &target.collection);
    let handle =
        exec.store
            .create_collection(&target.database, &target.collection, "_id")?;
    for row in rows {
        exec.check_interrupt()?;
        exec.store.insert(&handle, &row.doc)?;
    }
    Ok(())
}

fn merge(
    exec: &Executor<'_>,
    target: &CollectionRef,
    on: &[String],
    when_matched: MergeMatched,
    when_not_matched: MergeNotMatched,
    rows: Vec<SourcedDoc>,
) -> Result<()> {
    let handle = match exec
        .store
        .open_collection(&target.database, &target.collection)
    {
        Ok(h) => h,
        Err(strata_store::StoreError::NamespaceNotFound(_)) => {
            exec.store
                .create_collection(&target.database, &target.collection, "_id")?
        }
        Err(e) => return Err(e.into()),
    };

    for row in rows {
        exec.check_interrupt()?;
        let existing = find_by_on_keys(exec, &handle, on, &row.doc)?;
        match existing {
            Some(current) => match when_matched {
                MergeMatched::KeepExisting => {}
                MergeMatched::Fail => {
                    return Err(DbError::new(
                        ErrorCode::DuplicateKey,
                        "$merge found a matching document with whenMatched: fail",
                    ));
                }
                MergeMatched::Replace => {
                    let id = current
                        .get("_id")?
                        .ok_or_else(|| DbError::internal("stored row without _id"))?;
                    let mut replacement = row.doc.clone();
                    if replacement.get("_id")?.is_none() {
                        replacement = doc_utils::with_field_at_path(
                            &replacement,
                            "_id",
                            id.to_raw_bson(),
                        )?;
                    }
                    exec.store.update(&handle, id, &replacement)?;
                }
                MergeMatched::Merge => {
                    let id = current
                        .get("_id")?
                        .ok_or_else(|| DbError::internal("stored row without _id"))?;
                    let mut merged = current.clone();
                    for entry in row.doc.iter() {
                        let (key, value) = entry?;
                        merged =
                            doc_utils::with_field_at_path(&merged, key, value.to_raw_bson())?;
                    }
                    exec.store.update(&handle, id, &merged)?;
                }
            },
            None => match when_not_matched {
                MergeNotMatched::Insert => {
                    let doc = if row.doc.get("_id")?.is_some() {
                        row.doc
                    } else {
                        doc_utils::with_field_at_path(
                            &row.doc,
                            "_id",
                            bson::RawBson::ObjectId(bson::oid::ObjectId::new()),
                        )?
                    };
                    exec.store.insert(&handle, &doc)?;
                }
                MergeNotMatched::Discard => {}
                MergeNotMatched::Fail => {
                    return Err(DbError::new(
                        ErrorCode::Location(13113),
                        "$merge found no matching document with whenNotMatched: fail",
                    ));
                }
            },
        }
    }
    Ok(())
}

fn find_by_on_keys(
    exec: &Executor<'_>,
    handle: &strata_store::CollectionHandle,
    on: &[String],
    doc: &bson::RawDocument,
) -> Result<Option<RawDocumentBuf>> {
    // The common `on: _id` case is a point read.
    if on.len() == 1 && on[0] == "_id" {
        if let Some(id) = doc.get("_id")? {
            return Ok(exec.store.point_read(handle, id)?.map(|r| r.doc));
        }
        return Ok(None);
    }
    for row in exec.store.scan(handle, ScanOptions::default())? {
        let (_, candidate) = row?;
        let all_equal = on.iter().all(|path| {
            match (extract_path(doc, path), extract_path(&candidate.doc, path)) {
                (Some(a), Some(b)) => values_equal(a, b, None),
                _ => false,
            }
        });
        if all_equal {
            return Ok(Some(candidate.doc));
        }
    }
    Ok(None)
}
