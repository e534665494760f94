use bson::RawBson;

use strata_pipeline::CollectionRef;
use strata_query::Expression;
use strata_store::{IndexRange, RowPosition, ScanDirection, ScanOptions};

use crate::error::{DbError, ErrorCode, Result};
use crate::executor::{Executor, SourcedDoc};

pub(crate) fn scan(
    exec: &Executor<'_>,
    collection: &CollectionRef,
    resume: Option<&RowPosition>,
) -> Result<Vec<SourcedDoc>> {
    let handle = exec
        .store
        .open_collection(&collection.database, &collection.collection)?;
    let options = ScanOptions {
        start_after: resume.cloned(),
        ..ScanOptions::default()
    };
    let mut out = Vec::new();
    for row in exec.store.scan(&handle, options)? {
        if out.len() % 256 == 0 {
            exec.check_interrupt()?;
        }
        let (position, row) = row?;
        out.push(SourcedDoc::at(position, row.doc));
    }
    Ok(out)
}

pub(crate) fn point_read(
    exec: &Executor<'_>,
    collection: &CollectionRef,
    object_id: &RawBson,
) -> Result<Vec<SourcedDoc>> {
    let handle = exec
        .store
        .open_collection(&collection.database, &collection.collection)?;
    match exec
        .store
        .point_read(&handle, object_id.as_raw_bson_ref())?
    {
        Some(row) => Ok(vec![SourcedDoc::new(row.doc)]),
        None => Ok(Vec::new()),
    }
}

pub(crate) fn index_scan(
    exec: &Executor<'_>,
    collection: &CollectionRef,
    index_path: &str,
    lower: &Option<(RawBson, bool)>,
    upper: &Option<(RawBson, bool)>,
    reverse: bool,
    residual: &Option<Expression>,
    resume: Option<&RowPosition>,
) -> Result<Vec<SourcedDoc>> {
    let handle = exec
        .store
        .open_collection(&collection.database, &collection.collection)?;
    let index = handle
        .index_on(index_path)
        .ok_or_else(|| {
            DbError::new(
                ErrorCode::IndexNotFound,
                format!("no index on '{index_path}'"),
            )
        })?
        .id;
    let range = IndexRange {
        lower: lower.clone(),
        upper: upper.clone(),
    };
    let direction = if reverse {
        ScanDirection::Reverse
    } else {
        ScanDirection::Forward
    };
    let mut out = Vec::new();
    let mut resuming = resume.is_some();
    for row in exec.store.index_scan(&handle, index, &range, direction, None)? {
        if out.len() % 256 == 0 {
            exec.check_interrupt()?;
        }
        let (position, row) = row?;
        // Index order is the stream order; skip until strictly past the
        // resume point.
        if resuming {
            if Some(&position) == resume {
                resuming = false;
            }
            continue;
        }
        if let Some(expr) = residual
            && !strata_query::matches(&row.doc, expr).map_err(DbError::from)?
        {
            continue;
        }
        out.push(SourcedDoc::at(position, row.doc));
    }
    Ok(out)
}
