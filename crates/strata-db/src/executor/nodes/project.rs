use bson::RawBson;
use bson::raw::{RawBsonRef, RawDocument, RawDocumentBuf};

use strata_bson::{ArrayWriter, DocumentWriter};
use strata_path::{
    CompiledExpression, PathTree, ProjectionContext, eval, project as project_tree,
};

use crate::error::{DbError, ErrorCode, Result};
use crate::executor::doc_utils;
use crate::executor::{Executor, SourcedDoc};

pub(crate) fn project(
    exec: &Executor<'_>,
    projection: &PathTree,
    query: Option<&strata_query::Expression>,
    rows: Vec<SourcedDoc>,
) -> Result<Vec<SourcedDoc>> {
    let scope = exec.scope();
    let mut ctx = ProjectionContext::new(&scope, &exec.snapshot);
    ctx.query = query;
    let mut out = Vec::with_capacity(rows.len());
    for (i, row) in rows.into_iter().enumerate() {
        if i % 256 == 0 {
            exec.check_interrupt()?;
        }
        let doc = project_tree(&row.doc, projection, &ctx)?;
        out.push(SourcedDoc {
            position: row.position,
            doc,
        });
    }
    Ok(out)
}

pub(crate) fn add_fields(
    exec: &Executor<'_>,
    additions: &PathTree,
    rows: Vec<SourcedDoc>,
) -> Result<Vec<SourcedDoc>> {
    let scope = exec.scope();
    let fields = additions.flatten_fields();
    let mut out = Vec::with_capacity(rows.len());
    for (i, row) in rows.into_iter().enumerate() {
        if i % 256 == 0 {
            exec.check_interrupt()?;
        }
        let mut doc = row.doc;
        for (path, expression) in &fields {
            match eval(expression, &doc, &scope, &exec.snapshot)? {
                Some(value) => {
                    doc = doc_utils::with_field_at_path(&doc, path, value)?;
                }
                // `$$REMOVE` drops the field.
                None => {
                    doc = doc_utils::without_field_at_path(&doc, path)?;
                }
            }
        }
        out.push(SourcedDoc {
            position: row.position,
            doc,
        });
    }
    Ok(out)
}

pub(crate) fn replace_root(
    exec: &Executor<'_>,
    expression: &CompiledExpression,
    rows: Vec<SourcedDoc>,
) -> Result<Vec<SourcedDoc>> {
    let scope = exec.scope();
    let mut out = Vec::with_capacity(rows.len());
    for (i, row) in rows.into_iter().enumerate() {
        if i % 256 == 0 {
            exec.check_interrupt()?;
        }
        match eval(expression, &row.doc, &scope, &exec.snapshot)? {
            Some(RawBson::Document(new_root)) => {
                out.push(SourcedDoc {
                    position: row.position,
                    doc: new_root,
                });
            }
            other => {
                return Err(DbError::new(
                    ErrorCode::Location(40228),
                    format!(
                        "'newRoot' expression must evaluate to a document, got {:?}",
                        other.map(|v| v.element_type())
                    ),
                ));
            }
        }
    }
    Ok(out)
}

const REDACT_DESCEND: &str = "$$DESCEND";
const REDACT_PRUNE: &str = "$$PRUNE";
const REDACT_KEEP: &str = "$$KEEP";

pub(crate) fn redact(
    exec: &Executor<'_>,
    expression: &CompiledExpression,
    rows: Vec<SourcedDoc>,
) -> Result<Vec<SourcedDoc>> {
    let mut out = Vec::new();
    for (i, row) in rows.into_iter().enumerate() {
        if i % 256 == 0 {
            exec.check_interrupt()?;
        }
        if let Some(doc) = redact_document(exec, expression, &row.doc)? {
            out.push(SourcedDoc {
                position: row.position,
                doc,
            });
        }
    }
    Ok(out)
}

/// Apply the redact decision at this document level; `None` prunes.
fn redact_document(
    exec: &Executor<'_>,
    expression: &CompiledExpression,
    doc: &RawDocument,
) -> Result<Option<RawDocumentBuf>> {
    let scope = exec.scope();
    let decision = eval(expression, doc, &scope, &exec.snapshot)?;
    match decision {
        Some(RawBson::String(s)) if s == REDACT_PRUNE => Ok(None),
        Some(RawBson::String(s)) if s == REDACT_KEEP => Ok(Some(doc.to_raw_document_buf())),
        Some(RawBson::String(s)) if s == REDACT_DESCEND => {
            let mut w = DocumentWriter::new();
            for entry in doc.iter() {
                let (key, value) = entry.map_err(DbError::from)?;
                match value {
                    RawBsonRef::Document(sub) => {
                        if let Some(kept) = redact_document(exec, expression, sub)? {
                            w.append(key, RawBson::Document(kept));
                        }
                    }
                    RawBsonRef::Array(arr) => {
                        let mut kept = ArrayWriter::new();
                        for elem in arr.into_iter().flatten() {
                            match elem {
                                RawBsonRef::Document(sub) => {
                                    if let Some(k) = redact_document(exec, expression, sub)? {
                                        kept.push(RawBson::Document(k));
                                    }
                                }
                                other => kept.push_ref(other),
                            }
                        }
                        w.append_array(key, kept);
                    }
                    other => w.append_ref(key, other),
                }
            }
            Ok(Some(w.into_buf()))
        }
        other => Err(DbError::new(
            ErrorCode::Location(17053),
            format!(
                "$redact must resolve to $$KEEP, $$PRUNE or $$DESCEND, got {other:?}"
            ),
        )),
    }
}
