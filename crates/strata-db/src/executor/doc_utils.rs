use bson::raw::{RawDocument, RawDocumentBuf};
use bson::{Bson, Document};

use crate::error::{DbError, ErrorCode, Result};

/// Rewrite a document with `value` placed at a dotted path, creating
/// intermediate documents as needed.
pub(crate) fn with_field_at_path(
    doc: &RawDocument,
    path: &str,
    value: bson::RawBson,
) -> Result<RawDocumentBuf> {
    let mut owned = to_owned(doc)?;
    let value: Bson = value
        .try_into()
        .map_err(|e: bson::raw::Error| DbError::new(ErrorCode::InternalError, e.to_string()))?;
    set_path(&mut owned, path, value);
    from_owned(&owned)
}

/// Rewrite a document with the field at a dotted path removed.
pub(crate) fn without_field_at_path(doc: &RawDocument, path: &str) -> Result<RawDocumentBuf> {
    let mut owned = to_owned(doc)?;
    remove_path(&mut owned, path);
    from_owned(&owned)
}

pub(crate) fn to_owned(doc: &RawDocument) -> Result<Document> {
    Document::try_from(doc).map_err(|e| DbError::new(ErrorCode::InternalError, e.to_string()))
}

pub(crate) fn from_owned(doc: &Document) -> Result<RawDocumentBuf> {
    bson::to_raw_document_buf(doc)
        .map_err(|e| DbError::new(ErrorCode::InternalError, e.to_string()))
}

fn set_path(doc: &mut Document, path: &str, value: Bson) {
    match path.split_once('.') {
        None => {
            doc.insert(path, value);
        }
        Some((head, rest)) => {
            let entry = doc
                .entry(head.to_string())
                .or_insert_with(|| Bson::Document(Document::new()));
            if let Bson::Document(sub) = entry {
                set_path(sub, rest, value);
            } else {
                let mut sub = Document::new();
                set_path(&mut sub, rest, value);
                doc.insert(head, Bson::Document(sub));
            }
        }
    }
}

fn remove_path(doc: &mut Document, path: &str) {
    match path.split_once('.') {
        None => {
            doc.remove(path);
        }
        Some((head, rest)) => {
            if let Some(Bson::Document(sub)) = doc.get_mut(head) {
                remove_path(sub, rest);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use bson::rawdoc;

    use super::*;

    #[test]
    fn set_creates_intermediates() {
        let doc = rawdoc! { "a": 1 };
        let out = with_field_at_path(&doc, "b.c", bson::RawBson::Int32(2)).unwrap();
        assert_eq!(out, rawdoc! { "a": 1, "b": { "c": 2 } });
    }

    #[test]
    fn set_replaces_scalar_intermediate() {
        let doc = rawdoc! { "a": 5 };
        let out = with_field_at_path(&doc, "a.b", bson::RawBson::Int32(1)).unwrap();
        assert_eq!(out, rawdoc! { "a": { "b": 1 } });
    }

    #[test]
    fn remove_leaves_other_fields() {
        let doc = rawdoc! { "a": { "b": 1, "c": 2 }, "d": 3 };
        let out = without_field_at_path(&doc, "a.b").unwrap();
        assert_eq!(out, rawdoc! { "a": { "c": 2 }, "d": 3 });
    }
}
