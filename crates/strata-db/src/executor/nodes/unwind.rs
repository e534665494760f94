use bson::RawBson;
use bson::raw::RawBsonRef;

use strata_bson::extract_path;
use strata_pipeline::UnwindSpec;

use crate::error::Result;
use crate::executor::doc_utils;
use crate::executor::SourcedDoc;

pub(crate) fn unwind(spec: &UnwindSpec, rows: Vec<SourcedDoc>) -> Result<Vec<SourcedDoc>> {
    let mut out = Vec::new();
    for row in rows {
        let value = extract_path(&row.doc, &spec.path);
        match value {
            Some(RawBsonRef::Array(arr)) => {
                let elems: Vec<_> = arr.into_iter().flatten().collect();
                if elems.is_empty() {
                    if spec.preserve_null_and_empty {
                        let mut doc = doc_utils::without_field_at_path(&row.doc, &spec.path)?;
                        if let Some(index_field) = &spec.include_array_index {
                            doc = doc_utils::with_field_at_path(
                                &doc,
                                index_field,
                                RawBson::Null,
                            )?;
                        }
                        out.push(SourcedDoc::new(doc));
                    }
                    continue;
                }
                for (index, elem) in elems.into_iter().enumerate() {
                    let mut doc = doc_utils::with_field_at_path(
                        &row.doc,
                        &spec.path,
                        elem.to_raw_bson(),
                    )?;
                    if let Some(index_field) = &spec.include_array_index {
                        doc = doc_utils::with_field_at_path(
                            &doc,
                            index_field,
                            RawBson::Int64(index as i64),
                        )?;
                    }
                    out.push(SourcedDoc::new(doc));
                }
            }
            // A non-array value unwinds to itself.
            Some(_) => {
                let mut doc = row.doc;
                if let Some(index_field) = &spec.include_array_index {
                    doc = doc_utils::with_field_at_path(&doc, index_field, RawBson::Null)?;
                }
                out.push(SourcedDoc::new(doc));
            }
            None => {
                if spec.preserve_null_and_empty {
                    let mut doc = row.doc;
                    if let Some(index_field) = &spec.include_array_index {
                        doc = doc_utils::with_field_at_path(&doc, index_field, RawBson::Null)?;
                    }
                    out.push(SourcedDoc::new(doc));
                }
            }
        }
    }
    Ok(out)
}
