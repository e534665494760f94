use strata_bson::DocumentWriter;
use strata_pipeline::{CollectionRef, StatsKind};
use strata_store::ScanOptions;

use crate::error::Result;
use crate::executor::{Executor, SourcedDoc};

/// `$collStats` / `$indexStats` over the reference store.
pub(crate) fn meta_stats(
    exec: &Executor<'_>,
    kind: StatsKind,
    collection: &CollectionRef,
) -> Result<Vec<SourcedDoc>> {
    let handle = exec
        .store
        .open_collection(&collection.database, &collection.collection)?;

    match kind {
        StatsKind::Collection => {
            let mut count: i64 = 0;
            let mut size: i64 = 0;
            for row in exec.store.scan(&handle, ScanOptions::default())? {
                let (_, row) = row?;
                count += 1;
                size += row.doc.as_bytes().len() as i64;
            }
            let mut w = DocumentWriter::new();
            w.append("ns", handle.namespace());
            w.append("count", count);
            w.append("size", size);
            w.append("nindexes", handle.indexes().len() as i32);
            Ok(vec![SourcedDoc::new(w.into_buf())])
        }
        StatsKind::Indexes => {
            let mut out = Vec::new();
            for index in handle.indexes() {
                let mut w = DocumentWriter::new();
                w.append("name", index.name.as_str());
                let mut key = DocumentWriter::new();
                key.append(index.path.as_str(), 1i32);
                w.append_document("key", key);
                w.append("unique", index.unique);
                out.push(SourcedDoc::new(w.into_buf()));
            }
            Ok(out)
        }
    }
}
