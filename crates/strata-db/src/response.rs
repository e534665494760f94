use bson::raw::{RawArrayBuf, RawDocumentBuf};

use strata_bson::DocumentWriter;

/// `{ok: 1, cursor: {id, ns, firstBatch|nextBatch}}`.
pub(crate) fn cursor_reply(
    namespace: &str,
    cursor_id: i64,
    batch: RawArrayBuf,
    first_page: bool,
) -> RawDocumentBuf {
    let batch_field = if first_page { "firstBatch" } else { "nextBatch" };
    let mut cursor = DocumentWriter::new();
    cursor.append("id", cursor_id);
    cursor.append("ns", namespace);
    cursor.append(batch_field, bson::RawBson::Array(batch));

    let mut reply = DocumentWriter::new();
    reply.append_document("cursor", cursor);
    reply.append("ok", 1.0f64);
    reply.into_buf()
}

pub(crate) fn ok_reply() -> DocumentWriter {
    DocumentWriter::new()
}

pub(crate) fn finish_ok(mut w: DocumentWriter) -> RawDocumentBuf {
    w.append("ok", 1.0f64);
    w.into_buf()
}
