use bson::raw::{RawArrayBuf, RawBson, RawBsonRef, RawDocument, RawDocumentBuf};

/// Incremental builder for a BSON document.
///
/// Thin layer over [`RawDocumentBuf`] adding nested begin/end composition
/// and byte-copy append of existing sub-documents, which is what the
/// projection engine and cursor page writers need. `byte_len` tracks the
/// serialized size for batch caps.
#[derive(Debug, Default, Clone)]
pub struct DocumentWriter {
    buf: RawDocumentBuf,
}

impl DocumentWriter {
    pub fn new() -> Self {
        Self {
            buf: RawDocumentBuf::new(),
        }
    }

    pub fn append(&mut self, key: impl AsRef<str>, value: impl Into<RawBson>) {
        self.buf.append(key.as_ref(), value);
    }

    pub fn append_ref(&mut self, key: impl AsRef<str>, value: RawBsonRef<'_>) {
        self.buf.append_ref(key.as_ref(), value);
    }

    /// Append an existing document by byte copy, without re-walking it.
    pub fn append_raw_document(&mut self, key: impl AsRef<str>, doc: &RawDocument) {
        self.buf.append_ref(key.as_ref(), RawBsonRef::Document(doc));
    }

    /// Close out a nested document built with its own writer.
    pub fn append_document(&mut self, key: impl AsRef<str>, child: DocumentWriter) {
        self.buf
            .append(key.as_ref(), RawBson::Document(child.into_buf()));
    }

    pub fn append_array(&mut self, key: impl AsRef<str>, child: ArrayWriter) {
        self.buf
            .append(key.as_ref(), RawBson::Array(child.into_buf()));
    }

    /// Serialized size of the document built so far.
    pub fn byte_len(&self) -> usize {
        self.buf.as_bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.iter().next().is_none()
    }

    pub fn into_buf(self) -> RawDocumentBuf {
        self.buf
    }

    pub fn as_doc(&self) -> &RawDocument {
        &self.buf
    }
}

/// Incremental builder for a BSON array; element keys are managed
/// internally.
#[derive(Debug, Default, Clone)]
pub struct ArrayWriter {
    buf: RawArrayBuf,
    len: usize,
}

impl ArrayWriter {
    pub fn new() -> Self {
        Self {
            buf: RawArrayBuf::new(),
            len: 0,
        }
    }

    pub fn push(&mut self, value: impl Into<RawBson>) {
        self.buf.push(value);
        self.len += 1;
    }

    pub fn push_ref(&mut self, value: RawBsonRef<'_>) {
        self.buf.push(value.to_raw_bson());
        self.len += 1;
    }

    pub fn push_document(&mut self, child: DocumentWriter) {
        self.buf.push(RawBson::Document(child.into_buf()));
        self.len += 1;
    }

    pub fn push_array(&mut self, child: ArrayWriter) {
        self.buf.push(RawBson::Array(child.into_buf()));
        self.len += 1;
    }

    /// Number of elements pushed.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Serialized size of the array built so far.
    pub fn byte_len(&self) -> usize {
        self.buf.as_bytes().len()
    }

    pub fn into_buf(self) -> RawArrayBuf {
        self.buf
    }
}

#[cfg(test)]
mod tests {
    use bson::rawdoc;

    use super::*;

    #[test]
    fn nested_composition() {
        let mut inner = DocumentWriter::new();
        inner.append("b", 2i32);

        let mut arr = ArrayWriter::new();
        arr.push(1i32);
        arr.push("two");

        let mut root = DocumentWriter::new();
        root.append("a", 1i32);
        root.append_document("inner", inner);
        root.append_array("list", arr);

        let expected = rawdoc! { "a": 1, "inner": { "b": 2 }, "list": [1, "two"] };
        assert_eq!(root.into_buf(), expected);
    }

    #[test]
    fn raw_document_append_is_byte_identical() {
        let src = rawdoc! { "x": [1, 2], "y": { "z": true } };
        let mut w = DocumentWriter::new();
        w.append_raw_document("copy", &src);
        let out = w.into_buf();
        let copied = out.get("copy").unwrap().unwrap();
        match copied {
            RawBsonRef::Document(d) => assert_eq!(d.as_bytes(), src.as_bytes()),
            other => panic!("expected document, got {other:?}"),
        }
    }

    #[test]
    fn byte_len_tracks_growth() {
        let mut w = DocumentWriter::new();
        let empty = w.byte_len();
        w.append("k", "value");
        assert!(w.byte_len() > empty);
    }

    #[test]
    fn array_writer_counts_elements() {
        let mut arr = ArrayWriter::new();
        assert!(arr.is_empty());
        arr.push(10i64);
        arr.push_ref(RawBsonRef::Boolean(false));
        assert_eq!(arr.len(), 2);
    }
}
