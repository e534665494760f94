use std::fmt;
use std::sync::Arc;

use bson::RawBson;
use bson::raw::{RawBsonRef, RawDocumentBuf};

use crate::error::StoreError;

/// Identifier of a secondary index within a collection's table.
pub type IndexId = u32;

// ── CollectionHandle ────────────────────────────────────────────

struct CollectionHandleInner {
    database: String,
    name: String,
    /// Path of the distribution column; `_id` unless the collection was
    /// sharded on something else.
    shard_key_path: String,
    indexes: Vec<StoredIndex>,
}

/// A resolved collection descriptor. Cheap to clone (Arc bump); the index
/// list is a snapshot taken when the handle was opened.
#[derive(Clone)]
pub struct CollectionHandle {
    inner: Arc<CollectionHandleInner>,
}

impl fmt::Debug for CollectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CollectionHandle")
            .field("namespace", &self.namespace())
            .field("shard_key_path", &self.inner.shard_key_path)
            .field("indexes", &self.inner.indexes)
            .finish()
    }
}

impl CollectionHandle {
    pub fn new(
        database: impl Into<String>,
        name: impl Into<String>,
        shard_key_path: impl Into<String>,
        indexes: Vec<StoredIndex>,
    ) -> Self {
        Self {
            inner: Arc::new(CollectionHandleInner {
                database: database.into(),
                name: name.into(),
                shard_key_path: shard_key_path.into(),
                indexes,
            }),
        }
    }

    pub fn database(&self) -> &str {
        &self.inner.database
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn namespace(&self) -> String {
        format!("{}.{}", self.inner.database, self.inner.name)
    }

    pub fn shard_key_path(&self) -> &str {
        &self.inner.shard_key_path
    }

    pub fn indexes(&self) -> &[StoredIndex] {
        &self.inner.indexes
    }

    /// The ordered secondary index over a path, if one exists.
    pub fn index_on(&self, path: &str) -> Option<&StoredIndex> {
        self.inner.indexes.iter().find(|i| i.path == path)
    }
}

/// Descriptor of one secondary index as the substrate stores it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredIndex {
    pub id: IndexId,
    pub name: String,
    /// Dotted path of the indexed value (single-path form; composite
    /// indexes register one entry per column with a shared name).
    pub path: String,
    pub unique: bool,
}

/// A row of the physical table: `(shard_key_value, object_id,
/// document_bytes)` with primary key `(shard_key_value, object_id)`.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    pub object_id: RawBson,
    pub doc: RawDocumentBuf,
}

/// Opaque primary-key position used to resume scans (continuations).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct RowPosition(pub Vec<u8>);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScanDirection {
    #[default]
    Forward,
    Reverse,
}

/// Bounds for an ordered index scan; values are compared in the canonical
/// order via their sortable encodings.
#[derive(Debug, Clone, Default)]
pub struct IndexRange {
    pub lower: Option<(RawBson, bool)>,
    pub upper: Option<(RawBson, bool)>,
}

impl IndexRange {
    pub fn eq(value: RawBson) -> Self {
        Self {
            lower: Some((value.clone(), true)),
            upper: Some((value, true)),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ScanOptions {
    /// Resume strictly after this primary-key position.
    pub start_after: Option<RowPosition>,
    pub direction: ScanDirection,
    pub limit: Option<usize>,
}

pub type RowIter<'a> = Box<dyn Iterator<Item = Result<(RowPosition, Row), StoreError>> + 'a>;

/// The Row Store collaborator: scan/insert/update/delete over shard-keyed
/// tables with secondary indexes. The engine core consumes this interface;
/// the relational substrate implements it.
pub trait RowStore: Send + Sync {
    fn create_collection(
        &self,
        database: &str,
        name: &str,
        shard_key_path: &str,
    ) -> Result<CollectionHandle, StoreError>;

    fn open_collection(&self, database: &str, name: &str) -> Result<CollectionHandle, StoreError>;

    fn drop_collection(&self, database: &str, name: &str) -> Result<(), StoreError>;

    fn list_collections(&self, database: &str) -> Result<Vec<String>, StoreError>;

    /// Scan the table in primary-key order.
    fn scan<'a>(
        &'a self,
        handle: &CollectionHandle,
        options: ScanOptions,
    ) -> Result<RowIter<'a>, StoreError>;

    /// Read one row by `_id`, bypassing the scan machinery.
    fn point_read(
        &self,
        handle: &CollectionHandle,
        object_id: RawBsonRef<'_>,
    ) -> Result<Option<Row>, StoreError>;

    /// Ordered index scan resolving to full rows.
    fn index_scan<'a>(
        &'a self,
        handle: &CollectionHandle,
        index: IndexId,
        range: &IndexRange,
        direction: ScanDirection,
        limit: Option<usize>,
    ) -> Result<RowIter<'a>, StoreError>;

    /// Insert a document; `Conflict` when the primary key exists.
    fn insert(&self, handle: &CollectionHandle, doc: &RawDocumentBuf) -> Result<(), StoreError>;

    /// Replace the document at `object_id`; false when absent.
    fn update(
        &self,
        handle: &CollectionHandle,
        object_id: RawBsonRef<'_>,
        doc: &RawDocumentBuf,
    ) -> Result<bool, StoreError>;

    /// Delete the row at `object_id`; false when absent.
    fn delete(&self, handle: &CollectionHandle, object_id: RawBsonRef<'_>)
    -> Result<bool, StoreError>;

    fn create_index(
        &self,
        handle: &CollectionHandle,
        name: &str,
        path: &str,
        unique: bool,
    ) -> Result<IndexId, StoreError>;

    fn drop_index(&self, handle: &CollectionHandle, index: IndexId) -> Result<(), StoreError>;
}
