use std::collections::{BTreeMap, HashMap, HashSet};
use std::ops::Bound;

use bson::raw::{RawBsonRef, RawDocumentBuf};
use parking_lot::RwLock;

use strata_bson::{encode_i64_sortable, encode_index_key, extract_path, hash_value};

use crate::error::StoreError;
use crate::store::{
    CollectionHandle, IndexId, IndexRange, Row, RowIter, RowPosition, RowStore, ScanDirection,
    ScanOptions, StoredIndex,
};

/// In-memory reference implementation of the Row Store interface.
///
/// Tables are BTreeMaps keyed by the `(shard_key_value, object_id)`
/// primary key in sortable encoding; secondary indexes map
/// `value_key ++ primary_key` to the primary key. Used by tests and the
/// reference execution backend.
#[derive(Default)]
pub struct MemoryRowStore {
    inner: RwLock<HashMap<String, Table>>,
}

struct Table {
    shard_key_path: String,
    rows: BTreeMap<Vec<u8>, RawDocumentBuf>,
    indexes: Vec<StoredIndex>,
    index_entries: HashMap<IndexId, BTreeMap<Vec<u8>, Vec<u8>>>,
    next_index_id: IndexId,
}

impl Table {
    fn new(shard_key_path: &str) -> Self {
        Self {
            shard_key_path: shard_key_path.to_string(),
            rows: BTreeMap::new(),
            indexes: Vec::new(),
            index_entries: HashMap::new(),
            next_index_id: 1,
        }
    }

    fn primary_key(&self, doc: &RawDocumentBuf) -> Result<Vec<u8>, StoreError> {
        let id = doc
            .get("_id")?
            .ok_or_else(|| StoreError::InvalidDocument("document has no _id".into()))?;
        let shard_value = extract_path(doc, &self.shard_key_path).unwrap_or(RawBsonRef::Null);
        Ok(compose_pk(hash_value(shard_value), id))
    }

    fn index_entry_keys(&self, index: &StoredIndex, doc: &RawDocumentBuf, pk: &[u8]) -> Vec<Vec<u8>> {
        let mut keys = Vec::new();
        for value in strata_bson::extract_path_values(doc, &index.path) {
            if let Some(vk) = encode_index_key(value) {
                let mut key = vk;
                key.extend_from_slice(pk);
                keys.push(key);
            }
        }
        keys
    }

    fn add_index_entries(&mut self, doc: &RawDocumentBuf, pk: &[u8]) -> Result<(), StoreError> {
        let indexes = self.indexes.clone();
        for index in &indexes {
            if index.unique {
                self.check_unique(index, doc, pk)?;
            }
            for key in self.index_entry_keys(index, doc, pk) {
                self.index_entries
                    .entry(index.id)
                    .or_default()
                    .insert(key, pk.to_vec());
            }
        }
        Ok(())
    }

    fn remove_index_entries(&mut self, doc: &RawDocumentBuf, pk: &[u8]) {
        let indexes = self.indexes.clone();
        for index in &indexes {
            for key in self.index_entry_keys(index, doc, pk) {
                if let Some(entries) = self.index_entries.get_mut(&index.id) {
                    entries.remove(&key);
                }
            }
        }
    }

    fn check_unique(
        &self,
        index: &StoredIndex,
        doc: &RawDocumentBuf,
        pk: &[u8],
    ) -> Result<(), StoreError> {
        let Some(entries) = self.index_entries.get(&index.id) else {
            return Ok(());
        };
        for value in strata_bson::extract_path_values(doc, &index.path) {
            let Some(vk) = encode_index_key(value) else {
                continue;
            };
            let upper = prefix_successor(&vk);
            let range = match &upper {
                Some(end) => entries.range((Bound::Included(vk.clone()), Bound::Excluded(end.clone()))),
                None => entries.range((Bound::Included(vk.clone()), Bound::Unbounded)),
            };
            for (_, existing_pk) in range {
                if existing_pk.as_slice() != pk {
                    return Err(StoreError::DuplicateKey(index.name.clone()));
                }
            }
        }
        Ok(())
    }

    fn decode_row(&self, doc: &RawDocumentBuf) -> Result<Row, StoreError> {
        let id = doc
            .get("_id")?
            .ok_or_else(|| StoreError::InvalidDocument("row without _id".into()))?;
        Ok(Row {
            object_id: id.to_raw_bson(),
            doc: doc.clone(),
        })
    }
}

fn compose_pk(shard_hash: i64, id: RawBsonRef<'_>) -> Vec<u8> {
    let mut pk = encode_i64_sortable(shard_hash).to_vec();
    match encode_index_key(id) {
        Some(idk) => pk.extend_from_slice(&idk),
        None => pk.extend_from_slice(&[0xFE]),
    }
    pk
}

/// Smallest byte string greater than every key with this prefix, if any.
fn prefix_successor(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut out = prefix.to_vec();
    while let Some(last) = out.last_mut() {
        if *last < 0xFF {
            *last += 1;
            return Some(out);
        }
        out.pop();
    }
    None
}

impl MemoryRowStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn handle_for(&self, namespace: &str, table: &Table) -> CollectionHandle {
        let (database, name) = namespace.split_once('.').unwrap_or((namespace, ""));
        CollectionHandle::new(
            database,
            name,
            table.shard_key_path.clone(),
            table.indexes.clone(),
        )
    }
}

impl RowStore for MemoryRowStore {
    fn create_collection(
        &self,
        database: &str,
        name: &str,
        shard_key_path: &str,
    ) -> Result<CollectionHandle, StoreError> {
        let namespace = format!("{database}.{name}");
        let mut inner = self.inner.write();
        let table = inner
            .entry(namespace.clone())
            .or_insert_with(|| Table::new(shard_key_path));
        Ok(self.handle_for(&namespace, table))
    }

    fn open_collection(&self, database: &str, name: &str) -> Result<CollectionHandle, StoreError> {
        let namespace = format!("{database}.{name}");
        let inner = self.inner.read();
        match inner.get(&namespace) {
            Some(table) => Ok(self.handle_for(&namespace, table)),
            None => Err(StoreError::NamespaceNotFound(namespace)),
        }
    }

    fn drop_collection(&self, database: &str, name: &str) -> Result<(), StoreError> {
        let namespace = format!("{database}.{name}");
        match self.inner.write().remove(&namespace) {
            Some(_) => Ok(()),
            None => Err(StoreError::NamespaceNotFound(namespace)),
        }
    }

    fn list_collections(&self, database: &str) -> Result<Vec<String>, StoreError> {
        let prefix = format!("{database}.");
        let mut names: Vec<String> = self
            .inner
            .read()
            .keys()
            .filter_map(|ns| ns.strip_prefix(&prefix).map(str::to_string))
            .collect();
        names.sort();
        Ok(names)
    }

    fn scan<'a>(
        &'a self,
        handle: &CollectionHandle,
        options: ScanOptions,
    ) -> Result<RowIter<'a>, StoreError> {
        let inner = self.inner.read();
        let table = inner
            .get(&handle.namespace())
            .ok_or_else(|| StoreError::NamespaceNotFound(handle.namespace()))?;

        let bounds = match &options.start_after {
            Some(RowPosition(after)) => (Bound::Excluded(after.clone()), Bound::Unbounded),
            None => (Bound::Unbounded, Bound::Unbounded),
        };
        let mut rows: Vec<Result<(RowPosition, Row), StoreError>> = Vec::new();
        let range = table.rows.range::<Vec<u8>, _>(bounds);
        let collect = |(pk, doc): (&Vec<u8>, &RawDocumentBuf)| {
            table
                .decode_row(doc)
                .map(|row| (RowPosition(pk.clone()), row))
        };
        match options.direction {
            ScanDirection::Forward => {
                for item in range.map(collect) {
                    rows.push(item);
                    if options.limit.is_some_and(|l| rows.len() >= l) {
                        break;
                    }
                }
            }
            ScanDirection::Reverse => {
                for item in range.rev().map(collect) {
                    rows.push(item);
                    if options.limit.is_some_and(|l| rows.len() >= l) {
                        break;
                    }
                }
            }
        }
        Ok(Box::new(rows.into_iter()))
    }

    fn point_read(
        &self,
        handle: &CollectionHandle,
        object_id: RawBsonRef<'_>,
    ) -> Result<Option<Row>, StoreError> {
        let inner = self.inner.read();
        let table = inner
            .get(&handle.namespace())
            .ok_or_else(|| StoreError::NamespaceNotFound(handle.namespace()))?;
        // The shard key of a point read is derived from the document; for
        // `_id`-sharded tables (the common case) the key is the id itself.
        if table.shard_key_path == "_id" {
            let pk = compose_pk(hash_value(object_id), object_id);
            return match table.rows.get(&pk) {
                Some(doc) => table.decode_row(doc).map(Some),
                None => Ok(None),
            };
        }
        // Otherwise fall back to a table walk on the id column.
        for doc in table.rows.values() {
            if let Ok(Some(id)) = doc.get("_id")
                && strata_bson::values_equal(id, object_id, None)
            {
                return table.decode_row(doc).map(Some);
            }
        }
        Ok(None)
    }

    fn index_scan<'a>(
        &'a self,
        handle: &CollectionHandle,
        index: IndexId,
        range: &IndexRange,
        direction: ScanDirection,
        limit: Option<usize>,
    ) -> Result<RowIter<'a>, StoreError> {
        let inner = self.inner.read();
        let table = inner
            .get(&handle.namespace())
            .ok_or_else(|| StoreError::NamespaceNotFound(handle.namespace()))?;
        let entries = table
            .index_entries
            .get(&index)
            .ok_or_else(|| StoreError::IndexNotFound(format!("index {index}")))?;

        let lower = match &range.lower {
            None => Bound::Unbounded,
            Some((value, inclusive)) => {
                let vk = encode_index_key(value.as_raw_bson_ref())
                    .ok_or_else(|| StoreError::InvalidDocument("unindexable bound".into()))?;
                if *inclusive {
                    Bound::Included(vk)
                } else {
                    match prefix_successor(&vk) {
                        Some(next) => Bound::Included(next),
                        None => Bound::Unbounded,
                    }
                }
            }
        };
        let upper = match &range.upper {
            None => Bound::Unbounded,
            Some((value, inclusive)) => {
                let vk = encode_index_key(value.as_raw_bson_ref())
                    .ok_or_else(|| StoreError::InvalidDocument("unindexable bound".into()))?;
                if *inclusive {
                    match prefix_successor(&vk) {
                        Some(next) => Bound::Excluded(next),
                        None => Bound::Unbounded,
                    }
                } else {
                    Bound::Excluded(vk)
                }
            }
        };

        let mut seen: HashSet<Vec<u8>> = HashSet::new();
        let mut out: Vec<Result<(RowPosition, Row), StoreError>> = Vec::new();
        let pks = entries.range((lower, upper)).map(|(_, pk)| pk.clone());
        let ordered: Vec<Vec<u8>> = match direction {
            ScanDirection::Forward => pks.collect(),
            ScanDirection::Reverse => {
                let mut v: Vec<_> = pks.collect();
                v.reverse();
                v
            }
        };
        for pk in ordered {
            if !seen.insert(pk.clone()) {
                continue;
            }
            match table.rows.get(&pk) {
                Some(doc) => out.push(
                    table
                        .decode_row(doc)
                        .map(|row| (RowPosition(pk.clone()), row)),
                ),
                None => {
                    out.push(Err(StoreError::Internal(
                        "dangling index entry".into(),
                    )));
                }
            }
            if limit.is_some_and(|l| out.len() >= l) {
                break;
            }
        }
        Ok(Box::new(out.into_iter()))
    }

    fn insert(&self, handle: &CollectionHandle, doc: &RawDocumentBuf) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        let table = inner
            .get_mut(&handle.namespace())
            .ok_or_else(|| StoreError::NamespaceNotFound(handle.namespace()))?;
        let pk = table.primary_key(doc)?;
        if table.rows.contains_key(&pk) {
            return Err(StoreError::Conflict(format!("{:?}", doc.get("_id"))));
        }
        table.add_index_entries(doc, &pk)?;
        table.rows.insert(pk, doc.clone());
        Ok(())
    }

    fn update(
        &self,
        handle: &CollectionHandle,
        object_id: RawBsonRef<'_>,
        doc: &RawDocumentBuf,
    ) -> Result<bool, StoreError> {
        let mut inner = self.inner.write();
        let table = inner
            .get_mut(&handle.namespace())
            .ok_or_else(|| StoreError::NamespaceNotFound(handle.namespace()))?;
        let pk = table.primary_key(doc)?;
        let id_unchanged = doc
            .get("_id")?
            .is_some_and(|id| strata_bson::values_equal(id, object_id, None));
        if !id_unchanged {
            return Err(StoreError::InvalidDocument(
                "replacement document changes _id".into(),
            ));
        }
        let Some(old) = table.rows.get(&pk).cloned() else {
            return Ok(false);
        };
        table.remove_index_entries(&old, &pk);
        table.add_index_entries(doc, &pk)?;
        table.rows.insert(pk, doc.clone());
        Ok(true)
    }

    fn delete(
        &self,
        handle: &CollectionHandle,
        object_id: RawBsonRef<'_>,
    ) -> Result<bool, StoreError> {
        let mut inner = self.inner.write();
        let table = inner
            .get_mut(&handle.namespace())
            .ok_or_else(|| StoreError::NamespaceNotFound(handle.namespace()))?;
        // Locate the row through the id column.
        let mut found: Option<(Vec<u8>, RawDocumentBuf)> = None;
        if table.shard_key_path == "_id" {
            let pk = compose_pk(hash_value(object_id), object_id);
            found = table.rows.get(&pk).map(|d| (pk, d.clone()));
        } else {
            for (pk, doc) in &table.rows {
                if let Ok(Some(id)) = doc.get("_id")
                    && strata_bson::values_equal(id, object_id, None)
                {
                    found = Some((pk.clone(), doc.clone()));
                    break;
                }
            }
        }
        match found {
            Some((pk, doc)) => {
                table.remove_index_entries(&doc, &pk);
                table.rows.remove(&pk);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn create_index(
        &self,
        handle: &CollectionHandle,
        name: &str,
        path: &str,
        unique: bool,
    ) -> Result<IndexId, StoreError> {
        let mut inner = self.inner.write();
        let table = inner
            .get_mut(&handle.namespace())
            .ok_or_else(|| StoreError::NamespaceNotFound(handle.namespace()))?;
        if let Some(existing) = table.indexes.iter().find(|i| i.name == name) {
            return Ok(existing.id);
        }
        let id = table.next_index_id;
        table.next_index_id += 1;
        let index = StoredIndex {
            id,
            name: name.to_string(),
            path: path.to_string(),
            unique,
        };
        table.indexes.push(index.clone());

        // Backfill from existing rows.
        let rows: Vec<(Vec<u8>, RawDocumentBuf)> = table
            .rows
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        for (pk, doc) in rows {
            if index.unique {
                table.check_unique(&index, &doc, &pk)?;
            }
            for key in table.index_entry_keys(&index, &doc, &pk) {
                table.index_entries.entry(id).or_default().insert(key, pk.clone());
            }
        }
        Ok(id)
    }

    fn drop_index(&self, handle: &CollectionHandle, index: IndexId) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        let table = inner
            .get_mut(&handle.namespace())
            .ok_or_else(|| StoreError::NamespaceNotFound(handle.namespace()))?;
        let at = table
            .indexes
            .iter()
            .position(|i| i.id == index)
            .ok_or_else(|| StoreError::IndexNotFound(format!("index {index}")))?;
        table.indexes.remove(at);
        table.index_entries.remove(&index);
        Ok(())
    }
}
