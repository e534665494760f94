use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use bson::RawBson;
use bson::raw::{RawArrayBuf, RawBsonRef, RawDocument, RawDocumentBuf};
use tracing::debug;

use strata_bson::{ArrayWriter, Collation, DocumentWriter, values_equal};
use strata_cursor::{
    ContinuationToken, Cursor, CursorKind, PageWriter, PushOutcome, SpillFile, SpillState,
    TableContinuation,
};
use strata_path::TimeSnapshot;
use strata_pipeline::{BuildContext, CollectionRef, QueryTree, compile_pipeline_value};
use strata_query::{UpdateSpec, apply_update, matches, parse_filter, parse_update};
use strata_store::RowPosition;

use crate::catalog::{CachedPlan, PlanCacheKey};
use crate::database::Database;
use crate::error::{DbError, ErrorCode, Result};
use crate::executor::{Executor, SourcedDoc};
use crate::find::{FindCommand, find_to_pipeline, parse_find};
use crate::planner;
use crate::response::{cursor_reply, finish_ok, ok_reply};
use crate::retry::RetryKey;

static SPILL_NAME_SEQ: AtomicU64 = AtomicU64::new(1);

/// Operation-kind bits of a plan-cache key.
const OPERATION_READ: u32 = 1;

/// Shape hash over the pipeline's raw stage specs. Constants participate,
/// which keeps literal-bearing trees (point reads, range bounds) safe to
/// reuse verbatim.
fn shape_hash_of(pipeline: RawBsonRef<'_>) -> u64 {
    use std::hash::{DefaultHasher, Hash, Hasher};
    let mut hasher = DefaultHasher::new();
    if let RawBsonRef::Array(arr) = pipeline {
        arr.as_bytes().hash(&mut hasher);
    }
    hasher.finish()
}

/// One client session: at most one active cursor stream at a time,
/// cooperative single-threaded execution.
pub struct Session {
    db: Arc<Database>,
    id: u64,
}

/// Options shared by the read commands.
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    pub batch_size: Option<u32>,
    pub single_batch: bool,
    pub tailable: bool,
    pub collation: Option<Collation>,
    pub let_vars: Option<RawDocumentBuf>,
    pub max_time_ms: Option<u64>,
    pub cluster_time: Option<bson::Timestamp>,
}

/// One entry of an `update` command.
#[derive(Debug, Clone)]
pub struct WriteUpdate {
    pub filter: RawDocumentBuf,
    pub update: RawDocumentBuf,
    pub multi: bool,
    pub upsert: bool,
}

/// One entry of a `delete` command.
#[derive(Debug, Clone)]
pub struct WriteDelete {
    pub filter: RawDocumentBuf,
    pub limit_one: bool,
}

/// The compiled plan a live cursor re-attaches on getMore.
struct PlanPayload {
    tree: QueryTree,
    variables: HashMap<String, RawBson>,
}

impl Session {
    pub(crate) fn new(db: Arc<Database>, id: u64) -> Self {
        Self { db, id }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    // ── Read commands ───────────────────────────────────────────

    /// `find`: translated to the equivalent pipeline, sharing the
    /// aggregate path.
    pub fn find(&self, database: &str, cmd: &RawDocument) -> Result<RawDocumentBuf> {
        let parsed = parse_find(cmd)?;
        let pipeline = find_to_pipeline(&parsed);
        let FindCommand {
            collection,
            batch_size,
            single_batch,
            tailable,
            collation,
            let_vars,
            max_time_ms,
            ..
        } = parsed;
        let options = QueryOptions {
            batch_size,
            single_batch,
            tailable,
            collation,
            let_vars,
            max_time_ms,
            cluster_time: None,
        };
        self.run_read(database, Some(&collection), pipeline.as_raw_bson_ref(), options)
    }

    /// `aggregate`.
    pub fn aggregate(&self, database: &str, cmd: &RawDocument) -> Result<RawDocumentBuf> {
        let mut collection: Option<String> = None;
        let mut pipeline: Option<RawBson> = None;
        let mut options = QueryOptions::default();

        for entry in cmd.iter() {
            let (key, value) = entry?;
            match (key, value) {
                ("aggregate", RawBsonRef::String(coll)) => collection = Some(coll.to_string()),
                // `{aggregate: 1}`: collectionless pipeline.
                ("aggregate", v) if is_one(v) => collection = None,
                ("pipeline", RawBsonRef::Array(_)) => pipeline = Some(value.to_raw_bson()),
                ("cursor", RawBsonRef::Document(c)) => {
                    if let Some(RawBsonRef::Int32(n)) = c.get("batchSize")? {
                        options.batch_size = u32::try_from(n).ok();
                    }
                }
                ("collation", RawBsonRef::Document(d)) => {
                    options.collation = Some(
                        Collation::parse(d).map_err(|e| DbError::bad_value(e.to_string()))?,
                    );
                }
                ("let", RawBsonRef::Document(d)) => {
                    options.let_vars = Some(d.to_raw_document_buf());
                }
                ("maxTimeMS", RawBsonRef::Int32(n)) if n >= 0 => {
                    options.max_time_ms = Some(n as u64);
                }
                ("maxTimeMS", RawBsonRef::Int64(n)) if n >= 0 => {
                    options.max_time_ms = Some(n as u64);
                }
                ("allowDiskUse", RawBsonRef::Boolean(_))
                | ("explain", RawBsonRef::Boolean(_))
                | ("bypassDocumentValidation", _)
                | ("readConcern", _)
                | ("hint", _)
                | ("comment", _)
                | ("$db", _)
                | ("lsid", _)
                | ("$clusterTime", _) => {}
                (other, _) => {
                    return Err(DbError::bad_value(format!(
                        "unknown aggregate option '{other}'"
                    )));
                }
            }
        }

        let pipeline = pipeline
            .ok_or_else(|| DbError::bad_value("aggregate requires a pipeline array"))?;
        self.run_read(
            database,
            collection.as_deref(),
            pipeline.as_raw_bson_ref(),
            options,
        )
    }

    pub fn count(
        &self,
        database: &str,
        collection: &str,
        filter: Option<&RawDocument>,
    ) -> Result<i64> {
        let rows = match self.matching_rows(database, collection, filter)? {
            Some(rows) => rows,
            None => return Ok(0),
        };
        Ok(rows.len() as i64)
    }

    pub fn distinct(
        &self,
        database: &str,
        collection: &str,
        field: &str,
        filter: Option<&RawDocument>,
    ) -> Result<RawDocumentBuf> {
        let mut values: Vec<RawBson> = Vec::new();
        if let Some(rows) = self.matching_rows(database, collection, filter)? {
            for row in rows {
                for value in strata_bson::extract_path_values(&row.doc, field) {
                    let dup = values
                        .iter()
                        .any(|v| values_equal(v.as_raw_bson_ref(), value, None));
                    if !dup {
                        values.push(value.to_raw_bson());
                    }
                }
            }
        }
        let mut arr = ArrayWriter::new();
        for v in values {
            arr.push(v);
        }
        let mut w = ok_reply();
        w.append_array("values", arr);
        Ok(finish_ok(w))
    }

    pub fn list_collections(&self, database: &str) -> Result<RawDocumentBuf> {
        let names = self.db.store.list_collections(database)?;
        let mut batch = RawArrayBuf::new();
        for name in names {
            let mut doc = DocumentWriter::new();
            doc.append("name", name.as_str());
            doc.append("type", "collection");
            batch.push(doc.into_buf());
        }
        Ok(cursor_reply(
            &format!("{database}.$cmd.listCollections"),
            0,
            batch,
            true,
        ))
    }

    pub fn list_indexes(&self, database: &str, collection: &str) -> Result<RawDocumentBuf> {
        let handle = self.db.store.open_collection(database, collection)?;
        let mut batch = RawArrayBuf::new();
        for index in handle.indexes() {
            let mut key = DocumentWriter::new();
            key.append(index.path.as_str(), 1i32);
            let mut doc = DocumentWriter::new();
            doc.append("v", 2i32);
            doc.append("name", index.name.as_str());
            doc.append_document("key", key);
            if index.unique {
                doc.append("unique", true);
            }
            batch.push(doc.into_buf());
        }
        Ok(cursor_reply(
            &format!("{database}.{collection}.$cmd.listIndexes"),
            0,
            batch,
            true,
        ))
    }

    // ── Cursor continuation ─────────────────────────────────────

    pub fn get_more(
        &self,
        cursor_id: i64,
        batch_size: Option<u32>,
    ) -> Result<RawDocumentBuf> {
        let mut cursor = self.db.cursors.check_out(cursor_id, self.id)?;
        let namespace = cursor.namespace.clone();
        let mut page = PageWriter::new(batch_size.or(cursor.batch_size));

        let outcome = self.fill_page(&mut cursor, &mut page);
        match outcome {
            Ok(finished) => {
                let batch = page.into_batch();
                if finished && cursor.kind != CursorKind::Tailable {
                    self.db.cursors.close(cursor);
                    Ok(cursor_reply(&namespace, 0, batch, false))
                } else {
                    let id = cursor.id;
                    self.db.cursors.check_in(cursor, self.id);
                    Ok(cursor_reply(&namespace, id, batch, false))
                }
            }
            Err(e) => {
                // Partial results are discarded; files are unlinked.
                cursor.cancellation.cancel();
                self.db.cursors.close(cursor);
                Err(e)
            }
        }
    }

    pub fn kill_cursors(&self, cursor_ids: &[i64]) -> Result<RawDocumentBuf> {
        let (killed, not_found) = self.db.cursors.kill(cursor_ids, self.id);
        let mut killed_arr = ArrayWriter::new();
        for id in killed {
            killed_arr.push(id);
        }
        let mut missing_arr = ArrayWriter::new();
        for id in not_found {
            missing_arr.push(id);
        }
        let mut w = ok_reply();
        w.append_array("cursorsKilled", killed_arr);
        w.append_array("cursorsNotFound", missing_arr);
        Ok(finish_ok(w))
    }

    // ── Writes ──────────────────────────────────────────────────

    pub fn insert(
        &self,
        database: &str,
        collection: &str,
        docs: Vec<RawDocumentBuf>,
        retry: Option<RetryKey>,
    ) -> Result<RawDocumentBuf> {
        if let Some(key) = retry
            && let Some(replay) = self.db.retry.find(key)
        {
            return Ok(replay);
        }
        let handle = self.open_or_create(database, collection)?;
        let mut n = 0i64;
        for doc in docs {
            let doc = ensure_id(&doc)?;
            self.db.store.insert(&handle, &doc)?;
            n += 1;
        }
        let mut w = ok_reply();
        w.append("n", n);
        let reply = finish_ok(w);
        if let Some(key) = retry {
            self.db.retry.record(key, reply.clone());
        }
        Ok(reply)
    }

    pub fn update(
        &self,
        database: &str,
        collection: &str,
        updates: Vec<WriteUpdate>,
        retry: Option<RetryKey>,
    ) -> Result<RawDocumentBuf> {
        if let Some(key) = retry
            && let Some(replay) = self.db.retry.find(key)
        {
            return Ok(replay);
        }
        let handle = self.open_or_create(database, collection)?;
        let mut matched = 0i64;
        let mut modified = 0i64;
        let mut upserted = 0i64;

        for update in updates {
            let predicate = parse_filter(&update.filter)?;
            let is_replacement = !has_operators(&update.update)?;
            let spec: Option<UpdateSpec> = if is_replacement {
                None
            } else {
                Some(parse_update(&update.update)?)
            };

            let mut any = false;
            let rows = self.collection_rows(&handle)?;
            for row in rows {
                if !matches(&row.doc, &predicate)? {
                    continue;
                }
                any = true;
                matched += 1;
                let id = row
                    .doc
                    .get("_id")?
                    .ok_or_else(|| DbError::internal("stored row without _id"))?
                    .to_raw_bson();
                let new_doc = match &spec {
                    Some(spec) => apply_update(&row.doc, spec)?,
                    None => replacement_with_id(&update.update, id.as_raw_bson_ref())?,
                };
                if new_doc != row.doc {
                    self.db
                        .store
                        .update(&handle, id.as_raw_bson_ref(), &new_doc)?;
                    modified += 1;
                }
                if !update.multi {
                    break;
                }
            }

            if !any && update.upsert {
                let base = upsert_base(&update.filter)?;
                let new_doc = match &spec {
                    Some(spec) => apply_update(&base, spec)?,
                    None => update.update.clone(),
                };
                let new_doc = ensure_id(&new_doc)?;
                self.db.store.insert(&handle, &new_doc)?;
                upserted += 1;
            }
        }

        let mut w = ok_reply();
        w.append("n", matched + upserted);
        w.append("nModified", modified);
        if upserted > 0 {
            w.append("nUpserted", upserted);
        }
        let reply = finish_ok(w);
        if let Some(key) = retry {
            self.db.retry.record(key, reply.clone());
        }
        Ok(reply)
    }

    pub fn delete(
        &self,
        database: &str,
        collection: &str,
        deletes: Vec<WriteDelete>,
        retry: Option<RetryKey>,
    ) -> Result<RawDocumentBuf> {
        if let Some(key) = retry
            && let Some(replay) = self.db.retry.find(key)
        {
            return Ok(replay);
        }
        let handle = match self.db.store.open_collection(database, collection) {
            Ok(h) => h,
            Err(strata_store::StoreError::NamespaceNotFound(_)) => {
                let mut w = ok_reply();
                w.append("n", 0i64);
                return Ok(finish_ok(w));
            }
            Err(e) => return Err(e.into()),
        };

        let mut n = 0i64;
        for delete in deletes {
            let predicate = parse_filter(&delete.filter)?;
            for row in self.collection_rows(&handle)? {
                if !matches(&row.doc, &predicate)? {
                    continue;
                }
                let id = row
                    .doc
                    .get("_id")?
                    .ok_or_else(|| DbError::internal("stored row without _id"))?;
                if self.db.store.delete(&handle, id)? {
                    n += 1;
                }
                if delete.limit_one {
                    break;
                }
            }
        }
        let mut w = ok_reply();
        w.append("n", n);
        let reply = finish_ok(w);
        if let Some(key) = retry {
            self.db.retry.record(key, reply.clone());
        }
        Ok(reply)
    }

    // ── DDL ─────────────────────────────────────────────────────

    pub fn create_indexes(
        &self,
        database: &str,
        collection: &str,
        specs: &[RawDocumentBuf],
    ) -> Result<RawDocumentBuf> {
        let handle = self.open_or_create(database, collection)?;
        let namespace = format!("{database}.{collection}");
        let mut meta = self.db.metadata.get(&namespace).unwrap_or_default();
        if meta.shard_key_path.is_empty() {
            meta.shard_key_path = handle.shard_key_path().to_string();
        }

        let mut created = 0i32;
        for spec_doc in specs {
            let spec = strata_index::parse_index_spec(spec_doc)?;
            if let Some(existing) = meta.indexes.iter().find(|i| i.name == spec.name) {
                if existing.same_definition(&spec) {
                    continue; // idempotent re-create
                }
                return Err(DbError::new(
                    ErrorCode::IndexOptionsConflict,
                    format!("index '{}' already exists with different options", spec.name),
                ));
            }
            // Route to an access method; registration order decides ties.
            let am = self.db.registry.select_for_spec(&spec)?;
            debug!(index = %spec.name, am = %am.name, "creating index");
            for key in &spec.keys {
                if key.path.is_empty() {
                    // Wildcard root: the substrate indexes every path; the
                    // reference store has no wildcard support, so only the
                    // catalog records it.
                    continue;
                }
                self.db
                    .store
                    .create_index(&handle, &spec.name, &key.path, spec.unique)?;
            }
            meta.indexes.push(Arc::new(spec));
            created += 1;
        }
        self.db.metadata.put(namespace, meta);

        let mut w = ok_reply();
        w.append("numIndexesCreated", created);
        Ok(finish_ok(w))
    }

    pub fn drop_indexes(
        &self,
        database: &str,
        collection: &str,
        index_name: &str,
    ) -> Result<RawDocumentBuf> {
        let handle = self.db.store.open_collection(database, collection)?;
        let namespace = format!("{database}.{collection}");
        let mut meta = self.db.metadata.get(&namespace).unwrap_or_default();

        let drop_all = index_name == "*";
        let mut dropped = 0i32;
        for stored in handle.indexes() {
            if drop_all || stored.name == index_name {
                self.db.store.drop_index(&handle, stored.id)?;
                dropped += 1;
            }
        }
        if !drop_all && dropped == 0 {
            return Err(DbError::new(
                ErrorCode::IndexNotFound,
                format!("index '{index_name}' not found"),
            ));
        }
        meta.indexes
            .retain(|i| !(drop_all || i.name == index_name));
        self.db.metadata.put(namespace, meta);

        let mut w = ok_reply();
        w.append("nIndexesWas", dropped);
        Ok(finish_ok(w))
    }

    /// `collMod`: collection-metadata tweaks. The reference core records
    /// the change and invalidates caches.
    pub fn coll_mod(
        &self,
        database: &str,
        collection: &str,
        _spec: &RawDocument,
    ) -> Result<RawDocumentBuf> {
        let namespace = format!("{database}.{collection}");
        self.db.store.open_collection(database, collection)?;
        self.db.metadata.invalidate(&namespace);
        Ok(finish_ok(ok_reply()))
    }

    // ── Query execution ─────────────────────────────────────────

    fn run_read(
        &self,
        database: &str,
        collection: Option<&str>,
        pipeline: RawBsonRef<'_>,
        options: QueryOptions,
    ) -> Result<RawDocumentBuf> {
        let namespace = match collection {
            Some(coll) => format!("{database}.{coll}"),
            None => format!("{database}.$cmd.aggregate"),
        };

        // A missing source collection reads as empty (it is not an
        // error), except for collectionless pipelines.
        let (indexed_paths, collection_exists) = match collection {
            Some(coll) => match self.db.store.open_collection(database, coll) {
                Ok(handle) => (
                    handle
                        .indexes()
                        .iter()
                        .map(|i| i.path.clone())
                        .collect::<Vec<_>>(),
                    true,
                ),
                Err(strata_store::StoreError::NamespaceNotFound(_)) => (Vec::new(), false),
                Err(e) => return Err(e.into()),
            },
            None => (Vec::new(), true),
        };

        // Plan-cache lookup by namespace + operation + shape; entries die
        // with the metadata version they were compiled under.
        let metadata_version = self.db.metadata.version();
        let cache_key = PlanCacheKey {
            namespace: namespace.clone(),
            operation_bits: OPERATION_READ,
            shape_hash: shape_hash_of(pipeline),
        };
        let plan = match self.db.plans.get(&cache_key, metadata_version) {
            Some(cached) => cached,
            None => {
                let collection_ref =
                    CollectionRef::new(database, collection.unwrap_or("$cmd"));
                let mut ctx = BuildContext::new(database, Some(collection_ref.clone()));
                if let Some(c) = &options.collation {
                    ctx.set_collation(c);
                }
                if let Some(vars) = &options.let_vars {
                    ctx.variable_spec = Some(vars.clone());
                }
                let seed = QueryTree::Scan {
                    collection: collection_ref,
                };
                let tree = compile_pipeline_value(pipeline, seed, &mut ctx)?;
                let tree =
                    planner::improve_access_path(tree, &indexed_paths, &self.db.registry);
                let cached = Arc::new(CachedPlan {
                    tree,
                    is_point_read: ctx.is_point_read,
                    requires_persistent_cursor: ctx.requires_persistent_cursor,
                    is_single_row_result: ctx.is_single_row_result,
                });
                self.db
                    .plans
                    .put(cache_key, cached.clone(), metadata_version);
                cached
            }
        };
        let tree = plan.tree.clone();

        let reads_source = tree.any_node(&|n| {
            matches!(
                n,
                QueryTree::Scan { .. } | QueryTree::IndexScan { .. } | QueryTree::PointRead { .. }
            )
        });
        if !collection_exists && reads_source {
            return Ok(cursor_reply(&namespace, 0, RawArrayBuf::new(), true));
        }

        let snapshot = TimeSnapshot::capture(
            options
                .cluster_time
                .unwrap_or(bson::Timestamp { time: 0, increment: 0 }),
        );
        let variables = resolve_let_vars(options.let_vars.as_deref(), &snapshot)?;

        let mut executor =
            Executor::new(self.db.store.as_ref(), snapshot).with_variables(variables.clone());
        if let Some(ms) = options.max_time_ms {
            executor = executor.with_deadline(Instant::now() + Duration::from_millis(ms));
        }
        let rows = executor.execute(&tree, None)?;

        let kind = if options.tailable {
            CursorKind::Tailable
        } else if plan.is_point_read {
            CursorKind::PointRead
        } else if options.single_batch || plan.is_single_row_result {
            CursorKind::SingleBatch
        } else if plan.requires_persistent_cursor {
            CursorKind::Persistent
        } else {
            CursorKind::Streamable
        };

        match kind {
            // No server-side state: the whole result goes out at once.
            CursorKind::PointRead | CursorKind::SingleBatch => {
                let mut batch = ArrayWriter::new();
                for row in rows {
                    batch.push(RawBson::Document(row.doc));
                }
                Ok(cursor_reply(&namespace, 0, batch.into_buf(), true))
            }
            CursorKind::Streamable => {
                let mut page = PageWriter::new(options.batch_size);
                let mut emitted = 0usize;
                let mut last_position: Option<RowPosition> = None;
                for row in &rows {
                    match page.push(&row.doc) {
                        PushOutcome::Accepted => {
                            emitted += 1;
                            last_position = row.position.clone();
                        }
                        PushOutcome::PageFull => break,
                    }
                }
                if emitted == rows.len() {
                    return Ok(cursor_reply(&namespace, 0, page.into_batch(), true));
                }

                let mut cursor = Cursor::new(CursorKind::Streamable, &namespace, snapshot);
                cursor.batch_size = options.batch_size;
                match last_position {
                    Some(position) => {
                        cursor.continuation = Some(continuation_at(&namespace, &position));
                        cursor.payload = Some(Box::new(PlanPayload {
                            tree,
                            variables,
                        }));
                    }
                    // The plan lost positions (a barrier upstream);
                    // fall back to buffering the remainder.
                    None => {
                        cursor
                            .buffered
                            .extend(rows.into_iter().skip(emitted).map(|r| r.doc));
                    }
                }
                let id = self.db.cursors.register(cursor, self.id)?;
                Ok(cursor_reply(&namespace, id, page.into_batch(), true))
            }
            CursorKind::Persistent => {
                let mut page = PageWriter::new(options.batch_size);
                let mut emitted = 0usize;
                for row in &rows {
                    match page.push(&row.doc) {
                        PushOutcome::Accepted => emitted += 1,
                        PushOutcome::PageFull => break,
                    }
                }
                if emitted == rows.len() {
                    return Ok(cursor_reply(&namespace, 0, page.into_batch(), true));
                }

                let mut cursor = Cursor::new(CursorKind::Persistent, &namespace, snapshot);
                cursor.batch_size = options.batch_size;
                let remainder: Vec<RawDocumentBuf> =
                    rows.into_iter().skip(emitted).map(|r| r.doc).collect();
                if remainder.len() > self.db.spill_threshold {
                    let name = format!(
                        "s{}-{}",
                        self.id,
                        SPILL_NAME_SEQ.fetch_add(1, Ordering::Relaxed)
                    );
                    let mut spill = SpillFile::create(
                        self.db.cursors.spill_dir(),
                        &name,
                        self.db.cursors.spill_stats_handle(),
                    )?;
                    for doc in &remainder {
                        spill.append(doc)?;
                    }
                    cursor.spill = Some(SpillState::Reading(spill.finish()?));
                } else {
                    cursor.buffered.extend(remainder);
                }
                let id = self.db.cursors.register(cursor, self.id)?;
                Ok(cursor_reply(&namespace, id, page.into_batch(), true))
            }
            CursorKind::Tailable => {
                let mut page = PageWriter::new(options.batch_size);
                let mut last_position: Option<RowPosition> = None;
                for row in &rows {
                    match page.push(&row.doc) {
                        PushOutcome::Accepted => last_position = row.position.clone(),
                        PushOutcome::PageFull => break,
                    }
                }
                let mut cursor = Cursor::new(CursorKind::Tailable, &namespace, snapshot);
                cursor.batch_size = options.batch_size;
                cursor.last_position = last_position.map(|p| p.0);
                cursor.payload = Some(Box::new(PlanPayload { tree, variables }));
                let id = self.db.cursors.register(cursor, self.id)?;
                Ok(cursor_reply(&namespace, id, page.into_batch(), true))
            }
        }
    }

    /// Drain one page into `page`; returns whether the cursor finished.
    fn fill_page(&self, cursor: &mut Cursor, page: &mut PageWriter) -> Result<bool> {
        if cursor.cancellation.is_cancelled() {
            return Err(DbError::new(ErrorCode::Cancelled, "operation was cancelled"));
        }

        // Buffered rows first.
        while let Some(doc) = cursor.buffered.front() {
            match page.push(doc) {
                PushOutcome::Accepted => {
                    cursor.buffered.pop_front();
                }
                PushOutcome::PageFull => return Ok(false),
            }
        }

        // Then the spill file.
        if let Some(SpillState::Reading(reader)) = &mut cursor.spill {
            loop {
                if cursor.cancellation.is_cancelled() {
                    return Err(DbError::new(
                        ErrorCode::Cancelled,
                        "operation was cancelled",
                    ));
                }
                let Some(doc) = reader.next_doc()? else {
                    return Ok(true);
                };
                let doc = doc.to_raw_document_buf();
                match page.push(&doc) {
                    PushOutcome::Accepted => {}
                    PushOutcome::PageFull => {
                        // The row that did not fit leads the next page.
                        cursor.buffered.push_back(doc);
                        return Ok(false);
                    }
                }
            }
        }

        // Streamable / tailable: re-execute from the recorded position.
        let Some(payload) = cursor.payload.take() else {
            return Ok(true);
        };
        let Ok(plan) = payload.downcast::<PlanPayload>() else {
            return Err(DbError::internal("cursor payload of unexpected type"));
        };

        let resume = match cursor.kind {
            CursorKind::Streamable => cursor
                .continuation
                .as_ref()
                .and_then(|token| token.tables.first())
                .map(|t| RowPosition(t.cursor_state.clone())),
            CursorKind::Tailable => cursor.last_position.clone().map(RowPosition),
            _ => None,
        };

        let executor = Executor::new(self.db.store.as_ref(), cursor.snapshot)
            .with_variables(plan.variables.clone())
            .with_cancellation(cursor.cancellation.clone());
        let rows = executor.execute(&plan.tree, resume.as_ref())?;

        let mut emitted = 0usize;
        let mut last_position = None;
        for row in &rows {
            match page.push(&row.doc) {
                PushOutcome::Accepted => {
                    emitted += 1;
                    last_position = row.position.clone();
                }
                PushOutcome::PageFull => break,
            }
        }
        let finished = emitted == rows.len();
        match cursor.kind {
            CursorKind::Streamable => {
                if let Some(position) = last_position {
                    cursor.continuation = Some(continuation_at(&cursor.namespace, &position));
                }
            }
            CursorKind::Tailable => {
                if let Some(position) = last_position {
                    cursor.last_position = Some(position.0);
                }
            }
            _ => {}
        }
        cursor.payload = Some(plan);
        Ok(finished && cursor.kind != CursorKind::Tailable)
    }

    // ── Helpers ─────────────────────────────────────────────────

    fn matching_rows(
        &self,
        database: &str,
        collection: &str,
        filter: Option<&RawDocument>,
    ) -> Result<Option<Vec<SourcedDoc>>> {
        let handle = match self.db.store.open_collection(database, collection) {
            Ok(h) => h,
            Err(strata_store::StoreError::NamespaceNotFound(_)) => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let predicate = match filter {
            Some(f) => Some(parse_filter(f)?),
            None => None,
        };
        let mut out = Vec::new();
        for row in self.collection_rows(&handle)? {
            let keep = match &predicate {
                Some(p) => matches(&row.doc, p)?,
                None => true,
            };
            if keep {
                out.push(row);
            }
        }
        Ok(Some(out))
    }

    fn collection_rows(
        &self,
        handle: &strata_store::CollectionHandle,
    ) -> Result<Vec<SourcedDoc>> {
        let mut out = Vec::new();
        for row in self
            .db
            .store
            .scan(handle, strata_store::ScanOptions::default())?
        {
            let (position, row) = row?;
            out.push(SourcedDoc::at(position, row.doc));
        }
        Ok(out)
    }

    fn open_or_create(
        &self,
        database: &str,
        collection: &str,
    ) -> Result<strata_store::CollectionHandle> {
        match self.db.store.open_collection(database, collection) {
            Ok(h) => Ok(h),
            Err(strata_store::StoreError::NamespaceNotFound(_)) => Ok(self
                .db
                .store
                .create_collection(database, collection, "_id")?),
            Err(e) => Err(e.into()),
        }
    }
}

fn continuation_at(namespace: &str, position: &RowPosition) -> ContinuationToken {
    ContinuationToken {
        primary_key: None,
        tables: vec![TableContinuation {
            table: namespace.to_string(),
            cursor_state: position.0.clone(),
        }],
        params: None,
    }
}

fn is_one(value: RawBsonRef<'_>) -> bool {
    matches!(
        value,
        RawBsonRef::Int32(1) | RawBsonRef::Int64(1) | RawBsonRef::Double(1.0)
    )
}

/// Evaluate pipeline-level `let` bindings; they are constant expressions
/// (no document context).
fn resolve_let_vars(
    spec: Option<&RawDocument>,
    snapshot: &TimeSnapshot,
) -> Result<HashMap<String, RawBson>> {
    let mut out = HashMap::new();
    let Some(spec) = spec else {
        return Ok(out);
    };
    let empty = RawDocumentBuf::new();
    let scope = strata_path::VarScope::new();
    for entry in spec.iter() {
        let (name, value) = entry?;
        let compiled = strata_path::compile(value)?;
        let resolved =
            strata_path::eval(&compiled, &empty, &scope, snapshot)?.unwrap_or(RawBson::Null);
        out.insert(name.to_string(), resolved);
    }
    Ok(out)
}

/// Whether an update document is operator-form (`$set`, ...) rather than
/// a replacement.
fn has_operators(update: &RawDocument) -> Result<bool> {
    match update.iter().next() {
        Some(entry) => Ok(entry?.0.starts_with('$')),
        None => Ok(false),
    }
}

/// Give a document an `_id` (leading position) when it lacks one.
fn ensure_id(doc: &RawDocumentBuf) -> Result<RawDocumentBuf> {
    if doc.get("_id")?.is_some() {
        return Ok(doc.clone());
    }
    let mut w = DocumentWriter::new();
    w.append("_id", bson::oid::ObjectId::new());
    for entry in doc.iter() {
        let (key, value) = entry?;
        w.append_ref(key, value);
    }
    Ok(w.into_buf())
}

/// Replacement documents keep the matched row's `_id`.
fn replacement_with_id(
    replacement: &RawDocument,
    id: RawBsonRef<'_>,
) -> Result<RawDocumentBuf> {
    let mut w = DocumentWriter::new();
    w.append_ref("_id", id);
    for entry in replacement.iter() {
        let (key, value) = entry?;
        if key == "_id" {
            if !values_equal(value, id, None) {
                return Err(DbError::bad_value("replacement document changes _id"));
            }
            continue;
        }
        w.append_ref(key, value);
    }
    Ok(w.into_buf())
}

/// Seed document for an upsert: the equality fields of the filter.
fn upsert_base(filter: &RawDocument) -> Result<RawDocumentBuf> {
    let mut w = DocumentWriter::new();
    for entry in filter.iter() {
        let (key, value) = entry?;
        if key.starts_with('$') || key.contains('.') {
            continue;
        }
        match value {
            RawBsonRef::Document(d)
                if matches!(d.iter().next(), Some(Ok((k, _))) if k.starts_with('$')) => {}
            other => w.append_ref(key, other),
        }
    }
    Ok(w.into_buf())
}
