use std::sync::Arc;

use bson::raw::{RawBsonRef, RawDocumentBuf};

use strata_db::{Database, DatabaseConfig, Session};
use strata_store::MemoryRowStore;

pub fn open_db() -> (Arc<Database>, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let config = DatabaseConfig {
        cursor_dir: dir.path().to_path_buf(),
        ..DatabaseConfig::default()
    };
    let db = Database::open(Arc::new(MemoryRowStore::new()), config);
    (db, dir)
}

pub fn session(db: &Arc<Database>) -> Session {
    db.session(1)
}

pub fn insert_all(session: &Session, coll: &str, docs: Vec<RawDocumentBuf>) {
    let reply = session.insert("test", coll, docs, None).unwrap();
    assert_ok(&reply);
}

pub fn assert_ok(reply: &RawDocumentBuf) {
    assert_eq!(
        reply.get("ok").unwrap(),
        Some(RawBsonRef::Double(1.0)),
        "expected ok reply, got {reply:?}"
    );
}

pub fn cursor_id(reply: &RawDocumentBuf) -> i64 {
    let Some(RawBsonRef::Document(cursor)) = reply.get("cursor").unwrap() else {
        panic!("reply has no cursor document: {reply:?}");
    };
    match cursor.get("id").unwrap() {
        Some(RawBsonRef::Int64(id)) => id,
        other => panic!("cursor id missing: {other:?}"),
    }
}

pub fn batch(reply: &RawDocumentBuf) -> Vec<RawDocumentBuf> {
    let Some(RawBsonRef::Document(cursor)) = reply.get("cursor").unwrap() else {
        panic!("reply has no cursor document: {reply:?}");
    };
    let arr = cursor
        .get("firstBatch")
        .unwrap()
        .or_else(|| cursor.get("nextBatch").unwrap());
    let Some(RawBsonRef::Array(arr)) = arr else {
        panic!("reply has no batch: {reply:?}");
    };
    arr.into_iter()
        .map(|v| match v.unwrap() {
            RawBsonRef::Document(d) => d.to_raw_document_buf(),
            other => panic!("batch element is not a document: {other:?}"),
        })
        .collect()
}
