mod common;

use bson::raw::RawBsonRef;
use bson::rawdoc;

use common::{batch, cursor_id, insert_all, open_db, session};

fn ids_of(docs: &[bson::raw::RawDocumentBuf]) -> Vec<i32> {
    docs.iter()
        .map(|d| match d.get("_id").unwrap().unwrap() {
            RawBsonRef::Int32(n) => n,
            other => panic!("unexpected _id {other:?}"),
        })
        .collect()
}

#[test]
fn continuation_round_trip_returns_every_row_once() {
    let (db, _dir) = open_db();
    let s = session(&db);
    insert_all(
        &s,
        "rows",
        (0..500).map(|i| rawdoc! { "_id": i, "v": i }).collect(),
    );

    let first = s.find("test", &rawdoc! { "find": "rows" }).unwrap();
    let mut seen = ids_of(&batch(&first));
    assert_eq!(seen.len(), 101); // default first page
    let mut id = cursor_id(&first);
    assert_ne!(id, 0);

    let mut pages = 0;
    while id != 0 {
        let next = s.get_more(id, None).unwrap();
        seen.extend(ids_of(&batch(&next)));
        id = cursor_id(&next);
        pages += 1;
        assert!(pages < 20, "cursor failed to make progress");
    }

    // Concatenation of all pages is the result set once, in order.
    assert_eq!(seen.len(), 500);
    let expected: Vec<i32> = (0..500).collect();
    assert_eq!(seen, expected);
    assert_eq!(db.open_cursor_count(), 0);
}

#[test]
fn explicit_batch_size_is_respected() {
    let (db, _dir) = open_db();
    let s = session(&db);
    insert_all(&s, "rows", (0..10).map(|i| rawdoc! { "_id": i }).collect());

    let first = s
        .find("test", &rawdoc! { "find": "rows", "batchSize": 4 })
        .unwrap();
    assert_eq!(batch(&first).len(), 4);
    let id = cursor_id(&first);

    let next = s.get_more(id, Some(2)).unwrap();
    assert_eq!(batch(&next).len(), 2);
}

#[test]
fn single_batch_returns_everything_and_no_cursor() {
    let (db, _dir) = open_db();
    let s = session(&db);
    insert_all(&s, "rows", (0..250).map(|i| rawdoc! { "_id": i }).collect());

    let reply = s
        .find(
            "test",
            &rawdoc! { "find": "rows", "singleBatch": true, "batchSize": 10 },
        )
        .unwrap();
    assert_eq!(cursor_id(&reply), 0);
    assert_eq!(batch(&reply).len(), 250);
}

#[test]
fn blocking_pipeline_uses_a_persistent_cursor_with_spill() {
    let (db, _dir) = open_db();
    let s = session(&db);
    // Enough rows past the first page to exceed the spill threshold
    // (default 512).
    insert_all(
        &s,
        "rows",
        (0..800).map(|i| rawdoc! { "_id": i, "v": 800 - i }).collect(),
    );

    let first = s
        .find(
            "test",
            &rawdoc! { "find": "rows", "sort": { "v": 1 }, "batchSize": 50 },
        )
        .unwrap();
    let id = cursor_id(&first);
    assert_ne!(id, 0);
    // File-backed cursors carry the top bit.
    assert!(strata_cursor::CursorIdAllocator::is_file_backed(id));
    assert!(db.cursors_spill_active() > 0);

    let mut total = batch(&first).len();
    let mut cursor = id;
    while cursor != 0 {
        let next = s.get_more(cursor, Some(100)).unwrap();
        total += batch(&next).len();
        cursor = cursor_id(&next);
    }
    assert_eq!(total, 800);
    // Spill file cleaned up on normal close.
    assert_eq!(db.cursors_spill_active(), 0);
}

#[test]
fn kill_cursors_acknowledges_and_drops_state() {
    let (db, _dir) = open_db();
    let s = session(&db);
    insert_all(&s, "rows", (0..300).map(|i| rawdoc! { "_id": i }).collect());

    let first = s.find("test", &rawdoc! { "find": "rows" }).unwrap();
    let id = cursor_id(&first);
    assert_eq!(db.open_cursor_count(), 1);

    let reply = s.kill_cursors(&[id, 424242]).unwrap();
    let Some(RawBsonRef::Array(killed)) = reply.get("cursorsKilled").unwrap() else {
        panic!()
    };
    assert_eq!(killed.into_iter().count(), 1);
    assert_eq!(db.open_cursor_count(), 0);

    let err = s.get_more(id, None).unwrap_err();
    assert_eq!(err.code, strata_db::ErrorCode::CursorNotFound);
}

#[test]
fn get_more_on_foreign_session_is_not_found() {
    let (db, _dir) = open_db();
    let s1 = db.session(1);
    let s2 = db.session(2);
    insert_all(&s1, "rows", (0..300).map(|i| rawdoc! { "_id": i }).collect());

    let first = s1.find("test", &rawdoc! { "find": "rows" }).unwrap();
    let id = cursor_id(&first);
    let err = s2.get_more(id, None).unwrap_err();
    assert_eq!(err.code, strata_db::ErrorCode::CursorNotFound);
    // The owner still works.
    assert!(s1.get_more(id, None).is_ok());
}

#[test]
fn tailable_cursor_follows_appends() {
    let (db, _dir) = open_db();
    let s = session(&db);
    insert_all(&s, "log", (0..3).map(|i| rawdoc! { "_id": i }).collect());

    let first = s
        .find("test", &rawdoc! { "find": "log", "tailable": true })
        .unwrap();
    let id = cursor_id(&first);
    assert_ne!(id, 0);
    assert_eq!(batch(&first).len(), 3);

    // Nothing new yet: empty page, cursor stays open.
    let empty = s.get_more(id, None).unwrap();
    assert!(batch(&empty).is_empty());
    assert_eq!(cursor_id(&empty), id);

    insert_all(&s, "log", vec![rawdoc! { "_id": 3 }, rawdoc! { "_id": 4 }]);
    let next = s.get_more(id, None).unwrap();
    assert_eq!(ids_of(&batch(&next)), vec![3, 4]);
    assert_eq!(cursor_id(&next), id);
}

#[test]
fn max_time_ms_zero_cancels() {
    let (db, _dir) = open_db();
    let s = session(&db);
    insert_all(&s, "rows", (0..2000).map(|i| rawdoc! { "_id": i }).collect());

    // A zero-millisecond time limit expires before the scan finishes.
    let err = s
        .find("test", &rawdoc! { "find": "rows", "maxTimeMS": 0 })
        .unwrap_err();
    assert_eq!(err.code, strata_db::ErrorCode::Cancelled);
    assert!(err.code.is_retryable());
}
