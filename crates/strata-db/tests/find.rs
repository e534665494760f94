mod common;

use bson::rawdoc;

use common::{assert_ok, batch, cursor_id, insert_all, open_db, session};

#[test]
fn inclusion_projection_keeps_named_paths() {
    let (db, _dir) = open_db();
    let s = session(&db);
    insert_all(&s, "docs", vec![rawdoc! { "_id": 1, "a": { "b": 2, "c": 3 }, "d": 4 }]);

    let reply = s
        .find("test", &rawdoc! { "find": "docs", "projection": { "a.b": 1 } })
        .unwrap();
    assert_ok(&reply);
    assert_eq!(batch(&reply), vec![rawdoc! { "_id": 1, "a": { "b": 2 } }]);
}

#[test]
fn positional_projection_picks_matched_element() {
    let (db, _dir) = open_db();
    let s = session(&db);
    insert_all(
        &s,
        "students",
        vec![rawdoc! {
            "_id": 7,
            "grades": [ { "s": "math", "g": 85 }, { "s": "eng", "g": 90 } ]
        }],
    );

    let reply = s
        .find(
            "test",
            &rawdoc! {
                "find": "students",
                "filter": { "grades.g": { "$gte": 90 } },
                "projection": { "grades.$": 1 }
            },
        )
        .unwrap();
    assert_eq!(
        batch(&reply),
        vec![rawdoc! { "_id": 7, "grades": [ { "s": "eng", "g": 90 } ] }]
    );
}

#[test]
fn exclusion_projection_removes_named_paths() {
    let (db, _dir) = open_db();
    let s = session(&db);
    insert_all(&s, "docs", vec![rawdoc! { "_id": 1, "keep": 1, "drop": 2 }]);

    let reply = s
        .find("test", &rawdoc! { "find": "docs", "projection": { "drop": 0 } })
        .unwrap();
    assert_eq!(batch(&reply), vec![rawdoc! { "_id": 1, "keep": 1 }]);
}

#[test]
fn filter_sort_skip_limit() {
    let (db, _dir) = open_db();
    let s = session(&db);
    insert_all(
        &s,
        "nums",
        (0..10).map(|i| rawdoc! { "_id": i, "n": 9 - i }).collect(),
    );

    let reply = s
        .find(
            "test",
            &rawdoc! {
                "find": "nums",
                "filter": { "n": { "$gte": 3 } },
                "sort": { "n": 1 },
                "skip": 1,
                "limit": 3
            },
        )
        .unwrap();
    let rows = batch(&reply);
    let ns: Vec<i32> = rows
        .iter()
        .map(|d| match d.get("n").unwrap().unwrap() {
            bson::raw::RawBsonRef::Int32(n) => n,
            _ => panic!(),
        })
        .collect();
    assert_eq!(ns, vec![4, 5, 6]);
}

#[test]
fn point_read_returns_no_cursor() {
    let (db, _dir) = open_db();
    let s = session(&db);
    insert_all(
        &s,
        "docs",
        (0..300).map(|i| rawdoc! { "_id": i, "v": i }).collect(),
    );

    // An _id equality on an _id-sharded collection takes the point-read
    // path: whole answer in one response, no server-side cursor.
    let reply = s
        .find(
            "test",
            &rawdoc! { "find": "docs", "filter": { "_id": 42 }, "batchSize": 1 },
        )
        .unwrap();
    assert_eq!(cursor_id(&reply), 0);
    assert_eq!(batch(&reply), vec![rawdoc! { "_id": 42, "v": 42 }]);
}

#[test]
fn missing_collection_reads_empty() {
    let (db, _dir) = open_db();
    let s = session(&db);
    let reply = s.find("test", &rawdoc! { "find": "nope" }).unwrap();
    assert_eq!(cursor_id(&reply), 0);
    assert!(batch(&reply).is_empty());
}

#[test]
fn indexed_range_with_sort_stays_ordered() {
    let (db, _dir) = open_db();
    let s = session(&db);
    insert_all(
        &s,
        "events",
        vec![
            rawdoc! { "_id": 1, "t": "2024-01-15" },
            rawdoc! { "_id": 2, "t": "2023-12-31" },
            rawdoc! { "_id": 3, "t": "2024-01-01" },
            rawdoc! { "_id": 4, "t": "2024-02-01" },
            rawdoc! { "_id": 5, "t": "2024-01-20" },
        ],
    );
    let reply = s
        .create_indexes("test", "events", &[rawdoc! { "key": { "t": 1 }, "name": "t_1" }])
        .unwrap();
    assert_ok(&reply);

    let reply = s
        .find(
            "test",
            &rawdoc! {
                "find": "events",
                "filter": { "t": { "$gte": "2024-01-01", "$lt": "2024-02-01" } },
                "sort": { "t": 1 }
            },
        )
        .unwrap();
    let ts: Vec<String> = batch(&reply)
        .iter()
        .map(|d| match d.get("t").unwrap().unwrap() {
            bson::raw::RawBsonRef::String(t) => t.to_string(),
            _ => panic!(),
        })
        .collect();
    assert_eq!(ts, vec!["2024-01-01", "2024-01-15", "2024-01-20"]);
}

#[test]
fn count_and_distinct() {
    let (db, _dir) = open_db();
    let s = session(&db);
    insert_all(
        &s,
        "fruit",
        vec![
            rawdoc! { "_id": 1, "kind": "apple" },
            rawdoc! { "_id": 2, "kind": "pear" },
            rawdoc! { "_id": 3, "kind": "apple" },
        ],
    );

    assert_eq!(s.count("test", "fruit", None).unwrap(), 3);
    assert_eq!(
        s.count("test", "fruit", Some(&rawdoc! { "kind": "apple" }))
            .unwrap(),
        2
    );
    assert_eq!(s.count("test", "missing", None).unwrap(), 0);

    let reply = s.distinct("test", "fruit", "kind", None).unwrap();
    let Some(bson::raw::RawBsonRef::Array(values)) = reply.get("values").unwrap() else {
        panic!("no values array");
    };
    assert_eq!(values.into_iter().count(), 2);
}

#[test]
fn list_collections_and_indexes() {
    let (db, _dir) = open_db();
    let s = session(&db);
    insert_all(&s, "a", vec![rawdoc! { "_id": 1 }]);
    insert_all(&s, "b", vec![rawdoc! { "_id": 1 }]);
    s.create_indexes("test", "a", &[rawdoc! { "key": { "x": 1 }, "name": "x_1" }])
        .unwrap();

    let colls = s.list_collections("test").unwrap();
    let names: Vec<String> = batch(&colls)
        .iter()
        .map(|d| match d.get("name").unwrap().unwrap() {
            bson::raw::RawBsonRef::String(n) => n.to_string(),
            _ => panic!(),
        })
        .collect();
    assert_eq!(names, vec!["a", "b"]);

    let indexes = s.list_indexes("test", "a").unwrap();
    assert_eq!(batch(&indexes).len(), 1);
}
