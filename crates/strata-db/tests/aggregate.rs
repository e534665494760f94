mod common;

use bson::raw::RawBsonRef;
use bson::rawdoc;

use common::{batch, insert_all, open_db, session};

#[test]
fn group_totals_by_key() {
    let (db, _dir) = open_db();
    let s = session(&db);
    insert_all(
        &s,
        "sales",
        vec![
            rawdoc! { "_id": 1, "region": "east", "amount": 10 },
            rawdoc! { "_id": 2, "region": "west", "amount": 5 },
            rawdoc! { "_id": 3, "region": "east", "amount": 7 },
        ],
    );

    let reply = s
        .aggregate(
            "test",
            &rawdoc! {
                "aggregate": "sales",
                "pipeline": [
                    { "$group": { "_id": "$region", "total": { "$sum": "$amount" } } },
                    { "$sort": { "_id": 1 } }
                ],
                "cursor": {}
            },
        )
        .unwrap();
    assert_eq!(
        batch(&reply),
        vec![
            rawdoc! { "_id": "east", "total": 17 },
            rawdoc! { "_id": "west", "total": 5 },
        ]
    );
}

#[test]
fn lookup_unwind_fusion_matches_inner_join() {
    let (db, _dir) = open_db();
    let s = session(&db);
    insert_all(
        &s,
        "orders",
        vec![
            rawdoc! { "_id": 1, "x": 10 },
            rawdoc! { "_id": 2, "x": 20 },
            rawdoc! { "_id": 3, "x": 99 },
        ],
    );
    insert_all(
        &s,
        "customers",
        vec![
            rawdoc! { "_id": "a", "y": 10 },
            rawdoc! { "_id": "b", "y": 20 },
            rawdoc! { "_id": "c", "y": 20 },
        ],
    );

    // The fused $lookup+$unwind is an inner join on orders.x = customers.y.
    let reply = s
        .aggregate(
            "test",
            &rawdoc! {
                "aggregate": "orders",
                "pipeline": [
                    { "$lookup": {
                        "from": "customers", "localField": "x",
                        "foreignField": "y", "as": "j"
                    } },
                    { "$unwind": "$j" },
                    { "$sort": { "_id": 1, "j._id": 1 } }
                ],
                "cursor": {}
            },
        )
        .unwrap();
    let rows = batch(&reply);
    assert_eq!(rows.len(), 3); // order 1 joins a; order 2 joins b and c
    assert_eq!(
        rows[0],
        rawdoc! { "_id": 1, "x": 10, "j": { "_id": "a", "y": 10 } }
    );
    assert_eq!(
        rows[2],
        rawdoc! { "_id": 2, "x": 20, "j": { "_id": "c", "y": 20 } }
    );
}

#[test]
fn lookup_preserving_unwind_keeps_unmatched_rows() {
    let (db, _dir) = open_db();
    let s = session(&db);
    insert_all(
        &s,
        "orders",
        vec![rawdoc! { "_id": 1, "x": 10 }, rawdoc! { "_id": 2, "x": 99 }],
    );
    insert_all(&s, "customers", vec![rawdoc! { "_id": "a", "y": 10 }]);

    let reply = s
        .aggregate(
            "test",
            &rawdoc! {
                "aggregate": "orders",
                "pipeline": [
                    { "$lookup": {
                        "from": "customers", "localField": "x",
                        "foreignField": "y", "as": "j"
                    } },
                    { "$unwind": { "path": "$j", "preserveNullAndEmptyArrays": true } },
                    { "$sort": { "_id": 1 } }
                ],
                "cursor": {}
            },
        )
        .unwrap();
    let rows = batch(&reply);
    assert_eq!(rows.len(), 2);
    // The unmatched row survives without the as-field.
    assert_eq!(rows[1], rawdoc! { "_id": 2, "x": 99 });
}

#[test]
fn lookup_of_missing_collection_is_empty_not_an_error() {
    let (db, _dir) = open_db();
    let s = session(&db);
    insert_all(&s, "orders", vec![rawdoc! { "_id": 1, "x": 1 }]);

    let reply = s
        .aggregate(
            "test",
            &rawdoc! {
                "aggregate": "orders",
                "pipeline": [
                    { "$lookup": {
                        "from": "ghosts", "localField": "x",
                        "foreignField": "y", "as": "j"
                    } }
                ],
                "cursor": {}
            },
        )
        .unwrap();
    assert_eq!(batch(&reply), vec![rawdoc! { "_id": 1, "x": 1, "j": [] }]);
}

#[test]
fn facet_runs_arms_over_shared_input() {
    let (db, _dir) = open_db();
    let s = session(&db);
    insert_all(
        &s,
        "items",
        (1..=5).map(|i| rawdoc! { "_id": i, "price": i * 10 }).collect(),
    );

    let reply = s
        .aggregate(
            "test",
            &rawdoc! {
                "aggregate": "items",
                "pipeline": [ { "$facet": {
                    "cheap": [ { "$match": { "price": { "$lte": 20 } } }, { "$sort": { "_id": 1 } } ],
                    "count": [ { "$count": "n" } ]
                } } ],
                "cursor": {}
            },
        )
        .unwrap();
    let rows = batch(&reply);
    assert_eq!(rows.len(), 1);
    let row = &rows[0];
    let Some(RawBsonRef::Array(cheap)) = row.get("cheap").unwrap() else {
        panic!("no cheap arm");
    };
    assert_eq!(cheap.into_iter().count(), 2);
    let Some(RawBsonRef::Array(count)) = row.get("count").unwrap() else {
        panic!("no count arm");
    };
    let count_doc = count.into_iter().next().unwrap().unwrap();
    let RawBsonRef::Document(count_doc) = count_doc else { panic!() };
    assert_eq!(count_doc.get("n").unwrap(), Some(RawBsonRef::Int64(5)));
}

#[test]
fn unwind_add_fields_replace_root() {
    let (db, _dir) = open_db();
    let s = session(&db);
    insert_all(
        &s,
        "carts",
        vec![rawdoc! {
            "_id": 1,
            "items": [ { "sku": "A", "qty": 2 }, { "sku": "B", "qty": 1 } ]
        }],
    );

    let reply = s
        .aggregate(
            "test",
            &rawdoc! {
                "aggregate": "carts",
                "pipeline": [
                    { "$unwind": "$items" },
                    { "$addFields": { "items.line": { "$multiply": ["$items.qty", 100] } } },
                    { "$replaceRoot": { "newRoot": "$items" } },
                    { "$sort": { "sku": 1 } }
                ],
                "cursor": {}
            },
        )
        .unwrap();
    assert_eq!(
        batch(&reply),
        vec![
            rawdoc! { "sku": "A", "qty": 2, "line": 200 },
            rawdoc! { "sku": "B", "qty": 1, "line": 100 },
        ]
    );
}

#[test]
fn graph_lookup_walks_reporting_chain() {
    let (db, _dir) = open_db();
    let s = session(&db);
    insert_all(
        &s,
        "employees",
        vec![
            rawdoc! { "_id": 1, "name": "ceo", "reportsTo": null },
            rawdoc! { "_id": 2, "name": "vp", "reportsTo": "ceo" },
            rawdoc! { "_id": 3, "name": "eng", "reportsTo": "vp" },
        ],
    );

    let reply = s
        .aggregate(
            "test",
            &rawdoc! {
                "aggregate": "employees",
                "pipeline": [
                    { "$match": { "name": "eng" } },
                    { "$graphLookup": {
                        "from": "employees",
                        "startWith": "$reportsTo",
                        "connectFromField": "reportsTo",
                        "connectToField": "name",
                        "as": "chain",
                        "depthField": "depth"
                    } }
                ],
                "cursor": {}
            },
        )
        .unwrap();
    let rows = batch(&reply);
    let Some(RawBsonRef::Array(chain)) = rows[0].get("chain").unwrap() else {
        panic!("no chain");
    };
    // vp at depth 0, ceo at depth 1.
    assert_eq!(chain.into_iter().count(), 2);
}

#[test]
fn documents_stage_needs_no_collection() {
    let (db, _dir) = open_db();
    let s = session(&db);
    let reply = s
        .aggregate(
            "test",
            &rawdoc! {
                "aggregate": 1,
                "pipeline": [
                    { "$documents": [ { "a": 1 }, { "a": 2 } ] },
                    { "$match": { "a": { "$gt": 1 } } }
                ],
                "cursor": {}
            },
        )
        .unwrap();
    assert_eq!(batch(&reply), vec![rawdoc! { "a": 2 }]);
}

#[test]
fn out_writes_target_collection() {
    let (db, _dir) = open_db();
    let s = session(&db);
    insert_all(
        &s,
        "src",
        vec![rawdoc! { "_id": 1, "v": 1 }, rawdoc! { "_id": 2, "v": 2 }],
    );

    let reply = s
        .aggregate(
            "test",
            &rawdoc! {
                "aggregate": "src",
                "pipeline": [
                    { "$match": { "v": { "$gte": 2 } } },
                    { "$out": "dst" }
                ],
                "cursor": {}
            },
        )
        .unwrap();
    assert!(batch(&reply).is_empty());
    assert_eq!(s.count("test", "dst", None).unwrap(), 1);
}

#[test]
fn set_window_fields_running_total() {
    let (db, _dir) = open_db();
    let s = session(&db);
    insert_all(
        &s,
        "days",
        vec![
            rawdoc! { "_id": 1, "k": "a", "v": 1 },
            rawdoc! { "_id": 2, "k": "a", "v": 2 },
            rawdoc! { "_id": 3, "k": "b", "v": 5 },
        ],
    );

    let reply = s
        .aggregate(
            "test",
            &rawdoc! {
                "aggregate": "days",
                "pipeline": [
                    { "$setWindowFields": {
                        "partitionBy": "$k",
                        "sortBy": { "_id": 1 },
                        "output": { "running": {
                            "$sum": "$v",
                            "window": { "documents": ["unbounded", "current"] }
                        } }
                    } },
                    { "$sort": { "_id": 1 } }
                ],
                "cursor": {}
            },
        )
        .unwrap();
    let rows = batch(&reply);
    let running: Vec<i32> = rows
        .iter()
        .map(|d| match d.get("running").unwrap().unwrap() {
            RawBsonRef::Int32(n) => n,
            other => panic!("unexpected running value {other:?}"),
        })
        .collect();
    assert_eq!(running, vec![1, 3, 5]);
}

#[test]
fn unsupported_stage_is_a_command_error() {
    let (db, _dir) = open_db();
    let s = session(&db);
    insert_all(&s, "c", vec![rawdoc! { "_id": 1 }]);
    let err = s
        .aggregate(
            "test",
            &rawdoc! { "aggregate": "c", "pipeline": [ { "$changeStream": {} } ], "cursor": {} },
        )
        .unwrap_err();
    assert_eq!(err.code, strata_db::ErrorCode::CommandNotSupported);
}
