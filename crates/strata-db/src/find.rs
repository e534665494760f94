use bson::RawBson;
use bson::raw::{RawArrayBuf, RawBsonRef, RawDocument, RawDocumentBuf};

use strata_bson::Collation;

use crate::error::{DbError, ErrorCode, Result};

/// A parsed `find` command.
#[derive(Debug, Clone, Default)]
pub struct FindCommand {
    pub collection: String,
    pub filter: Option<RawDocumentBuf>,
    pub projection: Option<RawDocumentBuf>,
    pub sort: Option<RawDocumentBuf>,
    pub limit: Option<u64>,
    pub skip: Option<u64>,
    pub batch_size: Option<u32>,
    pub single_batch: bool,
    pub tailable: bool,
    pub collation: Option<Collation>,
    pub let_vars: Option<RawDocumentBuf>,
    pub max_time_ms: Option<u64>,
}

pub fn parse_find(cmd: &RawDocument) -> Result<FindCommand> {
    let mut out = FindCommand::default();
    for entry in cmd.iter() {
        let (key, value) = entry?;
        match (key, value) {
            ("find", RawBsonRef::String(coll)) => out.collection = coll.to_string(),
            ("filter", RawBsonRef::Document(d)) => out.filter = Some(d.to_raw_document_buf()),
            ("projection", RawBsonRef::Document(d)) => {
                out.projection = Some(d.to_raw_document_buf());
            }
            ("sort", RawBsonRef::Document(d)) => out.sort = Some(d.to_raw_document_buf()),
            ("limit", v) => out.limit = parse_non_negative(key, v)?,
            ("skip", v) => out.skip = parse_non_negative(key, v)?,
            ("batchSize", v) => {
                out.batch_size = parse_non_negative(key, v)?.map(|n| n as u32);
            }
            ("singleBatch", RawBsonRef::Boolean(b)) => out.single_batch = b,
            ("tailable", RawBsonRef::Boolean(b)) => out.tailable = b,
            ("collation", RawBsonRef::Document(d)) => {
                out.collation =
                    Some(Collation::parse(d).map_err(|e| DbError::bad_value(e.to_string()))?);
            }
            ("let", RawBsonRef::Document(d)) => out.let_vars = Some(d.to_raw_document_buf()),
            ("maxTimeMS", v) => out.max_time_ms = parse_non_negative(key, v)?,
            // Accepted for compatibility; the core has nothing to do for
            // them.
            ("hint", _)
            | ("readConcern", _)
            | ("awaitData", _)
            | ("noCursorTimeout", _)
            | ("allowDiskUse", _)
            | ("comment", _)
            | ("$db", _)
            | ("lsid", _)
            | ("$clusterTime", _) => {}
            (other, _) => {
                return Err(DbError::bad_value(format!(
                    "unknown find option '{other}'"
                )));
            }
        }
    }
    if out.collection.is_empty() {
        return Err(DbError::new(
            ErrorCode::BadValue,
            "'find' requires a collection name",
        ));
    }
    if out.limit.is_some_and(|l| l == 0) {
        out.limit = None;
    }
    Ok(out)
}

/// Lower a find command to the equivalent aggregation pipeline; find and
/// aggregate share one compilation and cursor path.
pub fn find_to_pipeline(cmd: &FindCommand) -> RawBson {
    let mut stages = RawArrayBuf::new();
    if let Some(filter) = &cmd.filter {
        let mut stage = RawDocumentBuf::new();
        stage.append("$match", filter.clone());
        stages.push(stage);
    }
    if let Some(sort) = &cmd.sort {
        let mut stage = RawDocumentBuf::new();
        stage.append("$sort", sort.clone());
        stages.push(stage);
    }
    if let Some(skip) = cmd.skip {
        let mut stage = RawDocumentBuf::new();
        stage.append("$skip", skip as i64);
        stages.push(stage);
    }
    if let Some(limit) = cmd.limit {
        let mut stage = RawDocumentBuf::new();
        stage.append("$limit", limit as i64);
        stages.push(stage);
    }
    if let Some(projection) = &cmd.projection {
        let mut stage = RawDocumentBuf::new();
        stage.append("$project", projection.clone());
        stages.push(stage);
    }
    RawBson::Array(stages)
}

fn parse_non_negative(key: &str, value: RawBsonRef<'_>) -> Result<Option<u64>> {
    let n = match value {
        RawBsonRef::Int32(n) => i64::from(n),
        RawBsonRef::Int64(n) => n,
        RawBsonRef::Double(d) if d.fract() == 0.0 => d as i64,
        RawBsonRef::Null => return Ok(None),
        _ => {
            return Err(DbError::bad_value(format!(
                "'{key}' must be a non-negative integer"
            )));
        }
    };
    if n < 0 {
        return Err(DbError::bad_value(format!(
            "'{key}' must be a non-negative integer"
        )));
    }
    Ok(Some(n as u64))
}

#[cfg(test)]
mod tests {
    use bson::rawdoc;

    use super::*;

    #[test]
    fn parses_the_full_option_set() {
        let cmd = rawdoc! {
            "find": "users",
            "filter": { "age": { "$gte": 21 } },
            "projection": { "name": 1 },
            "sort": { "age": -1 },
            "limit": 10,
            "skip": 5,
            "batchSize": 3,
            "singleBatch": true,
            "collation": { "locale": "en" },
            "let": { "minAge": 21 },
            "maxTimeMS": 500
        };
        let parsed = parse_find(&cmd).unwrap();
        assert_eq!(parsed.collection, "users");
        assert_eq!(parsed.limit, Some(10));
        assert_eq!(parsed.batch_size, Some(3));
        assert!(parsed.single_batch);
        assert!(parsed.collation.is_some());
        assert_eq!(parsed.max_time_ms, Some(500));
    }

    #[test]
    fn pipeline_lowering_orders_stages() {
        let cmd = parse_find(&rawdoc! {
            "find": "users",
            "filter": { "a": 1 },
            "sort": { "a": 1 },
            "skip": 2,
            "limit": 3,
            "projection": { "a": 1 }
        })
        .unwrap();
        let RawBson::Array(stages) = find_to_pipeline(&cmd) else {
            panic!()
        };
        let names: Vec<String> = stages
            .into_iter()
            .map(|s| match s.unwrap() {
                RawBsonRef::Document(d) => d.iter().next().unwrap().unwrap().0.to_string(),
                _ => panic!(),
            })
            .collect();
        assert_eq!(names, vec!["$match", "$sort", "$skip", "$limit", "$project"]);
    }

    #[test]
    fn zero_limit_means_no_limit() {
        let parsed = parse_find(&rawdoc! { "find": "c", "limit": 0 }).unwrap();
        assert_eq!(parsed.limit, None);
    }

    #[test]
    fn unknown_option_rejected() {
        assert!(parse_find(&rawdoc! { "find": "c", "frobnicate": 1 }).is_err());
        assert!(parse_find(&rawdoc! { "filter": {} }).is_err());
    }
}
