use bson::raw::RawBsonRef;

use crate::context::BuildContext;
use crate::error::PipelineError;
use crate::tree::{CollectionRef, MergeMatched, MergeNotMatched, OutputMode, QueryTree};

pub(super) fn out(
    spec: RawBsonRef<'_>,
    input: QueryTree,
    ctx: &mut BuildContext,
) -> Result<QueryTree, PipelineError> {
    let target = match spec {
        RawBsonRef::String(coll) => CollectionRef::new(ctx.database.clone(), coll),
        RawBsonRef::Document(doc) => parse_target(doc, &ctx.database, "$out")?,
        _ => {
            return Err(PipelineError::StageSpecInvalid(
                "$out needs a collection name or {db, coll}".into(),
            ));
        }
    };
    Ok(QueryTree::Output {
        target,
        mode: OutputMode::Replace,
        input: input.boxed(),
    })
}

pub(super) fn merge(
    spec: RawBsonRef<'_>,
    input: QueryTree,
    ctx: &mut BuildContext,
) -> Result<QueryTree, PipelineError> {
    let mut target = None;
    let mut on = vec!["_id".to_string()];
    let mut when_matched = MergeMatched::Merge;
    let mut when_not_matched = MergeNotMatched::Insert;

    match spec {
        RawBsonRef::String(coll) => {
            target = Some(CollectionRef::new(ctx.database.clone(), coll));
        }
        RawBsonRef::Document(doc) => {
            for entry in doc.iter() {
                let (field, value) = entry?;
                match (field, value) {
                    ("into", RawBsonRef::String(coll)) => {
                        target = Some(CollectionRef::new(ctx.database.clone(), coll));
                    }
                    ("into", RawBsonRef::Document(into)) => {
                        target = Some(parse_target(into, &ctx.database, "$merge")?);
                    }
                    ("on", RawBsonRef::String(path)) => on = vec![path.to_string()],
                    ("on", RawBsonRef::Array(paths)) => {
                        on.clear();
                        for p in paths {
                            match p? {
                                RawBsonRef::String(path) => on.push(path.to_string()),
                                _ => {
                                    return Err(PipelineError::StageSpecInvalid(
                                        "$merge 'on' entries must be strings".into(),
                                    ));
                                }
                            }
                        }
                    }
                    ("whenMatched", RawBsonRef::String(mode)) => {
                        when_matched = match mode {
                            "replace" => MergeMatched::Replace,
                            "keepExisting" => MergeMatched::KeepExisting,
                            "merge" => MergeMatched::Merge,
                            "fail" => MergeMatched::Fail,
                            other => {
                                return Err(PipelineError::StageSpecInvalid(format!(
                                    "unknown whenMatched mode '{other}'"
                                )));
                            }
                        };
                    }
                    ("whenNotMatched", RawBsonRef::String(mode)) => {
                        when_not_matched = match mode {
                            "insert" => MergeNotMatched::Insert,
                            "discard" => MergeNotMatched::Discard,
                            "fail" => MergeNotMatched::Fail,
                            other => {
                                return Err(PipelineError::StageSpecInvalid(format!(
                                    "unknown whenNotMatched mode '{other}'"
                                )));
                            }
                        };
                    }
                    (other, _) => {
                        return Err(PipelineError::StageSpecInvalid(format!(
                            "unknown or badly typed $merge field '{other}'"
                        )));
                    }
                }
            }
        }
        _ => {
            return Err(PipelineError::StageSpecInvalid(
                "$merge needs a collection name or options document".into(),
            ));
        }
    }

    let target = target.ok_or_else(|| {
        PipelineError::StageSpecInvalid("$merge requires 'into'".into())
    })?;
    if on.is_empty() {
        return Err(PipelineError::StageSpecInvalid(
            "$merge 'on' must not be empty".into(),
        ));
    }
    Ok(QueryTree::Output {
        target,
        mode: OutputMode::Merge {
            on,
            when_matched,
            when_not_matched,
        },
        input: input.boxed(),
    })
}

fn parse_target(
    doc: &bson::RawDocument,
    default_db: &str,
    stage: &str,
) -> Result<CollectionRef, PipelineError> {
    let mut db = default_db.to_string();
    let mut coll = None;
    for entry in doc.iter() {
        let (field, value) = entry?;
        match (field, value) {
            ("db", RawBsonRef::String(name)) => db = name.to_string(),
            ("coll", RawBsonRef::String(name)) => coll = Some(name.to_string()),
            (other, _) => {
                return Err(PipelineError::StageSpecInvalid(format!(
                    "unknown or badly typed {stage} target field '{other}'"
                )));
            }
        }
    }
    let coll = coll.ok_or_else(|| {
        PipelineError::StageSpecInvalid(format!("{stage} target requires 'coll'"))
    })?;
    Ok(CollectionRef::new(db, coll))
}
