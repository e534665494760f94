use bson::RawBson;
use bson::raw::{RawBsonRef, RawDocument};

use crate::error::PipelineError;

/// Every aggregation stage this engine recognizes.
///
/// Public stages follow the MongoDB surface; `InhibitOptimization` and
/// `LookupUnwind` are internal (the latter is only produced by fusion,
/// never parsed from user input).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    // Internal
    InhibitOptimization,
    LookupUnwind,
    InverseMatch,

    // Public
    AddFields,
    Bucket,
    BucketAuto,
    ChangeStream,
    CollStats,
    Count,
    CurrentOp,
    Densify,
    Documents,
    Facet,
    Fill,
    GeoNear,
    GraphLookup,
    Group,
    IndexStats,
    Limit,
    ListLocalSessions,
    ListSessions,
    Lookup,
    Match,
    Merge,
    Out,
    Project,
    Redact,
    ReplaceRoot,
    ReplaceWith,
    Sample,
    Search,
    SearchMeta,
    Set,
    SetWindowFields,
    Skip,
    Sort,
    SortByCount,
    UnionWith,
    Unset,
    Unwind,
    VectorSearch,
}

impl Stage {
    pub fn by_name(name: &str) -> Option<Stage> {
        Some(match name {
            "$_internalInhibitOptimization" => Stage::InhibitOptimization,
            "$inverseMatch" => Stage::InverseMatch,
            "$addFields" => Stage::AddFields,
            "$bucket" => Stage::Bucket,
            "$bucketAuto" => Stage::BucketAuto,
            "$changeStream" => Stage::ChangeStream,
            "$collStats" => Stage::CollStats,
            "$count" => Stage::Count,
            "$currentOp" => Stage::CurrentOp,
            "$densify" => Stage::Densify,
            "$documents" => Stage::Documents,
            "$facet" => Stage::Facet,
            "$fill" => Stage::Fill,
            "$geoNear" => Stage::GeoNear,
            "$graphLookup" => Stage::GraphLookup,
            "$group" => Stage::Group,
            "$indexStats" => Stage::IndexStats,
            "$limit" => Stage::Limit,
            "$listLocalSessions" => Stage::ListLocalSessions,
            "$listSessions" => Stage::ListSessions,
            "$lookup" => Stage::Lookup,
            "$match" => Stage::Match,
            "$merge" => Stage::Merge,
            "$out" => Stage::Out,
            "$project" => Stage::Project,
            "$redact" => Stage::Redact,
            "$replaceRoot" => Stage::ReplaceRoot,
            "$replaceWith" => Stage::ReplaceWith,
            "$sample" => Stage::Sample,
            "$search" => Stage::Search,
            "$searchMeta" => Stage::SearchMeta,
            "$set" => Stage::Set,
            "$setWindowFields" => Stage::SetWindowFields,
            "$skip" => Stage::Skip,
            "$sort" => Stage::Sort,
            "$sortByCount" => Stage::SortByCount,
            "$unionWith" => Stage::UnionWith,
            "$unset" => Stage::Unset,
            "$unwind" => Stage::Unwind,
            "$vectorSearch" => Stage::VectorSearch,
            _ => return None,
        })
    }

    pub fn name(self) -> &'static str {
        match self {
            Stage::InhibitOptimization => "$_internalInhibitOptimization",
            Stage::LookupUnwind => "$_internalLookupUnwind",
            Stage::InverseMatch => "$inverseMatch",
            Stage::AddFields => "$addFields",
            Stage::Bucket => "$bucket",
            Stage::BucketAuto => "$bucketAuto",
            Stage::ChangeStream => "$changeStream",
            Stage::CollStats => "$collStats",
            Stage::Count => "$count",
            Stage::CurrentOp => "$currentOp",
            Stage::Densify => "$densify",
            Stage::Documents => "$documents",
            Stage::Facet => "$facet",
            Stage::Fill => "$fill",
            Stage::GeoNear => "$geoNear",
            Stage::GraphLookup => "$graphLookup",
            Stage::Group => "$group",
            Stage::IndexStats => "$indexStats",
            Stage::Limit => "$limit",
            Stage::ListLocalSessions => "$listLocalSessions",
            Stage::ListSessions => "$listSessions",
            Stage::Lookup => "$lookup",
            Stage::Match => "$match",
            Stage::Merge => "$merge",
            Stage::Out => "$out",
            Stage::Project => "$project",
            Stage::Redact => "$redact",
            Stage::ReplaceRoot => "$replaceRoot",
            Stage::ReplaceWith => "$replaceWith",
            Stage::Sample => "$sample",
            Stage::Search => "$search",
            Stage::SearchMeta => "$searchMeta",
            Stage::Set => "$set",
            Stage::SetWindowFields => "$setWindowFields",
            Stage::Skip => "$skip",
            Stage::Sort => "$sort",
            Stage::SortByCount => "$sortByCount",
            Stage::UnionWith => "$unionWith",
            Stage::Unset => "$unset",
            Stage::Unwind => "$unwind",
            Stage::VectorSearch => "$vectorSearch",
        }
    }

    /// Stages whose output feeds another destination; only valid as the
    /// final stage of a top-level pipeline.
    pub fn is_output_stage(self) -> bool {
        matches!(self, Stage::Out | Stage::Merge)
    }

    /// Projection-class transforms subject to the one-free-transform
    /// subquery policy.
    pub fn is_projection_class(self) -> bool {
        matches!(
            self,
            Stage::Project
                | Stage::AddFields
                | Stage::Set
                | Stage::Unset
                | Stage::ReplaceRoot
                | Stage::ReplaceWith
        )
    }

    /// Stages whose result shape forces a materialization barrier before
    /// the next stage.
    pub fn is_group_class(self) -> bool {
        matches!(
            self,
            Stage::Group
                | Stage::Bucket
                | Stage::BucketAuto
                | Stage::Facet
                | Stage::SortByCount
                | Stage::SetWindowFields
        )
    }

    /// Stages that destroy or replace any ordering established upstream.
    pub fn invalidates_sort(self) -> bool {
        matches!(
            self,
            Stage::Group
                | Stage::Bucket
                | Stage::BucketAuto
                | Stage::Facet
                | Stage::SortByCount
                | Stage::Sample
                | Stage::Unwind
                | Stage::Lookup
                | Stage::LookupUnwind
                | Stage::GraphLookup
                | Stage::UnionWith
        )
    }

    /// Whether this stage may appear in a pipeline nested under `parent`.
    pub fn allowed_under(self, parent: ParentStage) -> bool {
        match parent {
            ParentStage::None => true,
            ParentStage::Facet => !matches!(
                self,
                Stage::Out
                    | Stage::Merge
                    | Stage::Facet
                    | Stage::ChangeStream
                    | Stage::CurrentOp
                    | Stage::IndexStats
            ),
            ParentStage::Lookup | ParentStage::UnionWith | ParentStage::InverseMatch => {
                !matches!(
                    self,
                    Stage::Out | Stage::Merge | Stage::ChangeStream | Stage::CurrentOp
                )
            }
        }
    }
}

/// Tag of the stage owning a nested pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ParentStage {
    #[default]
    None,
    Lookup,
    Facet,
    UnionWith,
    InverseMatch,
}

impl ParentStage {
    pub fn name(self) -> &'static str {
        match self {
            ParentStage::None => "(top level)",
            ParentStage::Lookup => "$lookup",
            ParentStage::Facet => "$facet",
            ParentStage::UnionWith => "$unionWith",
            ParentStage::InverseMatch => "$inverseMatch",
        }
    }
}

/// A stage as parsed off the wire: its tag and owned spec value.
/// `fused_unwind` carries the `$unwind` a fusion pass folded into a
/// `$lookup`.
#[derive(Debug, Clone)]
pub struct ParsedStage {
    pub stage: Stage,
    pub spec: RawBson,
    pub fused_unwind: Option<UnwindSpec>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UnwindSpec {
    /// Path without the leading `$`.
    pub path: String,
    pub preserve_null_and_empty: bool,
    pub include_array_index: Option<String>,
}

/// Parse one pipeline element: a document with exactly one `$stage` key.
pub fn parse_stage(doc: &RawDocument) -> Result<ParsedStage, PipelineError> {
    let mut iter = doc.iter();
    let Some(first) = iter.next() else {
        return Err(PipelineError::StageSpecInvalid(
            "pipeline stage must not be empty".into(),
        ));
    };
    let (name, spec) = first?;
    if iter.next().is_some() {
        return Err(PipelineError::StageSpecInvalid(format!(
            "a pipeline stage specification must contain exactly one field, found more after {name}"
        )));
    }
    let stage = Stage::by_name(name).ok_or_else(|| PipelineError::UnknownStage(name.into()))?;
    Ok(ParsedStage {
        stage,
        spec: spec.to_raw_bson(),
        fused_unwind: None,
    })
}

pub fn parse_unwind(spec: RawBsonRef<'_>) -> Result<UnwindSpec, PipelineError> {
    match spec {
        RawBsonRef::String(s) => Ok(UnwindSpec {
            path: strip_path(s)?,
            preserve_null_and_empty: false,
            include_array_index: None,
        }),
        RawBsonRef::Document(doc) => {
            let mut path = None;
            let mut preserve = false;
            let mut index_field = None;
            for entry in doc.iter() {
                let (key, value) = entry?;
                match (key, value) {
                    ("path", RawBsonRef::String(s)) => path = Some(strip_path(s)?),
                    ("preserveNullAndEmptyArrays", RawBsonRef::Boolean(b)) => preserve = b,
                    ("includeArrayIndex", RawBsonRef::String(s)) => {
                        index_field = Some(s.to_string());
                    }
                    (other, _) => {
                        return Err(PipelineError::StageSpecInvalid(format!(
                            "unknown $unwind option '{other}'"
                        )));
                    }
                }
            }
            Ok(UnwindSpec {
                path: path.ok_or_else(|| {
                    PipelineError::StageSpecInvalid("$unwind requires 'path'".into())
                })?,
                preserve_null_and_empty: preserve,
                include_array_index: index_field,
            })
        }
        _ => Err(PipelineError::StageSpecInvalid(
            "$unwind needs a path string or options document".into(),
        )),
    }
}

fn strip_path(s: &str) -> Result<String, PipelineError> {
    s.strip_prefix('$')
        .filter(|rest| !rest.is_empty())
        .map(str::to_string)
        .ok_or_else(|| {
            PipelineError::StageSpecInvalid(format!("path must start with $: '{s}'"))
        })
}

#[cfg(test)]
mod tests {
    use bson::rawdoc;

    use super::*;

    #[test]
    fn stage_names_round_trip() {
        for name in [
            "$match", "$project", "$group", "$lookup", "$facet", "$setWindowFields",
            "$documents", "$listSessions", "$vectorSearch",
        ] {
            let stage = Stage::by_name(name).unwrap();
            assert_eq!(stage.name(), name);
        }
        assert!(Stage::by_name("$frobnicate").is_none());
    }

    #[test]
    fn parse_rejects_multi_key_stage() {
        let err = parse_stage(&rawdoc! { "$match": {}, "$sort": {} }).unwrap_err();
        assert!(matches!(err, PipelineError::StageSpecInvalid(_)));
        let err = parse_stage(&rawdoc! {}).unwrap_err();
        assert!(matches!(err, PipelineError::StageSpecInvalid(_)));
    }

    #[test]
    fn unwind_forms() {
        let simple = parse_unwind(RawBsonRef::String("$items")).unwrap();
        assert_eq!(simple.path, "items");
        assert!(!simple.preserve_null_and_empty);

        let spec = rawdoc! { "path": "$items", "preserveNullAndEmptyArrays": true, "includeArrayIndex": "i" };
        let full = parse_unwind(RawBsonRef::Document(&spec)).unwrap();
        assert!(full.preserve_null_and_empty);
        assert_eq!(full.include_array_index.as_deref(), Some("i"));

        assert!(parse_unwind(RawBsonRef::String("items")).is_err());
    }

    #[test]
    fn nested_context_restrictions() {
        assert!(!Stage::Out.allowed_under(ParentStage::Facet));
        assert!(!Stage::Facet.allowed_under(ParentStage::Facet));
        assert!(Stage::Match.allowed_under(ParentStage::Facet));
        assert!(!Stage::Merge.allowed_under(ParentStage::Lookup));
        assert!(Stage::Lookup.allowed_under(ParentStage::Lookup));
    }
}
