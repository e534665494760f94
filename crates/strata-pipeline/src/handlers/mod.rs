mod combine;
mod core;
mod group;
mod lookup;
mod meta;
mod output;
mod window;

use crate::context::BuildContext;
use crate::error::PipelineError;
use crate::stage::{ParsedStage, Stage};
use crate::tree::QueryTree;

/// Dispatch one stage to its handler: `(spec, query-in, context) →
/// query-out`.
pub fn handle_stage(
    parsed: &ParsedStage,
    input: QueryTree,
    ctx: &mut BuildContext,
) -> Result<QueryTree, PipelineError> {
    let spec = parsed.spec.as_raw_bson_ref();
    match parsed.stage {
        Stage::Match => core::match_stage(spec, input, ctx),
        Stage::Sort => core::sort(spec, input, ctx),
        Stage::Limit => core::limit(spec, input),
        Stage::Skip => core::skip(spec, input),
        Stage::Sample => core::sample(spec, input),
        Stage::Project => core::project(spec, input),
        Stage::AddFields | Stage::Set => core::add_fields(spec, input),
        Stage::Unset => core::unset(spec, input),
        Stage::ReplaceRoot => core::replace_root(spec, input),
        Stage::ReplaceWith => core::replace_with(spec, input),
        Stage::Redact => core::redact(spec, input),
        Stage::Count => core::count(spec, input),
        Stage::Documents => core::documents(spec, ctx),
        Stage::Unwind => core::unwind(spec, input),

        Stage::Group => group::group(spec, input),
        Stage::Bucket => group::bucket(spec, input),
        Stage::BucketAuto => group::bucket_auto(spec, input),
        Stage::SortByCount => group::sort_by_count(spec, input),

        Stage::Lookup => lookup::lookup(parsed, input, ctx),
        Stage::LookupUnwind => lookup::lookup(parsed, input, ctx),
        Stage::GraphLookup => lookup::graph_lookup(spec, input, ctx),

        Stage::Facet => combine::facet(spec, input, ctx),
        Stage::UnionWith => combine::union_with(spec, input, ctx),

        Stage::SetWindowFields => window::set_window_fields(spec, input, ctx),

        Stage::Out => output::out(spec, input, ctx),
        Stage::Merge => output::merge(spec, input, ctx),

        Stage::CollStats => meta::coll_stats(input, ctx),
        Stage::IndexStats => meta::index_stats(input, ctx),

        Stage::InhibitOptimization => Ok(QueryTree::OptimizationFence {
            input: input.boxed(),
        }),

        // Delegated to external collaborators this deployment does not
        // ship (spatial engine, text search, change streams, session
        // registry, densification).
        Stage::GeoNear
        | Stage::Search
        | Stage::SearchMeta
        | Stage::VectorSearch
        | Stage::ChangeStream
        | Stage::CurrentOp
        | Stage::ListSessions
        | Stage::ListLocalSessions
        | Stage::Densify
        | Stage::Fill
        | Stage::InverseMatch => Err(PipelineError::StageNotSupported(
            parsed.stage.name().to_string(),
        )),
    }
}
