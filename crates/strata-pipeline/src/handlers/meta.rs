use crate::context::BuildContext;
use crate::error::PipelineError;
use crate::tree::{QueryTree, StatsKind};

pub(super) fn coll_stats(
    input: QueryTree,
    ctx: &mut BuildContext,
) -> Result<QueryTree, PipelineError> {
    stats(input, ctx, StatsKind::Collection)
}

pub(super) fn index_stats(
    input: QueryTree,
    ctx: &mut BuildContext,
) -> Result<QueryTree, PipelineError> {
    stats(input, ctx, StatsKind::Indexes)
}

fn stats(
    input: QueryTree,
    ctx: &mut BuildContext,
    kind: StatsKind,
) -> Result<QueryTree, PipelineError> {
    // Stats stages must open the pipeline: the input is the bare scan the
    // driver seeds, which they replace.
    if !matches!(input, QueryTree::Scan { .. }) || ctx.stage_number != 1 {
        return Err(PipelineError::StageSpecInvalid(
            "stats stages must be the first stage".into(),
        ));
    }
    let collection = ctx.collection.clone().ok_or_else(|| {
        PipelineError::StageSpecInvalid("stats stages require a collection".into())
    })?;
    ctx.is_single_row_result = kind == StatsKind::Collection;
    Ok(QueryTree::MetaStats { kind, collection })
}
