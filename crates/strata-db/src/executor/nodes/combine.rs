use bson::RawBson;

use strata_bson::{ArrayWriter, DocumentWriter};
use strata_pipeline::QueryTree;

use crate::error::Result;
use crate::executor::{Executor, SourcedDoc};

/// `$facet`: evaluate every arm and collect each arm's rows as an array
/// field of a single output row. Each compiled arm embeds the shared
/// input subquery, so arms are self-contained trees.
///
/// Sub-pipeline errors inside arms propagate at collection time, which is
/// here.
pub(crate) fn facet(
    exec: &Executor<'_>,
    arms: &[(String, QueryTree)],
    _input: &QueryTree,
) -> Result<Vec<SourcedDoc>> {
    let mut w = DocumentWriter::new();
    for (name, arm) in arms {
        exec.check_interrupt()?;
        let rows = exec.execute(arm, None)?;
        let mut arr = ArrayWriter::new();
        for row in rows {
            arr.push(RawBson::Document(row.doc));
        }
        w.append_array(name, arr);
    }
    Ok(vec![SourcedDoc::new(w.into_buf())])
}
