use bson::RawBson;

use strata_bson::{hash_value, values_equal};
use strata_path::{CompiledExpression, eval};
use strata_pipeline::{Accumulator, WindowBounds, WindowOutput};
use strata_query::{SortKey, compare_docs};

use crate::error::Result;
use crate::executor::doc_utils;
use crate::executor::nodes::group::AccumulatorState;
use crate::executor::{Executor, SourcedDoc};

/// `$setWindowFields`: partition, order within each partition, then
/// compute every output field per row over its window frame.
pub(crate) fn window_fields(
    exec: &Executor<'_>,
    partition_by: Option<&CompiledExpression>,
    sort: &[SortKey],
    outputs: &[WindowOutput],
    rows: Vec<SourcedDoc>,
) -> Result<Vec<SourcedDoc>> {
    let scope = exec.scope();

    // Partition while keeping first-seen partition order.
    let mut partitions: Vec<(RawBson, i64, Vec<SourcedDoc>)> = Vec::new();
    for row in rows {
        let key = match partition_by {
            Some(expr) => eval(expr, &row.doc, &scope, &exec.snapshot)?.unwrap_or(RawBson::Null),
            None => RawBson::Null,
        };
        let key_hash = hash_value(key.as_raw_bson_ref());
        let slot = partitions.iter().position(|(k, h, _)| {
            *h == key_hash && values_equal(k.as_raw_bson_ref(), key.as_raw_bson_ref(), None)
        });
        match slot {
            Some(at) => partitions[at].2.push(row),
            None => partitions.push((key, key_hash, vec![row])),
        }
    }

    let mut out = Vec::new();
    for (_, _, mut partition) in partitions {
        exec.check_interrupt()?;
        if !sort.is_empty() {
            partition.sort_by(|a, b| compare_docs(&a.doc, &b.doc, sort, None));
        }

        for i in 0..partition.len() {
            let mut doc = partition[i].doc.clone();
            for output in outputs {
                let (start, end) = frame(&output.window, i, partition.len());
                let mut state = AccumulatorState::new(&Accumulator {
                    field: output.field.clone(),
                    op: output.op,
                    argument: output.argument.clone(),
                });
                for row in &partition[start..end] {
                    let value = eval(&output.argument, &row.doc, &scope, &exec.snapshot)?;
                    state.step(output.op, value)?;
                }
                doc = doc_utils::with_field_at_path(
                    &doc,
                    &output.field,
                    state.finish(output.op),
                )?;
            }
            out.push(SourcedDoc::new(doc));
        }
    }
    Ok(out)
}

/// Clamp a window frame to `[start, end)` row indices of the partition.
fn frame(bounds: &WindowBounds, at: usize, len: usize) -> (usize, usize) {
    match bounds {
        WindowBounds::Unbounded => (0, len),
        WindowBounds::Documents(lower, upper) => {
            let start = match lower {
                None => 0,
                Some(offset) => (at as i64 + offset).clamp(0, len as i64) as usize,
            };
            let end = match upper {
                None => len,
                Some(offset) => ((at as i64 + offset + 1).clamp(0, len as i64)) as usize,
            };
            (start.min(end), end)
        }
    }
}
