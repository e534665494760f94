use strata_query::{Expression, QueryError, matches_with};

use crate::error::Result;
use crate::executor::{Executor, SourcedDoc};

pub(crate) fn filter(
    exec: &Executor<'_>,
    predicate: &Expression,
    rows: Vec<SourcedDoc>,
) -> Result<Vec<SourcedDoc>> {
    let scope = exec.scope();
    let snapshot = exec.snapshot;
    // `$expr` operands evaluate through the aggregation-expression layer
    // with the cursor's frozen time snapshot and pipeline variables.
    let hook = move |doc: &bson::RawDocument,
                     operand: &bson::RawBson|
          -> std::result::Result<bool, QueryError> {
        let compiled = strata_path::compile(operand.as_raw_bson_ref())
            .map_err(|e| QueryError::BadValue(e.to_string()))?;
        let value = strata_path::eval(&compiled, doc, &scope, &snapshot)
            .map_err(|e| QueryError::BadValue(e.to_string()))?;
        Ok(truthy(value.as_ref()))
    };

    let mut out = Vec::with_capacity(rows.len());
    for (i, row) in rows.into_iter().enumerate() {
        if i % 256 == 0 {
            exec.check_interrupt()?;
        }
        if matches_with(&row.doc, predicate, Some(&hook))? {
            out.push(row);
        }
    }
    Ok(out)
}

fn truthy(v: Option<&bson::RawBson>) -> bool {
    use bson::RawBson;
    match v {
        None | Some(RawBson::Null) | Some(RawBson::Undefined) => false,
        Some(RawBson::Boolean(b)) => *b,
        Some(RawBson::Int32(n)) => *n != 0,
        Some(RawBson::Int64(n)) => *n != 0,
        Some(RawBson::Double(d)) => *d != 0.0,
        Some(_) => true,
    }
}
