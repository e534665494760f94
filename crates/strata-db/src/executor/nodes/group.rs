use bson::RawBson;
use bson::raw::RawBsonRef;

use strata_bson::{ArrayWriter, DocumentWriter, hash_value, values_equal};
use strata_path::{CompiledExpression, eval};
use strata_pipeline::{Accumulator, AccumulatorOp};

use crate::error::{DbError, ErrorCode, Result};
use crate::executor::{Executor, SourcedDoc};

pub(crate) fn group(
    exec: &Executor<'_>,
    key: &CompiledExpression,
    accumulators: &[Accumulator],
    rows: Vec<SourcedDoc>,
) -> Result<Vec<SourcedDoc>> {
    let scope = exec.scope();
    // Buckets keyed by canonical hash, resolved by canonical equality so
    // Int32(5) and Double(5.0) land together. Insertion order is output
    // order.
    let mut buckets: Vec<GroupBucket> = Vec::new();

    for (i, row) in rows.iter().enumerate() {
        if i % 256 == 0 {
            exec.check_interrupt()?;
        }
        let key_value = eval(key, &row.doc, &scope, &exec.snapshot)?.unwrap_or(RawBson::Null);
        let key_hash = hash_value(key_value.as_raw_bson_ref());
        let slot = buckets.iter().position(|b| {
            b.key_hash == key_hash
                && values_equal(
                    b.key.as_raw_bson_ref(),
                    key_value.as_raw_bson_ref(),
                    None,
                )
        });
        let slot = match slot {
            Some(at) => at,
            None => {
                buckets.push(GroupBucket::new(key_value, key_hash, accumulators));
                buckets.len() - 1
            }
        };
        buckets[slot].step(exec, accumulators, &row.doc)?;
    }

    // A whole-collection group over zero rows still yields one row for
    // a null key when any accumulator is present and the key is constant
    // null — matching the empty-input $count shape.
    let mut out = Vec::with_capacity(buckets.len());
    for bucket in buckets {
        out.push(SourcedDoc::new(bucket.finish(accumulators)?));
    }
    Ok(out)
}

struct GroupBucket {
    key: RawBson,
    key_hash: i64,
    states: Vec<AccumulatorState>,
}

impl GroupBucket {
    fn new(key: RawBson, key_hash: i64, accumulators: &[Accumulator]) -> Self {
        Self {
            key,
            key_hash,
            states: accumulators.iter().map(AccumulatorState::new).collect(),
        }
    }

    fn step(
        &mut self,
        exec: &Executor<'_>,
        accumulators: &[Accumulator],
        doc: &bson::RawDocument,
    ) -> Result<()> {
        let scope = exec.scope();
        for (state, spec) in self.states.iter_mut().zip(accumulators) {
            let value = eval(&spec.argument, doc, &scope, &exec.snapshot)?;
            state.step(spec.op, value)?;
        }
        Ok(())
    }

    fn finish(self, accumulators: &[Accumulator]) -> Result<bson::raw::RawDocumentBuf> {
        let mut w = DocumentWriter::new();
        w.append("_id", self.key);
        for (state, spec) in self.states.into_iter().zip(accumulators) {
            w.append(&spec.field, state.finish(spec.op));
        }
        Ok(w.into_buf())
    }
}

pub(crate) struct AccumulatorState {
    count: u64,
    sum_int: Option<i64>,
    sum_float: f64,
    saw_float: bool,
    extreme: Option<RawBson>,
    first: Option<RawBson>,
    last: Option<RawBson>,
    collected: Vec<RawBson>,
}

impl AccumulatorState {
    pub(crate) fn new(_spec: &Accumulator) -> Self {
        Self {
            count: 0,
            sum_int: Some(0),
            sum_float: 0.0,
            saw_float: false,
            extreme: None,
            first: None,
            last: None,
            collected: Vec::new(),
        }
    }

    pub(crate) fn step(&mut self, op: AccumulatorOp, value: Option<RawBson>) -> Result<()> {
        match op {
            AccumulatorOp::Count => {
                self.count += 1;
            }
            AccumulatorOp::Sum | AccumulatorOp::Avg => {
                // Non-numeric values are ignored, matching $sum/$avg.
                match value.as_ref().map(RawBson::as_raw_bson_ref) {
                    Some(RawBsonRef::Int32(n)) => self.add_int(i64::from(n)),
                    Some(RawBsonRef::Int64(n)) => self.add_int(n),
                    Some(RawBsonRef::Double(d)) => {
                        self.saw_float = true;
                        self.sum_float += d;
                        self.count += 1;
                    }
                    _ => {}
                }
            }
            AccumulatorOp::Min | AccumulatorOp::Max => {
                let Some(candidate) = value else {
                    return Ok(());
                };
                if matches!(candidate, RawBson::Null) {
                    return Ok(());
                }
                let replace = match &self.extreme {
                    None => true,
                    Some(current) => {
                        let ord = strata_bson::compare(
                            candidate.as_raw_bson_ref(),
                            current.as_raw_bson_ref(),
                            None,
                        );
                        if op == AccumulatorOp::Min {
                            ord == std::cmp::Ordering::Less
                        } else {
                            ord == std::cmp::Ordering::Greater
                        }
                    }
                };
                if replace {
                    self.extreme = Some(candidate);
                }
            }
            AccumulatorOp::First => {
                if self.first.is_none() {
                    self.first = Some(value.unwrap_or(RawBson::Null));
                }
            }
            AccumulatorOp::Last => {
                self.last = Some(value.unwrap_or(RawBson::Null));
            }
            AccumulatorOp::Push => {
                if let Some(v) = value {
                    self.collected.push(v);
                }
            }
            AccumulatorOp::AddToSet => {
                if let Some(v) = value {
                    let dup = self.collected.iter().any(|existing| {
                        values_equal(existing.as_raw_bson_ref(), v.as_raw_bson_ref(), None)
                    });
                    if !dup {
                        self.collected.push(v);
                    }
                }
            }
        }
        Ok(())
    }

    pub(crate) fn finish(self, op: AccumulatorOp) -> RawBson {
        match op {
            AccumulatorOp::Count => RawBson::Int64(self.count as i64),
            AccumulatorOp::Sum => {
                if self.saw_float {
                    RawBson::Double(self.sum_float)
                } else {
                    match self.sum_int {
                        Some(n) => int_result(n),
                        None => RawBson::Double(self.sum_float),
                    }
                }
            }
            AccumulatorOp::Avg => {
                if self.count == 0 {
                    RawBson::Null
                } else {
                    RawBson::Double(self.sum_float / self.count as f64)
                }
            }
            AccumulatorOp::Min | AccumulatorOp::Max => self.extreme.unwrap_or(RawBson::Null),
            AccumulatorOp::First => self.first.unwrap_or(RawBson::Null),
            AccumulatorOp::Last => self.last.unwrap_or(RawBson::Null),
            AccumulatorOp::Push | AccumulatorOp::AddToSet => {
                let mut arr = ArrayWriter::new();
                for v in self.collected {
                    arr.push(v);
                }
                RawBson::Array(arr.into_buf())
            }
        }
    }

    fn add_int(&mut self, n: i64) {
        self.sum_float += n as f64;
        self.sum_int = self.sum_int.and_then(|acc| acc.checked_add(n));
        self.count += 1;
    }
}

fn int_result(n: i64) -> RawBson {
    match i32::try_from(n) {
        Ok(small) => RawBson::Int32(small),
        Err(_) => RawBson::Int64(n),
    }
}

pub(crate) fn bucket_auto(
    exec: &Executor<'_>,
    group_by: &CompiledExpression,
    buckets: u64,
    accumulators: &[Accumulator],
    rows: Vec<SourcedDoc>,
) -> Result<Vec<SourcedDoc>> {
    if rows.is_empty() {
        return Ok(Vec::new());
    }
    let scope = exec.scope();
    let mut keyed: Vec<(RawBson, SourcedDoc)> = Vec::with_capacity(rows.len());
    for row in rows {
        let key = eval(group_by, &row.doc, &scope, &exec.snapshot)?.unwrap_or(RawBson::Null);
        keyed.push((key, row));
    }
    keyed.sort_by(|(a, _), (b, _)| {
        strata_bson::compare(a.as_raw_bson_ref(), b.as_raw_bson_ref(), None)
    });

    let total = keyed.len();
    let bucket_count = (buckets as usize).min(total).max(1);
    let base = total / bucket_count;
    let remainder = total % bucket_count;

    let mut out = Vec::with_capacity(bucket_count);
    let mut at = 0usize;
    for b in 0..bucket_count {
        exec.check_interrupt()?;
        let size = base + usize::from(b < remainder);
        if size == 0 {
            continue;
        }
        let slice = &keyed[at..at + size];
        at += size;

        let mut states: Vec<AccumulatorState> =
            accumulators.iter().map(AccumulatorState::new).collect();
        for (_, row) in slice {
            for (state, spec) in states.iter_mut().zip(accumulators) {
                let value = eval(&spec.argument, &row.doc, &scope, &exec.snapshot)?;
                state.step(spec.op, value)?;
            }
        }

        let min = slice
            .first()
            .map(|(k, _)| k.clone())
            .ok_or_else(|| DbError::new(ErrorCode::InternalError, "empty bucket"))?;
        // The upper bound is the next bucket's minimum; the last bucket
        // closes on its own maximum.
        let max = if at < total {
            keyed[at].0.clone()
        } else {
            slice
                .last()
                .map(|(k, _)| k.clone())
                .ok_or_else(|| DbError::new(ErrorCode::InternalError, "empty bucket"))?
        };

        let mut id = DocumentWriter::new();
        id.append("min", min);
        id.append("max", max);
        let mut w = DocumentWriter::new();
        w.append_document("_id", id);
        for (state, spec) in states.into_iter().zip(accumulators) {
            w.append(&spec.field, state.finish(spec.op));
        }
        out.push(SourcedDoc::new(w.into_buf()));
    }
    Ok(out)
}
