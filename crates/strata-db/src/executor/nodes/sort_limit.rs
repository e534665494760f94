use rand::seq::SliceRandom;

use strata_query::{SortKey, compare_docs};

use crate::error::Result;
use crate::executor::SourcedDoc;

pub(crate) fn sort(keys: &[SortKey], mut rows: Vec<SourcedDoc>) -> Result<Vec<SourcedDoc>> {
    rows.sort_by(|a, b| compare_docs(&a.doc, &b.doc, keys, None));
    // A sort re-orders the stream; scan positions no longer describe it.
    for row in &mut rows {
        row.position = None;
    }
    Ok(rows)
}

pub(crate) fn sample(size: u64, mut rows: Vec<SourcedDoc>) -> Result<Vec<SourcedDoc>> {
    let mut rng = rand::thread_rng();
    rows.shuffle(&mut rng);
    rows.truncate(size as usize);
    for row in &mut rows {
        row.position = None;
    }
    Ok(rows)
}
