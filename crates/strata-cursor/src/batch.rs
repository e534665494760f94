use bson::raw::RawDocumentBuf;

use strata_bson::ArrayWriter;

/// Wire-imposed cap on one response batch.
pub const MAX_BATCH_BYTES: usize = 16 * 1024 * 1024;

/// Default number of rows in a first page when the client names none.
pub const DEFAULT_BATCH_SIZE: u32 = 101;

/// Why a page stopped accepting rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Accepted,
    /// The candidate would cross the byte cap or the row cap; the page is
    /// complete and the candidate belongs to the next one.
    PageFull,
}

/// Accumulates one response page under the batching contract: stop when
/// the serialized size plus one more candidate would exceed the byte cap,
/// when the configured batch size is reached, or when the source is
/// exhausted (caller-observed).
pub struct PageWriter {
    array: ArrayWriter,
    batch_size: u32,
    max_bytes: usize,
}

impl PageWriter {
    pub fn new(batch_size: Option<u32>) -> Self {
        Self {
            array: ArrayWriter::new(),
            batch_size: batch_size.unwrap_or(DEFAULT_BATCH_SIZE),
            max_bytes: MAX_BATCH_BYTES,
        }
    }

    #[cfg(test)]
    fn with_max_bytes(batch_size: Option<u32>, max_bytes: usize) -> Self {
        Self {
            array: ArrayWriter::new(),
            batch_size: batch_size.unwrap_or(DEFAULT_BATCH_SIZE),
            max_bytes,
        }
    }

    pub fn push(&mut self, doc: &RawDocumentBuf) -> PushOutcome {
        if self.array.len() as u32 >= self.batch_size {
            return PushOutcome::PageFull;
        }
        if !self.array.is_empty()
            && self.array.byte_len() + doc.as_bytes().len() > self.max_bytes
        {
            return PushOutcome::PageFull;
        }
        self.array.push(doc.clone());
        PushOutcome::Accepted
    }

    pub fn len(&self) -> usize {
        self.array.len()
    }

    pub fn is_empty(&self) -> bool {
        self.array.is_empty()
    }

    pub fn byte_len(&self) -> usize {
        self.array.byte_len()
    }

    pub fn into_batch(self) -> bson::raw::RawArrayBuf {
        self.array.into_buf()
    }
}
