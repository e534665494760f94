use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bson::raw::RawDocumentBuf;

use strata_path::TimeSnapshot;

use crate::continuation::ContinuationToken;
use crate::spill::{SpillFile, SpillReader};

/// The five cursor kinds and their lifecycle contracts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorKind {
    /// Resumable via an opaque continuation token the client echoes.
    Streamable,
    /// Whole result in one response; no server-side state.
    SingleBatch,
    /// Primary-key read; no server-side state, no cursor id.
    PointRead,
    /// Follows an append-only source, waiting for new rows.
    Tailable,
    /// Server holds the position between getMore calls, spilling to disk
    /// past the in-memory threshold.
    Persistent,
}

impl CursorKind {
    /// Whether the server keeps any state after the first response.
    pub fn holds_server_state(self) -> bool {
        matches!(
            self,
            CursorKind::Streamable | CursorKind::Tailable | CursorKind::Persistent
        )
    }
}

/// Cooperative cancellation flag, observed between batches and rows.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    flag: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

/// Overflow state of a persistent cursor.
pub enum SpillState {
    /// Still writing rows past the in-memory threshold.
    Writing(SpillFile),
    /// Finished; getMore drains the mapped file.
    Reading(SpillReader),
}

/// Server-side state of one cursor.
pub struct Cursor {
    pub id: i64,
    pub kind: CursorKind,
    pub namespace: String,
    pub batch_size: Option<u32>,
    /// `$$NOW` / `$$CLUSTER_TIME`, frozen at first invocation and reused
    /// for every getMore.
    pub snapshot: TimeSnapshot,
    /// Streamable resume position, echoed to the client.
    pub continuation: Option<ContinuationToken>,
    /// Tailable cursors: last observed primary-key position.
    pub last_position: Option<Vec<u8>>,
    /// Rows buffered in memory awaiting the next page (persistent).
    pub buffered: VecDeque<RawDocumentBuf>,
    pub spill: Option<SpillState>,
    pub exhausted: bool,
    pub cancellation: CancellationToken,
    /// Opaque execution state the owning layer re-attaches on getMore
    /// (e.g. the compiled plan); downcast at the consumer.
    pub payload: Option<Box<dyn std::any::Any + Send>>,
}

impl Cursor {
    pub fn new(kind: CursorKind, namespace: impl Into<String>, snapshot: TimeSnapshot) -> Self {
        Self {
            id: 0,
            kind,
            namespace: namespace.into(),
            batch_size: None,
            snapshot,
            continuation: None,
            last_position: None,
            buffered: VecDeque::new(),
            spill: None,
            exhausted: false,
            cancellation: CancellationToken::new(),
            payload: None,
        }
    }

    pub fn is_file_backed(&self) -> bool {
        self.spill.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_state_contract() {
        assert!(CursorKind::Streamable.holds_server_state());
        assert!(CursorKind::Tailable.holds_server_state());
        assert!(CursorKind::Persistent.holds_server_state());
        assert!(!CursorKind::SingleBatch.holds_server_state());
        assert!(!CursorKind::PointRead.holds_server_state());
    }

    #[test]
    fn cancellation_is_shared() {
        let token = CancellationToken::new();
        let clone = token.clone();
        assert!(!clone.is_cancelled());
        token.cancel();
        assert!(clone.is_cancelled());
    }

    #[test]
    fn snapshot_frozen_on_cursor() {
        let snapshot = TimeSnapshot::capture(bson::Timestamp { time: 5, increment: 1 });
        let cursor = Cursor::new(CursorKind::Streamable, "db.c", snapshot);
        assert_eq!(cursor.snapshot, snapshot);
    }
}
