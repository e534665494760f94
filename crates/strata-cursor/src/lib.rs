//! Cursor management across request/response rounds: the five cursor
//! kinds, page batching under the wire caps, continuation tokens, on-disk
//! spill for persistent cursors, TTL reaping, and cooperative
//! cancellation.

mod batch;
mod continuation;
mod cursor;
mod error;
mod id;
mod manager;
mod spill;

pub use batch::{DEFAULT_BATCH_SIZE, MAX_BATCH_BYTES, PageWriter, PushOutcome};
pub use continuation::{ContinuationToken, TableContinuation};
pub use cursor::{CancellationToken, Cursor, CursorKind, SpillState};
pub use error::CursorError;
pub use id::CursorIdAllocator;
pub use manager::{CursorManager, DEFAULT_CURSOR_TTL};
pub use spill::{SharedSpillStats, SpillFile, SpillReader, SpillStats};
