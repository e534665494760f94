use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::debug;

use crate::cursor::{Cursor, CursorKind, SpillState};
use crate::error::CursorError;
use crate::id::CursorIdAllocator;
use crate::spill::{SharedSpillStats, SpillStats};

/// Default idle lifetime before a cursor is reaped.
pub const DEFAULT_CURSOR_TTL: Duration = Duration::from_secs(10 * 60);

struct Entry {
    cursor: Cursor,
    session: u64,
    last_access: Instant,
}

/// Owns server-side cursor state across request/response rounds.
///
/// Single-batch and point-read cursors never enter the table; the other
/// kinds are registered under a process-unique id, checked out per
/// getMore, and reaped on TTL expiry or kill.
pub struct CursorManager {
    ids: CursorIdAllocator,
    table: Mutex<HashMap<i64, Entry>>,
    ttl: Duration,
    spill_dir: PathBuf,
    spill_stats: SharedSpillStats,
}

impl CursorManager {
    pub fn new(spill_dir: impl Into<PathBuf>) -> Self {
        Self {
            ids: CursorIdAllocator::new(),
            table: Mutex::new(HashMap::new()),
            ttl: DEFAULT_CURSOR_TTL,
            spill_dir: spill_dir.into(),
            spill_stats: Arc::new(Mutex::new(SpillStats::default())),
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn spill_dir(&self) -> &std::path::Path {
        &self.spill_dir
    }

    pub fn spill_stats_handle(&self) -> SharedSpillStats {
        self.spill_stats.clone()
    }

    pub fn spill_stats(&self) -> SpillStats {
        *self.spill_stats.lock()
    }

    /// Register a cursor that must survive this response; assigns its id.
    /// Each cursor belongs to exactly one session.
    pub fn register(&self, mut cursor: Cursor, session: u64) -> Result<i64, CursorError> {
        debug_assert!(cursor.kind.holds_server_state());
        let id = self.ids.next(cursor.is_file_backed());
        cursor.id = id;
        debug!(cursor_id = id, namespace = %cursor.namespace, "registered cursor");
        self.table.lock().insert(
            id,
            Entry {
                cursor,
                session,
                last_access: Instant::now(),
            },
        );
        Ok(id)
    }

    /// Take the cursor out of the table for one getMore round. The caller
    /// returns it with [`check_in`] or finishes it with [`close`].
    ///
    /// A cursor belongs to the session that opened it.
    pub fn check_out(&self, id: i64, session: u64) -> Result<Cursor, CursorError> {
        let mut table = self.table.lock();
        let entry = table.get(&id).ok_or(CursorError::CursorNotFound(id))?;
        if entry.session != session {
            return Err(CursorError::CursorNotFound(id));
        }
        if entry.cursor.cancellation.is_cancelled() {
            let entry = table.remove(&id).ok_or(CursorError::CursorNotFound(id))?;
            drop(table);
            self.discard(entry.cursor);
            return Err(CursorError::Cancelled);
        }
        let entry = table.remove(&id).ok_or(CursorError::CursorNotFound(id))?;
        Ok(entry.cursor)
    }

    /// Return a still-live cursor after a getMore round.
    pub fn check_in(&self, cursor: Cursor, session: u64) {
        let id = cursor.id;
        self.table.lock().insert(
            id,
            Entry {
                cursor,
                session,
                last_access: Instant::now(),
            },
        );
    }

    /// Close a cursor normally: state dropped, spill file unlinked.
    pub fn close(&self, cursor: Cursor) {
        debug!(cursor_id = cursor.id, "closing cursor");
        self.discard(cursor);
    }

    /// Kill cursors by id; returns the ids actually removed. Unknown ids
    /// are reported back to the caller separately.
    pub fn kill(&self, ids: &[i64], session: u64) -> (Vec<i64>, Vec<i64>) {
        let mut killed = Vec::new();
        let mut not_found = Vec::new();
        for &id in ids {
            let removed = {
                let mut table = self.table.lock();
                match table.get(&id) {
                    Some(entry) if entry.session == session => table.remove(&id),
                    _ => None,
                }
            };
            match removed {
                Some(entry) => {
                    entry.cursor.cancellation.cancel();
                    self.discard(entry.cursor);
                    killed.push(id);
                }
                None => not_found.push(id),
            }
        }
        (killed, not_found)
    }

    /// Drop cursors idle past the TTL, unlinking their spill files.
    pub fn reap_expired(&self) -> usize {
        let now = Instant::now();
        let expired: Vec<Cursor> = {
            let mut table = self.table.lock();
            let ids: Vec<i64> = table
                .iter()
                .filter(|(_, e)| now.duration_since(e.last_access) > self.ttl)
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter()
                .filter_map(|id| table.remove(&id).map(|e| e.cursor))
                .collect()
        };
        let count = expired.len();
        for cursor in expired {
            debug!(cursor_id = cursor.id, "reaping expired cursor");
            self.discard(cursor);
        }
        count
    }

    pub fn open_cursors(&self) -> usize {
        self.table.lock().len()
    }

    fn discard(&self, cursor: Cursor) {
        match cursor.spill {
            Some(SpillState::Reading(reader)) => {
                let _ = reader.delete();
            }
            Some(SpillState::Writing(file)) => {
                let path = file.path().to_path_buf();
                drop(file);
                let _ = std::fs::remove_file(path);
                let mut stats = self.spill_stats.lock();
                stats.active_cursor_count = stats.active_cursor_count.saturating_sub(1);
            }
            None => {}
        }
    }
}
