use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use strata_cursor::{CursorManager, DEFAULT_CURSOR_TTL};
use strata_index::AmRegistry;
use strata_store::RowStore;

use crate::catalog::{MetadataCache, PlanCache};
use crate::retry::RetryRecordStore;
use crate::session::Session;

pub struct DatabaseConfig {
    /// Directory for persistent-cursor spill files.
    pub cursor_dir: PathBuf,
    pub cursor_ttl: Duration,
    /// Rows a persistent cursor buffers in memory before spilling.
    pub spill_threshold: usize,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            cursor_dir: std::env::temp_dir().join("strata-cursors"),
            cursor_ttl: DEFAULT_CURSOR_TTL,
            spill_threshold: 512,
        }
    }
}

/// The engine core: owns the cursor manager, caches, the index-AM
/// registry, and retry records over a Row Store substrate.
///
/// The Protocol Frontend obtains a [`Session`] per client and invokes
/// commands on it; sessions are isolated, sharing only the caches under
/// their locks.
pub struct Database {
    pub(crate) store: Arc<dyn RowStore>,
    pub(crate) cursors: CursorManager,
    pub(crate) metadata: MetadataCache,
    pub(crate) plans: PlanCache,
    pub(crate) registry: AmRegistry,
    pub(crate) retry: RetryRecordStore,
    pub(crate) spill_threshold: usize,
}

impl Database {
    pub fn open(store: Arc<dyn RowStore>, config: DatabaseConfig) -> Arc<Self> {
        Arc::new(Self {
            store,
            cursors: CursorManager::new(config.cursor_dir).with_ttl(config.cursor_ttl),
            metadata: MetadataCache::new(),
            plans: PlanCache::new(),
            registry: AmRegistry::builtin(),
            retry: RetryRecordStore::new(),
            spill_threshold: config.spill_threshold,
        })
    }

    pub fn session(self: &Arc<Self>, session_id: u64) -> Session {
        Session::new(Arc::clone(self), session_id)
    }

    /// Reap idle cursors; invoked by the host's background job machinery.
    pub fn reap_cursors(&self) -> usize {
        self.cursors.reap_expired()
    }

    pub fn open_cursor_count(&self) -> usize {
        self.cursors.open_cursors()
    }

    /// Spill files currently backing persistent cursors.
    pub fn cursors_spill_active(&self) -> u64 {
        self.cursors.spill_stats().active_cursor_count
    }

    pub fn plan_cache(&self) -> &PlanCache {
        &self.plans
    }

    pub fn metadata_cache(&self) -> &MetadataCache {
        &self.metadata
    }
}
