use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use strata_index::IndexSpec;
use strata_pipeline::QueryTree;

/// Cached metadata for one collection: its shard key and index specs.
#[derive(Debug, Clone, Default)]
pub struct CollectionMeta {
    pub shard_key_path: String,
    pub indexes: Vec<Arc<IndexSpec>>,
}

/// Process-wide collection-metadata cache.
///
/// Readers take a consistent snapshot under the read lock; DDL bumps the
/// version, which also invalidates dependent plan-cache entries.
#[derive(Default)]
pub struct MetadataCache {
    inner: RwLock<MetadataInner>,
}

#[derive(Default)]
struct MetadataInner {
    version: u64,
    collections: HashMap<String, CollectionMeta>,
}

impl MetadataCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn version(&self) -> u64 {
        self.inner.read().version
    }

    pub fn get(&self, namespace: &str) -> Option<CollectionMeta> {
        self.inner.read().collections.get(namespace).cloned()
    }

    pub fn put(&self, namespace: impl Into<String>, meta: CollectionMeta) {
        let mut inner = self.inner.write();
        inner.collections.insert(namespace.into(), meta);
        inner.version += 1;
    }

    /// DDL invalidation: drop the entry and bump the version.
    pub fn invalidate(&self, namespace: &str) {
        let mut inner = self.inner.write();
        inner.collections.remove(namespace);
        inner.version += 1;
        debug!(namespace, version = inner.version, "metadata invalidated");
    }
}

/// Key of a cached plan: operation-kind bits plus the query's shape.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PlanCacheKey {
    pub namespace: String,
    pub operation_bits: u32,
    /// Hash over the pipeline's stage specs. Constants participate, so
    /// literal-bearing trees can be reused verbatim.
    pub shape_hash: u64,
}

/// A compiled plan plus the build-context outcomes the cursor layer
/// needs.
#[derive(Debug, Clone)]
pub struct CachedPlan {
    pub tree: QueryTree,
    pub is_point_read: bool,
    pub requires_persistent_cursor: bool,
    pub is_single_row_result: bool,
}

/// Per-process plan cache; entries are dropped wholesale when the
/// metadata version they were built under goes stale.
#[derive(Default)]
pub struct PlanCache {
    inner: RwLock<PlanInner>,
}

#[derive(Default)]
struct PlanInner {
    version: u64,
    plans: HashMap<PlanCacheKey, Arc<CachedPlan>>,
}

impl PlanCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &PlanCacheKey, metadata_version: u64) -> Option<Arc<CachedPlan>> {
        let inner = self.inner.read();
        if inner.version != metadata_version {
            return None;
        }
        inner.plans.get(key).cloned()
    }

    pub fn put(&self, key: PlanCacheKey, plan: Arc<CachedPlan>, metadata_version: u64) {
        let mut inner = self.inner.write();
        if inner.version != metadata_version {
            inner.plans.clear();
            inner.version = metadata_version;
        }
        inner.plans.insert(key, plan);
    }

    pub fn len(&self) -> usize {
        self.inner.read().plans.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use strata_pipeline::CollectionRef;

    use super::*;

    #[test]
    fn metadata_versions_bump_on_writes() {
        let cache = MetadataCache::new();
        let v0 = cache.version();
        cache.put(
            "db.a",
            CollectionMeta {
                shard_key_path: "_id".into(),
                indexes: Vec::new(),
            },
        );
        assert!(cache.version() > v0);
        assert!(cache.get("db.a").is_some());

        cache.invalidate("db.a");
        assert!(cache.get("db.a").is_none());
    }

    fn scan_plan(coll: &str) -> Arc<CachedPlan> {
        Arc::new(CachedPlan {
            tree: QueryTree::Scan {
                collection: CollectionRef::new("db", coll),
            },
            is_point_read: false,
            requires_persistent_cursor: false,
            is_single_row_result: false,
        })
    }

    #[test]
    fn plan_cache_invalidates_on_version_bump() {
        let plans = PlanCache::new();
        let key = PlanCacheKey {
            namespace: "db.a".into(),
            operation_bits: 1,
            shape_hash: 42,
        };
        plans.put(key.clone(), scan_plan("a"), 7);
        assert!(plans.get(&key, 7).is_some());
        // A newer metadata version makes the entry invisible; inserting
        // under it clears the stale generation.
        assert!(plans.get(&key, 8).is_none());
        plans.put(
            PlanCacheKey {
                namespace: "db.b".into(),
                operation_bits: 1,
                shape_hash: 1,
            },
            scan_plan("b"),
            8,
        );
        assert!(plans.get(&key, 8).is_none());
        assert_eq!(plans.len(), 1);
    }
}
