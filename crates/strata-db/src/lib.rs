//! The engine-core facade the Protocol Frontend invokes: find/aggregate
//! compilation and execution, cursor lifecycles, batched writes, index
//! DDL, the wire error taxonomy, retry records, and the shared metadata
//! and plan caches — all over a Row Store substrate.

mod catalog;
mod database;
mod error;
mod executor;
mod find;
mod planner;
mod response;
mod retry;
mod session;

pub use catalog::{CachedPlan, CollectionMeta, MetadataCache, PlanCache, PlanCacheKey};
pub use database::{Database, DatabaseConfig};
pub use error::{DbError, ErrorCode, Result};
pub use executor::{Executor, SourcedDoc};
pub use find::{FindCommand, find_to_pipeline, parse_find};
pub use retry::{RetryKey, RetryRecordStore};
pub use session::{QueryOptions, Session, WriteDelete, WriteUpdate};
