//! The Row Store collaborator interface: shard-keyed tables with
//! secondary indexes, consumed by the engine core and implemented by the
//! relational substrate. Ships an in-memory reference implementation for
//! tests and the reference execution backend.

mod error;
mod memory;
mod store;

pub use error::StoreError;
pub use memory::MemoryRowStore;
pub use store::{
    CollectionHandle, IndexId, IndexRange, Row, RowIter, RowPosition, RowStore, ScanDirection,
    ScanOptions, StoredIndex,
};
