//! Index access-method dispatch: a capability-driven registry of
//! alternate inverted-index implementations, the strategy vocabulary
//! operator classes speak, and `createIndexes` spec parsing.

mod am;
mod error;
mod registry;
mod spec;
mod strategy;

pub use am::{
    AmCapabilities, ExplainFn, IndexAmEntry, IndexClass, MultikeyStatusFn, OpFamily,
    TruncationStatusFn,
};
pub use error::IndexError;
pub use registry::{AmRegistry, MAX_ALTERNATE_INDEX_AMS};
pub use spec::{IndexKey, IndexKeyKind, IndexSpec, parse_index_spec};
pub use strategy::IndexStrategy;
