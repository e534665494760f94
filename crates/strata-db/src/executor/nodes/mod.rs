pub(super) mod combine;
pub(super) mod filter;
pub(super) mod group;
pub(super) mod lookup;
pub(super) mod output;
pub(super) mod project;
pub(super) mod scan;
pub(super) mod sort_limit;
pub(super) mod stats;
pub(super) mod unwind;
pub(super) mod window;
