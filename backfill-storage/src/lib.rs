//! Backfill Storage - Ordered Stores and Merging
//!
//! Defines the ordered-store abstraction the paged cache reads from, the
//! in-memory and LMDB implementations, the per-collection change feed that
//! wakes readers after commits, and the [`Merger`] that assigns position
//! indices to fetched pages.

pub mod change_feed;
pub mod merger;
pub mod store;

pub use change_feed::{ChangeFeed, Watermark};
pub use merger::{assign_positions, MergeMode, MergeOutcome, Merger};
pub use store::{
    CollectionScopedKey, InMemoryOrderedStore, LmdbOrderedStore, LmdbStoreError, OrderedStore,
    StoreTxn,
};
