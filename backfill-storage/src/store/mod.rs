//! Ordered stores: the persistent side of the paged cache.
//!
//! An [`OrderedStore`] keeps each collection's items sorted by position
//! index and exposes one atomic write primitive, [`OrderedStore::transaction`].
//! Two implementations ship with this crate:
//!
//! - [`InMemoryOrderedStore`] for tests and ephemeral caches
//! - [`LmdbOrderedStore`] for caches that survive restarts
//!
//! Both publish a [`Watermark`](crate::Watermark) per collection after each
//! commit so readers can re-query without polling.

pub mod lmdb_backend;
pub mod memory;
pub mod scoped_key;
pub mod traits;

pub use lmdb_backend::{LmdbOrderedStore, LmdbStoreError};
pub use memory::InMemoryOrderedStore;
pub use scoped_key::CollectionScopedKey;
pub use traits::{OrderedStore, StoreTxn};
