//! Ordered store traits.
//!
//! An ordered store holds cached items keyed by collection and position
//! index. Writes happen only inside [`OrderedStore::transaction`]; reads are
//! plain ordered range queries that always observe committed state.

use backfill_core::{BackfillResult, CachedItem, CollectionKey, ListingItem, PositionIndex};
use tokio::sync::watch;

use crate::change_feed::Watermark;

/// Write handle available inside a store transaction.
///
/// Everything done through a `StoreTxn` becomes visible atomically when the
/// transaction commits, or not at all.
pub trait StoreTxn<T: ListingItem> {
    /// Highest position in the collection as seen by this transaction,
    /// including its own uncommitted writes.
    fn max_position_index(&self, collection: &CollectionKey)
        -> BackfillResult<Option<PositionIndex>>;

    /// Remove every row of the collection. Returns the number removed.
    fn delete_by_collection(&mut self, collection: &CollectionKey) -> BackfillResult<u64>;

    /// Insert rows. Fails if any (collection, position) is already occupied.
    fn insert_batch(&mut self, items: &[CachedItem<T>]) -> BackfillResult<()>;
}

/// Persistent collection of ordered items.
///
/// # Thread Safety
///
/// Implementations must be shareable across threads. Transactions may block
/// on I/O, so async callers should run them on a blocking thread (the
/// [`Merger`](crate::Merger) does this).
pub trait OrderedStore<T: ListingItem>: Send + Sync + 'static {
    /// Run `work` inside one atomic write transaction.
    ///
    /// If `work` returns an error, nothing it did is applied and the error
    /// is returned unchanged.
    fn transaction<R, F>(&self, work: F) -> BackfillResult<R>
    where
        F: FnOnce(&mut dyn StoreTxn<T>) -> BackfillResult<R>;

    /// Items with position greater than `after` (or from the start), in
    /// position order, at most `limit` of them (or all).
    fn read_range(
        &self,
        collection: &CollectionKey,
        after: Option<PositionIndex>,
        limit: Option<usize>,
    ) -> BackfillResult<Vec<CachedItem<T>>>;

    /// The item at an exact position.
    fn item_at(
        &self,
        collection: &CollectionKey,
        position: PositionIndex,
    ) -> BackfillResult<Option<CachedItem<T>>>;

    fn min_position_index(&self, collection: &CollectionKey)
        -> BackfillResult<Option<PositionIndex>>;

    fn max_position_index(&self, collection: &CollectionKey)
        -> BackfillResult<Option<PositionIndex>>;

    fn count(&self, collection: &CollectionKey) -> BackfillResult<u64>;

    /// Receiver that changes after every committed transaction touching
    /// the collection.
    fn watch(&self, collection: &CollectionKey) -> watch::Receiver<Watermark>;

    /// Every item in the collection, in position order.
    fn read_all(&self, collection: &CollectionKey) -> BackfillResult<Vec<CachedItem<T>>> {
        self.read_range(collection, None, None)
    }
}
