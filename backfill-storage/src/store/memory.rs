//! In-memory ordered store.
//!
//! Transactions stage copy-on-write clones of the collections they touch and
//! swap them in under the write lock on commit, so readers see either the
//! old collection or the new one, never a half-applied batch.

use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use backfill_core::{
    BackfillResult, CachedItem, CollectionKey, ListingItem, PositionIndex, StorageError,
};
use tokio::sync::watch;

use super::traits::{OrderedStore, StoreTxn};
use crate::change_feed::{ChangeFeed, Watermark};

type Collection<T> = BTreeMap<PositionIndex, CachedItem<T>>;

/// Ordered store kept entirely in memory.
#[derive(Debug)]
pub struct InMemoryOrderedStore<T> {
    collections: RwLock<HashMap<CollectionKey, Collection<T>>>,
    feed: ChangeFeed,
}

impl<T> Default for InMemoryOrderedStore<T> {
    fn default() -> Self {
        Self {
            collections: RwLock::new(HashMap::new()),
            feed: ChangeFeed::new(),
        }
    }
}

impl<T: ListingItem> InMemoryOrderedStore<T> {
    pub fn new() -> Self {
        Self::default()
    }

    fn read<R>(
        &self,
        collection: &CollectionKey,
        f: impl FnOnce(Option<&Collection<T>>) -> R,
    ) -> BackfillResult<R> {
        let collections = self
            .collections
            .read()
            .map_err(|_| StorageError::LockPoisoned)?;
        Ok(f(collections.get(collection)))
    }
}

/// Staged view of the store during one transaction.
struct MemoryTxn<'a, T> {
    base: &'a HashMap<CollectionKey, Collection<T>>,
    staged: HashMap<CollectionKey, Collection<T>>,
}

impl<'a, T: Clone> MemoryTxn<'a, T> {
    fn collection(&self, key: &CollectionKey) -> Option<&Collection<T>> {
        self.staged.get(key).or_else(|| self.base.get(key))
    }

    fn collection_mut(&mut self, key: &CollectionKey) -> &mut Collection<T> {
        let base = self.base;
        self.staged
            .entry(key.clone())
            .or_insert_with(|| base.get(key).cloned().unwrap_or_default())
    }
}

impl<'a, T: ListingItem> StoreTxn<T> for MemoryTxn<'a, T> {
    fn max_position_index(
        &self,
        collection: &CollectionKey,
    ) -> BackfillResult<Option<PositionIndex>> {
        Ok(self
            .collection(collection)
            .and_then(|c| c.keys().next_back().copied()))
    }

    fn delete_by_collection(&mut self, collection: &CollectionKey) -> BackfillResult<u64> {
        let existing = self.collection(collection).map(|c| c.len()).unwrap_or(0);
        self.staged.insert(collection.clone(), BTreeMap::new());
        Ok(existing as u64)
    }

    fn insert_batch(&mut self, items: &[CachedItem<T>]) -> BackfillResult<()> {
        for item in items {
            let rows = self.collection_mut(&item.collection);
            if rows.contains_key(&item.position) {
                return Err(StorageError::TransactionFailed {
                    reason: format!(
                        "position {} already occupied in {}",
                        item.position, item.collection
                    ),
                }
                .into());
            }
            rows.insert(item.position, item.clone());
        }
        Ok(())
    }
}

impl<T: ListingItem> OrderedStore<T> for InMemoryOrderedStore<T> {
    fn transaction<R, F>(&self, work: F) -> BackfillResult<R>
    where
        F: FnOnce(&mut dyn StoreTxn<T>) -> BackfillResult<R>,
    {
        let (touched, result) = {
            let mut collections = self
                .collections
                .write()
                .map_err(|_| StorageError::LockPoisoned)?;

            let mut txn = MemoryTxn {
                base: &*collections,
                staged: HashMap::new(),
            };
            let result = work(&mut txn)?;
            let staged = txn.staged;

            let touched: Vec<CollectionKey> = staged.keys().cloned().collect();
            for (key, rows) in staged {
                if rows.is_empty() {
                    collections.remove(&key);
                } else {
                    collections.insert(key, rows);
                }
            }
            (touched, result)
        };

        for key in &touched {
            self.feed.publish(key);
        }
        Ok(result)
    }

    fn read_range(
        &self,
        collection: &CollectionKey,
        after: Option<PositionIndex>,
        limit: Option<usize>,
    ) -> BackfillResult<Vec<CachedItem<T>>> {
        self.read(collection, |rows| {
            let Some(rows) = rows else {
                return Vec::new();
            };
            let iter = match after {
                Some(after) => rows.range((
                    std::ops::Bound::Excluded(after),
                    std::ops::Bound::Unbounded,
                )),
                None => rows.range(..),
            };
            iter.take(limit.unwrap_or(usize::MAX))
                .map(|(_, item)| item.clone())
                .collect()
        })
    }

    fn item_at(
        &self,
        collection: &CollectionKey,
        position: PositionIndex,
    ) -> BackfillResult<Option<CachedItem<T>>> {
        self.read(collection, |rows| {
            rows.and_then(|r| r.get(&position)).cloned()
        })
    }

    fn min_position_index(
        &self,
        collection: &CollectionKey,
    ) -> BackfillResult<Option<PositionIndex>> {
        self.read(collection, |rows| rows.and_then(|r| r.keys().next().copied()))
    }

    fn max_position_index(
        &self,
        collection: &CollectionKey,
    ) -> BackfillResult<Option<PositionIndex>> {
        self.read(collection, |rows| {
            rows.and_then(|r| r.keys().next_back().copied())
        })
    }

    fn count(&self, collection: &CollectionKey) -> BackfillResult<u64> {
        self.read(collection, |rows| rows.map(|r| r.len() as u64).unwrap_or(0))
    }

    fn watch(&self, collection: &CollectionKey) -> watch::Receiver<Watermark> {
        self.feed.subscribe(collection)
    }
}
