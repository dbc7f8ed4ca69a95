//! Merging fetched pages into an ordered store.
//!
//! The merger owns the position-index policy: appended items continue after
//! the collection's current maximum, refreshed collections restart at 0.
//! Both operations run as a single store transaction, so a failed merge
//! leaves no partially numbered rows behind.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex};

use backfill_core::{
    BackfillResult, CachedItem, CollectionKey, ListingItem, PositionIndex, StorageError,
    Timestamp, ValidationError,
};
use chrono::Utc;

use crate::store::OrderedStore;

/// How a merge treats existing rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeMode {
    /// Keep existing rows; continue numbering after the maximum.
    Append,
    /// Delete existing rows; number from 0.
    ReplaceAll,
}

/// Result of one committed merge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeOutcome {
    pub mode: MergeMode,
    pub inserted: usize,
    /// Rows removed before inserting (replace only).
    pub cleared: u64,
    pub first_position: Option<PositionIndex>,
    pub last_position: Option<PositionIndex>,
}

/// Number `payloads` consecutively from `start`, in the order received.
pub fn assign_positions<T>(
    collection: &CollectionKey,
    start: PositionIndex,
    payloads: Vec<T>,
    cached_at: Timestamp,
) -> Result<Vec<CachedItem<T>>, ValidationError> {
    payloads
        .into_iter()
        .enumerate()
        .map(|(offset, payload)| {
            let position = start.checked_add(offset as u64).ok_or_else(|| {
                ValidationError::PositionOverflow {
                    collection: collection.to_string(),
                    position: start,
                }
            })?;
            Ok(CachedItem {
                collection: collection.clone(),
                position,
                cached_at,
                payload,
            })
        })
        .collect()
}

/// Next free position after `max`, or 0 for an empty collection.
fn next_position(
    collection: &CollectionKey,
    max: Option<PositionIndex>,
) -> Result<PositionIndex, ValidationError> {
    match max {
        None => Ok(0),
        Some(max) => max
            .checked_add(1)
            .ok_or_else(|| ValidationError::PositionOverflow {
                collection: collection.to_string(),
                position: max,
            }),
    }
}

/// Writes fetched pages into an [`OrderedStore`].
///
/// Merges on the same collection are serialized through a per-collection
/// async lock; merges on different collections run concurrently. Store
/// transactions run on tokio's blocking pool.
///
/// A collection's lock is created on its first merge and kept for the life
/// of the merger, one small entry per distinct collection.
pub struct Merger<T, S> {
    store: Arc<S>,
    write_locks: Mutex<HashMap<CollectionKey, Arc<tokio::sync::Mutex<()>>>>,
    _payload: PhantomData<fn() -> T>,
}

impl<T, S> Merger<T, S>
where
    T: ListingItem,
    S: OrderedStore<T>,
{
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            write_locks: Mutex::new(HashMap::new()),
            _payload: PhantomData,
        }
    }

    /// The store this merger writes to.
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Append `items` after the collection's current maximum position.
    pub async fn append(
        &self,
        collection: &CollectionKey,
        items: Vec<T>,
    ) -> BackfillResult<MergeOutcome> {
        self.merge(collection, items, MergeMode::Append).await
    }

    /// Replace the whole collection with `items`, numbered from 0.
    pub async fn replace_all(
        &self,
        collection: &CollectionKey,
        items: Vec<T>,
    ) -> BackfillResult<MergeOutcome> {
        self.merge(collection, items, MergeMode::ReplaceAll).await
    }

    fn write_lock(&self, collection: &CollectionKey) -> BackfillResult<Arc<tokio::sync::Mutex<()>>> {
        let mut locks = self
            .write_locks
            .lock()
            .map_err(|_| StorageError::LockPoisoned)?;
        Ok(Arc::clone(locks.entry(collection.clone()).or_default()))
    }

    async fn merge(
        &self,
        collection: &CollectionKey,
        items: Vec<T>,
        mode: MergeMode,
    ) -> BackfillResult<MergeOutcome> {
        let lock = self.write_lock(collection)?;
        let _guard = lock.lock().await;

        let store = Arc::clone(&self.store);
        let key = collection.clone();
        let outcome = tokio::task::spawn_blocking(move || {
            store.transaction(|txn| {
                let (start, cleared) = match mode {
                    MergeMode::Append => (next_position(&key, txn.max_position_index(&key)?)?, 0),
                    MergeMode::ReplaceAll => (0, txn.delete_by_collection(&key)?),
                };
                let batch = assign_positions(&key, start, items, Utc::now())?;
                txn.insert_batch(&batch)?;
                Ok(MergeOutcome {
                    mode,
                    inserted: batch.len(),
                    cleared,
                    first_position: batch.first().map(|i| i.position),
                    last_position: batch.last().map(|i| i.position),
                })
            })
        })
        .await
        .map_err(|e| StorageError::TransactionFailed {
            reason: format!("merge task failed: {}", e),
        })??;

        tracing::debug!(
            collection = %collection,
            mode = ?outcome.mode,
            inserted = outcome.inserted,
            cleared = outcome.cleared,
            first_position = ?outcome.first_position,
            last_position = ?outcome.last_position,
            "Merged page into store"
        );
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryOrderedStore;
    use proptest::prelude::*;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Row(String);

    impl ListingItem for Row {}

    fn key(name: &str) -> CollectionKey {
        CollectionKey::new(name).expect("valid key")
    }

    fn rows(names: &[&str]) -> Vec<Row> {
        names.iter().map(|n| Row(n.to_string())).collect()
    }

    fn snapshot(store: &InMemoryOrderedStore<Row>, x: &CollectionKey) -> Vec<(String, u64)> {
        store
            .read_all(x)
            .expect("read should succeed")
            .into_iter()
            .map(|i| (i.payload.0, i.position))
            .collect()
    }

    fn merger() -> (Merger<Row, InMemoryOrderedStore<Row>>, Arc<InMemoryOrderedStore<Row>>) {
        let store = Arc::new(InMemoryOrderedStore::new());
        (Merger::new(Arc::clone(&store)), store)
    }

    #[tokio::test]
    async fn test_append_to_empty_starts_at_zero() {
        let (merger, store) = merger();
        let x = key("X");

        let outcome = merger
            .append(&x, rows(&["a", "b", "c"]))
            .await
            .expect("append should succeed");

        assert_eq!(outcome.inserted, 3);
        assert_eq!(outcome.first_position, Some(0));
        assert_eq!(
            snapshot(&store, &x),
            vec![("a".into(), 0), ("b".into(), 1), ("c".into(), 2)]
        );
    }

    #[tokio::test]
    async fn test_append_continues_after_max() {
        let (merger, store) = merger();
        let x = key("X");

        merger.append(&x, rows(&["a", "b"])).await.expect("append");
        let outcome = merger.append(&x, rows(&["c", "d"])).await.expect("append");

        assert_eq!(outcome.first_position, Some(2));
        assert_eq!(outcome.last_position, Some(3));
        assert_eq!(snapshot(&store, &x).last(), Some(&("d".into(), 3)));
    }

    #[tokio::test]
    async fn test_replace_all_restarts_at_zero() {
        let (merger, store) = merger();
        let x = key("X");

        merger.append(&x, rows(&["a", "b", "c"])).await.expect("append");
        let outcome = merger
            .replace_all(&x, rows(&["p1", "p2"]))
            .await
            .expect("replace should succeed");

        assert_eq!(outcome.cleared, 3);
        assert_eq!(
            snapshot(&store, &x),
            vec![("p1".into(), 0), ("p2".into(), 1)]
        );
    }

    #[tokio::test]
    async fn test_replace_all_with_empty_page_clears() {
        let (merger, store) = merger();
        let x = key("X");

        merger.append(&x, rows(&["a"])).await.expect("append");
        merger.replace_all(&x, Vec::new()).await.expect("replace");
        assert!(snapshot(&store, &x).is_empty());
    }

    #[tokio::test]
    async fn test_collections_number_independently() {
        let (merger, store) = merger();
        let x = key("X");
        let y = key("Y");

        merger.append(&x, rows(&["a", "b"])).await.expect("append");
        merger.append(&y, rows(&["z"])).await.expect("append");

        assert_eq!(snapshot(&store, &y), vec![("z".into(), 0)]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_replace_is_never_observed_half_done() {
        let (merger, store) = merger();
        let x = key("X");
        merger.append(&x, rows(&["a", "b"])).await.expect("append");

        let reader_store = Arc::clone(&store);
        let reader_key = x.clone();
        let reader = tokio::task::spawn_blocking(move || {
            for _ in 0..2_000 {
                let count = reader_store.count(&reader_key).expect("read");
                assert!(count > 0, "reader observed an empty collection mid-replace");
            }
        });

        for round in 0..50 {
            let page = vec![Row(format!("r{}", round)), Row("tail".to_string())];
            merger.replace_all(&x, page).await.expect("replace");
        }
        reader.await.expect("reader should not panic");
    }

    #[test]
    fn test_assign_positions_overflow() {
        let x = key("X");
        let result = assign_positions(&x, u64::MAX, rows(&["a", "b"]), Utc::now());
        assert!(matches!(
            result,
            Err(ValidationError::PositionOverflow { .. })
        ));
    }

    proptest! {
        #[test]
        fn prop_appends_are_contiguous_and_increasing(
            pages in proptest::collection::vec(1usize..6, 1..8)
        ) {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .expect("runtime should build");
            let (merger, store) = merger();
            let x = key("X");

            runtime.block_on(async {
                let mut expected_next = 0u64;
                for (page_no, len) in pages.iter().enumerate() {
                    let page: Vec<Row> =
                        (0..*len).map(|i| Row(format!("{}-{}", page_no, i))).collect();
                    let outcome = merger.append(&x, page).await.expect("append");
                    prop_assert_eq!(outcome.first_position, Some(expected_next));
                    prop_assert_eq!(outcome.last_position, Some(expected_next + *len as u64 - 1));
                    expected_next += *len as u64;
                }
                Ok(())
            })?;

            let positions: Vec<u64> = snapshot(&store, &x).into_iter().map(|(_, p)| p).collect();
            let expected: Vec<u64> = (0..pages.iter().sum::<usize>() as u64).collect();
            prop_assert_eq!(positions, expected);
        }
    }
}
