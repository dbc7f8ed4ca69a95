//! LMDB-backed ordered store.
//!
//! Uses the heed crate (Rust bindings for LMDB) to keep cached listings in a
//! memory-mapped, crash-safe key-value file.
//!
//! # Layout
//!
//! - Keys: [`CollectionScopedKey`] encodings, so each collection is one
//!   contiguous, position-ordered key range
//! - Values: `[cached_at millis: 8 bytes LE][json payload]`
//!
//! # Thread Safety
//!
//! LMDB provides ACID transactions. Reads open a read transaction per call;
//! [`OrderedStore::transaction`] maps one-to-one onto an LMDB write
//! transaction, which LMDB serializes across threads.

use std::marker::PhantomData;
use std::ops::Bound;
use std::path::{Path, PathBuf};

use backfill_core::{
    BackfillError, BackfillResult, CachedItem, CollectionKey, ListingItem, PositionIndex,
    StorageError,
};
use chrono::{DateTime, Utc};
use heed::types::Bytes;
use heed::{Database, Env, EnvOpenOptions, RwTxn};
use tokio::sync::watch;

use super::scoped_key::{position_from_key, CollectionScopedKey};
use super::traits::{OrderedStore, StoreTxn};
use crate::change_feed::{ChangeFeed, Watermark};

/// Error type for LMDB store operations.
#[derive(Debug, thiserror::Error)]
pub enum LmdbStoreError {
    /// Failed to open or create the LMDB environment.
    #[error("Failed to open LMDB environment: {0}")]
    EnvOpen(String),

    /// Failed to open the database within the environment.
    #[error("Failed to open database: {0}")]
    DbOpen(String),

    /// Transaction error.
    #[error("Transaction error: {0}")]
    Transaction(String),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Deserialization error.
    #[error("Deserialization error: {0}")]
    Deserialization(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<LmdbStoreError> for BackfillError {
    fn from(e: LmdbStoreError) -> Self {
        let storage = match e {
            LmdbStoreError::Serialization(reason) => StorageError::Serialization { reason },
            LmdbStoreError::Deserialization(reason) => StorageError::Deserialization { reason },
            other => StorageError::TransactionFailed {
                reason: other.to_string(),
            },
        };
        BackfillError::Storage(storage)
    }
}

fn txn_err(e: heed::Error) -> LmdbStoreError {
    LmdbStoreError::Transaction(e.to_string())
}

/// LMDB-backed ordered store.
///
/// # Example
///
/// ```ignore
/// use backfill_storage::{LmdbOrderedStore, OrderedStore};
///
/// let store: LmdbOrderedStore<Post> = LmdbOrderedStore::open("/tmp/backfill", 64)?;
/// let first_page = store.read_range(&collection, None, Some(10))?;
/// ```
pub struct LmdbOrderedStore<T> {
    /// The LMDB environment.
    env: Env,
    /// The main database (single unnamed database).
    db: Database<Bytes, Bytes>,
    feed: ChangeFeed,
    path: PathBuf,
    _payload: PhantomData<fn() -> T>,
}

impl<T> std::fmt::Debug for LmdbOrderedStore<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LmdbOrderedStore")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl<T: ListingItem> LmdbOrderedStore<T> {
    /// Open (or create) a store.
    ///
    /// # Arguments
    ///
    /// * `path` - Directory where LMDB files will be stored
    /// * `max_size_mb` - Maximum size of the database in megabytes
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The directory cannot be created
    /// - LMDB environment cannot be opened
    /// - Database cannot be created
    pub fn open<P: AsRef<Path>>(path: P, max_size_mb: usize) -> Result<Self, LmdbStoreError> {
        std::fs::create_dir_all(&path)?;

        // SAFETY: the environment is opened once per path by this process and
        // the file is never truncated or remapped behind LMDB's back.
        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(max_size_mb * 1024 * 1024)
                .max_dbs(1)
                .open(path.as_ref())
        }
        .map_err(|e| LmdbStoreError::EnvOpen(e.to_string()))?;

        let mut wtxn = env.write_txn().map_err(txn_err)?;
        let db: Database<Bytes, Bytes> = env
            .create_database(&mut wtxn, None)
            .map_err(|e| LmdbStoreError::DbOpen(e.to_string()))?;
        wtxn.commit().map_err(txn_err)?;

        tracing::debug!(path = %path.as_ref().display(), max_size_mb, "Opened LMDB ordered store");

        Ok(Self {
            env,
            db,
            feed: ChangeFeed::new(),
            path: path.as_ref().to_path_buf(),
            _payload: PhantomData,
        })
    }

    /// Directory holding the LMDB files.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Walk a collection's rows in key order (or reverse), stopping when
    /// `visit` returns false.
    fn scan(
        &self,
        collection: &CollectionKey,
        reverse: bool,
        mut visit: impl FnMut(&[u8], &[u8]) -> BackfillResult<bool>,
    ) -> BackfillResult<()> {
        let rtxn = self.env.read_txn().map_err(txn_err)?;
        let prefix = CollectionScopedKey::collection_prefix(collection);

        if reverse {
            let iter = self.db.rev_prefix_iter(&rtxn, &prefix).map_err(txn_err)?;
            for entry in iter {
                let (key, value) = entry.map_err(txn_err)?;
                if !visit(key, value)? {
                    break;
                }
            }
        } else {
            let iter = self.db.prefix_iter(&rtxn, &prefix).map_err(txn_err)?;
            for entry in iter {
                let (key, value) = entry.map_err(txn_err)?;
                if !visit(key, value)? {
                    break;
                }
            }
        }
        Ok(())
    }
}

fn encode_value<T: ListingItem>(item: &CachedItem<T>) -> Result<Vec<u8>, LmdbStoreError> {
    let payload = serde_json::to_vec(&item.payload)
        .map_err(|e| LmdbStoreError::Serialization(e.to_string()))?;
    let mut bytes = Vec::with_capacity(8 + payload.len());
    bytes.extend_from_slice(&item.cached_at.timestamp_millis().to_le_bytes());
    bytes.extend_from_slice(&payload);
    Ok(bytes)
}

fn decode_item<T: ListingItem>(
    collection: &CollectionKey,
    key: &[u8],
    value: &[u8],
) -> BackfillResult<CachedItem<T>> {
    if value.len() < 8 {
        return Err(LmdbStoreError::Deserialization("value shorter than timestamp".into()).into());
    }
    let timestamp_bytes: [u8; 8] = value[0..8]
        .try_into()
        .map_err(|_| LmdbStoreError::Deserialization("Invalid timestamp".into()))?;
    let cached_at = DateTime::from_timestamp_millis(i64::from_le_bytes(timestamp_bytes))
        .unwrap_or_else(Utc::now);
    let payload: T = serde_json::from_slice(&value[8..])
        .map_err(|e| LmdbStoreError::Deserialization(e.to_string()))?;

    Ok(CachedItem {
        collection: collection.clone(),
        position: position_from_key(key)?,
        cached_at,
        payload,
    })
}

/// Write transaction wrapper tracking which collections it touched.
struct LmdbTxn<'t, 'e> {
    db: Database<Bytes, Bytes>,
    wtxn: &'t mut RwTxn<'e>,
    touched: Vec<CollectionKey>,
}

impl LmdbTxn<'_, '_> {
    fn touch(&mut self, collection: &CollectionKey) {
        if !self.touched.contains(collection) {
            self.touched.push(collection.clone());
        }
    }
}

impl<T: ListingItem> StoreTxn<T> for LmdbTxn<'_, '_> {
    fn max_position_index(
        &self,
        collection: &CollectionKey,
    ) -> BackfillResult<Option<PositionIndex>> {
        let prefix = CollectionScopedKey::collection_prefix(collection);
        let mut iter = self
            .db
            .rev_prefix_iter(&*self.wtxn, &prefix)
            .map_err(txn_err)?;
        match iter.next() {
            Some(entry) => {
                let (key, _) = entry.map_err(txn_err)?;
                Ok(Some(position_from_key(key)?))
            }
            None => Ok(None),
        }
    }

    fn delete_by_collection(&mut self, collection: &CollectionKey) -> BackfillResult<u64> {
        let prefix = CollectionScopedKey::collection_prefix(collection);
        let keys: Vec<Vec<u8>> = {
            let iter = self.db.prefix_iter(&*self.wtxn, &prefix).map_err(txn_err)?;
            let mut keys = Vec::new();
            for entry in iter {
                let (key, _) = entry.map_err(txn_err)?;
                keys.push(key.to_vec());
            }
            keys
        };

        let mut deleted = 0u64;
        for key in &keys {
            if self.db.delete(&mut *self.wtxn, key).map_err(txn_err)? {
                deleted += 1;
            }
        }
        self.touch(collection);
        Ok(deleted)
    }

    fn insert_batch(&mut self, items: &[CachedItem<T>]) -> BackfillResult<()> {
        for item in items {
            let key = CollectionScopedKey::new(item.collection.clone(), item.position).encode();
            if self.db.get(&*self.wtxn, &key).map_err(txn_err)?.is_some() {
                return Err(StorageError::TransactionFailed {
                    reason: format!(
                        "position {} already occupied in {}",
                        item.position, item.collection
                    ),
                }
                .into());
            }
            let value = encode_value(item)?;
            self.db.put(&mut *self.wtxn, &key, &value).map_err(txn_err)?;
            self.touch(&item.collection);
        }
        Ok(())
    }
}

impl<T: ListingItem> OrderedStore<T> for LmdbOrderedStore<T> {
    fn transaction<R, F>(&self, work: F) -> BackfillResult<R>
    where
        F: FnOnce(&mut dyn StoreTxn<T>) -> BackfillResult<R>,
    {
        let mut wtxn = self.env.write_txn().map_err(txn_err)?;
        let mut txn = LmdbTxn {
            db: self.db,
            wtxn: &mut wtxn,
            touched: Vec::new(),
        };

        // Dropping `wtxn` without commit aborts everything `work` wrote.
        let result = work(&mut txn)?;
        let touched = txn.touched;
        wtxn.commit().map_err(txn_err)?;

        for collection in &touched {
            self.feed.publish(collection);
        }
        Ok(result)
    }

    fn read_range(
        &self,
        collection: &CollectionKey,
        after: Option<PositionIndex>,
        limit: Option<usize>,
    ) -> BackfillResult<Vec<CachedItem<T>>> {
        let limit = limit.unwrap_or(usize::MAX);
        let mut items = Vec::new();
        if limit == 0 {
            return Ok(items);
        }
        let Some(after) = after else {
            self.scan(collection, false, |key, value| {
                items.push(decode_item(collection, key, value)?);
                Ok(items.len() < limit)
            })?;
            return Ok(items);
        };
        let Some(first) = after.checked_add(1) else {
            return Ok(items);
        };

        // Keys of one collection sort by position, so the bounded range
        // starts at the first row past `after`.
        let lower = CollectionScopedKey::new(collection.clone(), first).encode();
        let upper = CollectionScopedKey::new(collection.clone(), PositionIndex::MAX).encode();
        let bounds = (Bound::Included(lower.as_slice()), Bound::Included(upper.as_slice()));

        let rtxn = self.env.read_txn().map_err(txn_err)?;
        for entry in self.db.range(&rtxn, &bounds).map_err(txn_err)? {
            let (key, value) = entry.map_err(txn_err)?;
            items.push(decode_item(collection, key, value)?);
            if items.len() >= limit {
                break;
            }
        }
        Ok(items)
    }

    fn item_at(
        &self,
        collection: &CollectionKey,
        position: PositionIndex,
    ) -> BackfillResult<Option<CachedItem<T>>> {
        let rtxn = self.env.read_txn().map_err(txn_err)?;
        let key = CollectionScopedKey::new(collection.clone(), position).encode();
        match self.db.get(&rtxn, &key).map_err(txn_err)? {
            Some(value) => Ok(Some(decode_item(collection, &key, value)?)),
            None => Ok(None),
        }
    }

    fn min_position_index(
        &self,
        collection: &CollectionKey,
    ) -> BackfillResult<Option<PositionIndex>> {
        let mut found = None;
        self.scan(collection, false, |key, _| {
            found = Some(position_from_key(key)?);
            Ok(false)
        })?;
        Ok(found)
    }

    fn max_position_index(
        &self,
        collection: &CollectionKey,
    ) -> BackfillResult<Option<PositionIndex>> {
        let mut found = None;
        self.scan(collection, true, |key, _| {
            found = Some(position_from_key(key)?);
            Ok(false)
        })?;
        Ok(found)
    }

    fn count(&self, collection: &CollectionKey) -> BackfillResult<u64> {
        let mut count = 0u64;
        self.scan(collection, false, |_, _| {
            count += 1;
            Ok(true)
        })?;
        Ok(count)
    }

    fn watch(&self, collection: &CollectionKey) -> watch::Receiver<Watermark> {
        self.feed.subscribe(collection)
    }
}
