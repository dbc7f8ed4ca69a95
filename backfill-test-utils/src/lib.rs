//! Backfill Test Utilities
//!
//! Shared test infrastructure for the backfill workspace:
//! - A scripted remote fetcher with call recording and an optional gate
//! - A store wrapper that injects transaction failures
//! - Proptest generators for payloads and collection keys
//! - Fixtures and assertions for common scenarios

pub use backfill_core::{
    BackfillError, BackfillResult, CachedItem, CollectionKey, Edge, FetchError, FetchMode,
    FetchRequest, ListingItem, LoadState, PositionIndex, RemoteFetcher, StorageError,
};
pub use backfill_storage::{InMemoryOrderedStore, OrderedStore, StoreTxn, Watermark};

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Notify, Semaphore};

// ============================================================================
// PAYLOAD FIXTURE
// ============================================================================

/// Minimal listing payload, shaped like a link in a forum listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Post {
    pub name: String,
    pub title: String,
    pub score: i64,
}

impl Post {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            title: format!("Title of {}", name),
            name,
            score: 0,
        }
    }
}

impl ListingItem for Post {
    fn cursor(&self) -> Option<String> {
        Some(self.name.clone())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ============================================================================
// MOCK FETCHER
// ============================================================================

/// Remote fetcher that replays queued responses in order.
///
/// Every call is recorded before it waits on the gate, so tests can observe
/// that a fetch has started while it is still in flight. An exhausted
/// script answers with an empty page.
pub struct ScriptedFetcher<T> {
    responses: Mutex<VecDeque<Result<Vec<T>, FetchError>>>,
    requests: Mutex<Vec<FetchRequest>>,
    gate: Option<Arc<Semaphore>>,
    called: Notify,
}

impl<T: ListingItem> ScriptedFetcher<T> {
    pub fn new() -> Self {
        Self {
            responses: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
            gate: None,
            called: Notify::new(),
        }
    }

    /// Fetcher whose calls block until [`release`](Self::release) is called.
    pub fn gated() -> Self {
        Self {
            gate: Some(Arc::new(Semaphore::new(0))),
            ..Self::new()
        }
    }

    pub fn push_ok(&self, items: Vec<T>) -> &Self {
        lock(&self.responses).push_back(Ok(items));
        self
    }

    pub fn push_err(&self, message: impl Into<String>) -> &Self {
        lock(&self.responses).push_back(Err(FetchError::new(message)));
        self
    }

    /// Let `n` gated calls proceed.
    pub fn release(&self, n: usize) {
        if let Some(gate) = &self.gate {
            gate.add_permits(n);
        }
    }

    pub fn calls(&self) -> usize {
        lock(&self.requests).len()
    }

    pub fn requests(&self) -> Vec<FetchRequest> {
        lock(&self.requests).clone()
    }

    /// Wait until at least `n` calls have started.
    pub async fn wait_for_calls(&self, n: usize) {
        loop {
            let notified = self.called.notified();
            if self.calls() >= n {
                return;
            }
            notified.await;
        }
    }
}

impl<T: ListingItem> Default for ScriptedFetcher<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<T: ListingItem> RemoteFetcher<T> for ScriptedFetcher<T> {
    async fn fetch(&self, request: &FetchRequest) -> Result<Vec<T>, FetchError> {
        lock(&self.requests).push(request.clone());
        self.called.notify_waiters();

        if let Some(gate) = &self.gate {
            if let Ok(permit) = gate.acquire().await {
                permit.forget();
            }
        }

        lock(&self.responses)
            .pop_front()
            .unwrap_or_else(|| Ok(Vec::new()))
    }
}

// ============================================================================
// MOCK STORE
// ============================================================================

/// In-memory store whose next transactions can be made to fail.
///
/// An injected failure is returned before the transaction's work runs, so
/// the wrapped store is left exactly as it was.
pub struct FaultyStore<T> {
    inner: InMemoryOrderedStore<T>,
    failures: AtomicUsize,
}

impl<T: ListingItem> FaultyStore<T> {
    pub fn new() -> Self {
        Self {
            inner: InMemoryOrderedStore::new(),
            failures: AtomicUsize::new(0),
        }
    }

    /// Fail the next `n` transactions.
    pub fn fail_next(&self, n: usize) {
        self.failures.store(n, Ordering::SeqCst);
    }

    pub fn inner(&self) -> &InMemoryOrderedStore<T> {
        &self.inner
    }

    fn take_failure(&self) -> bool {
        self.failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl<T: ListingItem> Default for FaultyStore<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: ListingItem> OrderedStore<T> for FaultyStore<T> {
    fn transaction<R, F>(&self, work: F) -> BackfillResult<R>
    where
        F: FnOnce(&mut dyn StoreTxn<T>) -> BackfillResult<R>,
    {
        if self.take_failure() {
            return Err(StorageError::TransactionFailed {
                reason: "injected failure".to_string(),
            }
            .into());
        }
        self.inner.transaction(work)
    }

    fn read_range(
        &self,
        collection: &CollectionKey,
        after: Option<PositionIndex>,
        limit: Option<usize>,
    ) -> BackfillResult<Vec<CachedItem<T>>> {
        self.inner.read_range(collection, after, limit)
    }

    fn item_at(
        &self,
        collection: &CollectionKey,
        position: PositionIndex,
    ) -> BackfillResult<Option<CachedItem<T>>> {
        self.inner.item_at(collection, position)
    }

    fn min_position_index(
        &self,
        collection: &CollectionKey,
    ) -> BackfillResult<Option<PositionIndex>> {
        self.inner.min_position_index(collection)
    }

    fn max_position_index(
        &self,
        collection: &CollectionKey,
    ) -> BackfillResult<Option<PositionIndex>> {
        self.inner.max_position_index(collection)
    }

    fn count(&self, collection: &CollectionKey) -> BackfillResult<u64> {
        self.inner.count(collection)
    }

    fn watch(&self, collection: &CollectionKey) -> watch::Receiver<Watermark> {
        self.inner.watch(collection)
    }
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    use super::*;
    use proptest::prelude::*;

    /// Collection keys drawn from a small alphabet so prefixes collide often.
    pub fn arb_collection_key() -> impl Strategy<Value = CollectionKey> {
        "[a-z]{1,12}".prop_map(|s| CollectionKey::new(s).expect("generated key is valid"))
    }

    pub fn arb_post() -> impl Strategy<Value = Post> {
        ("t3_[a-z0-9]{6}", ".{0,40}", -1000i64..100_000).prop_map(|(name, title, score)| Post {
            name,
            title,
            score,
        })
    }

    /// A remote page of up to `max_len` posts.
    pub fn arb_page(max_len: usize) -> impl Strategy<Value = Vec<Post>> {
        proptest::collection::vec(arb_post(), 0..=max_len)
    }
}

// ============================================================================
// FIXTURES
// ============================================================================

pub mod fixtures {
    use super::*;

    pub fn key(name: &str) -> CollectionKey {
        CollectionKey::new(name).expect("fixture key is valid")
    }

    pub fn post(name: &str) -> Post {
        Post::new(name)
    }

    pub fn posts(names: &[&str]) -> Vec<Post> {
        names.iter().map(|n| Post::new(*n)).collect()
    }

    /// An in-memory store already holding `names` at positions 0.. in `collection`.
    pub fn seeded_store(collection: &CollectionKey, names: &[&str]) -> InMemoryOrderedStore<Post> {
        let store = InMemoryOrderedStore::new();
        let rows: Vec<CachedItem<Post>> = names
            .iter()
            .enumerate()
            .map(|(i, n)| CachedItem::new(collection.clone(), i as u64, Post::new(*n)))
            .collect();
        store
            .transaction(|txn| txn.insert_batch(&rows))
            .expect("seeding the store should succeed");
        store
    }
}

// ============================================================================
// ASSERTIONS
// ============================================================================

pub mod assertions {
    use super::*;

    /// `(name, position)` pairs of a collection, in position order.
    pub fn positions_of<S: OrderedStore<Post>>(
        store: &S,
        collection: &CollectionKey,
    ) -> Vec<(String, PositionIndex)> {
        store
            .read_all(collection)
            .expect("reading the store should succeed")
            .into_iter()
            .map(|item| (item.payload.name, item.position))
            .collect()
    }

    /// Assert a collection holds exactly `expected` as `(name, position)`.
    pub fn assert_positions<S: OrderedStore<Post>>(
        store: &S,
        collection: &CollectionKey,
        expected: &[(&str, PositionIndex)],
    ) {
        let actual = positions_of(store, collection);
        let expected: Vec<(String, PositionIndex)> = expected
            .iter()
            .map(|(name, position)| (name.to_string(), *position))
            .collect();
        assert_eq!(actual, expected, "collection {} contents differ", collection);
    }

    pub fn assert_error_state(state: &LoadState, message: &str) {
        match state {
            LoadState::Error(actual) => assert_eq!(actual, message),
            other => panic!("expected Error({:?}), got {:?}", message, other),
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
