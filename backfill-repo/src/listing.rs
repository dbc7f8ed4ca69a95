//! Paged, observable views over a cached collection.
//!
//! A [`PagedSequence`] is a lazy handle: nothing is read until a consumer
//! subscribes or asks for a snapshot, and it can be subscribed to any
//! number of times. Each [`PageStream`] yields the store's current contents
//! first and then a fresh snapshot after every committed write to the
//! collection. Reads never touch the network and never fail; a storage read
//! error is logged and shows up as an empty snapshot.
//!
//! Consumers report which offset they are showing through
//! [`PagedSequence::report_cursor`]; coming near an edge of the window
//! triggers a boundary fetch.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use backfill_core::{CachedItem, CollectionKey, Edge, ListingItem, LoadState, PositionIndex, RemoteFetcher};
use backfill_storage::{OrderedStore, Watermark};
use futures_util::stream::{self, Stream};
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::boundary::detect_boundary;
use crate::coordinator::BoundaryCoordinator;
use crate::load_state::LoadStateTracker;

/// One page of a snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct Page<T> {
    /// Zero-based page number within the snapshot.
    pub index: usize,
    pub items: Vec<CachedItem<T>>,
}

/// Immutable view of a collection at one point in time.
#[derive(Debug, Clone)]
pub struct PagedSnapshot<T> {
    collection: CollectionKey,
    watermark: Watermark,
    page_size: usize,
    items: Vec<CachedItem<T>>,
}

impl<T: Clone> PagedSnapshot<T> {
    pub fn collection(&self) -> &CollectionKey {
        &self.collection
    }

    /// Watermark of the last commit this snapshot includes.
    pub fn watermark(&self) -> Watermark {
        self.watermark
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn items(&self) -> &[CachedItem<T>] {
        &self.items
    }

    pub fn get(&self, offset: usize) -> Option<&CachedItem<T>> {
        self.items.get(offset)
    }

    pub fn page_count(&self) -> usize {
        self.items.len().div_ceil(self.page_size)
    }

    pub fn page(&self, index: usize) -> Option<Page<T>> {
        self.items.chunks(self.page_size).nth(index).map(|chunk| Page {
            index,
            items: chunk.to_vec(),
        })
    }

    pub fn pages(&self) -> Vec<Page<T>> {
        self.items
            .chunks(self.page_size)
            .enumerate()
            .map(|(index, chunk)| Page {
                index,
                items: chunk.to_vec(),
            })
            .collect()
    }

    pub fn first_position(&self) -> Option<PositionIndex> {
        self.items.first().map(|item| item.position)
    }

    pub fn last_position(&self) -> Option<PositionIndex> {
        self.items.last().map(|item| item.position)
    }
}

fn read_snapshot<T, S>(
    store: &S,
    collection: &CollectionKey,
    page_size: usize,
    watermark: Watermark,
) -> PagedSnapshot<T>
where
    T: ListingItem,
    S: OrderedStore<T>,
{
    let items = store.read_all(collection).unwrap_or_else(|e| {
        warn!(collection = %collection, error = %e, "Failed to read collection, serving empty snapshot");
        Vec::new()
    });
    PagedSnapshot {
        collection: collection.clone(),
        watermark,
        page_size,
        items,
    }
}

/// Lazy, restartable paged view of one collection.
pub struct PagedSequence<T, S, F> {
    collection: CollectionKey,
    page_size: usize,
    prefetch_distance: usize,
    store: Arc<S>,
    coordinator: Arc<BoundaryCoordinator<T, S, F>>,
    /// Watermark sequence at which each edge was last signalled.
    signalled: Arc<Mutex<HashMap<Edge, u64>>>,
}

impl<T, S, F> Clone for PagedSequence<T, S, F> {
    fn clone(&self) -> Self {
        Self {
            collection: self.collection.clone(),
            page_size: self.page_size,
            prefetch_distance: self.prefetch_distance,
            store: Arc::clone(&self.store),
            coordinator: Arc::clone(&self.coordinator),
            signalled: Arc::clone(&self.signalled),
        }
    }
}

impl<T, S, F> PagedSequence<T, S, F>
where
    T: ListingItem,
    S: OrderedStore<T>,
    F: RemoteFetcher<T> + 'static,
{
    pub(crate) fn new(
        collection: CollectionKey,
        page_size: usize,
        prefetch_distance: usize,
        store: Arc<S>,
        coordinator: Arc<BoundaryCoordinator<T, S, F>>,
    ) -> Self {
        Self {
            collection,
            page_size: page_size.max(1),
            prefetch_distance,
            store,
            coordinator,
            signalled: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn collection(&self) -> &CollectionKey {
        &self.collection
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// What the store holds right now.
    pub fn snapshot(&self) -> PagedSnapshot<T> {
        let watermark = *self.store.watch(&self.collection).borrow();
        read_snapshot(self.store.as_ref(), &self.collection, self.page_size, watermark)
    }

    /// Start a new stream of snapshots.
    ///
    /// If the first snapshot is empty, an [`Edge::End`] boundary is signalled
    /// so the first page gets loaded.
    pub fn subscribe(&self) -> PageStream<T, S> {
        let mut stream = PageStream {
            collection: self.collection.clone(),
            page_size: self.page_size,
            store: Arc::clone(&self.store),
            rx: self.store.watch(&self.collection),
            primed: None,
        };
        let first = stream.read_current();
        if first.is_empty() {
            self.report_cursor(&first, 0);
        }
        stream.primed = Some(first);
        stream
    }

    /// Report that the consumer is showing `offset` of `snapshot`.
    ///
    /// Signals the coordinator when the offset is within the prefetch
    /// distance of an edge. The start edge is not signalled while the
    /// snapshot begins at the collection's head; newer items arrive through
    /// a refresh. Each edge is signalled at most once per snapshot
    /// watermark, unless its last fetch failed. Returns the edge that was
    /// signalled.
    pub fn report_cursor(&self, snapshot: &PagedSnapshot<T>, offset: usize) -> Option<Edge> {
        let edge = detect_boundary(snapshot.len(), offset, self.prefetch_distance)?;
        if edge == Edge::Start && self.starts_at_head(snapshot) {
            return None;
        }
        let sequence = snapshot.watermark().sequence;
        let failed = matches!(
            self.coordinator.boundary_state(&self.collection, edge).current(),
            LoadState::Error(_)
        );

        {
            let mut signalled = self.signalled.lock().unwrap_or_else(PoisonError::into_inner);
            if signalled.get(&edge) == Some(&sequence) && !failed {
                return None;
            }
            signalled.insert(edge, sequence);
        }

        debug!(
            collection = %self.collection,
            edge = ?edge,
            offset = offset,
            window = snapshot.len(),
            "Consumer reached boundary"
        );
        self.coordinator.on_boundary_reached(&self.collection, edge);
        Some(edge)
    }
}

impl<T, S, F> PagedSequence<T, S, F>
where
    T: ListingItem,
    S: OrderedStore<T>,
{
    fn starts_at_head(&self, snapshot: &PagedSnapshot<T>) -> bool {
        match self.store.min_position_index(&self.collection) {
            Ok(head) => snapshot.first_position() == head,
            Err(e) => {
                warn!(collection = %self.collection, error = %e, "Failed to read collection head");
                true
            }
        }
    }
}

/// Snapshots of one collection, starting with its current contents.
pub struct PageStream<T, S> {
    collection: CollectionKey,
    page_size: usize,
    store: Arc<S>,
    rx: watch::Receiver<Watermark>,
    primed: Option<PagedSnapshot<T>>,
}

impl<T, S> PageStream<T, S>
where
    T: ListingItem,
    S: OrderedStore<T>,
{
    fn read_current(&mut self) -> PagedSnapshot<T> {
        let watermark = *self.rx.borrow_and_update();
        read_snapshot(self.store.as_ref(), &self.collection, self.page_size, watermark)
    }

    /// The next snapshot. The first call returns immediately; later calls
    /// wait for a commit to the collection.
    pub async fn next(&mut self) -> Option<PagedSnapshot<T>> {
        if let Some(first) = self.primed.take() {
            return Some(first);
        }
        self.rx.changed().await.ok()?;
        Some(self.read_current())
    }

    pub fn into_stream(self) -> impl Stream<Item = PagedSnapshot<T>> + Send + 'static {
        stream::unfold(self, |mut pages| async move {
            let snapshot = pages.next().await?;
            Some((snapshot, pages))
        })
    }
}

/// What [`Repository::listing`](crate::Repository::listing) returns.
pub struct Listing<T, S, F> {
    pub pages: PagedSequence<T, S, F>,
    /// Aggregated state of the collection's boundary fetches.
    pub load_state: LoadStateTracker,
}
