//! Boundary coordination: turning "the consumer reached an edge" into at
//! most one in-flight fetch per (collection, edge).
//!
//! The coordinator never writes to the store itself. A boundary fetch reads
//! the edge item's cursor, asks the fetcher for the next page and hands the
//! result to the [`Merger`], which appends it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use backfill_core::{
    BackfillConfig, BackfillResult, CollectionKey, Edge, FetchRequest, ListingItem, LoadState,
    RemoteFetcher,
};
use backfill_storage::{MergeOutcome, Merger, OrderedStore};
use tracing::{info, trace, warn};

use crate::executor::TaskExecutor;
use crate::load_state::{LoadStatePublisher, LoadStateTracker};

/// Start and end fetch states of one collection, plus their aggregate.
///
/// Every edge transition goes through `transition`, and the aggregate is
/// published before the edge state that produced it. A caller woken by an
/// edge tracker therefore always reads an up-to-date aggregate.
struct EdgeStates {
    start: LoadStatePublisher,
    end: LoadStatePublisher,
    network: LoadStatePublisher,
    transition: Mutex<()>,
}

impl EdgeStates {
    fn new(collection: &CollectionKey, capacity: usize) -> Self {
        let stream =
            |suffix: &str| LoadStatePublisher::new(format!("{}:{}", collection, suffix), capacity);
        Self {
            start: stream("start"),
            end: stream("end"),
            network: stream("network"),
            transition: Mutex::new(()),
        }
    }

    fn edge(&self, edge: Edge) -> &LoadStatePublisher {
        match edge {
            Edge::Start => &self.start,
            Edge::End => &self.end,
        }
    }

    fn other(&self, edge: Edge) -> &LoadStatePublisher {
        match edge {
            Edge::Start => &self.end,
            Edge::End => &self.start,
        }
    }

    /// Claim the edge's fetch. Returns false if one is already loading.
    fn begin(&self, edge: Edge) -> bool {
        let _guard = self.transition.lock().unwrap_or_else(PoisonError::into_inner);
        if !self.edge(edge).try_begin() {
            return false;
        }
        self.network.set(LoadState::Loading);
        true
    }

    /// Record the outcome of the edge's fetch.
    fn settle(&self, edge: Edge, state: LoadState) {
        let _guard = self.transition.lock().unwrap_or_else(PoisonError::into_inner);
        let network = aggregate_state(&state, &self.other(edge).current());
        self.network.set(network);
        self.edge(edge).set(state);
    }
}

/// Collection-wide state from one edge's outcome and the other edge's state.
///
/// Loading while either edge loads. Otherwise an error on either edge wins
/// over a successful load, so a failed edge stays visible until it is
/// retried.
fn aggregate_state(settled: &LoadState, other: &LoadState) -> LoadState {
    match (settled, other) {
        (_, LoadState::Loading) => LoadState::Loading,
        (LoadState::Error(_), _) => settled.clone(),
        (_, LoadState::Error(_)) => other.clone(),
        _ => settled.clone(),
    }
}

/// Load states and page size of one collection.
struct CollectionStreams {
    edges: Arc<EdgeStates>,
    page_size: usize,
}

impl CollectionStreams {
    fn new(collection: &CollectionKey, config: &BackfillConfig) -> Self {
        Self {
            edges: Arc::new(EdgeStates::new(collection, config.state_channel_capacity)),
            page_size: config.network_page_size,
        }
    }
}

/// Turns boundary signals into deduplicated background fetches.
///
/// Per-collection state is created on first use and kept for the life of
/// the coordinator, so trackers handed out earlier keep receiving updates.
/// Memory therefore grows with the number of distinct collections seen.
pub struct BoundaryCoordinator<T, S, F> {
    fetcher: Arc<F>,
    merger: Arc<Merger<T, S>>,
    executor: Arc<TaskExecutor>,
    config: BackfillConfig,
    streams: Mutex<HashMap<CollectionKey, CollectionStreams>>,
}

impl<T, S, F> BoundaryCoordinator<T, S, F>
where
    T: ListingItem,
    S: OrderedStore<T>,
    F: RemoteFetcher<T> + 'static,
{
    pub fn new(
        fetcher: Arc<F>,
        merger: Arc<Merger<T, S>>,
        executor: Arc<TaskExecutor>,
        config: BackfillConfig,
    ) -> Self {
        Self {
            fetcher,
            merger,
            executor,
            config,
            streams: Mutex::new(HashMap::new()),
        }
    }

    fn with_streams<R>(
        &self,
        collection: &CollectionKey,
        f: impl FnOnce(&mut CollectionStreams) -> R,
    ) -> R {
        let mut streams = self.streams.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = streams
            .entry(collection.clone())
            .or_insert_with(|| CollectionStreams::new(collection, &self.config));
        f(entry)
    }

    /// Page size used for this collection's remote fetches from now on.
    pub fn register_page_size(&self, collection: &CollectionKey, page_size: usize) {
        self.with_streams(collection, |s| s.page_size = page_size);
    }

    pub fn page_size(&self, collection: &CollectionKey) -> usize {
        self.with_streams(collection, |s| s.page_size)
    }

    pub fn boundary_state(&self, collection: &CollectionKey, edge: Edge) -> LoadStateTracker {
        self.with_streams(collection, |s| s.edges.edge(edge).tracker())
    }

    /// Aggregated state of every boundary fetch on the collection.
    pub fn network_state(&self, collection: &CollectionKey) -> LoadStateTracker {
        self.with_streams(collection, |s| s.edges.network.tracker())
    }

    /// Signal that the consumer reached `edge` of the collection's window.
    ///
    /// Starts a fetch unless one is already loading for this edge, in which
    /// case the call does nothing. Returns the edge's load state either way.
    pub fn on_boundary_reached(&self, collection: &CollectionKey, edge: Edge) -> LoadStateTracker {
        let (edges, page_size) =
            self.with_streams(collection, |s| (Arc::clone(&s.edges), s.page_size));
        let tracker = edges.edge(edge).tracker();

        if !edges.begin(edge) {
            trace!(collection = %collection, edge = ?edge, "Boundary fetch already in flight");
            return tracker;
        }

        let fetcher = Arc::clone(&self.fetcher);
        let merger = Arc::clone(&self.merger);
        let key = collection.clone();
        let task_edges = Arc::clone(&edges);

        let spawned = self.executor.spawn("boundary_fetch", async move {
            let result = fetch_boundary(&*fetcher, &merger, &key, edge, page_size).await;
            match result {
                Ok(outcome) => {
                    info!(
                        collection = %key,
                        edge = ?edge,
                        inserted = outcome.inserted,
                        last_position = ?outcome.last_position,
                        "Boundary fetch complete"
                    );
                    task_edges.settle(edge, LoadState::Loaded);
                }
                Err(e) => {
                    warn!(collection = %key, edge = ?edge, error = %e, "Boundary fetch failed");
                    task_edges.settle(edge, LoadState::Error(e.to_string()));
                }
            }
        });

        if let Err(e) = spawned {
            warn!(collection = %collection, edge = ?edge, error = %e, "Boundary fetch not scheduled");
            edges.settle(edge, LoadState::Error(e.to_string()));
        }
        tracker
    }
}

/// Cursor of the first or last cached item, used to continue paging.
pub(crate) fn edge_anchor<T, S>(
    store: &S,
    collection: &CollectionKey,
    edge: Edge,
) -> BackfillResult<Option<String>>
where
    T: ListingItem,
    S: OrderedStore<T>,
{
    let position = match edge {
        Edge::Start => store.min_position_index(collection)?,
        Edge::End => store.max_position_index(collection)?,
    };
    let Some(position) = position else {
        return Ok(None);
    };
    Ok(store
        .item_at(collection, position)?
        .and_then(|item| item.payload.cursor()))
}

async fn fetch_boundary<T, S, F>(
    fetcher: &F,
    merger: &Merger<T, S>,
    collection: &CollectionKey,
    edge: Edge,
    page_size: usize,
) -> BackfillResult<MergeOutcome>
where
    T: ListingItem,
    S: OrderedStore<T>,
    F: RemoteFetcher<T>,
{
    let anchor = edge_anchor(merger.store().as_ref(), collection, edge)?;
    let request = FetchRequest::boundary(collection.clone(), edge, page_size, anchor);
    let items = fetcher.fetch(&request).await?;
    merger.append(collection, items).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use backfill_storage::InMemoryOrderedStore;
    use backfill_test_utils::fixtures::{key, posts, seeded_store};
    use backfill_test_utils::{FetchMode, Post, ScriptedFetcher};

    type Coordinator = BoundaryCoordinator<Post, InMemoryOrderedStore<Post>, ScriptedFetcher<Post>>;

    fn coordinator(
        store: InMemoryOrderedStore<Post>,
        fetcher: ScriptedFetcher<Post>,
    ) -> (Coordinator, Arc<InMemoryOrderedStore<Post>>, Arc<ScriptedFetcher<Post>>) {
        let store = Arc::new(store);
        let fetcher = Arc::new(fetcher);
        let executor = Arc::new(TaskExecutor::new(4).expect("runtime available"));
        let coordinator = BoundaryCoordinator::new(
            Arc::clone(&fetcher),
            Arc::new(Merger::new(Arc::clone(&store))),
            executor,
            BackfillConfig::default(),
        );
        (coordinator, store, fetcher)
    }

    #[tokio::test]
    async fn test_end_boundary_appends_with_anchor() {
        let x = key("X");
        let fetcher = ScriptedFetcher::new();
        fetcher.push_ok(posts(&["c", "d"]));
        let (coordinator, store, fetcher) = coordinator(seeded_store(&x, &["a", "b"]), fetcher);

        let state = coordinator.on_boundary_reached(&x, Edge::End).settled().await;
        assert_eq!(state, LoadState::Loaded);
        assert_eq!(coordinator.network_state(&x).current(), LoadState::Loaded);

        let request = &fetcher.requests()[0];
        assert_eq!(request.mode, FetchMode::Boundary(Edge::End));
        assert_eq!(request.anchor.as_deref(), Some("b"));
        assert_eq!(request.page_size, 10);
        assert_eq!(store.max_position_index(&x).expect("read"), Some(3));
    }

    #[tokio::test]
    async fn test_start_boundary_uses_first_item_cursor() {
        let x = key("X");
        let (coordinator, _store, fetcher) =
            coordinator(seeded_store(&x, &["a", "b"]), ScriptedFetcher::new());

        coordinator.on_boundary_reached(&x, Edge::Start).settled().await;
        assert_eq!(fetcher.requests()[0].anchor.as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn test_duplicate_signal_while_loading_is_ignored() {
        let x = key("X");
        let (coordinator, _store, fetcher) =
            coordinator(InMemoryOrderedStore::new(), ScriptedFetcher::gated());

        let first = coordinator.on_boundary_reached(&x, Edge::End);
        fetcher.wait_for_calls(1).await;
        let second = coordinator.on_boundary_reached(&x, Edge::End);
        assert_eq!(second.current(), LoadState::Loading);

        fetcher.release(1);
        assert_eq!(first.settled().await, LoadState::Loaded);
        assert_eq!(fetcher.calls(), 1);
    }

    #[tokio::test]
    async fn test_failure_sets_error_and_allows_retry() {
        let x = key("X");
        let fetcher = ScriptedFetcher::new();
        fetcher.push_err("timeout").push_ok(posts(&["a"]));
        let (coordinator, store, fetcher) = coordinator(InMemoryOrderedStore::new(), fetcher);

        let state = coordinator.on_boundary_reached(&x, Edge::End).settled().await;
        assert_eq!(state, LoadState::Error("timeout".to_string()));
        assert_eq!(store.count(&x).expect("read"), 0);
        assert_eq!(coordinator.network_state(&x).current(), state);

        let retried = coordinator.on_boundary_reached(&x, Edge::End).settled().await;
        assert_eq!(retried, LoadState::Loaded);
        assert_eq!(fetcher.calls(), 2);
        assert_eq!(store.count(&x).expect("read"), 1);
    }

    #[tokio::test]
    async fn test_registered_page_size_is_used() {
        let x = key("X");
        let (coordinator, _store, fetcher) =
            coordinator(InMemoryOrderedStore::new(), ScriptedFetcher::new());

        coordinator.register_page_size(&x, 25);
        coordinator.on_boundary_reached(&x, Edge::End).settled().await;
        assert_eq!(fetcher.requests()[0].page_size, 25);
        assert_eq!(coordinator.page_size(&key("other")), 10);
    }

    #[tokio::test]
    async fn test_edges_are_tracked_independently() {
        let x = key("X");
        let (coordinator, _store, fetcher) =
            coordinator(InMemoryOrderedStore::new(), ScriptedFetcher::gated());

        coordinator.on_boundary_reached(&x, Edge::End);
        coordinator.on_boundary_reached(&x, Edge::Start);
        fetcher.wait_for_calls(2).await;

        fetcher.release(2);
        coordinator.boundary_state(&x, Edge::End).settled().await;
        coordinator.boundary_state(&x, Edge::Start).settled().await;
        assert_eq!(fetcher.calls(), 2);
    }

    #[tokio::test]
    async fn test_network_state_loading_until_both_edges_settle() {
        let x = key("X");
        let (coordinator, _store, fetcher) =
            coordinator(InMemoryOrderedStore::new(), ScriptedFetcher::gated());
        fetcher.push_ok(posts(&["a"])).push_ok(posts(&["b"]));
        let network = coordinator.network_state(&x);

        coordinator.on_boundary_reached(&x, Edge::End);
        fetcher.wait_for_calls(1).await;
        coordinator.on_boundary_reached(&x, Edge::Start);
        fetcher.wait_for_calls(2).await;

        fetcher.release(1);
        let end = coordinator.boundary_state(&x, Edge::End).settled().await;
        assert_eq!(end, LoadState::Loaded);
        assert_eq!(coordinator.boundary_state(&x, Edge::Start).current(), LoadState::Loading);
        assert_eq!(network.current(), LoadState::Loading);

        fetcher.release(1);
        coordinator.boundary_state(&x, Edge::Start).settled().await;
        assert_eq!(network.current(), LoadState::Loaded);
    }

    #[tokio::test]
    async fn test_edge_error_survives_other_edge_success() {
        let x = key("X");
        let (coordinator, _store, fetcher) =
            coordinator(InMemoryOrderedStore::new(), ScriptedFetcher::gated());
        fetcher.push_err("start failed").push_ok(posts(&["a"]));

        coordinator.on_boundary_reached(&x, Edge::Start);
        fetcher.wait_for_calls(1).await;
        coordinator.on_boundary_reached(&x, Edge::End);
        fetcher.wait_for_calls(2).await;

        fetcher.release(1);
        coordinator.boundary_state(&x, Edge::Start).settled().await;
        assert_eq!(coordinator.network_state(&x).current(), LoadState::Loading);

        fetcher.release(1);
        let end = coordinator.boundary_state(&x, Edge::End).settled().await;
        assert_eq!(end, LoadState::Loaded);
        assert_eq!(
            coordinator.network_state(&x).current(),
            LoadState::Error("start failed".to_string())
        );
    }

    #[test]
    fn test_aggregate_state() {
        let err = LoadState::Error("offline".to_string());
        assert_eq!(aggregate_state(&LoadState::Loaded, &LoadState::Loading), LoadState::Loading);
        assert_eq!(aggregate_state(&err, &LoadState::Loading), LoadState::Loading);
        assert_eq!(aggregate_state(&LoadState::Loaded, &LoadState::Idle), LoadState::Loaded);
        assert_eq!(aggregate_state(&LoadState::Loaded, &err), err);
        assert_eq!(aggregate_state(&err, &LoadState::Loaded), err);
    }

    #[tokio::test]
    async fn test_signal_after_shutdown_reports_error() {
        let x = key("X");
        let (coordinator, _store, fetcher) =
            coordinator(InMemoryOrderedStore::new(), ScriptedFetcher::new());

        coordinator.executor.shutdown().await;
        let state = coordinator.on_boundary_reached(&x, Edge::End).current();
        assert!(state
            .error_message()
            .is_some_and(|m| m.contains("shut down")));
        assert_eq!(fetcher.calls(), 0);
    }
}
