//! Read-through repository over an ordered store and a remote fetcher.
//!
//! Consumers only ever read from the store. Network results reach them
//! indirectly: a fetch is merged into the store, the commit bumps the
//! collection's watermark, and every open [`PageStream`](crate::PageStream)
//! emits a new snapshot.
//!
//! Refresh and boundary fetches on the same collection may overlap. Their
//! merges are serialized by the merger's per-collection write lock, so an
//! append that commits after a refresh continues numbering from the
//! refreshed rows.

use std::sync::Arc;

use backfill_core::{
    BackfillConfig, BackfillResult, CollectionKey, Edge, ExecutorError, FetchRequest, ListingItem,
    LoadState, RemoteFetcher,
};
use backfill_storage::{Merger, OrderedStore};
use tokio::runtime::Handle;
use tracing::{info, warn};

use crate::coordinator::BoundaryCoordinator;
use crate::executor::TaskExecutor;
use crate::listing::{Listing, PagedSequence};
use crate::load_state::{LoadStatePublisher, LoadStateTracker};

pub struct Repository<T, S, F> {
    config: BackfillConfig,
    store: Arc<S>,
    fetcher: Arc<F>,
    merger: Arc<Merger<T, S>>,
    coordinator: Arc<BoundaryCoordinator<T, S, F>>,
    executor: Arc<TaskExecutor>,
}

impl<T, S, F> Repository<T, S, F>
where
    T: ListingItem,
    S: OrderedStore<T>,
    F: RemoteFetcher<T> + 'static,
{
    /// Repository whose background work runs on the current tokio runtime.
    pub fn new(store: Arc<S>, fetcher: Arc<F>, config: BackfillConfig) -> BackfillResult<Self> {
        let handle = Handle::try_current().map_err(|_| ExecutorError::NoRuntime)?;
        Self::with_handle(store, fetcher, config, handle)
    }

    /// Repository whose background work runs on `handle`.
    pub fn with_handle(
        store: Arc<S>,
        fetcher: Arc<F>,
        config: BackfillConfig,
        handle: Handle,
    ) -> BackfillResult<Self> {
        config.validate()?;

        let executor = Arc::new(TaskExecutor::with_handle(handle, config.max_concurrent_tasks));
        let merger = Arc::new(Merger::new(Arc::clone(&store)));
        let coordinator = Arc::new(BoundaryCoordinator::new(
            Arc::clone(&fetcher),
            Arc::clone(&merger),
            Arc::clone(&executor),
            config.clone(),
        ));

        info!(
            network_page_size = config.network_page_size,
            prefetch_distance = config.prefetch_distance,
            max_concurrent_tasks = config.max_concurrent_tasks,
            "Repository created"
        );

        Ok(Self {
            config,
            store,
            fetcher,
            merger,
            coordinator,
            executor,
        })
    }

    pub fn config(&self) -> &BackfillConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Paged view of a collection plus the state of its boundary fetches.
    ///
    /// `page_size` splits snapshots into pages and sizes the collection's
    /// remote fetches from now on. A page size of 0 falls back to the
    /// configured default.
    pub fn listing(&self, collection: &CollectionKey, page_size: usize) -> Listing<T, S, F> {
        let page_size = if page_size == 0 {
            warn!(
                collection = %collection,
                fallback = self.config.network_page_size,
                "Page size 0 requested, using configured default"
            );
            self.config.network_page_size
        } else {
            page_size
        };
        self.coordinator.register_page_size(collection, page_size);

        Listing {
            pages: PagedSequence::new(
                collection.clone(),
                page_size,
                self.config.prefetch_distance,
                Arc::clone(&self.store),
                Arc::clone(&self.coordinator),
            ),
            load_state: self.coordinator.network_state(collection),
        }
    }

    /// Fetch the first page again and replace the cached collection with it.
    ///
    /// Every call gets its own tracker. On failure the cached rows are left
    /// untouched.
    pub fn refresh(&self, collection: &CollectionKey) -> LoadStateTracker {
        let publisher = Arc::new(LoadStatePublisher::new(
            format!("{}:refresh", collection),
            self.config.state_channel_capacity,
        ));
        let tracker = publisher.tracker();
        publisher.set(LoadState::Loading);

        let request = FetchRequest::refresh(collection.clone(), self.coordinator.page_size(collection));
        let fetcher = Arc::clone(&self.fetcher);
        let merger = Arc::clone(&self.merger);
        let task_publisher = Arc::clone(&publisher);

        let spawned = self.executor.spawn("refresh", async move {
            let result = run_refresh(&*fetcher, &merger, &request).await;
            match result {
                Ok(replaced) => {
                    info!(
                        collection = %request.collection,
                        inserted = replaced.inserted,
                        cleared = replaced.cleared,
                        "Refresh complete"
                    );
                    task_publisher.set(LoadState::Loaded);
                }
                Err(e) => {
                    warn!(collection = %request.collection, error = %e, "Refresh failed");
                    task_publisher.set(LoadState::Error(e.to_string()));
                }
            }
        });

        if let Err(e) = spawned {
            warn!(collection = %collection, error = %e, "Refresh not scheduled");
            publisher.set(LoadState::Error(e.to_string()));
        }
        tracker
    }

    /// Signal an edge directly, without going through a listing.
    pub fn on_boundary_reached(&self, collection: &CollectionKey, edge: Edge) -> LoadStateTracker {
        self.coordinator.on_boundary_reached(collection, edge)
    }

    pub fn boundary_state(&self, collection: &CollectionKey, edge: Edge) -> LoadStateTracker {
        self.coordinator.boundary_state(collection, edge)
    }

    pub fn network_state(&self, collection: &CollectionKey) -> LoadStateTracker {
        self.coordinator.network_state(collection)
    }

    /// Stop accepting background work and wait for running fetches.
    pub async fn shutdown(&self) {
        self.executor.shutdown().await;
    }
}

async fn run_refresh<T, S, F>(
    fetcher: &F,
    merger: &Merger<T, S>,
    request: &FetchRequest,
) -> BackfillResult<backfill_storage::MergeOutcome>
where
    T: ListingItem,
    S: OrderedStore<T>,
    F: RemoteFetcher<T>,
{
    let items = fetcher.fetch(request).await?;
    merger.replace_all(&request.collection, items).await
}

impl<T, S, F> std::fmt::Debug for Repository<T, S, F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Repository")
            .field("config", &self.config)
            .field("executor", &self.executor)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use backfill_core::FetchMode;
    use backfill_storage::InMemoryOrderedStore;
    use backfill_test_utils::assertions::assert_positions;
    use backfill_test_utils::fixtures::{key, posts, seeded_store};
    use backfill_test_utils::{Post, ScriptedFetcher};

    type Repo = Repository<Post, InMemoryOrderedStore<Post>, ScriptedFetcher<Post>>;

    fn repo(store: InMemoryOrderedStore<Post>, fetcher: ScriptedFetcher<Post>) -> Repo {
        Repository::new(Arc::new(store), Arc::new(fetcher), BackfillConfig::default())
            .expect("repository should build")
    }

    #[tokio::test]
    async fn test_refresh_replaces_collection() {
        let x = key("X");
        let fetcher = ScriptedFetcher::new();
        fetcher.push_ok(posts(&["p1", "p2"]));
        let repo = repo(seeded_store(&x, &["old1", "old2", "old3"]), fetcher);

        assert_eq!(repo.refresh(&x).settled().await, LoadState::Loaded);
        assert_positions(repo.store().as_ref(), &x, &[("p1", 0), ("p2", 1)]);
    }

    #[tokio::test]
    async fn test_refresh_gets_fresh_tracker_each_call() {
        let x = key("X");
        let fetcher = ScriptedFetcher::new();
        fetcher.push_err("first").push_ok(posts(&["a"]));
        let repo = repo(InMemoryOrderedStore::new(), fetcher);

        let first = repo.refresh(&x);
        assert_eq!(first.settled().await, LoadState::Error("first".to_string()));
        let second = repo.refresh(&x);
        assert_eq!(second.settled().await, LoadState::Loaded);
        assert_eq!(first.current(), LoadState::Error("first".to_string()));
    }

    #[tokio::test]
    async fn test_refresh_uses_listing_page_size() {
        let x = key("X");
        let repo = repo(InMemoryOrderedStore::new(), ScriptedFetcher::new());
        let _listing = repo.listing(&x, 42);

        repo.refresh(&x).settled().await;
        let requests = repo.fetcher.requests();
        let refresh = requests
            .iter()
            .find(|r| r.mode == FetchMode::Refresh)
            .expect("refresh request recorded");
        assert_eq!(refresh.page_size, 42);
    }

    #[tokio::test]
    async fn test_zero_page_size_falls_back_to_default() {
        let repo = repo(InMemoryOrderedStore::new(), ScriptedFetcher::new());
        let listing = repo.listing(&key("X"), 0);
        assert_eq!(listing.pages.page_size(), 10);
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let result = Repository::new(
            Arc::new(InMemoryOrderedStore::<Post>::new()),
            Arc::new(ScriptedFetcher::<Post>::new()),
            BackfillConfig::default().with_max_concurrent_tasks(0),
        );
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_refresh_after_shutdown_reports_error() {
        let repo = repo(InMemoryOrderedStore::new(), ScriptedFetcher::new());
        repo.shutdown().await;

        let state = repo.refresh(&key("X")).current();
        assert!(state.error_message().is_some_and(|m| m.contains("shut down")));
    }

    #[test]
    fn test_new_without_runtime_fails() {
        let result = Repository::new(
            Arc::new(InMemoryOrderedStore::<Post>::new()),
            Arc::new(ScriptedFetcher::<Post>::new()),
            BackfillConfig::default(),
        );
        assert!(result.is_err());
    }
}
