//! Backfill Repository
//!
//! Read-through paging over a local ordered store. Consumers read pages
//! from the store only; when they scroll near an edge of what is cached, a
//! bounded background executor fetches the next remote page and merges it
//! into the store, and open page streams pick the change up.
//!
//! # Usage
//!
//! ```ignore
//! use backfill_repo::{HttpFetcher, Repository};
//! use backfill_storage::LmdbOrderedStore;
//!
//! let store = Arc::new(LmdbOrderedStore::<Post>::open("./cache", 64)?);
//! let fetcher = Arc::new(HttpFetcher::new("https://example.test/r", &config)?);
//! let repo = Repository::new(store, fetcher, config)?;
//!
//! let listing = repo.listing(&"androiddev".parse()?, 25);
//! let mut pages = listing.pages.subscribe();
//! while let Some(snapshot) = pages.next().await {
//!     // render, then report what is on screen
//!     listing.pages.report_cursor(&snapshot, visible_offset);
//! }
//! ```

pub mod boundary;
pub mod coordinator;
pub mod executor;
pub mod listing;
pub mod load_state;
pub mod remote;
pub mod repository;
pub mod telemetry;

pub use boundary::detect_boundary;
pub use coordinator::BoundaryCoordinator;
pub use executor::TaskExecutor;
pub use listing::{Listing, Page, PageStream, PagedSequence, PagedSnapshot};
pub use load_state::{LoadStatePublisher, LoadStateSubscription, LoadStateTracker};
pub use remote::HttpFetcher;
pub use repository::Repository;
pub use telemetry::{init_tracing, TelemetryConfig};
