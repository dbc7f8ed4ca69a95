//! Backfill demo
//!
//! Refreshes one collection from an HTTP listing endpoint into a local LMDB
//! cache, prints the first page, scrolls to the end once and prints what
//! the boundary fetch appended.
//!
//! Usage: backfill-demo [collection]
//!
//! Environment:
//!   BACKFILL_BASE_URL   listing endpoint (default http://127.0.0.1:8080/r)
//!   BACKFILL_STORE_DIR  LMDB directory (default ./.backfill)
//!   BACKFILL_*          see `BackfillConfig::from_env`

use std::sync::Arc;

use backfill_core::{BackfillConfig, BackfillResult, CollectionKey, Edge, ListingItem, LoadState};
use backfill_repo::{init_tracing, HttpFetcher, PagedSnapshot, Repository, TelemetryConfig};
use backfill_storage::LmdbOrderedStore;
use serde::{Deserialize, Serialize};

const STORE_SIZE_MB: usize = 64;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Link {
    name: String,
    #[serde(default)]
    title: String,
    #[serde(flatten)]
    extra: serde_json::Map<String, serde_json::Value>,
}

impl ListingItem for Link {
    fn cursor(&self) -> Option<String> {
        Some(self.name.clone())
    }
}

fn print_snapshot(label: &str, snapshot: &PagedSnapshot<Link>) {
    println!("{} ({} cached, {} pages)", label, snapshot.len(), snapshot.page_count());
    if let Some(page) = snapshot.page(0) {
        for item in &page.items {
            println!("  #{:<4} {:<12} {}", item.position, item.payload.name, item.payload.title);
        }
    }
}

#[tokio::main]
async fn main() -> BackfillResult<()> {
    init_tracing(&TelemetryConfig::default())?;

    let config = BackfillConfig::from_env()?;
    let collection: CollectionKey = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "androiddev".to_string())
        .parse()?;
    let base_url = std::env::var("BACKFILL_BASE_URL")
        .unwrap_or_else(|_| "http://127.0.0.1:8080/r".to_string());
    let store_dir =
        std::env::var("BACKFILL_STORE_DIR").unwrap_or_else(|_| ".backfill".to_string());

    let store = Arc::new(LmdbOrderedStore::<Link>::open(&store_dir, STORE_SIZE_MB)?);
    let fetcher = Arc::new(HttpFetcher::<Link>::new(&base_url, &config)?);
    let page_size = config.network_page_size;
    let repo = Repository::new(store, fetcher, config)?;

    tracing::info!(collection = %collection, base_url = %base_url, store_dir = %store_dir, "Starting demo");

    let listing = repo.listing(&collection, page_size);
    print_snapshot("Cached before refresh", &listing.pages.snapshot());

    if let LoadState::Error(message) = repo.refresh(&collection).settled().await {
        eprintln!("Refresh failed: {}", message);
    }

    let snapshot = listing.pages.snapshot();
    print_snapshot("After refresh", &snapshot);

    let last = snapshot.len().saturating_sub(1);
    if let Some(edge) = listing.pages.report_cursor(&snapshot, last) {
        let state = repo.boundary_state(&collection, edge).settled().await;
        println!("Boundary fetch at {:?}: {}", edge, state);
        if edge == Edge::End {
            println!("Now cached: {}", listing.pages.snapshot().len());
        }
    }

    repo.shutdown().await;
    Ok(())
}
