//! Backfill Core - Entity Types
//!
//! Data structures shared by every backfill crate: collection keys, position
//! indices, cached items, load states and the remote fetcher seam.
//! This crate contains no storage or scheduling logic.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub mod config;
pub mod error;

pub use config::{BackfillConfig, DEFAULT_NETWORK_PAGE_SIZE};
pub use error::{
    BackfillError, BackfillResult, ConfigError, ExecutorError, FetchError, StorageError,
    ValidationError,
};

// ============================================================================
// IDENTITY TYPES
// ============================================================================

/// Per-collection, monotonically assigned read order.
pub type PositionIndex = u64;

/// Timestamp type using UTC timezone.
pub type Timestamp = DateTime<Utc>;

/// Longest collection key accepted, in bytes.
pub const MAX_COLLECTION_KEY_LEN: usize = 512;

/// Identifies one cached listing (for example a subreddit name).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CollectionKey(String);

impl CollectionKey {
    /// Validate and wrap a collection key.
    ///
    /// Keys must be non-empty and at most [`MAX_COLLECTION_KEY_LEN`] bytes.
    pub fn new(key: impl Into<String>) -> Result<Self, ValidationError> {
        let key = key.into();
        if key.is_empty() {
            return Err(ValidationError::InvalidCollectionKey {
                key,
                reason: "must not be empty".to_string(),
            });
        }
        if key.len() > MAX_COLLECTION_KEY_LEN {
            return Err(ValidationError::InvalidCollectionKey {
                reason: format!("longer than {} bytes", MAX_COLLECTION_KEY_LEN),
                key,
            });
        }
        Ok(Self(key))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CollectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for CollectionKey {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for CollectionKey {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl TryFrom<&str> for CollectionKey {
    type Error = ValidationError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<CollectionKey> for String {
    fn from(key: CollectionKey) -> Self {
        key.0
    }
}

impl AsRef<str> for CollectionKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

// ============================================================================
// ENUMS
// ============================================================================

/// Edge of the currently buffered window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Edge {
    /// The first cached item.
    Start,
    /// The last cached item.
    End,
}

/// Lifecycle of one fetch stream.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum LoadState {
    #[default]
    Idle,
    Loading,
    Loaded,
    Error(String),
}

impl LoadState {
    pub fn is_loading(&self) -> bool {
        matches!(self, LoadState::Loading)
    }

    /// Loaded or Error.
    pub fn is_settled(&self) -> bool {
        matches!(self, LoadState::Loaded | LoadState::Error(_))
    }

    pub fn error_message(&self) -> Option<&str> {
        match self {
            LoadState::Error(message) => Some(message),
            _ => None,
        }
    }
}

impl fmt::Display for LoadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoadState::Idle => f.write_str("idle"),
            LoadState::Loading => f.write_str("loading"),
            LoadState::Loaded => f.write_str("loaded"),
            LoadState::Error(message) => write!(f, "error: {}", message),
        }
    }
}

// ============================================================================
// ITEMS
// ============================================================================

/// Marker trait for payloads that can be cached in a listing.
///
/// Payloads are stored serialized, so they must round-trip through serde.
/// `cursor` exposes the remote paging token of an item (e.g. a post's
/// fullname); the coordinator passes the edge item's cursor to the fetcher
/// so the remote side can continue from there.
pub trait ListingItem: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {
    fn cursor(&self) -> Option<String> {
        None
    }
}

/// A payload placed at a position inside a collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedItem<T> {
    pub collection: CollectionKey,
    pub position: PositionIndex,
    /// When the merge that assigned `position` ran.
    pub cached_at: Timestamp,
    pub payload: T,
}

impl<T> CachedItem<T> {
    pub fn new(collection: CollectionKey, position: PositionIndex, payload: T) -> Self {
        Self {
            collection,
            position,
            cached_at: Utc::now(),
            payload,
        }
    }

    pub fn into_payload(self) -> T {
        self.payload
    }
}

// ============================================================================
// REMOTE FETCHING
// ============================================================================

/// Why a fetch was issued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FetchMode {
    /// Full refresh; results replace the collection.
    Refresh,
    /// Backfill at an edge; results are appended.
    Boundary(Edge),
}

/// One remote page request. Lives only for the duration of a fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    pub collection: CollectionKey,
    pub mode: FetchMode,
    pub page_size: usize,
    /// Cursor of the edge item the page should continue from.
    pub anchor: Option<String>,
}

impl FetchRequest {
    pub fn refresh(collection: CollectionKey, page_size: usize) -> Self {
        Self {
            collection,
            mode: FetchMode::Refresh,
            page_size,
            anchor: None,
        }
    }

    pub fn boundary(
        collection: CollectionKey,
        edge: Edge,
        page_size: usize,
        anchor: Option<String>,
    ) -> Self {
        Self {
            collection,
            mode: FetchMode::Boundary(edge),
            page_size,
            anchor,
        }
    }
}

/// Remote paging capability.
///
/// One call is one attempt: implementations must not retry internally and
/// must not mutate shared state. Items are returned in remote order.
#[async_trait]
pub trait RemoteFetcher<T: ListingItem>: Send + Sync {
    async fn fetch(&self, request: &FetchRequest) -> Result<Vec<T>, FetchError>;
}
