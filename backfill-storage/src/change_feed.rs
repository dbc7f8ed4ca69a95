//! Watermarks and the per-collection change feed.
//!
//! Every committed transaction that touches a collection advances that
//! collection's watermark. Readers hold a `watch` receiver and re-read the
//! store when it changes, which is how page streams learn about merges.

use std::collections::HashMap;
use std::sync::Mutex;

use backfill_core::CollectionKey;
use chrono::{DateTime, Utc};
use tokio::sync::watch;

/// A point in one collection's write history.
///
/// Sequences are monotonically increasing per collection; comparing two
/// watermarks tells whether writes happened between them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Watermark {
    /// Number of committed transactions that touched the collection.
    pub sequence: u64,
    /// When this watermark was produced.
    pub observed_at: DateTime<Utc>,
}

impl Watermark {
    pub fn new(sequence: u64) -> Self {
        Self {
            sequence,
            observed_at: Utc::now(),
        }
    }

    /// Watermark of a collection nobody has written to yet.
    pub fn zero() -> Self {
        Self {
            sequence: 0,
            observed_at: DateTime::UNIX_EPOCH,
        }
    }

    /// Check if this watermark is newer than another.
    pub fn is_newer_than(&self, other: &Watermark) -> bool {
        self.sequence > other.sequence
    }

    fn next(&self) -> Self {
        Self::new(self.sequence + 1)
    }
}

impl Default for Watermark {
    fn default() -> Self {
        Self::zero()
    }
}

/// Fan-out of commit notifications, one `watch` channel per collection.
///
/// Channels are created lazily by whichever comes first, a subscriber or a
/// commit, and live as long as the store.
#[derive(Debug, Default)]
pub struct ChangeFeed {
    senders: Mutex<HashMap<CollectionKey, watch::Sender<Watermark>>>,
}

impl ChangeFeed {
    pub fn new() -> Self {
        Self::default()
    }

    /// Receiver for a collection's watermark. The current value is marked
    /// as seen; the receiver wakes on the next commit.
    pub fn subscribe(&self, collection: &CollectionKey) -> watch::Receiver<Watermark> {
        self.with_sender(collection, |tx| tx.subscribe())
    }

    /// Current watermark of a collection.
    pub fn current(&self, collection: &CollectionKey) -> Watermark {
        self.with_sender(collection, |tx| *tx.borrow())
    }

    /// Advance a collection's watermark after a commit.
    pub fn publish(&self, collection: &CollectionKey) -> Watermark {
        self.with_sender(collection, |tx| {
            tx.send_modify(|w| *w = w.next());
            *tx.borrow()
        })
    }

    fn with_sender<R>(
        &self,
        collection: &CollectionKey,
        f: impl FnOnce(&watch::Sender<Watermark>) -> R,
    ) -> R {
        // A panic while holding this lock cannot leave the map half-updated.
        let mut senders = match self.senders.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let tx = senders
            .entry(collection.clone())
            .or_insert_with(|| watch::channel(Watermark::zero()).0);
        f(tx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(name: &str) -> CollectionKey {
        CollectionKey::new(name).expect("valid key")
    }

    #[test]
    fn test_watermark_ordering() {
        let w1 = Watermark::new(1);
        let w2 = Watermark::new(2);
        assert!(w2.is_newer_than(&w1));
        assert!(!w1.is_newer_than(&w2));
        assert_eq!(Watermark::default().sequence, 0);
    }

    #[test]
    fn test_publish_advances_per_collection() {
        let feed = ChangeFeed::new();
        let a = key("a");
        let b = key("b");

        assert_eq!(feed.publish(&a).sequence, 1);
        assert_eq!(feed.publish(&a).sequence, 2);
        assert_eq!(feed.current(&a).sequence, 2);
        assert_eq!(feed.current(&b).sequence, 0);
    }

    #[tokio::test]
    async fn test_subscriber_wakes_on_publish() {
        let feed = ChangeFeed::new();
        let a = key("a");
        let mut rx = feed.subscribe(&a);
        assert!(!rx.has_changed().expect("sender alive"));

        feed.publish(&a);
        rx.changed().await.expect("sender alive");
        assert_eq!(rx.borrow_and_update().sequence, 1);
    }
}
