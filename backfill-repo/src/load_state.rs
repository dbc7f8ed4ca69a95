//! Observable load state streams.
//!
//! A [`LoadStatePublisher`] is the single writer of one stream; any number
//! of [`LoadStateTracker`] handles read it. Subscribers get the current
//! value first and then every later transition, in order.
//!
//! ## Architecture
//!
//! - The current value sits behind a lock; transitions are fanned out over
//!   a tokio broadcast channel
//! - Publishing and subscribing both happen under that lock, so a new
//!   subscriber never misses or repeats a transition
//! - Slow subscribers that fall behind the channel capacity skip ahead and
//!   a warning is logged

use std::sync::{Arc, PoisonError, RwLock};

use backfill_core::LoadState;
use futures_util::stream::{self, Stream};
use tokio::sync::broadcast;
use tracing::{debug, warn};

struct Shared {
    label: String,
    state: RwLock<LoadState>,
    tx: broadcast::Sender<LoadState>,
}

/// Write side of a load state stream.
pub struct LoadStatePublisher {
    shared: Arc<Shared>,
}

impl LoadStatePublisher {
    /// Create a stream starting at `Idle`.
    ///
    /// `capacity` bounds how many transitions a subscriber may fall behind
    /// before it starts skipping.
    pub fn new(label: impl Into<String>, capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self {
            shared: Arc::new(Shared {
                label: label.into(),
                state: RwLock::new(LoadState::Idle),
                tx,
            }),
        }
    }

    pub fn tracker(&self) -> LoadStateTracker {
        LoadStateTracker {
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn current(&self) -> LoadState {
        self.tracker().current()
    }

    /// Publish `next`. Setting the value the stream already holds is a no-op.
    pub fn set(&self, next: LoadState) {
        let mut state = self
            .shared
            .state
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if *state != next {
            self.transition(&mut state, next);
        }
    }

    /// Move to `Loading` unless the stream is already loading.
    ///
    /// Returns whether the caller now owns the in-flight load.
    pub fn try_begin(&self) -> bool {
        let mut state = self
            .shared
            .state
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if state.is_loading() {
            return false;
        }
        self.transition(&mut state, LoadState::Loading);
        true
    }

    fn transition(&self, state: &mut LoadState, next: LoadState) {
        debug!(
            stream = %self.shared.label,
            from = %state,
            to = %next,
            "Load state transition"
        );
        *state = next.clone();
        // No subscribers is fine; the value is still readable via current().
        let _ = self.shared.tx.send(next);
    }
}

impl std::fmt::Debug for LoadStatePublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadStatePublisher")
            .field("label", &self.shared.label)
            .field("state", &self.current())
            .finish()
    }
}

/// Read-only handle on a load state stream.
#[derive(Clone)]
pub struct LoadStateTracker {
    shared: Arc<Shared>,
}

impl LoadStateTracker {
    pub fn label(&self) -> &str {
        &self.shared.label
    }

    pub fn current(&self) -> LoadState {
        self.shared
            .state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn subscribe(&self) -> LoadStateSubscription {
        let state = self
            .shared
            .state
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        LoadStateSubscription {
            label: self.shared.label.clone(),
            pending: Some(state.clone()),
            rx: self.shared.tx.subscribe(),
        }
    }

    /// Wait until the stream holds a value matching `predicate` and return it.
    ///
    /// Returns `None` if the stream is dropped first.
    pub async fn wait_for(&self, predicate: impl Fn(&LoadState) -> bool) -> Option<LoadState> {
        let mut subscription = self.subscribe();
        while let Some(state) = subscription.next().await {
            if predicate(&state) {
                return Some(state);
            }
        }
        None
    }

    /// Wait for `Loaded` or `Error`.
    ///
    /// A stream that already settled returns its current value immediately;
    /// call this after the load of interest has started.
    pub async fn settled(&self) -> LoadState {
        self.wait_for(LoadState::is_settled)
            .await
            .unwrap_or_else(|| self.current())
    }
}

impl std::fmt::Debug for LoadStateTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadStateTracker")
            .field("label", &self.shared.label)
            .field("state", &self.current())
            .finish()
    }
}

/// Ordered view of a load state stream from the moment of subscription.
pub struct LoadStateSubscription {
    label: String,
    pending: Option<LoadState>,
    rx: broadcast::Receiver<LoadState>,
}

impl LoadStateSubscription {
    /// Next value, or `None` once the publisher and every tracker are gone.
    pub async fn next(&mut self) -> Option<LoadState> {
        if let Some(state) = self.pending.take() {
            return Some(state);
        }
        loop {
            match self.rx.recv().await {
                Ok(state) => return Some(state),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(
                        stream = %self.label,
                        skipped = skipped,
                        "Load state subscriber lagged, transitions were dropped"
                    );
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    pub fn into_stream(self) -> impl Stream<Item = LoadState> + Send + 'static {
        stream::unfold(self, |mut subscription| async move {
            let state = subscription.next().await?;
            Some((state, subscription))
        })
    }
}
