//! Bounded background task executor.
//!
//! Fetch-and-merge work runs here instead of on the caller. Submission never
//! blocks and works from any thread, including threads outside the tokio
//! runtime, because tasks are spawned through a captured runtime handle.
//! At most `max_concurrent` tasks run at once; the rest wait for a permit.
//!
//! # Usage
//!
//! ```ignore
//! let executor = TaskExecutor::new(4)?;
//! executor.spawn("boundary_fetch", async move { /* ... */ })?;
//!
//! // On shutdown: refuse new work, wait for running tasks
//! executor.shutdown().await;
//! ```

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use backfill_core::ExecutorError;
use tokio::runtime::Handle;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info, trace};

pub struct TaskExecutor {
    handle: Handle,
    permits: Arc<Semaphore>,
    tasks: Mutex<JoinSet<()>>,
    closed: AtomicBool,
}

impl TaskExecutor {
    /// Executor on the current tokio runtime.
    pub fn new(max_concurrent: usize) -> Result<Self, ExecutorError> {
        let handle = Handle::try_current().map_err(|_| ExecutorError::NoRuntime)?;
        Ok(Self::with_handle(handle, max_concurrent))
    }

    pub fn with_handle(handle: Handle, max_concurrent: usize) -> Self {
        Self {
            handle,
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
            tasks: Mutex::new(JoinSet::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Submit `task`. Fails once [`shutdown`](Self::shutdown) has begun.
    pub fn spawn<F>(&self, name: &'static str, task: F) -> Result<(), ExecutorError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        if self.closed.load(Ordering::SeqCst) {
            return Err(ExecutorError::ShutDown);
        }

        while let Some(finished) = tasks.try_join_next() {
            log_join(finished);
        }

        let permits = Arc::clone(&self.permits);
        tasks.spawn_on(
            async move {
                let Ok(_permit) = permits.acquire_owned().await else {
                    return;
                };
                trace!(task = name, "Background task started");
                task.await;
            },
            &self.handle,
        );
        Ok(())
    }

    /// Tasks submitted and not yet reaped.
    pub fn in_flight(&self) -> usize {
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_shut_down(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Refuse new work and wait for every submitted task to finish.
    pub async fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let mut tasks = {
            let mut guard = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
            std::mem::take(&mut *guard)
        };

        let pending = tasks.len();
        while let Some(finished) = tasks.join_next().await {
            log_join(finished);
        }
        info!(drained = pending, "Task executor shut down");
    }
}

impl std::fmt::Debug for TaskExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskExecutor")
            .field("available_permits", &self.permits.available_permits())
            .field("in_flight", &self.in_flight())
            .field("closed", &self.is_shut_down())
            .finish()
    }
}

fn log_join(result: Result<(), tokio::task::JoinError>) {
    if let Err(e) = result {
        if e.is_panic() {
            error!(error = %e, "Background task panicked");
        }
    }
}
