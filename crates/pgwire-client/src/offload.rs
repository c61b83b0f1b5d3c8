//! Bounded offload of CPU-bound work off the async executor.
//!
//! Work runs on tokio's blocking thread pool; a semaphore caps how many jobs
//! from this pool run at once. The result comes back through a oneshot
//! channel that resolves exactly once. If the awaiting caller goes away
//! before a job starts, the job is skipped.

use std::sync::Arc;

use tokio::sync::{Semaphore, oneshot};

use crate::error::{Error, Result};

/// A bounded pool for blocking work.
#[derive(Debug, Clone)]
pub struct WorkerPool {
    permits: Arc<Semaphore>,
    max_concurrency: usize,
}

impl WorkerPool {
    /// Create a pool running at most `max_concurrency` jobs at once.
    #[must_use]
    pub fn new(max_concurrency: usize) -> Self {
        let max_concurrency = max_concurrency.max(1);
        Self {
            permits: Arc::new(Semaphore::new(max_concurrency)),
            max_concurrency,
        }
    }

    /// Run `job` on a blocking thread and await its result.
    pub async fn run<F, T>(&self, job: F) -> Result<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| Error::Offload("worker pool closed".into()))?;

        let (tx, rx) = oneshot::channel();
        tokio::task::spawn_blocking(move || {
            let _permit = permit;
            if tx.is_closed() {
                tracing::trace!("skipping offloaded job; caller is gone");
                return;
            }
            let _ = tx.send(job());
        });

        rx.await
            .map_err(|_| Error::Offload("job did not produce a result".into()))
    }

    /// Jobs that could start right now without waiting.
    #[must_use]
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Configured concurrency limit.
    #[must_use]
    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }
}

impl Default for WorkerPool {
    fn default() -> Self {
        let n = std::thread::available_parallelism().map_or(2, |n| n.get());
        Self::new(n)
    }
}
