//! Bounded worker pool for per-cluster operations

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tandem_core::{Error, Result};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::debug;

/// Runs per-cluster operations with at most `size` in flight.
///
/// Work submitted beyond the limit is queued on the semaphore. Closing the
/// pool rejects new work with [`Error::Closed`]; tasks already running keep
/// their permit and finish normally.
#[derive(Debug)]
pub struct WorkerPool {
    permits: Arc<Semaphore>,
    size: usize,
    closed: AtomicBool,
}

impl WorkerPool {
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            permits: Arc::new(Semaphore::new(size)),
            size,
            closed: AtomicBool::new(false),
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Permits not currently held by a running task
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Spawn `task` once a permit is free.
    ///
    /// Dropping the returned handle detaches the task; it is never cancelled.
    pub fn spawn<F, T>(&self, task: F) -> Result<JoinHandle<Result<T>>>
    where
        F: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        let permits = Arc::clone(&self.permits);
        Ok(tokio::spawn(async move {
            let _permit = permits.acquire_owned().await.map_err(|_| Error::Closed)?;
            task.await
        }))
    }

    /// Reject new work; running tasks are left alone. Idempotent.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            debug!("Closing worker pool of {}", self.size);
            self.permits.close();
        }
    }
}
