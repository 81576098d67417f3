// BSD-2-Clause

//! Bounded worker pool for adapter callbacks that perform blocking or
//! latency-sensitive I/O (encoding a report to send over a transport,
//! running a virtual tile's RPC handler). Keeps that work off the task
//! driving an adapter's own read loop so one slow callback can't stall
//! the next inbound fragment.

use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

use std::future::Future;
use std::sync::Arc;

pub struct WorkerPool {
    semaphore: Arc<Semaphore>,
}

impl WorkerPool {
    pub fn new(max_concurrent: usize) -> Self {
        Self { semaphore: Arc::new(Semaphore::new(max_concurrent.max(1))) }
    }

    /// Run `task` on the runtime's task pool, bounded by this pool's
    /// concurrency limit. The returned handle resolves once `task`
    /// completes; dropping it does not cancel the work.
    pub fn spawn<F>(&self, task: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let semaphore = Arc::clone(&self.semaphore);
        tokio::spawn(async move {
            // Semaphore is never closed; ok() degrades to unbounded rather
            // than panicking if that ever changes.
            let _permit = semaphore.acquire_owned().await.ok();
            task.await
        })
    }
}

#[cfg(test)]
#[path = "worker_tests.rs"]
mod tests;
