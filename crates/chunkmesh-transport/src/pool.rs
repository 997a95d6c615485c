//! Bounded worker pool for inbound datagram handling.
//!
//! Receive loops hand every datagram to a `WorkerPool` instead of handling it
//! inline. At most `workers` jobs run at once and at most `queue_depth` more
//! wait for a worker; anything beyond that is rejected so a message storm
//! cannot grow memory without bound.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::{Semaphore, TryAcquireError};
use tracing::trace;

/// A bounded pool of concurrently running jobs.
#[derive(Debug, Clone)]
pub struct WorkerPool {
    name: Arc<str>,
    admitted: Arc<Semaphore>,
    running: Arc<Semaphore>,
}

impl WorkerPool {
    /// Create a pool running up to `workers` jobs with `queue_depth` more waiting.
    pub fn new(name: &str, workers: usize, queue_depth: usize) -> Self {
        let workers = workers.max(1);
        Self {
            name: Arc::from(name),
            admitted: Arc::new(Semaphore::new(workers + queue_depth)),
            running: Arc::new(Semaphore::new(workers)),
        }
    }

    /// Pool name, used in logs.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of additional jobs the pool would accept right now.
    pub fn available(&self) -> usize {
        self.admitted.available_permits()
    }

    /// Submit a job. Returns false, dropping the job, if the pool is full.
    pub fn submit<F>(&self, job: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let admission = match Arc::clone(&self.admitted).try_acquire_owned() {
            Ok(permit) => permit,
            Err(TryAcquireError::NoPermits) | Err(TryAcquireError::Closed) => {
                trace!(pool = %self.name, "worker pool full");
                return false;
            }
        };
        let running = Arc::clone(&self.running);
        tokio::spawn(async move {
            let _admission = admission;
            let Ok(_worker) = running.acquire_owned().await else {
                return;
            };
            job.await;
        });
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_rejects_when_full() {
        let pool = WorkerPool::new("test", 1, 1);
        let gate = Arc::new(Semaphore::new(0));

        for _ in 0..2 {
            let gate = Arc::clone(&gate);
            assert!(pool.submit(async move {
                let _ = gate.acquire().await;
            }));
        }
        assert!(!pool.submit(async {}));
        assert_eq!(pool.available(), 0);

        gate.add_permits(2);
        for _ in 0..50 {
            if pool.available() > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(pool.submit(async {}));
    }

    #[tokio::test]
    async fn test_concurrency_bounded_by_workers() {
        let pool = WorkerPool::new("bounded", 2, 16);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let done = Arc::new(AtomicUsize::new(0));

        for _ in 0..8 {
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            let done = Arc::clone(&done);
            assert!(pool.submit(async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                running.fetch_sub(1, Ordering::SeqCst);
                done.fetch_add(1, Ordering::SeqCst);
            }));
        }

        for _ in 0..200 {
            if done.load(Ordering::SeqCst) == 8 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(done.load(Ordering::SeqCst), 8);
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[test]
    fn test_zero_workers_clamped() {
        let pool = WorkerPool::new("tiny", 0, 0);
        assert_eq!(pool.available(), 1);
        assert_eq!(pool.name(), "tiny");
    }
}
