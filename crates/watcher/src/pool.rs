//! Bounded worker pool for verification and assembly tasks.
//!
//! Concurrency is capped by a semaphore sized to a share of the machine's
//! parallelism, leaving headroom for the external render process. The
//! assembly task takes every permit at once, which makes it mutually
//! exclusive with in-flight verification workers.

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Upper bound on verification workers regardless of core count.
const MAX_WORKERS: usize = 10;

/// Share of the available parallelism given to the pool.
const PARALLELISM_SHARE: f64 = 0.3;

/// Worker count for a machine with `available` usable cores.
pub fn pool_size(available: usize) -> usize {
    ((available as f64 * PARALLELISM_SHARE).round() as usize).clamp(1, MAX_WORKERS)
}

/// Pool size derived from the current machine.
pub fn default_pool_size() -> usize {
    let available = std::thread::available_parallelism().map_or(1, |n| n.get());
    pool_size(available)
}

#[derive(Debug, Clone)]
pub struct WorkerPool {
    permits: Arc<Semaphore>,
    size: usize,
}

impl WorkerPool {
    pub fn new(size: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(size)),
            size,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// True when no worker holds a permit.
    pub fn is_idle(&self) -> bool {
        self.permits.available_permits() == self.size
    }

    /// Acquire one worker slot.
    pub async fn acquire(&self) -> OwnedSemaphorePermit {
        // The semaphore is never closed while the pool exists.
        self.permits
            .clone()
            .acquire_owned()
            .await
            .unwrap_or_else(|_| unreachable!("worker pool semaphore closed"))
    }

    /// Acquire every slot at once; granted only when the pool is idle.
    pub async fn acquire_all(&self) -> OwnedSemaphorePermit {
        self.permits
            .clone()
            .acquire_many_owned(self.size as u32)
            .await
            .unwrap_or_else(|_| unreachable!("worker pool semaphore closed"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // -- pool_size ------------------------------------------------------------

    #[test]
    fn single_core_machine_gets_one_worker() {
        assert_eq!(pool_size(1), 1);
    }

    #[test]
    fn four_cores_round_to_one_worker() {
        // 4 * 0.3 = 1.2 -> 1
        assert_eq!(pool_size(4), 1);
    }

    #[test]
    fn sixteen_cores_get_five_workers() {
        // 16 * 0.3 = 4.8 -> 5
        assert_eq!(pool_size(16), 5);
    }

    #[test]
    fn worker_count_is_capped() {
        assert_eq!(pool_size(64), MAX_WORKERS);
    }

    // -- permit accounting ----------------------------------------------------

    #[tokio::test]
    async fn pool_tracks_idleness() {
        let pool = WorkerPool::new(2);
        assert!(pool.is_idle());

        let permit = pool.acquire().await;
        assert!(!pool.is_idle());

        drop(permit);
        assert!(pool.is_idle());
    }

    #[tokio::test]
    async fn acquire_all_blocks_out_single_permits() {
        let pool = WorkerPool::new(3);
        let all = pool.acquire_all().await;
        assert!(!pool.is_idle());

        // A single acquire must wait until the bulk permit is released.
        let pool_clone = pool.clone();
        let waiter = tokio::spawn(async move { pool_clone.acquire().await });
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        drop(all);
        let _permit = waiter.await.unwrap();
    }
}
