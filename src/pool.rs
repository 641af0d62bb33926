//! Worker pool for blocking checksum and file work
//!
//! The pool is constructed by the caller and passed to whatever needs it,
//! so its lifetime and shutdown are explicit.

use rayon::{ThreadPool, ThreadPoolBuilder};

use crate::error::{FleetpkgError, Result};

/// Explicitly owned worker pool
pub struct WorkerPool {
    pool: ThreadPool,
}

impl WorkerPool {
    /// Create a pool with `threads` workers (at least one)
    pub fn new(threads: usize) -> Result<Self> {
        let pool = ThreadPoolBuilder::new()
            .num_threads(threads.max(1))
            .thread_name(|i| format!("fleetpkg-worker-{}", i))
            .build()
            .map_err(|e| FleetpkgError::Config(format!("Failed to start worker pool: {}", e)))?;

        tracing::debug!("Started worker pool with {} threads", pool.current_num_threads());
        Ok(Self { pool })
    }

    /// Run `f` inside the pool; parallel iterators in `f` use its workers
    pub fn install<R, F>(&self, f: F) -> R
    where
        F: FnOnce() -> R + Send,
        R: Send,
    {
        self.pool.install(f)
    }

    pub fn threads(&self) -> usize {
        self.pool.current_num_threads()
    }

    /// Stop the pool, waiting for queued work to drain
    pub fn shutdown(self) {
        tracing::debug!("Shutting down worker pool");
        drop(self.pool);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rayon::prelude::*;

    #[test]
    fn test_pool_runs_parallel_work() {
        let pool = WorkerPool::new(2).unwrap();
        assert_eq!(pool.threads(), 2);

        let sum: u64 = pool.install(|| (1..=100u64).into_par_iter().sum());
        assert_eq!(sum, 5050);

        pool.shutdown();
    }
}
