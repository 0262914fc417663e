//! Explicit runtime value carrying the worker pool, threaded through
//! the decode pipeline instead of a process-wide scheduler singleton.

use crate::error::{CodecError, Result};

pub struct Runtime {
    pool: Option<rayon::ThreadPool>,
    workers: usize,
}

impl Runtime {
    /// A runtime with `workers` threads; `workers == 1` (or 0) selects
    /// the sequential code paths throughout the pipeline.
    pub fn new(workers: usize) -> Result<Self> {
        let workers = workers.max(1);
        if workers == 1 {
            return Ok(Self {
                pool: None,
                workers: 1,
            });
        }
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .build()
            .map_err(|e| CodecError::AllocationFailure(format!("thread pool: {e}")))?;
        Ok(Self {
            pool: Some(pool),
            workers,
        })
    }

    pub fn single_threaded() -> Self {
        Self {
            pool: None,
            workers: 1,
        }
    }

    /// A runtime sized to the available parallelism.
    pub fn default_parallel() -> Result<Self> {
        let n = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self::new(n)
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Run `op` inside the pool so rayon parallel iterators use our
    /// workers; inline when single-threaded.
    pub fn install<R: Send>(&self, op: impl FnOnce() -> R + Send) -> R {
        match &self.pool {
            Some(pool) => pool.install(op),
            None => op(),
        }
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::single_threaded()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_threaded_runs_inline() {
        let rt = Runtime::single_threaded();
        assert_eq!(rt.workers(), 1);
        assert_eq!(rt.install(|| 41 + 1), 42);
    }

    #[test]
    fn pool_runs_closures() {
        let rt = Runtime::new(2).unwrap();
        assert_eq!(rt.workers(), 2);
        assert_eq!(rt.install(|| (0..10).sum::<i32>()), 45);
    }
}
