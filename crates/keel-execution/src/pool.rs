use crate::config::EngineConfig;
use crate::engine::{ExecutionEngine, ExecutionResult};
use crate::error::Result;
use crate::unit::UnitOfWork;
use rayon::prelude::*;
use rayon::ThreadPool;

enum Workers {
    Rayon(ThreadPool),
    Inline,
}

/// Runs batches of units on a bounded set of worker threads.
///
/// The pool imposes no ordering; callers submit only units whose inputs are
/// already available. Units sharing an identity still serialize on the
/// identity's workspace lock.
pub struct WorkerPool {
    workers: Workers,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("threads", &self.threads())
            .finish()
    }
}

impl WorkerPool {
    /// A pool sized by [`EngineConfig::workers`].
    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(config.workers)
    }

    pub fn new(threads: usize) -> Self {
        // Thread creation can fail under low process limits; shrink the pool
        // rather than fail, and run inline as a last resort.
        let mut threads = threads.max(1);
        loop {
            match rayon::ThreadPoolBuilder::new()
                .num_threads(threads)
                .thread_name(|idx| format!("keel-worker-{idx}"))
                .build()
            {
                Ok(pool) => {
                    return Self {
                        workers: Workers::Rayon(pool),
                    }
                }
                Err(err) if threads > 1 => {
                    tracing::warn!(
                        target = "keel.execution",
                        threads,
                        error = %err,
                        "failed to start worker pool; retrying with fewer threads"
                    );
                    threads = (threads / 2).max(1);
                }
                Err(err) => {
                    tracing::warn!(
                        target = "keel.execution",
                        error = %err,
                        "failed to start any worker thread; executing inline"
                    );
                    return Self {
                        workers: Workers::Inline,
                    };
                }
            }
        }
    }

    /// Number of units that can execute at once.
    pub fn threads(&self) -> usize {
        match &self.workers {
            Workers::Rayon(pool) => pool.current_num_threads(),
            Workers::Inline => 1,
        }
    }

    /// Executes every unit and returns the results in input order.
    pub fn execute_all(
        &self,
        engine: &ExecutionEngine,
        units: &[UnitOfWork],
    ) -> Vec<Result<ExecutionResult>> {
        match &self.workers {
            Workers::Rayon(pool) => {
                pool.install(|| units.par_iter().map(|unit| engine.execute(unit)).collect())
            }
            Workers::Inline => units.iter().map(|unit| engine.execute(unit)).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_size_follows_the_configured_worker_count() {
        let mut config = EngineConfig::new(std::env::temp_dir().join("keel-unused"));
        config.workers = 3;
        assert_eq!(WorkerPool::from_config(&config).threads(), 3);

        config.workers = 0;
        assert_eq!(WorkerPool::from_config(&config).threads(), 1);
    }
}
