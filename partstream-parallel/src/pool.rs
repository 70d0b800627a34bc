//! Bounded worker pool for batch operations

use std::sync::atomic::{AtomicUsize, Ordering};

use partstream_core::Result;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Configuration for a worker pool
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Number of worker threads; `0` or `1` means run everything on the
    /// calling thread
    pub threads: usize,

    /// Parallel sections allowed at once before callers fall back to
    /// sequential execution
    pub max_in_flight: usize,

    /// Batches with fewer records than this run sequentially
    pub min_parallel_records: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        let threads = num_cpus::get();
        Self {
            threads,
            max_in_flight: threads,
            min_parallel_records: 1024,
        }
    }
}

/// Runs per-record work over contiguous ranges of a record buffer.
///
/// Each range is handed to one worker together with that worker's context
/// slot, so output order always equals input order. When the pool is
/// saturated, or was built without threads, work runs on the caller's
/// thread instead.
pub struct WorkerPool {
    pool: Option<rayon::ThreadPool>,
    in_flight: AtomicUsize,
    config: PoolConfig,
}

impl WorkerPool {
    /// Build a pool; failure to start threads degrades to sequential
    pub fn new(config: PoolConfig) -> Self {
        let pool = if config.threads > 1 {
            match rayon::ThreadPoolBuilder::new()
                .num_threads(config.threads)
                .thread_name(|i| format!("partstream-worker-{i}"))
                .build()
            {
                Ok(pool) => Some(pool),
                Err(e) => {
                    warn!(error = %e, "failed to start worker threads, running sequentially");
                    None
                }
            }
        } else {
            None
        };
        debug!(threads = config.threads, parallel = pool.is_some(), "created worker pool");

        Self {
            pool,
            in_flight: AtomicUsize::new(0),
            config,
        }
    }

    /// A pool that never spawns threads
    pub fn sequential() -> Self {
        Self::new(PoolConfig {
            threads: 1,
            ..PoolConfig::default()
        })
    }

    /// Number of context slots callers should keep for this pool
    pub fn slots(&self) -> usize {
        if self.pool.is_some() {
            self.config.threads
        } else {
            1
        }
    }

    /// Pool configuration
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Apply `f` to contiguous ranges of `count` records in `records`.
    ///
    /// `f` receives the worker's context, the range's bytes and the index of
    /// the range's first record. Contexts live in `slots` and are built
    /// lazily with `init` the first time a slot is used, then kept for later
    /// calls. The first error stops the remaining work.
    pub fn for_each_range<C, I, F>(
        &self,
        records: &mut [u8],
        record_size: usize,
        count: usize,
        slots: &mut [Option<C>],
        init: I,
        f: F,
    ) -> Result<()>
    where
        C: Send,
        I: Fn() -> Result<C> + Sync,
        F: Fn(&mut C, &mut [u8], usize) -> Result<()> + Sync,
    {
        let records = &mut records[..count * record_size];
        let run_one = |slot: &mut Option<C>, range: &mut [u8], first: usize| -> Result<()> {
            if slot.is_none() {
                *slot = Some(init()?);
            }
            match slot {
                Some(context) => f(context, range, first),
                None => Ok(()),
            }
        };

        if slots.is_empty() {
            return Ok(());
        }
        let parallel = self
            .pool
            .as_ref()
            .filter(|_| slots.len() > 1 && record_size > 0 && count >= self.config.min_parallel_records.max(2));
        let Some(pool) = parallel else {
            return run_one(&mut slots[0], records, 0);
        };
        let Some(_guard) = InFlight::enter(&self.in_flight, self.config.max_in_flight) else {
            debug!("worker pool saturated, running batch sequentially");
            return run_one(&mut slots[0], records, 0);
        };

        let per_range = count.div_ceil(slots.len());
        pool.install(|| {
            records
                .par_chunks_mut(per_range * record_size)
                .zip(slots.par_iter_mut())
                .enumerate()
                .try_for_each(|(i, (range, slot))| run_one(slot, range, i * per_range))
        })
    }
}

impl Default for WorkerPool {
    fn default() -> Self {
        Self::new(PoolConfig::default())
    }
}

/// Counts a parallel section for as long as it is alive
struct InFlight<'a> {
    counter: &'a AtomicUsize,
}

impl<'a> InFlight<'a> {
    fn enter(counter: &'a AtomicUsize, limit: usize) -> Option<Self> {
        counter
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n < limit.max(1)).then_some(n + 1))
            .ok()
            .map(|_| Self { counter })
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::AcqRel);
    }
}
