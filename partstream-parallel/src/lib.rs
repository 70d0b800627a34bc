//! Bounded parallelism for particle pipelines
//!
//! Two pieces live here:
//!
//! - [`WorkerPool`] splits a batch into contiguous ranges, one per worker,
//!   each with its own lazily built context. Output order matches the input.
//!   A saturated pool quietly runs work on the caller's thread.
//! - [`ParallelConcatStream`] reads several streams at once on dedicated
//!   threads with bounded prefetch. It keeps each child's order but not the
//!   global order.

#![warn(missing_docs)]

pub mod concat;
pub mod pool;

pub use concat::{ParallelConcatConfig, ParallelConcatStream};
pub use pool::{PoolConfig, WorkerPool};
