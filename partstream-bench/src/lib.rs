//! Throughput benchmarks for particle stream chains

use std::sync::Arc;
use std::time::{Duration, Instant};

use glam::{Mat4, UVec3, Vec3};
use partstream_core::{
    channels, drain, negotiate, Channel, Error, NullProgress, ParticleSink, ParticleStream, Schema,
    DEFAULT_BATCH_SIZE,
};
use partstream_parallel::{ParallelConcatConfig, ParallelConcatStream, PoolConfig, WorkerPool};
use partstream_pipeline::GradientShader;
use partstream_readers::{LatticeGenerator, ProceduralStream};
use partstream_transforms::{
    FractionalStream, Sampling, ShadeStream, Sphere, TransformStream, VolumeCullStream,
};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Errors raised while benchmarking
#[derive(thiserror::Error, Debug)]
pub enum BenchError {
    /// A chain failed to assemble or to produce records
    #[error("Chain error: {0}")]
    Chain(#[from] Error),

    /// The configuration asks for no timed iterations
    #[error("Benchmark '{0}' has no iterations to time")]
    NoIterations(String),
}

/// Benchmark configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BenchConfig {
    /// Timed iterations
    pub iterations: usize,

    /// Untimed iterations run first
    pub warmup_iterations: usize,

    /// Lattice points per side; each source yields `grid^3` records
    pub grid: u32,

    /// Sources read side by side by the parallel benchmarks
    pub sources: usize,

    /// Worker threads for shading and parallel reading
    pub threads: usize,

    /// Fraction kept by the sampling decorator
    pub fraction: f64,
}

impl Default for BenchConfig {
    fn default() -> Self {
        Self {
            iterations: 10,
            warmup_iterations: 3,
            grid: 64,
            sources: 4,
            threads: 4,
            fraction: 0.5,
        }
    }
}

/// Benchmark result
#[derive(Debug, Clone, Serialize)]
pub struct BenchResult {
    /// Name of the benchmark
    pub name: String,

    /// Total time taken
    pub total_time: Duration,

    /// Average time per iteration
    pub avg_time: Duration,

    /// Min time per iteration
    pub min_time: Duration,

    /// Max time per iteration
    pub max_time: Duration,

    /// Records produced by the last iteration
    pub records: u64,

    /// Throughput (records/second)
    pub throughput: f64,
}

/// Run `func` repeatedly; it returns the number of records it produced
pub fn run_benchmark<F>(name: &str, config: &BenchConfig, mut func: F) -> Result<BenchResult, BenchError>
where
    F: FnMut() -> partstream_core::Result<u64>,
{
    for _ in 0..config.warmup_iterations {
        func()?;
    }

    let mut times = Vec::with_capacity(config.iterations);
    let mut records = 0;
    let mut total_records = 0u64;
    let start_total = Instant::now();

    for _ in 0..config.iterations {
        let start = Instant::now();
        records = func()?;
        times.push(start.elapsed());
        total_records += records;
    }

    let total_time = start_total.elapsed();
    let (Some(min_time), Some(max_time)) = (times.iter().min().copied(), times.iter().max().copied()) else {
        return Err(BenchError::NoIterations(name.to_string()));
    };
    let avg_time = times.iter().sum::<Duration>() / times.len() as u32;
    let throughput = total_records as f64 / total_time.as_secs_f64().max(f64::EPSILON);

    debug!(benchmark = name, records, ?avg_time, "benchmark finished");
    Ok(BenchResult {
        name: name.to_string(),
        total_time,
        avg_time,
        min_time,
        max_time,
        records,
        throughput,
    })
}

/// Sink that only counts what it is given
struct CountingSink {
    schema: Schema,
    records: u64,
}

impl ParticleSink for CountingSink {
    fn schema(&self) -> &Schema {
        &self.schema
    }

    fn consume(&mut self, _records: &[u8], count: usize) -> partstream_core::Result<()> {
        self.records += count as u64;
        Ok(())
    }

    fn flush(&mut self) -> partstream_core::Result<()> {
        Ok(())
    }
}

/// Layout pulled through every benchmarked chain
pub fn requested_schema() -> partstream_core::Result<Schema> {
    Schema::new(vec![
        Channel::of::<Vec3>(channels::POSITION),
        Channel::of::<f32>(channels::DENSITY),
    ])
}

/// Negotiate `requested` on `stream` and pull every record, returning the count
pub fn pull_all(stream: &mut dyn ParticleStream, requested: &Schema) -> partstream_core::Result<u64> {
    negotiate(stream, requested, None)?;
    let mut sink = CountingSink {
        schema: requested.clone(),
        records: 0,
    };
    drain(stream, &mut sink, &NullProgress, DEFAULT_BATCH_SIZE)?;
    Ok(sink.records)
}

/// A lattice source of `grid^3` records, offset by `index` along X
pub fn lattice(config: &BenchConfig, index: usize) -> partstream_core::Result<ProceduralStream<LatticeGenerator>> {
    let origin = Vec3::new(index as f32 * config.grid as f32, 0.0, 0.0);
    Ok(ProceduralStream::new(LatticeGenerator::new(UVec3::splat(config.grid), origin, 1.0)?))
}

/// The render-style chain: transform, sampling, culling and shading over a
/// lattice
pub fn decorator_chain(config: &BenchConfig, pool: Arc<WorkerPool>) -> partstream_core::Result<Box<dyn ParticleStream>> {
    let extent = config.grid as f32;
    let moved = TransformStream::fixed(lattice(config, 0)?, Mat4::from_translation(Vec3::splat(-extent / 2.0)))?;
    let sampled = FractionalStream::new(moved, Sampling::evenly(config.fraction))?;
    let culled = VolumeCullStream::new(
        sampled,
        Arc::new(Sphere {
            center: Vec3::ZERO,
            radius: extent / 4.0,
        }),
        false,
    )?;
    let shader = GradientShader::new(Vec3::splat(-extent / 2.0), Vec3::splat(extent / 2.0), Vec3::ZERO, Vec3::ONE);
    Ok(Box::new(ShadeStream::new(culled, shader, pool)?))
}

/// Pull records straight from a lattice
pub fn bench_source(config: &BenchConfig) -> Result<BenchResult, BenchError> {
    let requested = requested_schema()?;
    run_benchmark("Lattice source", config, || pull_all(&mut lattice(config, 0)?, &requested))
}

/// Pull records through [`decorator_chain`]
pub fn bench_decorator_chain(config: &BenchConfig) -> Result<BenchResult, BenchError> {
    let mut requested = requested_schema()?;
    requested.append_channel(Channel::of::<Vec3>(channels::COLOR))?;
    let pool = Arc::new(WorkerPool::new(PoolConfig {
        threads: config.threads,
        max_in_flight: config.threads,
        ..PoolConfig::default()
    }));
    run_benchmark("Decorator chain", config, || {
        pull_all(decorator_chain(config, Arc::clone(&pool))?.as_mut(), &requested)
    })
}

/// Read `sources` lattices side by side
pub fn bench_parallel_concat(config: &BenchConfig) -> Result<BenchResult, BenchError> {
    let requested = requested_schema()?;
    let concat = ParallelConcatConfig {
        max_threads: config.threads,
        ..ParallelConcatConfig::default()
    };
    run_benchmark("Parallel concatenation", config, || {
        let children = (0..config.sources)
            .map(|i| lattice(config, i).map(|s| Box::new(s) as Box<dyn ParticleStream>))
            .collect::<partstream_core::Result<Vec<_>>>()?;
        pull_all(&mut ParallelConcatStream::new(children, concat.clone()), &requested)
    })
}
