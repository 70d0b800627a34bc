//! Benchmark runner for particle stream chains
//!
//! Usage: `partstream-bench [config.json]`. Set `RUST_LOG` for chain logs.

use anyhow::Context;
use partstream_bench::{bench_decorator_chain, bench_parallel_concat, bench_source, BenchConfig, BenchResult};
use tracing_subscriber::EnvFilter;

fn print_result(result: &BenchResult) {
    println!("\nBenchmark: {}", result.name);
    println!("  Total time:   {:?}", result.total_time);
    println!("  Average time: {:?}", result.avg_time);
    println!("  Min time:     {:?}", result.min_time);
    println!("  Max time:     {:?}", result.max_time);
    println!("  Records:      {}", result.records);
    println!("  Throughput:   {:.2} records/sec", result.throughput);
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => {
            let text = std::fs::read_to_string(&path).with_context(|| format!("reading {path}"))?;
            serde_json::from_str(&text).with_context(|| format!("parsing {path}"))?
        }
        None => BenchConfig::default(),
    };

    println!("=== Particle Stream Benchmarks ===");
    print_result(&bench_source(&config)?);
    print_result(&bench_decorator_chain(&config)?);
    print_result(&bench_parallel_concat(&config)?);

    println!("\n=== Scaling with grid size ===");
    for grid in [16, 32, 64, 128] {
        let config = BenchConfig {
            iterations: 3,
            warmup_iterations: 1,
            grid,
            ..config.clone()
        };
        let result = bench_decorator_chain(&config)?;
        println!("\nGrid: {grid}^3");
        println!("  Average time: {:?}", result.avg_time);
        println!("  Throughput:   {:.2} records/sec", result.throughput);
    }

    Ok(())
}
