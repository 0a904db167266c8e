//! Generate a small synthetic dataset, benchmark the built-in decoders on it
//! and write the HTML report.
//!
//! Usage: cargo run -p bench-core --example gen_dataset [OUTPUT_DIR]

use std::path::PathBuf;

use bench_core::config::{BenchConfig, GeneratorConfig};
use bench_core::dataset::{DatasetGenerator, Ratios};

fn main() -> Result<(), bench_core::BenchError> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let root = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("generated_dataset"));
    let dataset_dir = root.join("dataset");

    let mut generator = DatasetGenerator::new(&dataset_dir, 42, GeneratorConfig::default())?;
    let counts = generator.generate(20, &Ratios::default())?;
    generator.finalize()?;
    println!("Generated {} cases in {:?}", counts.total(), dataset_dir);

    let config = BenchConfig::default();
    let results = root.join("results.jsonl");
    let summary = bench_core::run_benchmark(&dataset_dir, None, &config, &results)?;
    println!(
        "Measured {} pairs: {} decoded, {} failed",
        summary.measured, summary.successes, summary.failures
    );

    let report = bench_core::analyze_results(&results, Some(&dataset_dir), &config, &root.join("report"))?;
    for (area, stats) in &report.focus_areas {
        if let Some(best) = &stats.best {
            println!("{:>18}: best backend {}", area, best);
        }
    }
    Ok(())
}
