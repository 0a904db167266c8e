use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use bench_core::config::{BenchConfig, GeneratorConfig};
use bench_core::dataset::{DatasetGenerator, Ratios};
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "barcode-bench", version, about = "Synthetic barcode corpus and decoder benchmark")]
struct Cli {
    /// More log output (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Generate a labelled synthetic dataset
    Generate {
        /// Total number of cases (negative values are rejected)
        #[arg(long, allow_hyphen_values = true)]
        total: i64,
        /// Category ratios, e.g. single=0.4,angled=0.3,multiple=0.2,challenging=0.1
        #[arg(long, default_value = "single=0.4,angled=0.3,multiple=0.2,challenging=0.1")]
        ratios: Ratios,
        #[arg(long)]
        output: PathBuf,
        #[arg(long, default_value_t = 42)]
        seed: u64,
        /// Generator settings (JSON)
        #[arg(long)]
        config: Option<PathBuf>,
        /// Skip symbols without an encoder instead of drawing placeholders
        #[arg(long)]
        no_placeholders: bool,
    },
    /// Run every backend over every case, appending to the result log
    Run {
        #[arg(long)]
        dataset: PathBuf,
        /// Directory of real images named <payload>_<anything>.<ext>
        #[arg(long)]
        existing: Option<PathBuf>,
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long)]
        results: PathBuf,
        /// Per-decode timeout; 0 disables the watchdog
        #[arg(long)]
        timeout_ms: Option<u64>,
        /// Require the decoded format to match the expected symbology
        #[arg(long)]
        strict_format: bool,
        /// Comma-separated backend names to keep
        #[arg(long, value_delimiter = ',')]
        backends: Vec<String>,
    },
    /// Aggregate a result log into report.html and analysis.json
    Analyze {
        #[arg(long)]
        results: PathBuf,
        /// Dataset root, used to join results with sidecars
        #[arg(long)]
        dataset: Option<PathBuf>,
        #[arg(long)]
        output: PathBuf,
        /// Benchmark settings (JSON); only `include_placeholders` is used here
        #[arg(long)]
        config: Option<PathBuf>,
        /// Count placeholder cases in headline statistics
        #[arg(long)]
        include_placeholders: bool,
    },
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => log::LevelFilter::Info,
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    let mut builder = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    if verbose > 0 {
        builder.filter_level(level);
    }
    builder.init();
}

fn load_generator_config(path: Option<&Path>) -> Result<GeneratorConfig> {
    let Some(path) = path else {
        return Ok(GeneratorConfig::default());
    };
    let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

fn generate_cmd(
    total: i64,
    ratios: &Ratios,
    output: &Path,
    seed: u64,
    config: Option<&Path>,
    no_placeholders: bool,
) -> Result<()> {
    let mut config = load_generator_config(config)?;
    if no_placeholders {
        config.allow_placeholders = false;
    }

    let mut generator = DatasetGenerator::new(output, seed, config).context("initializing generator")?;
    let counts = generator
        .generate(total, ratios)
        .with_context(|| format!("generating dataset in {}", output.display()))?;
    generator.finalize().context("removing scratch directory")?;

    println!("{}", serde_json::to_string_pretty(&counts)?);
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn load_bench_config(path: Option<&Path>) -> Result<BenchConfig> {
    match path {
        Some(path) => BenchConfig::load(path).with_context(|| format!("loading {}", path.display())),
        None => Ok(BenchConfig::default()),
    }
}

fn run_cmd(
    dataset: &Path,
    existing: Option<&Path>,
    config: Option<&Path>,
    results: &Path,
    timeout_ms: Option<u64>,
    strict_format: bool,
    backends: &[String],
) -> Result<()> {
    let mut config = load_bench_config(config)?;
    match timeout_ms {
        Some(0) => config.timeout_ms = None,
        Some(ms) => config.timeout_ms = Some(ms),
        None => {}
    }
    if strict_format {
        config.strict_format = true;
    }
    if !backends.is_empty() {
        config.retain_backends(backends)?;
    }
    config.validate()?;

    let summary = bench_core::run_benchmark(dataset, existing, &config, results)
        .with_context(|| format!("benchmarking {}", dataset.display()))?;
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

fn analyze_cmd(
    results: &Path,
    dataset: Option<&Path>,
    output: &Path,
    config: Option<&Path>,
    include_placeholders: bool,
) -> Result<()> {
    let mut config = load_bench_config(config)?;
    if include_placeholders {
        config.include_placeholders = true;
    }

    let report = bench_core::analyze_results(results, dataset, &config, output)
        .with_context(|| format!("analyzing {}", results.display()))?;

    println!(
        "{} measurements, {:.1}% success; report in {}",
        report.overall.total,
        report.overall.success_rate * 100.0,
        output.join(bench_core::report::REPORT_FILE).display()
    );
    Ok(())
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let outcome = match cli.command {
        Command::Generate {
            total,
            ratios,
            output,
            seed,
            config,
            no_placeholders,
        } => generate_cmd(total, &ratios, &output, seed, config.as_deref(), no_placeholders),
        Command::Run {
            dataset,
            existing,
            config,
            results,
            timeout_ms,
            strict_format,
            backends,
        } => run_cmd(
            &dataset,
            existing.as_deref(),
            config.as_deref(),
            &results,
            timeout_ms,
            strict_format,
            &backends,
        ),
        Command::Analyze {
            results,
            dataset,
            output,
            config,
            include_placeholders,
        } => analyze_cmd(&results, dataset.as_deref(), &output, config.as_deref(), include_placeholders),
    };

    match outcome {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}
