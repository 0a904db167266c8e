//! Bench Core - генерация синтетического корпуса штрихкодов и замер декодеров
//!
//! Конвейер из трёх этапов:
//! - Генерация датасета: символы, компоновка на холсте, деградации, sidecar JSON
//! - Прогон: каждый кейс через каждый бэкенд с таймаутом, журнал JSONL
//! - Анализ: статистика по журналу и HTML-отчёт

pub mod symbology;
pub mod encoder;
pub mod geometry;
pub mod degradation;
pub mod model;
pub mod config;
pub mod dataset;
pub mod preprocessing;
pub mod decoding;
pub mod cases;
pub mod results;
pub mod runner;
pub mod analysis;
pub mod report;

pub use analysis::{AnalysisReport, Analyzer};
pub use cases::{load_cases, load_existing_dataset, CaseSet, LoadedCase};
pub use config::{BackendConfig, BackendKind, BenchConfig, GeneratorConfig};
pub use dataset::{allocate, CategoryCounts, DatasetGenerator, Ratios};
pub use decoding::{create_backend, Backend, BackendError};
pub use degradation::{Degradation, DegradationKind, Severity};
pub use encoder::{BarcodeEncoder, EncodeError, EncodedSymbol};
pub use model::{BenchmarkResult, DecodedItem, Difficulty, TestCase, TestType};
pub use report::write_report;
pub use results::{read_results, ResultLog};
pub use runner::{is_success, BenchmarkRunner, RunSummary, RunnerConfig};
pub use symbology::Symbology;

use thiserror::Error;

/// Основные ошибки библиотеки
#[derive(Error, Debug)]
pub enum BenchError {
    #[error(transparent)]
    Encode(#[from] encoder::EncodeError),

    #[error(transparent)]
    Degradation(#[from] degradation::DegradationError),

    #[error(transparent)]
    Dataset(#[from] dataset::DatasetError),

    #[error(transparent)]
    Backend(#[from] decoding::BackendError),

    #[error(transparent)]
    Cases(#[from] cases::CaseError),

    #[error(transparent)]
    ResultLog(#[from] results::ResultLogError),

    #[error(transparent)]
    Report(#[from] report::ReportError),

    #[error(transparent)]
    Config(#[from] config::ConfigError),
}

/// Результат с ошибкой библиотеки
pub type Result<T> = std::result::Result<T, BenchError>;

/// Прогон датасета целиком: загрузка кейсов, замер, дозапись в журнал
pub fn run_benchmark(
    dataset: &std::path::Path,
    existing: Option<&std::path::Path>,
    config: &BenchConfig,
    results_path: &std::path::Path,
) -> Result<RunSummary> {
    let mut cases = load_cases(dataset)?;
    if let Some(dir) = existing {
        cases.extend(load_existing_dataset(dir)?);
    }

    let (mut log, _) = ResultLog::open(results_path)?;
    let mut runner = BenchmarkRunner::from_config(config)?;
    Ok(runner.run(&cases.cases, &mut log)?)
}

/// Анализ журнала с необязательной привязкой к sidecar датасета.
/// Учёт заглушек берётся из `config.include_placeholders`.
pub fn analyze_results(
    results_path: &std::path::Path,
    dataset: Option<&std::path::Path>,
    config: &BenchConfig,
    output_dir: &std::path::Path,
) -> Result<AnalysisReport> {
    let results = read_results(results_path)?;
    let mut analyzer = Analyzer::new(config.include_placeholders);
    if let Some(dir) = dataset {
        analyzer = analyzer.with_cases(&load_cases(dir)?);
    }
    let report = analyzer.analyze(&results);
    write_report(output_dir, &report)?;
    Ok(report)
}
