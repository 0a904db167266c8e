//! Integration tests for the run and analyze stages

use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bench_core::analysis::{Analyzer, TimingStats};
use bench_core::cases::{load_cases, CaseSet};
use bench_core::config::{BackendConfig, BackendKind, BenchConfig, GeneratorConfig};
use bench_core::dataset::{compose_single, payload_for, Category, DatasetGenerator, Ratios};
use bench_core::decoding::{create_backend, Backend, BackendError, CommandBackend, LumaDecoder, RxingDecoder};
use bench_core::encoder::BarcodeEncoder;
use bench_core::model::{BenchmarkResult, DecodedItem, RunStatus, TestCase};
use bench_core::results::{read_results, ResultLog};
use bench_core::runner::{BenchmarkRunner, RunnerConfig};
use bench_core::symbology::Symbology;

fn init_logging() {
    let _ = env_logger::builder()
        .filter_level(log::LevelFilter::Debug)
        .is_test(true)
        .try_init();
}

fn dataset(dir: &Path, total: i64, seed: u64) -> CaseSet {
    let mut generator = DatasetGenerator::new(dir, seed, GeneratorConfig::default()).unwrap();
    generator.generate(total, &Ratios::default()).unwrap();
    generator.finalize().unwrap();
    load_cases(dir).unwrap()
}

/// Reads the ground truth from the sidecar next to the image
struct Oracle {
    calls: Arc<AtomicUsize>,
}

impl Backend for Oracle {
    fn name(&self) -> &str {
        "oracle"
    }

    fn decode(&self, image_path: &Path) -> Result<Vec<DecodedItem>, BackendError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let text = fs::read_to_string(image_path.with_extension("json"))
            .map_err(|e| BackendError::Runtime(e.to_string()))?;
        let case: TestCase = serde_json::from_str(&text).map_err(|e| BackendError::Runtime(e.to_string()))?;
        Ok(case
            .barcode_data
            .iter()
            .zip(&case.barcode_types)
            .map(|(text, tag)| DecodedItem::new(text.as_str(), tag.as_str()))
            .collect())
    }
}

struct Sleeper(Duration);

impl Backend for Sleeper {
    fn name(&self) -> &str {
        "sleeper"
    }

    fn decode(&self, _image_path: &Path) -> Result<Vec<DecodedItem>, BackendError> {
        std::thread::sleep(self.0);
        Ok(Vec::new())
    }
}

struct Panicker;

impl Backend for Panicker {
    fn name(&self) -> &str {
        "panicker"
    }

    fn decode(&self, _image_path: &Path) -> Result<Vec<DecodedItem>, BackendError> {
        panic!("decoder crashed");
    }
}

struct BrokenInit;

impl Backend for BrokenInit {
    fn name(&self) -> &str {
        "broken"
    }

    fn initialize(&mut self) -> Result<(), BackendError> {
        Err(BackendError::Init {
            backend: "broken".to_string(),
            reason: "license missing".to_string(),
        })
    }

    fn decode(&self, _image_path: &Path) -> Result<Vec<DecodedItem>, BackendError> {
        unreachable!("decode after failed initialization")
    }
}

fn oracle() -> (Box<dyn Backend>, Arc<AtomicUsize>) {
    let calls = Arc::new(AtomicUsize::new(0));
    (Box::new(Oracle { calls: Arc::clone(&calls) }), calls)
}

#[test]
fn test_oracle_run_records_every_pair() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let cases = dataset(&dir.path().join("dataset"), 6, 21);
    let log_path = dir.path().join("results.jsonl");

    let (backend, _) = oracle();
    let mut runner = BenchmarkRunner::new(vec![backend], RunnerConfig::default());
    let (mut log, _) = ResultLog::open(&log_path).unwrap();
    let summary = runner.run(&cases.cases, &mut log).unwrap();

    assert_eq!(summary.measured, 6);
    assert_eq!(summary.successes, 6);

    let results = read_results(&log_path).unwrap();
    assert_eq!(results.len(), 6);
    for (result, loaded) in results.iter().zip(&cases.cases) {
        assert_eq!(result.test_case_id, loaded.case.test_id);
        assert_eq!(result.barcodes_expected, loaded.case.barcode_data.len());
        assert!(result.detection_time_ms >= 0.0);
        assert_eq!(result.test_metadata(), Some(&loaded.metadata));
    }
}

#[test]
fn test_restart_skips_measured_pairs() {
    let dir = tempfile::tempdir().unwrap();
    let cases = dataset(&dir.path().join("dataset"), 4, 5);
    let log_path = dir.path().join("results.jsonl");

    {
        let (backend, _) = oracle();
        let mut runner = BenchmarkRunner::new(vec![backend], RunnerConfig::default());
        let (mut log, _) = ResultLog::open(&log_path).unwrap();
        runner.run(&cases.cases[..2], &mut log).unwrap();
    }

    let (backend, calls) = oracle();
    let mut runner = BenchmarkRunner::new(vec![backend], RunnerConfig::default());
    let (mut log, existing) = ResultLog::open(&log_path).unwrap();
    assert_eq!(existing.len(), 2);
    let summary = runner.run(&cases.cases, &mut log).unwrap();

    assert_eq!(summary.skipped_existing, 2);
    assert_eq!(summary.measured, 2);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(read_results(&log_path).unwrap().len(), 4);
}

#[test]
fn test_timeout_panic_and_init_failure_do_not_abort() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let cases = dataset(&dir.path().join("dataset"), 2, 8);
    let log_path = dir.path().join("results.jsonl");

    let (good, _) = oracle();
    let backends: Vec<Box<dyn Backend>> = vec![
        Box::new(Sleeper(Duration::from_millis(500))),
        Box::new(Panicker),
        Box::new(BrokenInit),
        good,
    ];
    let config = RunnerConfig {
        timeout: Some(Duration::from_millis(50)),
        strict_format: false,
    };
    let mut runner = BenchmarkRunner::new(backends, config);
    let (mut log, _) = ResultLog::open(&log_path).unwrap();
    let summary = runner.run(&cases.cases, &mut log).unwrap();

    assert_eq!(summary.measured, 8);
    assert_eq!(summary.successes, 2);
    assert_eq!(summary.timeouts, 2);

    let results = read_results(&log_path).unwrap();
    let by = |lib: &str| -> Vec<&BenchmarkResult> { results.iter().filter(|r| r.library_name == lib).collect() };

    for r in by("sleeper") {
        assert!(!r.success);
        assert_eq!(r.barcodes_detected, 0);
        assert_eq!(r.status(), Some(RunStatus::Timeout));
        assert!((r.detection_time_ms - 50.0).abs() < 1e-9);
    }
    for r in by("panicker") {
        assert_eq!(r.status(), Some(RunStatus::Error));
        assert!(r.error_message.as_deref().unwrap().contains("decoder crashed"));
    }
    for r in by("broken") {
        assert_eq!(r.status(), Some(RunStatus::InitFailed));
        assert!(r.error_message.as_deref().unwrap().contains("license missing"));
    }
    assert!(by("oracle").iter().all(|r| r.success));
}

/// Live processes whose command line contains `marker`
#[cfg(target_os = "linux")]
fn processes_with(marker: &str) -> usize {
    fs::read_dir("/proc")
        .unwrap()
        .filter_map(|entry| fs::read(entry.ok()?.path().join("cmdline")).ok())
        .filter(|cmdline| String::from_utf8_lossy(cmdline).contains(marker))
        .count()
}

#[cfg(target_os = "linux")]
#[test]
fn test_timed_out_command_is_killed() {
    use std::os::unix::fs::PermissionsExt;

    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let cases = dataset(&dir.path().join("dataset"), 1, 13);
    let log_path = dir.path().join("results.jsonl");

    let marker = "7.654";
    let program = dir.path().join("slow-decoder");
    fs::write(
        &program,
        format!("#!/bin/sh\n[ \"$1\" = --version ] && {{ echo slow 1.0; exit 0; }}\nexec sleep {}\n", marker),
    )
    .unwrap();
    fs::set_permissions(&program, fs::Permissions::from_mode(0o755)).unwrap();

    let backend = CommandBackend::new("slow", program.to_string_lossy(), Vec::new());
    let config = RunnerConfig {
        timeout: Some(Duration::from_millis(200)),
        strict_format: false,
    };
    let mut runner = BenchmarkRunner::new(vec![Box::new(backend)], config);
    let (mut log, _) = ResultLog::open(&log_path).unwrap();
    let summary = runner.run(&cases.cases, &mut log).unwrap();
    assert_eq!(summary.timeouts, 1);

    let results = read_results(&log_path).unwrap();
    assert_eq!(results[0].status(), Some(RunStatus::Timeout));
    assert!((results[0].detection_time_ms - 200.0).abs() < 1e-9);

    // The child is polled every 10 ms
    let deadline = std::time::Instant::now() + Duration::from_secs(2);
    while processes_with(marker) > 0 && std::time::Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(20));
    }
    assert_eq!(processes_with(marker), 0, "decoder process survived the timeout");
}

#[test]
fn test_analyzer_matches_independent_statistics() {
    let dir = tempfile::tempdir().unwrap();
    let cases = dataset(&dir.path().join("dataset"), 10, 77);
    let log_path = dir.path().join("results.jsonl");

    let (backend, _) = oracle();
    let mut runner = BenchmarkRunner::new(vec![backend, Box::new(Sleeper(Duration::from_millis(1)))], RunnerConfig::default());
    let (mut log, _) = ResultLog::open(&log_path).unwrap();
    runner.run(&cases.cases, &mut log).unwrap();

    let results = read_results(&log_path).unwrap();
    let report = Analyzer::new(true).with_cases(&cases).analyze(&results);

    let times: Vec<f64> = results
        .iter()
        .filter(|r| r.library_name == "oracle" && r.success)
        .map(|r| r.detection_time_ms)
        .collect();
    let n = times.len() as f64;
    let mean = times.iter().sum::<f64>() / n;
    let std = (times.iter().map(|t| (t - mean).powi(2)).sum::<f64>() / (n - 1.0)).sqrt();
    let mut sorted = times.clone();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
    let median = (sorted[4] + sorted[5]) / 2.0;

    let stats = &report.libraries["oracle"];
    assert_eq!(stats.count, 10);
    assert_eq!(stats.success_rate, 1.0);
    assert!((stats.detection_time_ms.mean - mean).abs() < 1e-9);
    assert!((stats.detection_time_ms.median - median).abs() < 1e-9);
    assert!((stats.detection_time_ms.std - std).abs() < 1e-9);

    let sleeper = &report.libraries["sleeper"];
    assert_eq!(sleeper.success_rate, 0.0);
    assert_eq!(sleeper.detection_time_ms, TimingStats::default());

    assert_eq!(report.overall.total, 20);
    assert_eq!(report.overall.successful, 10);
    assert_eq!(report.focus_areas["challenging"].best.as_deref(), Some("oracle"));
    assert_eq!(report.test_types.values().sum::<usize>(), 10);
}

#[test]
fn test_rxing_end_to_end() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let data_dir = dir.path().join("dataset");
    let mut generator = DatasetGenerator::new(&data_dir, 3, GeneratorConfig::default()).unwrap();
    generator.generate(3, &"single=1".parse().unwrap()).unwrap();
    generator.finalize().unwrap();

    let mut config = BenchConfig::default();
    config.backends = vec![BackendConfig::new("rxing", BackendKind::Rxing)];
    let log_path = dir.path().join("results.jsonl");
    let summary = bench_core::run_benchmark(&data_dir, None, &config, &log_path).unwrap();
    assert_eq!(summary.measured, 3);

    let out = dir.path().join("report");
    let report = bench_core::analyze_results(&log_path, Some(&data_dir), &config, &out).unwrap();
    assert_eq!(report.overall.total, 3);
    // Every clean single case decodes with the default decoder
    assert_eq!(report.overall.successful, 3, "{:?}", report.failures);
    assert!(out.join("report.html").is_file());
    assert!(out.join("analysis.json").is_file());
}

#[test]
fn test_default_tags_decode_to_ground_truth() {
    let config = GeneratorConfig::default();
    let encoder = BarcodeEncoder::default();

    let mut inputs: Vec<(Symbology, String)> = Symbology::DEFAULT_SET
        .iter()
        .map(|&tag| (tag, payload_for(Category::Single, tag, 17, 0, 0.0)))
        .collect();
    // Payloads that go through repair
    inputs.push((Symbology::Ean13, "978-0-306-40615".to_string()));
    inputs.push((Symbology::Ean8, "12-34".to_string()));
    inputs.push((Symbology::Itf, "12345".to_string()));
    inputs.push((Symbology::Code39, "code-39 x".to_string()));

    for (tag, payload) in inputs {
        let (width, height) = if tag.is_two_dimensional() {
            (config.square_size, config.square_size)
        } else {
            (config.linear_width, config.linear_height)
        };
        let symbol = encoder.encode(&payload, tag, width, height).unwrap();
        assert!(!symbol.placeholder);
        let (canvas, _) = compose_single(&config, &symbol.image);
        let luma = image::DynamicImage::ImageRgb8(canvas).to_luma8();

        let items = RxingDecoder.decode_luma(&luma).unwrap();
        assert!(
            items.iter().any(|item| item.text == symbol.ground_truth
                && Symbology::from_format_name(&item.format) == Some(tag)),
            "{} {:?}: expected {:?}, decoded {:?}",
            tag,
            payload,
            symbol.ground_truth,
            items
        );
    }
}

#[test]
fn test_config_controls_placeholder_accounting() {
    let dir = tempfile::tempdir().unwrap();
    let log_path = dir.path().join("results.jsonl");
    let record = |id: &str, placeholder: bool, success: bool| BenchmarkResult {
        library_name: "rxing".to_string(),
        test_case_id: id.to_string(),
        success,
        detection_time_ms: 1.0,
        barcodes_detected: usize::from(success),
        barcodes_expected: 1,
        error_message: None,
        additional_metrics: [(
            "test_metadata".to_string(),
            serde_json::json!({"test_type": "single", "placeholder": placeholder}),
        )]
        .into_iter()
        .collect(),
    };
    {
        let (mut log, _) = ResultLog::open(&log_path).unwrap();
        log.append(&record("single_0000", false, true)).unwrap();
        log.append(&record("single_0001", true, false)).unwrap();
    }

    let mut config = BenchConfig::default();
    let report = bench_core::analyze_results(&log_path, None, &config, &dir.path().join("a")).unwrap();
    assert_eq!(report.placeholder_excluded, 1);
    assert_eq!(report.overall.total, 1);
    assert_eq!(report.overall.success_rate, 1.0);

    config.include_placeholders = true;
    let report = bench_core::analyze_results(&log_path, None, &config, &dir.path().join("b")).unwrap();
    assert_eq!(report.placeholder_excluded, 0);
    assert_eq!(report.overall.total, 2);
    assert_eq!(report.overall.success_rate, 0.5);
}

#[test]
fn test_factory_builds_configured_backends() {
    let runner = BenchmarkRunner::from_config(&BenchConfig::default()).unwrap();
    assert_eq!(runner.backend_names(), ["rxing", "rxing_enhanced", "rqrr"]);

    let backend = create_backend(&BackendConfig::new("qr", BackendKind::Rqrr)).unwrap();
    assert_eq!(backend.name(), "qr");
}
