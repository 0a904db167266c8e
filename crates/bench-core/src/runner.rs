//! Прогон бенчмарка
//!
//! Однопоточный: кейсы по порядку, внутри кейса бэкенды в объявленном порядке.
//! Каждый вызов `decode` ограничен таймаутом (watchdog-поток) и защищён от
//! паники. Сбой одного бэкенда не прерывает прогон.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::{json, Value};

use crate::cases::LoadedCase;
use crate::config::BenchConfig;
use crate::decoding::{create_backend, Backend, BackendError};
use crate::model::{BenchmarkResult, DecodedItem, RunStatus};
use crate::results::{ResultLog, ResultLogError};
use crate::symbology::Symbology;

/// Параметры прогона
#[derive(Debug, Clone, PartialEq)]
pub struct RunnerConfig {
    /// None - без watchdog, вызов в текущем потоке
    pub timeout: Option<Duration>,
    pub strict_format: bool,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            timeout: Some(Duration::from_secs(10)),
            strict_format: false,
        }
    }
}

impl From<&BenchConfig> for RunnerConfig {
    fn from(config: &BenchConfig) -> Self {
        Self {
            timeout: config.timeout_ms.map(Duration::from_millis),
            strict_format: config.strict_format,
        }
    }
}

/// Итоги прогона
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub measured: usize,
    pub skipped_existing: usize,
    pub successes: usize,
    pub failures: usize,
    pub timeouts: usize,
    pub errors: usize,
}

/// Правило успеха: каждый ожидаемый текст совпадает с текстом хотя бы одного
/// декодированного элемента. В строгом режиме должен совпасть и формат.
/// Кейс без ожидаемых данных успешным не бывает.
pub fn is_success(expected: &[String], expected_types: &[String], decoded: &[DecodedItem], strict_format: bool) -> bool {
    if expected.is_empty() {
        return false;
    }
    expected.iter().enumerate().all(|(i, text)| {
        decoded.iter().any(|item| {
            item.text == *text
                && (!strict_format || format_matches(expected_types.get(i).map(String::as_str), &item.format))
        })
    })
}

/// Неизвестный ожидаемый тег проверить нельзя, он совпадает с любым форматом
fn format_matches(expected_tag: Option<&str>, decoded_format: &str) -> bool {
    match expected_tag.map(Symbology::from_str) {
        Some(Ok(tag)) => Symbology::from_format_name(decoded_format) == Some(tag),
        _ => true,
    }
}

struct BackendSlot {
    backend: Arc<dyn Backend>,
    init_error: Option<String>,
}

/// Прогон набора бэкендов по набору кейсов
pub struct BenchmarkRunner {
    slots: Vec<BackendSlot>,
    config: RunnerConfig,
    initialized: bool,
}

impl BenchmarkRunner {
    pub fn new(backends: Vec<Box<dyn Backend>>, config: RunnerConfig) -> Self {
        Self {
            slots: backends
                .into_iter()
                .map(|b| BackendSlot {
                    backend: Arc::from(b),
                    init_error: None,
                })
                .collect(),
            config,
            initialized: false,
        }
    }

    /// Бэкенды из конфигурации (только включённые)
    pub fn from_config(config: &BenchConfig) -> Result<Self, BackendError> {
        let backends = config
            .enabled_backends()
            .map(create_backend)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(backends, RunnerConfig::from(config)))
    }

    pub fn backend_names(&self) -> Vec<&str> {
        self.slots.iter().map(|s| s.backend.name()).collect()
    }

    /// Однократная инициализация; ошибка запоминается и превращается в
    /// записи `init_failed` для всех кейсов этого бэкенда
    pub fn initialize(&mut self) {
        if self.initialized {
            return;
        }
        for slot in &mut self.slots {
            let name = slot.backend.name().to_string();
            let outcome = match Arc::get_mut(&mut slot.backend) {
                Some(backend) => {
                    backend.set_timeout(self.config.timeout);
                    backend.initialize()
                }
                None => Err(BackendError::Init {
                    backend: name.clone(),
                    reason: "backend is shared".to_string(),
                }),
            };
            match outcome {
                Ok(()) => log::info!("{}: initialized", name),
                Err(e) => {
                    log::warn!("{}: initialization failed: {}", name, e);
                    slot.init_error = Some(e.to_string());
                }
            }
        }
        self.initialized = true;
    }

    pub fn cleanup(&mut self) {
        for slot in &mut self.slots {
            let name = slot.backend.name().to_string();
            match Arc::get_mut(&mut slot.backend) {
                Some(backend) => backend.cleanup(),
                // Поток с истёкшим таймаутом ещё держит бэкенд
                None => log::warn!("{}: still busy, cleanup skipped", name),
            }
        }
        self.initialized = false;
    }

    /// Полный прогон: инициализация, замеры с дозаписью в журнал, очистка.
    /// Пары, уже присутствующие в журнале, пропускаются.
    pub fn run(&mut self, cases: &[LoadedCase], log: &mut ResultLog) -> Result<RunSummary, ResultLogError> {
        self.initialize();
        log::info!(
            "running {} cases against {} backends: {}",
            cases.len(),
            self.slots.len(),
            self.backend_names().join(", ")
        );

        let mut summary = RunSummary::default();
        let outcome = self.measure_all(cases, log, &mut summary);
        self.cleanup();
        outcome?;

        log::info!(
            "measured {} pairs ({} skipped as already logged): {} ok, {} failed, {} timeouts, {} errors",
            summary.measured,
            summary.skipped_existing,
            summary.successes,
            summary.failures,
            summary.timeouts,
            summary.errors
        );
        Ok(summary)
    }

    fn measure_all(
        &self,
        cases: &[LoadedCase],
        log: &mut ResultLog,
        summary: &mut RunSummary,
    ) -> Result<(), ResultLogError> {
        for (index, loaded) in cases.iter().enumerate() {
            for slot in &self.slots {
                if log.contains(&loaded.case.test_id, slot.backend.name()) {
                    summary.skipped_existing += 1;
                    continue;
                }

                let result = self.measure_slot(slot, loaded);
                log.append(&result)?;

                summary.measured += 1;
                if result.success {
                    summary.successes += 1;
                } else {
                    summary.failures += 1;
                }
                match result.status() {
                    Some(RunStatus::Timeout) => summary.timeouts += 1,
                    Some(RunStatus::Error) | Some(RunStatus::InitFailed) => summary.errors += 1,
                    _ => {}
                }
            }
            if (index + 1) % 50 == 0 {
                log::info!("progress: {}/{} cases", index + 1, cases.len());
            }
        }
        Ok(())
    }

    /// Замер одного кейса одним бэкендом по имени
    pub fn measure(&self, backend_name: &str, loaded: &LoadedCase) -> Option<BenchmarkResult> {
        self.slots
            .iter()
            .find(|s| s.backend.name() == backend_name)
            .map(|slot| self.measure_slot(slot, loaded))
    }

    fn measure_slot(&self, slot: &BackendSlot, loaded: &LoadedCase) -> BenchmarkResult {
        let name = slot.backend.name();
        if let Some(reason) = &slot.init_error {
            return build_result(
                loaded,
                name,
                Duration::ZERO,
                RunStatus::InitFailed,
                &[],
                Some(reason.clone()),
                false,
            );
        }

        let (elapsed, outcome) = timed_decode(&slot.backend, &loaded.image_path, self.config.timeout);
        match outcome {
            Ok(items) => {
                let status = if items.is_empty() {
                    RunStatus::NoItems
                } else {
                    RunStatus::Ok
                };
                let success = is_success(
                    &loaded.case.barcode_data,
                    &loaded.case.barcode_types,
                    &items,
                    self.config.strict_format,
                );
                log::debug!(
                    "{} / {}: {} items in {:.2} ms, success={}",
                    loaded.case.test_id,
                    name,
                    items.len(),
                    elapsed.as_secs_f64() * 1000.0,
                    success
                );
                build_result(loaded, name, elapsed, status, &items, None, success)
            }
            Err(e) => {
                log::warn!("{} / {}: {}", loaded.case.test_id, name, e);
                let status = match e {
                    BackendError::Timeout(_) => RunStatus::Timeout,
                    _ => RunStatus::Error,
                };
                build_result(loaded, name, elapsed, status, &[], Some(e.to_string()), false)
            }
        }
    }
}

fn build_result(
    loaded: &LoadedCase,
    library_name: &str,
    elapsed: Duration,
    status: RunStatus,
    items: &[DecodedItem],
    error_message: Option<String>,
    success: bool,
) -> BenchmarkResult {
    let mut metrics = std::collections::BTreeMap::new();
    metrics.insert("test_metadata".to_string(), loaded.metadata.clone());
    metrics.insert("status".to_string(), json!(status.as_str()));
    metrics.insert(
        "decoded".to_string(),
        serde_json::to_value(items).unwrap_or(Value::Array(Vec::new())),
    );

    BenchmarkResult {
        library_name: library_name.to_string(),
        test_case_id: loaded.case.test_id.clone(),
        success,
        detection_time_ms: elapsed.as_secs_f64() * 1000.0,
        barcodes_detected: items.len(),
        barcodes_expected: loaded.case.barcode_data.len(),
        error_message,
        additional_metrics: metrics,
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

type DecodeOutcome = Result<Vec<DecodedItem>, BackendError>;

/// Вызов `decode` с замером времени.
///
/// Время меряется вокруг самого вызова. При таймауте рабочий поток не
/// прерывается, его результат отбрасывается, а время записи равно таймауту.
/// Внешние процессы бэкенд убивает сам по лимиту из `set_timeout`.
fn timed_decode(backend: &Arc<dyn Backend>, image_path: &Path, timeout: Option<Duration>) -> (Duration, DecodeOutcome) {
    let Some(timeout) = timeout else {
        let start = Instant::now();
        let outcome = catch_unwind(AssertUnwindSafe(|| backend.decode(image_path)));
        let elapsed = start.elapsed();
        return (
            elapsed,
            outcome.unwrap_or_else(|payload| Err(BackendError::Panic(panic_message(payload.as_ref())))),
        );
    };

    let (tx, rx) = mpsc::channel();
    let worker = Arc::clone(backend);
    let path: PathBuf = image_path.to_path_buf();
    let spawned = thread::Builder::new()
        .name(format!("decode-{}", backend.name()))
        .spawn(move || {
            let start = Instant::now();
            let outcome = catch_unwind(AssertUnwindSafe(|| worker.decode(&path)));
            let elapsed = start.elapsed();
            let outcome = outcome.unwrap_or_else(|payload| Err(BackendError::Panic(panic_message(payload.as_ref()))));
            // Получатель мог уже уйти по таймауту
            let _ = tx.send((elapsed, outcome));
        });
    if let Err(e) = spawned {
        return (Duration::ZERO, Err(BackendError::Runtime(format!("cannot spawn decode thread: {}", e))));
    }

    match rx.recv_timeout(timeout) {
        // Бэкенд сам остановил работу по своему лимиту
        Ok((_, Err(BackendError::Timeout(_)))) => (timeout, Err(BackendError::Timeout(timeout))),
        Ok(result) => result,
        Err(RecvTimeoutError::Timeout) => (timeout, Err(BackendError::Timeout(timeout))),
        Err(RecvTimeoutError::Disconnected) => (
            Duration::ZERO,
            Err(BackendError::Panic("decode thread exited without a result".to_string())),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Difficulty, TestCase, TestType};

    fn decoded(texts: &[&str]) -> Vec<DecodedItem> {
        texts.iter().map(|t| DecodedItem::new(*t, "QR_CODE")).collect()
    }

    fn strings(values: &[&str]) -> Vec<String> {
        values.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_success_rule() {
        let expected = strings(&["ABC123", "XYZ789"]);
        let types = strings(&["QR_CODE", "QR_CODE"]);
        assert!(is_success(&expected, &types, &decoded(&["XYZ789", "ABC123", "GARBAGE"]), false));
        assert!(!is_success(&expected, &types, &decoded(&["ABC123"]), false));
        assert!(!is_success(&[], &[], &decoded(&["ABC123"]), false));
    }

    #[test]
    fn test_strict_format() {
        let expected = strings(&["12345"]);
        let types = strings(&["CODE128"]);
        let items = vec![DecodedItem::new("12345", "CODE_39")];
        assert!(is_success(&expected, &types, &items, false));
        assert!(!is_success(&expected, &types, &items, true));

        let items = vec![DecodedItem::new("12345", "CODE_128")];
        assert!(is_success(&expected, &types, &items, true));

        // UNKNOWN не проверяется
        assert!(is_success(&expected, &strings(&["UNKNOWN"]), &items, true));
    }

    struct Scripted(Vec<DecodedItem>);

    impl Backend for Scripted {
        fn name(&self) -> &str {
            "scripted"
        }

        fn decode(&self, _image_path: &Path) -> Result<Vec<DecodedItem>, BackendError> {
            Ok(self.0.clone())
        }
    }

    fn loaded_case() -> LoadedCase {
        let case = TestCase {
            test_id: "single_000".to_string(),
            image_path: "single/single_000.png".to_string(),
            barcode_data: strings(&["ABC123"]),
            barcode_types: strings(&["CODE128"]),
            barcode_count: 1,
            rotation_angle: 0.0,
            test_type: TestType::Single,
            difficulty: Difficulty::Easy,
            degradations_list: None,
            degradations: None,
            focus_area: None,
            placeholder: false,
            degradation_skipped: Vec::new(),
            barcode_boxes: Vec::new(),
        };
        LoadedCase {
            metadata: serde_json::to_value(&case).unwrap(),
            image_path: PathBuf::from("single/single_000.png"),
            case,
            sidecar_path: None,
        }
    }

    #[test]
    fn test_result_record_shape() {
        let runner = BenchmarkRunner::new(
            vec![Box::new(Scripted(decoded(&["ABC123", "OTHER"])))],
            RunnerConfig::default(),
        );
        let loaded = loaded_case();
        let result = runner.measure("scripted", &loaded).unwrap();

        assert!(result.success);
        assert_eq!(result.barcodes_detected, 2);
        assert_eq!(result.barcodes_expected, 1);
        assert!(result.detection_time_ms >= 0.0);
        assert_eq!(result.test_metadata(), Some(&loaded.metadata));
        assert_eq!(result.status(), Some(RunStatus::Ok));
        assert_eq!(result.additional_metrics["decoded"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn test_no_items_is_not_an_error() {
        let runner = BenchmarkRunner::new(vec![Box::new(Scripted(Vec::new()))], RunnerConfig::default());
        let result = runner.measure("scripted", &loaded_case()).unwrap();
        assert!(!result.success);
        assert_eq!(result.status(), Some(RunStatus::NoItems));
        assert!(result.error_message.is_none());
    }
}
