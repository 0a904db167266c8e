//! Анализ результатов
//!
//! Читает журнал и sidecar, никогда не вызывает декодеры. Результат -
//! неизменяемый снимок `AnalysisReport`, из которого строится отчёт.
//!
//! Время (среднее, медиана, std) считается только по успешным замерам,
//! знаменатель доли успеха включает неудачи. Деление на ноль даёт 0.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::cases::CaseSet;
use crate::model::{BenchmarkResult, TestType};

/// Нижняя граница среднего времени (секунды) в оценке масштабируемости
const SCALABILITY_EPSILON_S: f64 = 0.001;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OverallStats {
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
    pub success_rate: f64,
    pub libraries: Vec<String>,
}

/// Статистика времени по успешным замерам, мс
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TimingStats {
    pub min: f64,
    pub mean: f64,
    pub median: f64,
    pub max: f64,
    pub std: f64,
}

impl TimingStats {
    pub fn from_samples(samples: &[f64]) -> Self {
        if samples.is_empty() {
            return Self::default();
        }
        let mut sorted = samples.to_vec();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(Ordering::Equal));

        let n = sorted.len();
        let median = if n % 2 == 1 {
            sorted[n / 2]
        } else {
            (sorted[n / 2 - 1] + sorted[n / 2]) / 2.0
        };

        Self {
            min: sorted[0],
            mean: mean(&sorted),
            median,
            max: sorted[n - 1],
            std: sample_std(&sorted),
        }
    }
}

fn mean(samples: &[f64]) -> f64 {
    if samples.is_empty() {
        0.0
    } else {
        samples.iter().sum::<f64>() / samples.len() as f64
    }
}

/// Выборочное стандартное отклонение (n - 1); меньше двух точек - 0
fn sample_std(samples: &[f64]) -> f64 {
    if samples.len() < 2 {
        return 0.0;
    }
    let m = mean(samples);
    let var = samples.iter().map(|x| (x - m).powi(2)).sum::<f64>() / (samples.len() - 1) as f64;
    var.sqrt()
}

fn ratio(part: usize, whole: usize) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LibraryStats {
    pub count: usize,
    pub successful: usize,
    pub success_rate: f64,
    pub detection_time_ms: TimingStats,
    pub timeouts: usize,
    pub errors: usize,
}

/// Показатели бэкенда в одной группе кейсов
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GroupStats {
    pub count: usize,
    pub success_rate: f64,
    pub mean_time_ms: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AreaLibraryStats {
    pub count: usize,
    pub successful: usize,
    pub success_rate: f64,
    pub mean_time_ms: f64,
    /// Только для multiple: success_rate / max(mean_time_s, 0.001)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scalability: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avg_barcodes_detected: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FocusAreaStats {
    pub total_tests: usize,
    pub libraries: BTreeMap<String, AreaLibraryStats>,
    /// (success_rate desc, mean_time asc)
    pub ranking: Vec<String>,
    pub best: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureEntry {
    pub test_case_id: String,
    pub library_name: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OmittedCase {
    pub path: String,
    pub reason: String,
}

/// Снимок анализа
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnalysisReport {
    pub generated: String,
    pub overall: OverallStats,
    pub libraries: BTreeMap<String, LibraryStats>,
    /// Число кейсов каждого типа
    pub test_types: BTreeMap<String, usize>,
    pub focus_areas: BTreeMap<String, FocusAreaStats>,
    /// бэкенд -> тег деградации -> показатели
    pub degradation_impact: BTreeMap<String, BTreeMap<String, GroupStats>>,
    /// бэкенд -> угол поворота -> показатели
    pub by_rotation: BTreeMap<String, BTreeMap<String, GroupStats>>,
    /// бэкенд -> число символов -> показатели
    pub by_barcode_count: BTreeMap<String, BTreeMap<usize, GroupStats>>,
    pub failures: Vec<FailureEntry>,
    /// Записи по кейсам с заглушками, не вошедшие в статистику
    pub placeholder_excluded: usize,
    /// Записи без метаданных и без распознаваемого test_id
    pub unclassified: usize,
    pub omitted_cases: Vec<OmittedCase>,
}

/// Запись журнала вместе с метаданными кейса
struct Row<'a> {
    result: &'a BenchmarkResult,
    test_type: Option<TestType>,
    tags: Vec<String>,
    rotation: Option<f64>,
    barcode_count: usize,
}

impl Row<'_> {
    fn time(&self) -> f64 {
        self.result.detection_time_ms
    }
}

fn group_stats(rows: &[&Row]) -> GroupStats {
    let successes: Vec<f64> = rows.iter().filter(|r| r.result.success).map(|r| r.time()).collect();
    GroupStats {
        count: rows.len(),
        success_rate: ratio(successes.len(), rows.len()),
        mean_time_ms: mean(&successes),
    }
}

/// Анализатор журнала результатов
#[derive(Debug, Clone, Default)]
pub struct Analyzer {
    include_placeholders: bool,
    sidecars: HashMap<String, Value>,
    omitted: Vec<OmittedCase>,
}

impl Analyzer {
    pub fn new(include_placeholders: bool) -> Self {
        Self {
            include_placeholders,
            ..Self::default()
        }
    }

    /// Метаданные из sidecar датасета имеют приоритет над копией в журнале
    pub fn with_cases(mut self, set: &CaseSet) -> Self {
        for loaded in &set.cases {
            self.sidecars.insert(loaded.case.test_id.clone(), loaded.metadata.clone());
        }
        self.omitted.extend(set.skipped.iter().map(|s| OmittedCase {
            path: s.path.display().to_string(),
            reason: s.reason.clone(),
        }));
        self
    }

    fn metadata<'a>(&'a self, result: &'a BenchmarkResult) -> Option<&'a Value> {
        self.sidecars.get(&result.test_case_id).or_else(|| result.test_metadata())
    }

    fn row<'a>(&'a self, result: &'a BenchmarkResult) -> (Row<'a>, bool) {
        let meta = self.metadata(result);
        let field = |key: &str| meta.and_then(|m| m.get(key));

        let test_type = field("test_type")
            .and_then(Value::as_str)
            .and_then(|s| TestType::from_str(s).ok())
            .or_else(|| TestType::from_test_id(&result.test_case_id));
        let tags = field("degradations_list")
            .and_then(Value::as_array)
            .map(|a| a.iter().filter_map(Value::as_str).map(str::to_string).collect())
            .unwrap_or_default();
        let placeholder = field("placeholder").and_then(Value::as_bool).unwrap_or(false);

        (
            Row {
                result,
                test_type,
                tags,
                rotation: field("rotation_angle").and_then(Value::as_f64),
                barcode_count: result.barcodes_expected,
            },
            placeholder,
        )
    }

    pub fn analyze(&self, results: &[BenchmarkResult]) -> AnalysisReport {
        let mut report = AnalysisReport {
            generated: chrono::Utc::now().to_rfc3339(),
            omitted_cases: self.omitted.clone(),
            ..AnalysisReport::default()
        };

        let mut rows = Vec::with_capacity(results.len());
        for result in results {
            let (row, placeholder) = self.row(result);
            if placeholder && !self.include_placeholders {
                report.placeholder_excluded += 1;
                continue;
            }
            if row.test_type.is_none() {
                report.unclassified += 1;
            }
            rows.push(row);
        }
        log::info!(
            "analyzing {} results ({} placeholder records excluded)",
            rows.len(),
            report.placeholder_excluded
        );

        let mut libraries: Vec<String> = Vec::new();
        for row in &rows {
            if !libraries.contains(&row.result.library_name) {
                libraries.push(row.result.library_name.clone());
            }
        }
        let by_library = |lib: &str| -> Vec<&Row> { rows.iter().filter(|r| r.result.library_name == lib).collect() };

        let successful = rows.iter().filter(|r| r.result.success).count();
        report.overall = OverallStats {
            total: rows.len(),
            successful,
            failed: rows.len() - successful,
            success_rate: ratio(successful, rows.len()),
            libraries: libraries.clone(),
        };

        for lib in &libraries {
            let lib_rows = by_library(lib);
            report.libraries.insert(lib.clone(), library_stats(&lib_rows));
            report
                .degradation_impact
                .insert(lib.clone(), degradation_impact(&lib_rows));

            let mut rotation: BTreeMap<String, Vec<&Row>> = BTreeMap::new();
            let mut counts: BTreeMap<usize, Vec<&Row>> = BTreeMap::new();
            for row in lib_rows.iter().copied() {
                if let Some(angle) = row.rotation {
                    rotation.entry(format!("{}", angle)).or_default().push(row);
                }
                counts.entry(row.barcode_count).or_default().push(row);
            }
            report.by_rotation.insert(
                lib.clone(),
                rotation.into_iter().map(|(k, v)| (k, group_stats(&v))).collect(),
            );
            report.by_barcode_count.insert(
                lib.clone(),
                counts.into_iter().map(|(k, v)| (k, group_stats(&v))).collect(),
            );
        }

        let mut seen_cases: HashSet<&str> = HashSet::new();
        for row in &rows {
            if let Some(t) = row.test_type {
                if seen_cases.insert(row.result.test_case_id.as_str()) {
                    *report.test_types.entry(t.as_str().to_string()).or_default() += 1;
                }
            }
        }

        for area in TestType::FOCUS_AREAS {
            let area_rows: Vec<&Row> = rows.iter().filter(|r| r.test_type == Some(area)).collect();
            report
                .focus_areas
                .insert(area.as_str().to_string(), focus_area(area, &area_rows, &libraries));
        }

        report.failures = rows
            .iter()
            .filter(|r| !r.result.success)
            .map(|r| FailureEntry {
                test_case_id: r.result.test_case_id.clone(),
                library_name: r.result.library_name.clone(),
                status: r
                    .result
                    .status()
                    .map(|s| s.as_str().to_string())
                    .unwrap_or_else(|| "failed".to_string()),
                error_message: r.result.error_message.clone(),
            })
            .collect();

        report
    }
}

fn library_stats(rows: &[&Row]) -> LibraryStats {
    use crate::model::RunStatus;

    let successes: Vec<f64> = rows.iter().filter(|r| r.result.success).map(|r| r.time()).collect();
    let status_count =
        |wanted: &[RunStatus]| rows.iter().filter(|r| r.result.status().is_some_and(|s| wanted.contains(&s))).count();

    LibraryStats {
        count: rows.len(),
        successful: successes.len(),
        success_rate: ratio(successes.len(), rows.len()),
        detection_time_ms: TimingStats::from_samples(&successes),
        timeouts: status_count(&[RunStatus::Timeout]),
        errors: status_count(&[RunStatus::Error, RunStatus::InitFailed]),
    }
}

fn degradation_impact(rows: &[&Row]) -> BTreeMap<String, GroupStats> {
    let mut by_tag: BTreeMap<&str, Vec<&Row>> = BTreeMap::new();
    for row in rows.iter().copied() {
        for tag in &row.tags {
            by_tag.entry(tag.as_str()).or_default().push(row);
        }
    }
    by_tag
        .into_iter()
        .map(|(tag, rows)| (tag.to_string(), group_stats(&rows)))
        .collect()
}

fn focus_area(area: TestType, rows: &[&Row], libraries: &[String]) -> FocusAreaStats {
    let total_tests = rows
        .iter()
        .map(|r| r.result.test_case_id.as_str())
        .collect::<HashSet<_>>()
        .len();

    let mut stats = BTreeMap::new();
    for lib in libraries {
        let lib_rows: Vec<&Row> = rows.iter().copied().filter(|r| &r.result.library_name == lib).collect();
        if lib_rows.is_empty() {
            continue;
        }
        let successes: Vec<&Row> = lib_rows.iter().copied().filter(|r| r.result.success).collect();
        let times: Vec<f64> = successes.iter().map(|r| r.time()).collect();
        let success_rate = ratio(successes.len(), lib_rows.len());
        let mean_time_ms = mean(&times);

        let (scalability, avg_barcodes_detected) = if area == TestType::Multiple {
            let detected: Vec<f64> = successes.iter().map(|r| r.result.barcodes_detected as f64).collect();
            (
                Some(success_rate / (mean_time_ms / 1000.0).max(SCALABILITY_EPSILON_S)),
                Some(mean(&detected)),
            )
        } else {
            (None, None)
        };

        stats.insert(
            lib.clone(),
            AreaLibraryStats {
                count: lib_rows.len(),
                successful: successes.len(),
                success_rate,
                mean_time_ms,
                scalability,
                avg_barcodes_detected,
            },
        );
    }

    let ranking = rank(&stats);
    FocusAreaStats {
        total_tests,
        best: ranking.first().cloned(),
        ranking,
        libraries: stats,
    }
}

/// Порядок: доля успеха по убыванию, затем среднее время по возрастанию, затем имя
fn rank(stats: &BTreeMap<String, AreaLibraryStats>) -> Vec<String> {
    let mut names: Vec<&String> = stats.keys().collect();
    names.sort_by(|a, b| {
        let (sa, sb) = (&stats[*a], &stats[*b]);
        sb.success_rate
            .partial_cmp(&sa.success_rate)
            .unwrap_or(Ordering::Equal)
            .then(sa.mean_time_ms.partial_cmp(&sb.mean_time_ms).unwrap_or(Ordering::Equal))
            .then_with(|| a.cmp(b))
    });
    names.into_iter().cloned().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn result(case: &str, lib: &str, success: bool, time: f64, meta: Value) -> BenchmarkResult {
        let mut metrics = BTreeMap::new();
        metrics.insert("test_metadata".to_string(), meta);
        BenchmarkResult {
            library_name: lib.to_string(),
            test_case_id: case.to_string(),
            success,
            detection_time_ms: time,
            barcodes_detected: usize::from(success),
            barcodes_expected: 1,
            error_message: None,
            additional_metrics: metrics,
        }
    }

    #[test]
    fn test_timing_stats() {
        let stats = TimingStats::from_samples(&[4.0, 1.0, 3.0, 2.0]);
        assert_eq!(stats.min, 1.0);
        assert_eq!(stats.max, 4.0);
        assert_eq!(stats.mean, 2.5);
        assert_eq!(stats.median, 2.5);
        assert!((stats.std - 1.2909944487).abs() < 1e-9);

        assert_eq!(TimingStats::from_samples(&[]), TimingStats::default());
        assert_eq!(TimingStats::from_samples(&[7.0]).std, 0.0);
    }

    #[test]
    fn test_ranking_prefers_rate_then_speed() {
        let meta = json!({"test_type": "angled", "rotation_angle": 45.0});
        let results = vec![
            result("angled_000", "slow", true, 50.0, meta.clone()),
            result("angled_001", "slow", true, 50.0, meta.clone()),
            result("angled_000", "fast", true, 5.0, meta.clone()),
            result("angled_001", "fast", true, 5.0, meta.clone()),
            result("angled_000", "flaky", true, 1.0, meta.clone()),
            result("angled_001", "flaky", false, 1.0, meta),
        ];
        let report = Analyzer::new(false).analyze(&results);
        let angled = &report.focus_areas["angled"];
        assert_eq!(angled.total_tests, 2);
        assert_eq!(angled.ranking, ["fast", "slow", "flaky"]);
        assert_eq!(angled.best.as_deref(), Some("fast"));
        assert_eq!(report.by_rotation["fast"]["45"].count, 2);
    }

    #[test]
    fn test_degradation_impact_and_scalability() {
        let chal = json!({"test_type": "challenging", "degradations_list": ["gaussian_noise", "shadows"]});
        let multi = json!({"test_type": "multiple"});
        let results = vec![
            result("challenging_000", "rxing", true, 10.0, chal.clone()),
            result("challenging_001", "rxing", false, 99.0, json!({"test_type": "challenging", "degradations_list": ["shadows"]})),
            result("multiple_000", "rxing", true, 2000.0, multi),
        ];
        let report = Analyzer::new(false).analyze(&results);

        let impact = &report.degradation_impact["rxing"];
        assert_eq!(impact["gaussian_noise"].count, 1);
        assert_eq!(impact["shadows"].count, 2);
        assert_eq!(impact["shadows"].success_rate, 0.5);
        assert_eq!(impact["shadows"].mean_time_ms, 10.0);

        let multiple = &report.focus_areas["multiple"].libraries["rxing"];
        assert_eq!(multiple.scalability, Some(0.5));
        assert_eq!(multiple.avg_barcodes_detected, Some(1.0));
        assert!(report.focus_areas["existing_dataset"].libraries.is_empty());
    }

    #[test]
    fn test_placeholders_excluded_by_default() {
        let meta = json!({"test_type": "single", "placeholder": true});
        let results = vec![
            result("single_000", "rxing", false, 1.0, meta),
            result("single_001", "rxing", true, 1.0, json!({"test_type": "single"})),
        ];
        let report = Analyzer::new(false).analyze(&results);
        assert_eq!(report.placeholder_excluded, 1);
        assert_eq!(report.overall.total, 1);
        assert_eq!(report.overall.success_rate, 1.0);

        let report = Analyzer::new(true).analyze(&results);
        assert_eq!(report.overall.total, 2);
        assert_eq!(report.failures.len(), 1);
    }

    #[test]
    fn test_empty_results_yield_zeros() {
        let report = Analyzer::new(false).analyze(&[]);
        assert_eq!(report.overall.success_rate, 0.0);
        assert!(report.libraries.is_empty());
    }
}
