//! Модель данных: тестовый кейс (sidecar) и результат замера
//!
//! Формат sidecar JSON и записи в журнале результатов - внешние интерфейсы,
//! поэтому имена полей фиксированы.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::degradation::SkippedDegradation;
use crate::geometry::Rect;

/// Тип кейса (категория)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestType {
    Single,
    Angled,
    Multiple,
    Challenging,
    ExistingDataset,
}

impl TestType {
    pub const ALL: [TestType; 5] = [
        TestType::Single,
        TestType::Angled,
        TestType::Multiple,
        TestType::Challenging,
        TestType::ExistingDataset,
    ];

    /// Оси стратификации анализатора
    pub const FOCUS_AREAS: [TestType; 4] = [
        TestType::Angled,
        TestType::Multiple,
        TestType::Challenging,
        TestType::ExistingDataset,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            TestType::Single => "single",
            TestType::Angled => "angled",
            TestType::Multiple => "multiple",
            TestType::Challenging => "challenging",
            TestType::ExistingDataset => "existing_dataset",
        }
    }

    /// Метка focus_area, которую генератор пишет в sidecar
    pub fn focus_label(self) -> Option<&'static str> {
        match self {
            TestType::Angled => Some("angled_barcode_performance"),
            TestType::Multiple => Some("multiple_barcode_performance"),
            TestType::Challenging => Some("challenging_conditions"),
            TestType::ExistingDataset => Some("existing_dataset"),
            TestType::Single => None,
        }
    }

    /// Определение типа по префиксу test_id (`angled_003` -> Angled)
    pub fn from_test_id(test_id: &str) -> Option<TestType> {
        if test_id.starts_with("existing_") {
            return Some(TestType::ExistingDataset);
        }
        TestType::ALL
            .iter()
            .copied()
            .find(|t| test_id.starts_with(&format!("{}_", t.as_str())))
    }
}

impl fmt::Display for TestType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TestType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TestType::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| format!("unknown test type: {}", s))
    }
}

/// Сложность кейса
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Difficulty {
    Easy,
    Medium,
    Hard,
    Extreme,
}

/// Эталонная запись для одного изображения (sidecar JSON)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestCase {
    /// Уникальный идентификатор, совпадает с именем файла sidecar без расширения
    pub test_id: String,
    /// Путь к изображению относительно корня датасета
    pub image_path: String,
    pub barcode_data: Vec<String>,
    pub barcode_types: Vec<String>,
    pub barcode_count: usize,
    /// Угол поворота, градусы
    pub rotation_angle: f64,
    pub test_type: TestType,
    pub difficulty: Difficulty,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub degradations_list: Option<Vec<String>>,
    /// Реализованные параметры деградаций: тег -> объект параметров
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub degradations: Option<BTreeMap<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub focus_area: Option<String>,
    /// Хотя бы один символ нарисован заглушкой
    #[serde(default, skip_serializing_if = "is_false")]
    pub placeholder: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub degradation_skipped: Vec<SkippedDegradation>,
    /// Положение символов на холсте до деградаций
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub barcode_boxes: Vec<Rect>,
}

fn is_false(value: &bool) -> bool {
    !*value
}

impl TestCase {
    /// Проверка инвариантов записи
    pub fn validate(&self) -> Result<(), String> {
        if self.test_id.is_empty() {
            return Err("empty test_id".to_string());
        }
        if self.barcode_data.len() != self.barcode_count || self.barcode_types.len() != self.barcode_count {
            return Err(format!(
                "{}: barcode_data={}, barcode_types={}, barcode_count={}",
                self.test_id,
                self.barcode_data.len(),
                self.barcode_types.len(),
                self.barcode_count
            ));
        }
        if !self.rotation_angle.is_finite() {
            return Err(format!("{}: rotation_angle is not finite", self.test_id));
        }
        Ok(())
    }

    /// Теги применённых деградаций (пусто, если их нет)
    pub fn degradation_tags(&self) -> &[String] {
        self.degradations_list.as_deref().unwrap_or(&[])
    }
}

/// Элемент, который вернул декодер
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecodedItem {
    pub text: String,
    /// Имя формата в терминах декодера
    pub format: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f32>,
    /// Четырёхугольник символа на изображении
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub points: Option<[[f32; 2]; 4]>,
}

impl DecodedItem {
    pub fn new(text: impl Into<String>, format: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            format: format.into(),
            confidence: None,
            points: None,
        }
    }
}

/// Исход одного вызова декодера
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Ok,
    NoItems,
    Timeout,
    Error,
    InitFailed,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Ok => "ok",
            RunStatus::NoItems => "no_items",
            RunStatus::Timeout => "timeout",
            RunStatus::Error => "error",
            RunStatus::InitFailed => "init_failed",
        }
    }
}

/// Одна запись на пару (кейс, бэкенд)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BenchmarkResult {
    pub library_name: String,
    pub test_case_id: String,
    pub success: bool,
    pub detection_time_ms: f64,
    pub barcodes_detected: usize,
    pub barcodes_expected: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Обязательно содержит `test_metadata` - копию sidecar
    #[serde(default)]
    pub additional_metrics: BTreeMap<String, Value>,
}

impl BenchmarkResult {
    pub fn test_metadata(&self) -> Option<&Value> {
        self.additional_metrics.get("test_metadata")
    }

    pub fn status(&self) -> Option<RunStatus> {
        self.additional_metrics
            .get("status")
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    /// Пара (кейс, бэкенд) - ключ для перезапуска
    pub fn key(&self) -> (String, String) {
        (self.test_case_id.clone(), self.library_name.clone())
    }
}
