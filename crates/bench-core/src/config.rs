//! Конфигурация генератора и прогона
//!
//! JSON-файл (`--config`) с разумными значениями по умолчанию; флаги CLI
//! перекрывают значения из файла.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::symbology::Symbology;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Параметры генерации датасета
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneratorConfig {
    /// Холст для single / angled / challenging
    pub canvas_width: u32,
    pub canvas_height: u32,
    /// Холст для multiple
    pub multiple_canvas_width: u32,
    pub multiple_canvas_height: u32,
    /// Уровень серого фона
    pub background: u8,
    /// Поля вокруг повёрнутого символа
    pub margin: u32,
    /// Размер 1D-символа (подсказка кодировщику)
    pub linear_width: u32,
    pub linear_height: u32,
    /// Сторона 2D-символа
    pub square_size: u32,
    /// Сторона 2D-символа в multiple
    pub multiple_square_size: u32,
    /// Углы для angled, градусы
    pub angles: Vec<f64>,
    /// Количество символов в multiple
    pub multiple_counts: Vec<usize>,
    /// Вероятность жёсткого набора деградаций
    pub severe_probability: f64,
    /// Рисовать заглушку для тегов без кодировщика
    pub allow_placeholders: bool,
    /// Теги, из которых выбирается символ
    pub symbologies: Vec<Symbology>,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            canvas_width: 800,
            canvas_height: 600,
            multiple_canvas_width: 1600,
            multiple_canvas_height: 1200,
            background: 240,
            margin: 20,
            linear_width: 300,
            linear_height: 150,
            square_size: 300,
            multiple_square_size: 250,
            angles: vec![15.0, 30.0, 45.0, 60.0, 75.0],
            multiple_counts: vec![2, 5, 10, 15],
            severe_probability: 0.3,
            allow_placeholders: true,
            symbologies: Symbology::DEFAULT_SET.to_vec(),
        }
    }
}

impl GeneratorConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.canvas_width <= self.margin * 2 || self.canvas_height <= self.margin * 2 {
            return Err(ConfigError::Invalid("canvas smaller than its margins".to_string()));
        }
        if self.multiple_canvas_width == 0 || self.multiple_canvas_height == 0 {
            return Err(ConfigError::Invalid("empty multiple canvas".to_string()));
        }
        if self.linear_width == 0 || self.linear_height == 0 || self.square_size == 0 || self.multiple_square_size == 0 {
            return Err(ConfigError::Invalid("symbol size hints must be positive".to_string()));
        }
        if self.angles.is_empty() || self.angles.iter().any(|a| !a.is_finite()) {
            return Err(ConfigError::Invalid("angle set must be non-empty and finite".to_string()));
        }
        if self.multiple_counts.is_empty() || self.multiple_counts.contains(&0) {
            return Err(ConfigError::Invalid("multiple counts must be positive".to_string()));
        }
        if !(0.0..=1.0).contains(&self.severe_probability) {
            return Err(ConfigError::Invalid(format!(
                "severe_probability {} outside [0, 1]",
                self.severe_probability
            )));
        }
        if self.symbologies.is_empty() {
            return Err(ConfigError::Invalid("no symbologies to draw from".to_string()));
        }
        Ok(())
    }
}

/// Вид бэкенда
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// rxing, все форматы, несколько символов
    Rxing,
    /// rqrr, только QR
    Rqrr,
    /// Внешняя программа, строки вывода `FORMAT:text`
    Command,
}

/// Описание одного бэкенда
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendConfig {
    pub name: String,
    pub kind: BackendKind,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Повторять на улучшенных изображениях, если ничего не найдено
    #[serde(default)]
    pub enhance: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub program: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
}

fn default_true() -> bool {
    true
}

impl BackendConfig {
    pub fn new(name: &str, kind: BackendKind) -> Self {
        Self {
            name: name.to_string(),
            kind,
            enabled: true,
            enhance: false,
            program: None,
            args: Vec::new(),
        }
    }
}

/// Конфигурация прогона
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BenchConfig {
    /// Бэкенды в порядке вызова
    pub backends: Vec<BackendConfig>,
    /// Таймаут одного вызова; `null` отключает watchdog
    pub timeout_ms: Option<u64>,
    /// Требовать совпадение формата, а не только текста
    pub strict_format: bool,
    /// Учитывать кейсы с заглушками в общей статистике
    pub include_placeholders: bool,
}

impl Default for BenchConfig {
    fn default() -> Self {
        let mut enhanced = BackendConfig::new("rxing_enhanced", BackendKind::Rxing);
        enhanced.enhance = true;

        Self {
            backends: vec![
                BackendConfig::new("rxing", BackendKind::Rxing),
                enhanced,
                BackendConfig::new("rqrr", BackendKind::Rqrr),
            ],
            timeout_ms: Some(10_000),
            strict_format: false,
            include_placeholders: false,
        }
    }
}

impl BenchConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: BenchConfig = serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        for backend in &self.backends {
            if backend.name.is_empty() {
                return Err(ConfigError::Invalid("backend with empty name".to_string()));
            }
            if !seen.insert(backend.name.as_str()) {
                return Err(ConfigError::Invalid(format!("duplicate backend name {}", backend.name)));
            }
            if backend.kind == BackendKind::Command && backend.program.is_none() {
                return Err(ConfigError::Invalid(format!(
                    "command backend {} has no program",
                    backend.name
                )));
            }
        }
        if self.timeout_ms == Some(0) {
            return Err(ConfigError::Invalid("timeout_ms must be positive".to_string()));
        }
        Ok(())
    }

    /// Оставить только бэкенды из списка, в порядке конфигурации
    pub fn retain_backends(&mut self, names: &[String]) -> Result<(), ConfigError> {
        if let Some(unknown) = names.iter().find(|n| !self.backends.iter().any(|b| &b.name == *n)) {
            return Err(ConfigError::Invalid(format!("unknown backend {}", unknown)));
        }
        self.backends.retain(|b| names.contains(&b.name));
        Ok(())
    }

    pub fn enabled_backends(&self) -> impl Iterator<Item = &BackendConfig> {
        self.backends.iter().filter(|b| b.enabled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_generator_config() {
        let config = GeneratorConfig::default();
        assert_eq!((config.canvas_width, config.canvas_height), (800, 600));
        assert_eq!((config.multiple_canvas_width, config.multiple_canvas_height), (1600, 1200));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_bench_config() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"backends": [{{"name": "zbar", "kind": "command", "program": "zbarimg", "args": ["--raw"]}}], "timeout_ms": null}}"#
        )
        .unwrap();

        let config = BenchConfig::load(file.path()).unwrap();
        assert_eq!(config.backends.len(), 1);
        assert!(config.backends[0].enabled);
        assert_eq!(config.timeout_ms, None);
        assert!(!config.strict_format);
    }

    #[test]
    fn test_missing_timeout_uses_default() {
        let config: BenchConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.timeout_ms, Some(10_000));
        assert_eq!(config.backends.len(), 3);
    }

    #[test]
    fn test_duplicate_backend_rejected() {
        let mut config = BenchConfig::default();
        config.backends.push(BackendConfig::new("rxing", BackendKind::Rxing));
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_retain_backends() {
        let mut config = BenchConfig::default();
        config.retain_backends(&["rqrr".to_string()]).unwrap();
        assert_eq!(config.backends.len(), 1);
        assert!(config.retain_backends(&["nope".to_string()]).is_err());
    }
}
