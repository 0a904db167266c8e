//! Журнал результатов
//!
//! JSONL: первая строка - заголовок, далее одна запись `BenchmarkResult` на
//! строку. Каждая запись сбрасывается на диск сразу, поэтому прерванный прогон
//! оставляет корректный журнал.

use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::BenchmarkResult;

const LOG_FORMAT: &str = "barcode-bench/results";
const LOG_VERSION: u32 = 1;

#[derive(Error, Debug)]
pub enum ResultLogError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("corrupt result log header in {path}: {reason}")]
    CorruptHeader { path: PathBuf, reason: String },

    #[error("cannot serialize result: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LogHeader {
    format: String,
    version: u32,
    created: String,
}

impl LogHeader {
    fn new() -> Self {
        Self {
            format: LOG_FORMAT.to_string(),
            version: LOG_VERSION,
            created: chrono::Utc::now().to_rfc3339(),
        }
    }
}

/// Журнал, открытый на дозапись
pub struct ResultLog {
    path: PathBuf,
    file: File,
    completed: HashSet<(String, String)>,
}

impl ResultLog {
    /// Открытие или создание журнала. Возвращает уже записанные результаты.
    pub fn open(path: &Path) -> Result<(Self, Vec<BenchmarkResult>), ResultLogError> {
        let io_err = |source| ResultLogError::Io {
            path: path.to_path_buf(),
            source,
        };

        let existing = if path.exists() {
            parse_log(path, &fs::read_to_string(path).map_err(io_err)?)?
        } else {
            None
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(io_err)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(path)
            .map_err(io_err)?;

        let records = match existing {
            Some(records) => {
                ensure_trailing_newline(&mut file).map_err(io_err)?;
                records
            }
            None => {
                let mut line = serde_json::to_string(&LogHeader::new())?;
                line.push('\n');
                file.write_all(line.as_bytes()).map_err(io_err)?;
                file.flush().map_err(io_err)?;
                Vec::new()
            }
        };

        let completed = records.iter().map(BenchmarkResult::key).collect();
        log::info!("result log {}: {} existing records", path.display(), records.len());
        Ok((
            Self {
                path: path.to_path_buf(),
                file,
                completed,
            },
            records,
        ))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Пара (кейс, бэкенд) уже замерена
    pub fn contains(&self, test_case_id: &str, library_name: &str) -> bool {
        self.completed
            .contains(&(test_case_id.to_string(), library_name.to_string()))
    }

    pub fn append(&mut self, result: &BenchmarkResult) -> Result<(), ResultLogError> {
        let mut line = serde_json::to_string(result)?;
        line.push('\n');
        self.file
            .write_all(line.as_bytes())
            .and_then(|_| self.file.flush())
            .map_err(|source| ResultLogError::Io {
                path: self.path.clone(),
                source,
            })?;
        self.completed.insert(result.key());
        Ok(())
    }
}

fn ensure_trailing_newline(file: &mut File) -> std::io::Result<()> {
    let len = file.seek(SeekFrom::End(0))?;
    if len == 0 {
        return Ok(());
    }
    file.seek(SeekFrom::End(-1))?;
    let mut last = [0u8; 1];
    file.read_exact(&mut last)?;
    if last[0] != b'\n' {
        file.write_all(b"\n")?;
        file.flush()?;
    }
    Ok(())
}

/// None - файл пуст и заголовок нужно записать
fn parse_log(path: &Path, text: &str) -> Result<Option<Vec<BenchmarkResult>>, ResultLogError> {
    let mut lines = text.lines().enumerate().filter(|(_, l)| !l.trim().is_empty());
    let Some((_, header_line)) = lines.next() else {
        return Ok(None);
    };

    let header: LogHeader = serde_json::from_str(header_line).map_err(|e| ResultLogError::CorruptHeader {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    if header.format != LOG_FORMAT || header.version != LOG_VERSION {
        return Err(ResultLogError::CorruptHeader {
            path: path.to_path_buf(),
            reason: format!("unexpected {} v{}", header.format, header.version),
        });
    }

    let mut records = Vec::new();
    for (index, line) in lines {
        match serde_json::from_str::<BenchmarkResult>(line) {
            Ok(record) => records.push(record),
            Err(e) => log::warn!("{}:{}: skipping malformed record: {}", path.display(), index + 1, e),
        }
    }
    Ok(Some(records))
}

/// Чтение результатов: JSONL-журнал или JSON-массив записей
pub fn read_results(path: &Path) -> Result<Vec<BenchmarkResult>, ResultLogError> {
    let io_err = |source| ResultLogError::Io {
        path: path.to_path_buf(),
        source,
    };
    let mut reader = BufReader::new(File::open(path).map_err(io_err)?);
    let mut first = String::new();
    while first.trim().is_empty() {
        first.clear();
        if reader.read_line(&mut first).map_err(io_err)? == 0 {
            return Ok(Vec::new());
        }
    }

    if first.trim_start().starts_with('[') {
        let mut rest = String::new();
        reader.read_to_string(&mut rest).map_err(io_err)?;
        first.push_str(&rest);
        return Ok(serde_json::from_str(&first)?);
    }

    let text = fs::read_to_string(path).map_err(io_err)?;
    Ok(parse_log(path, &text)?.unwrap_or_default())
}
