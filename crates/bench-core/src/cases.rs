//! Загрузка тестовых кейсов
//!
//! Sidecar JSON ищутся рекурсивно и перечисляются в отсортированном порядке.
//! Битые sidecar пропускаются с предупреждением. Отсутствие корня - фатальная
//! ошибка.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use serde_json::{json, Value};
use thiserror::Error;

use crate::model::{Difficulty, TestCase, TestType};

/// Расширения изображений, которые принимают читатели
pub const IMAGE_EXTENSIONS: [&str; 7] = ["png", "jpg", "jpeg", "bmp", "tif", "tiff", "webp"];

#[derive(Error, Debug)]
pub enum CaseError {
    #[error("dataset directory {0} does not exist")]
    MissingRoot(PathBuf),

    #[error("cannot list {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Кейс, готовый к замеру
#[derive(Debug, Clone)]
pub struct LoadedCase {
    pub case: TestCase,
    /// Разрешённый путь к изображению
    pub image_path: PathBuf,
    /// Sidecar как есть, копируется в `test_metadata`
    pub metadata: Value,
    pub sidecar_path: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct SkippedCase {
    pub path: PathBuf,
    pub reason: String,
}

#[derive(Debug, Clone, Default)]
pub struct CaseSet {
    pub cases: Vec<LoadedCase>,
    pub skipped: Vec<SkippedCase>,
}

impl CaseSet {
    /// Объединение наборов; дубликаты test_id из `other` пропускаются
    pub fn extend(&mut self, other: CaseSet) {
        let mut seen: HashSet<String> = self.cases.iter().map(|c| c.case.test_id.clone()).collect();
        for loaded in other.cases {
            if seen.insert(loaded.case.test_id.clone()) {
                self.cases.push(loaded);
            } else {
                self.skip(
                    loaded.sidecar_path.unwrap_or(loaded.image_path),
                    format!("duplicate test_id {}", loaded.case.test_id),
                );
            }
        }
        self.skipped.extend(other.skipped);
    }

    fn skip(&mut self, path: PathBuf, reason: String) {
        log::warn!("skipping {}: {}", path.display(), reason);
        self.skipped.push(SkippedCase { path, reason });
    }
}

fn list_files(root: &Path, filter: &dyn Fn(&Path) -> bool) -> Result<Vec<PathBuf>, CaseError> {
    let mut files = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let entries = fs::read_dir(&dir).map_err(|source| CaseError::Io {
            path: dir.clone(),
            source,
        })?;
        for entry in entries {
            let entry = entry.map_err(|source| CaseError::Io {
                path: dir.clone(),
                source,
            })?;
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
            } else if filter(&path) {
                files.push(path);
            }
        }
    }
    files.sort();
    Ok(files)
}

fn has_extension(path: &Path, extensions: &[&str]) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| extensions.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

/// Путь к изображению: абсолютный, от корня датасета, иначе соседний файл
/// с тем же именем, что и sidecar
fn resolve_image(root: &Path, sidecar: &Path, image_path: &str) -> Option<PathBuf> {
    let declared = Path::new(image_path);
    if declared.is_absolute() && declared.is_file() {
        return Some(declared.to_path_buf());
    }
    let from_root = root.join(declared);
    if from_root.is_file() {
        return Some(from_root);
    }
    IMAGE_EXTENSIONS
        .iter()
        .map(|ext| sidecar.with_extension(ext))
        .find(|candidate| candidate.is_file())
}

fn load_sidecar(root: &Path, sidecar: &Path) -> Result<LoadedCase, String> {
    let text = fs::read_to_string(sidecar).map_err(|e| e.to_string())?;
    let metadata: Value = serde_json::from_str(&text).map_err(|e| format!("malformed sidecar: {}", e))?;
    let case: TestCase =
        serde_json::from_value(metadata.clone()).map_err(|e| format!("malformed sidecar: {}", e))?;
    case.validate()?;
    let image_path = resolve_image(root, sidecar, &case.image_path)
        .ok_or_else(|| format!("image {} not found", case.image_path))?;

    Ok(LoadedCase {
        case,
        image_path,
        metadata,
        sidecar_path: Some(sidecar.to_path_buf()),
    })
}

/// Рекурсивная загрузка sidecar из каталога датасета
pub fn load_cases(root: &Path) -> Result<CaseSet, CaseError> {
    if !root.is_dir() {
        return Err(CaseError::MissingRoot(root.to_path_buf()));
    }

    let sidecars = list_files(root, &|p| has_extension(p, &["json"]))?;
    let mut set = CaseSet::default();
    let mut seen = HashSet::new();

    for sidecar in sidecars {
        match load_sidecar(root, &sidecar) {
            Ok(loaded) => {
                if seen.insert(loaded.case.test_id.clone()) {
                    set.cases.push(loaded);
                } else {
                    set.skip(sidecar, format!("duplicate test_id {}", loaded.case.test_id));
                }
            }
            Err(reason) => set.skip(sidecar, reason),
        }
    }

    log::info!(
        "loaded {} cases from {} ({} skipped)",
        set.cases.len(),
        root.display(),
        set.skipped.len()
    );
    Ok(set)
}

/// Импорт внешнего корпуса: префикс имени файла до первого `_` - ожидаемый текст
pub fn load_existing_dataset(dir: &Path) -> Result<CaseSet, CaseError> {
    if !dir.is_dir() {
        return Err(CaseError::MissingRoot(dir.to_path_buf()));
    }

    let images = list_files(dir, &|p| has_extension(p, &IMAGE_EXTENSIONS))?;
    let mut set = CaseSet::default();

    for image in images {
        let Some(file_name) = image.file_name().and_then(|n| n.to_str()) else {
            set.skip(image.clone(), "file name is not valid UTF-8".to_string());
            continue;
        };
        let stem = image.file_stem().and_then(|s| s.to_str()).unwrap_or(file_name);
        let payload = stem.split('_').next().unwrap_or(stem);
        if payload.is_empty() {
            set.skip(image.clone(), "empty payload prefix".to_string());
            continue;
        }

        let relative = image.strip_prefix(dir).unwrap_or(image.as_path()).to_string_lossy().into_owned();
        let case = TestCase {
            test_id: format!("existing_{}", file_name),
            image_path: relative,
            barcode_data: vec![payload.to_string()],
            barcode_types: vec!["UNKNOWN".to_string()],
            barcode_count: 1,
            rotation_angle: 0.0,
            test_type: TestType::ExistingDataset,
            difficulty: Difficulty::Medium,
            degradations_list: None,
            degradations: None,
            focus_area: TestType::ExistingDataset.focus_label().map(str::to_string),
            placeholder: false,
            degradation_skipped: Vec::new(),
            barcode_boxes: Vec::new(),
        };
        let metadata = match serde_json::to_value(&case) {
            Ok(Value::Object(mut obj)) => {
                obj.insert("source_file".to_string(), json!(image.to_string_lossy()));
                Value::Object(obj)
            }
            Ok(other) => other,
            Err(e) => {
                set.skip(image.clone(), e.to_string());
                continue;
            }
        };

        set.cases.push(LoadedCase {
            case,
            image_path: image,
            metadata,
            sidecar_path: None,
        });
    }

    log::info!("imported {} existing images from {}", set.cases.len(), dir.display());
    Ok(set)
}
