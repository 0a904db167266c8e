//! Генератор датасета
//!
//! Распределяет N кейсов по категориям, рисует для каждого кейса холст с
//! символами и пишет пару `<test_id>.png` + `<test_id>.json` в подкаталог
//! категории. Все случайные решения берутся из одного RNG с заданным seed.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use image::imageops::{self, FilterType};
use image::{ImageFormat, Rgb, RgbImage};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tempfile::TempDir;
use thiserror::Error;

use crate::config::GeneratorConfig;
use crate::degradation::{self, DegradationContext, Severity};
use crate::encoder::{BarcodeEncoder, EncodedSymbol};
use crate::geometry::{self, Rect};
use crate::model::{Difficulty, TestCase, TestType};
use crate::symbology::Symbology;

/// Доля холста под символ в challenging
const CHALLENGING_SCALE: f64 = 0.6;
/// Доля холста, если символ не влез в single
const SINGLE_FALLBACK_SCALE: f64 = 0.8;
/// Доля ячейки под символ в multiple
const CELL_FILL: f64 = 0.7;

#[derive(Error, Debug)]
pub enum DatasetError {
    #[error("sample count must be non-negative, got {0}")]
    NegativeTotal(i64),

    #[error("invalid ratio for {category}: {value}")]
    InvalidRatio { category: String, value: f64 },

    #[error("cannot parse ratios {input:?}: {reason}")]
    RatioParse { input: String, reason: String },

    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot write image {path}: {source}")]
    Image {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    #[error("cannot serialize sidecar: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Config(#[from] crate::config::ConfigError),
}

/// Категория синтетических кейсов
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Single,
    Angled,
    Multiple,
    Challenging,
}

impl Category {
    pub const ALL: [Category; 4] = [
        Category::Single,
        Category::Angled,
        Category::Multiple,
        Category::Challenging,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Category::Single => "single",
            Category::Angled => "angled",
            Category::Multiple => "multiple",
            Category::Challenging => "challenging",
        }
    }

    pub fn test_type(self) -> TestType {
        match self {
            Category::Single => TestType::Single,
            Category::Angled => TestType::Angled,
            Category::Multiple => TestType::Multiple,
            Category::Challenging => TestType::Challenging,
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Доли категорий (не обязательно нормированные)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Ratios {
    pub single: f64,
    pub angled: f64,
    pub multiple: f64,
    pub challenging: f64,
}

impl Default for Ratios {
    fn default() -> Self {
        Self {
            single: 0.4,
            angled: 0.3,
            multiple: 0.2,
            challenging: 0.1,
        }
    }
}

impl Ratios {
    pub fn get(&self, category: Category) -> f64 {
        match category {
            Category::Single => self.single,
            Category::Angled => self.angled,
            Category::Multiple => self.multiple,
            Category::Challenging => self.challenging,
        }
    }

    fn set(&mut self, category: Category, value: f64) {
        match category {
            Category::Single => self.single = value,
            Category::Angled => self.angled = value,
            Category::Multiple => self.multiple = value,
            Category::Challenging => self.challenging = value,
        }
    }
}

/// Разбор `single=0.4,angled=0.3,...`; отсутствующая категория = 0
impl FromStr for Ratios {
    type Err = DatasetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parse_err = |reason: String| DatasetError::RatioParse {
            input: s.to_string(),
            reason,
        };

        let mut ratios = Ratios {
            single: 0.0,
            angled: 0.0,
            multiple: 0.0,
            challenging: 0.0,
        };
        for part in s.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let (key, value) = part
                .split_once('=')
                .ok_or_else(|| parse_err(format!("expected name=value, got {:?}", part)))?;
            let category = Category::ALL
                .iter()
                .copied()
                .find(|c| c.as_str() == key.trim())
                .ok_or_else(|| parse_err(format!("unknown category {:?}", key)))?;
            let value: f64 = value
                .trim()
                .parse()
                .map_err(|e| parse_err(format!("{}: {}", key, e)))?;
            ratios.set(category, value);
        }
        Ok(ratios)
    }
}

/// Количество кейсов по категориям
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryCounts {
    pub single: usize,
    pub angled: usize,
    pub multiple: usize,
    pub challenging: usize,
}

impl CategoryCounts {
    pub fn get(&self, category: Category) -> usize {
        match category {
            Category::Single => self.single,
            Category::Angled => self.angled,
            Category::Multiple => self.multiple,
            Category::Challenging => self.challenging,
        }
    }

    fn slot(&mut self, category: Category) -> &mut usize {
        match category {
            Category::Single => &mut self.single,
            Category::Angled => &mut self.angled,
            Category::Multiple => &mut self.multiple,
            Category::Challenging => &mut self.challenging,
        }
    }

    pub fn total(&self) -> usize {
        self.single + self.angled + self.multiple + self.challenging
    }
}

/// Распределение `total` кейсов по долям.
///
/// Доли нормируются, каждая категория получает `floor(N * r)`, остаток от
/// округления уходит в challenging. Если у challenging доля 0, остаток
/// получает категория с наибольшей долей. Все нулевые доли заменяются
/// долями по умолчанию.
pub fn allocate(total: i64, ratios: &Ratios) -> Result<CategoryCounts, DatasetError> {
    if total < 0 {
        return Err(DatasetError::NegativeTotal(total));
    }
    for category in Category::ALL {
        let value = ratios.get(category);
        if !value.is_finite() || value < 0.0 {
            return Err(DatasetError::InvalidRatio {
                category: category.to_string(),
                value,
            });
        }
    }

    let mut ratios = *ratios;
    let mut sum: f64 = Category::ALL.iter().map(|&c| ratios.get(c)).sum();
    if sum <= 0.0 {
        log::warn!("all category ratios are zero, using defaults");
        ratios = Ratios::default();
        sum = 1.0;
    }

    let total = total as usize;
    let mut counts = CategoryCounts::default();
    for category in [Category::Single, Category::Angled, Category::Multiple] {
        let share = total as f64 * ratios.get(category) / sum;
        *counts.slot(category) = (share + 1e-9).floor() as usize;
    }
    // Доля challenging тоже округляется вниз, так что остаток >= 0
    let remainder = total - counts.total();

    let target = if ratios.challenging > 0.0 {
        Category::Challenging
    } else {
        Category::ALL
            .iter()
            .copied()
            .filter(|&c| ratios.get(c) > 0.0)
            .fold(Category::Challenging, |best, c| {
                if best == Category::Challenging || ratios.get(c) > ratios.get(best) {
                    c
                } else {
                    best
                }
            })
    };
    *counts.slot(target) += remainder;

    Ok(counts)
}

/// Раскладка сетки для multiple
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GridLayout {
    pub cols: u32,
    pub rows: u32,
    pub cell_width: u32,
    pub cell_height: u32,
}

impl GridLayout {
    /// ⌈√n⌉ столбцов × ⌈n / cols⌉ строк
    pub fn for_count(n: usize, canvas_width: u32, canvas_height: u32) -> Self {
        let n = n.max(1) as u32;
        let cols = (n as f64).sqrt().ceil() as u32;
        let rows = (n + cols - 1) / cols;
        Self {
            cols,
            rows,
            cell_width: canvas_width / cols,
            cell_height: canvas_height / rows,
        }
    }

    pub fn cell_count(&self) -> usize {
        (self.cols * self.rows) as usize
    }

    pub fn cell_rect(&self, index: usize) -> Rect {
        let index = index as u32;
        let (row, col) = (index / self.cols, index % self.cols);
        Rect::new(col * self.cell_width, row * self.cell_height, self.cell_width, self.cell_height)
    }

    /// Максимальный размер символа внутри ячейки
    pub fn inner_box(&self) -> (u32, u32) {
        (
            (self.cell_width as f64 * CELL_FILL) as u32,
            (self.cell_height as f64 * CELL_FILL) as u32,
        )
    }
}

fn resize(img: &RgbImage, width: u32, height: u32) -> RgbImage {
    if img.dimensions() == (width, height) {
        return img.clone();
    }
    imageops::resize(img, width.max(1), height.max(1), FilterType::Triangle)
}

fn scale_into(img: &RgbImage, max_width: f64, max_height: f64) -> RgbImage {
    let (w, h) = (img.width() as f64, img.height() as f64);
    let scale = (max_width / w).min(max_height / h);
    resize(img, (w * scale) as u32, (h * scale) as u32)
}

/// Вставка по центру холста, возвращает занятый прямоугольник
fn paste_centered(canvas: &mut RgbImage, img: &RgbImage, area: Rect) -> Rect {
    let x = area.x + area.width.saturating_sub(img.width()) / 2;
    let y = area.y + area.height.saturating_sub(img.height()) / 2;
    imageops::replace(canvas, img, x as i64, y as i64);
    Rect::new(x, y, img.width(), img.height()).clipped(canvas.width(), canvas.height())
}

fn blank(width: u32, height: u32, background: u8) -> RgbImage {
    RgbImage::from_pixel(width, height, Rgb([background; 3]))
}

/// Символ по центру холста без поворота
pub fn compose_single(config: &GeneratorConfig, symbol: &RgbImage) -> (RgbImage, Rect) {
    let (cw, ch) = (config.canvas_width, config.canvas_height);
    let mut canvas = blank(cw, ch, config.background);

    let placed = if symbol.width() > cw || symbol.height() > ch {
        log::debug!("symbol {:?} does not fit {}x{}, scaling down", symbol.dimensions(), cw, ch);
        scale_into(symbol, cw as f64 * SINGLE_FALLBACK_SCALE, ch as f64 * SINGLE_FALLBACK_SCALE)
    } else {
        symbol.clone()
    };

    let bbox = paste_centered(&mut canvas, &placed, Rect::new(0, 0, cw, ch));
    (canvas, bbox)
}

/// Повёрнутый символ: холст символа расширяется, затем вписывается в поля
pub fn compose_angled(config: &GeneratorConfig, symbol: &RgbImage, angle: f64) -> (RgbImage, Rect) {
    let (cw, ch) = (config.canvas_width, config.canvas_height);
    let fill = Rgb([config.background; 3]);
    let mut canvas = blank(cw, ch, config.background);

    let rotated = geometry::rotate_expanded(symbol, angle, fill);
    let (avail_w, avail_h) = (cw - config.margin * 2, ch - config.margin * 2);
    let placed = if rotated.width() > avail_w || rotated.height() > avail_h {
        scale_into(&rotated, avail_w as f64, avail_h as f64)
    } else {
        rotated
    };

    let bbox = paste_centered(&mut canvas, &placed, Rect::new(0, 0, cw, ch));
    (canvas, bbox)
}

/// Символы по ячейкам сетки; ячейки выбираются случайно
pub fn compose_multiple<R: Rng + ?Sized>(
    config: &GeneratorConfig,
    symbols: &[EncodedSymbol],
    rng: &mut R,
) -> (RgbImage, Vec<Rect>) {
    let (cw, ch) = (config.multiple_canvas_width, config.multiple_canvas_height);
    let mut canvas = blank(cw, ch, config.background);
    let layout = GridLayout::for_count(symbols.len(), cw, ch);
    let (max_w, max_h) = layout.inner_box();

    let mut cells: Vec<usize> = (0..layout.cell_count()).collect();
    cells.shuffle(rng);

    let boxes = symbols
        .iter()
        .zip(cells)
        .map(|(symbol, cell)| {
            let placed = if symbol.symbology.is_two_dimensional() {
                let side = max_w.min(max_h);
                resize(&symbol.image, side, side)
            } else {
                scale_into(&symbol.image, max_w as f64, max_h as f64)
            };
            paste_centered(&mut canvas, &placed, layout.cell_rect(cell))
        })
        .collect();

    (canvas, boxes)
}

/// Символ на 60% холста, по центру; деградации применяются отдельно
pub fn compose_challenging(config: &GeneratorConfig, symbol: &RgbImage) -> (RgbImage, Rect) {
    let (cw, ch) = (config.canvas_width, config.canvas_height);
    let mut canvas = blank(cw, ch, config.background);
    let placed = scale_into(symbol, cw as f64 * CHALLENGING_SCALE, ch as f64 * CHALLENGING_SCALE);
    let bbox = paste_centered(&mut canvas, &placed, Rect::new(0, 0, cw, ch));
    (canvas, bbox)
}

fn digits(base: u64, offset: u64, width: u32) -> String {
    let modulus = 10u64.pow(width);
    format!("{:0width$}", (base + offset) % modulus, width = width as usize)
}

/// Детерминированная нагрузка по категории, тегу и номеру кейса
pub fn payload_for(category: Category, tag: Symbology, index: usize, sub: usize, angle: f64) -> String {
    let i = index as u64;
    let angle = angle.round() as i64;
    match (category, tag) {
        (Category::Single, Symbology::Ean13) => digits(123_456_789_012, i, 12),
        (Category::Single, Symbology::Ean8) => digits(1_234_567, i, 7),
        (Category::Single, Symbology::Itf) => digits(12_345_678_901_234, i, 14),
        (Category::Single, Symbology::Code39) => format!("CODE{:04}", index % 10_000),
        (Category::Single, Symbology::QrCode) => format!("https://example.com/qr/{:06}", index),
        (Category::Single, Symbology::Code128) => format!("BARCODE{:06}", index % 1_000_000),

        (Category::Angled, Symbology::Ean13) => digits(200_000_000_000, i, 12),
        (Category::Angled, Symbology::Ean8) => digits(2_000_000, i, 7),
        (Category::Angled, Symbology::Itf) => digits(20_000_000_000_000, i, 14),
        (Category::Angled, Symbology::Code39) => format!("ANGLED{:03}", index % 1_000),
        (Category::Angled, Symbology::QrCode) => {
            format!("https://example.com/angled/{}/{:04}", angle, index)
        }
        (Category::Angled, Symbology::Code128) => format!("ANGLE{:02}{:04}", angle, index % 10_000),

        (Category::Multiple, Symbology::Ean13) => digits(300_000_000_000, i * 100 + sub as u64, 12),
        (Category::Multiple, Symbology::Ean8) => digits(3_000_000, i * 100 + sub as u64, 7),
        (Category::Multiple, Symbology::Itf) => digits(30_000_000_000_000, i * 100 + sub as u64, 14),
        (Category::Multiple, Symbology::Code39) => format!("MULTI{:02}{:02}", index % 100, sub % 100),
        (Category::Multiple, Symbology::QrCode) => {
            format!("https://example.com/multi/{:03}/{:02}", index, sub)
        }
        (Category::Multiple, Symbology::Code128) => format!("MULTI{:03}{:02}", index % 1_000, sub % 100),

        (Category::Challenging, Symbology::Ean13) => digits(900_000_000_000, i, 12),
        (Category::Challenging, Symbology::Ean8) => digits(9_000_000, i, 7),
        (Category::Challenging, Symbology::Itf) => digits(90_000_000_000_000, i, 14),
        (Category::Challenging, Symbology::Code39) => format!("CHAL{:04}", index % 10_000),
        (Category::Challenging, Symbology::QrCode) => {
            format!("https://example.com/challenging/{:05}", index)
        }
        (Category::Challenging, Symbology::Code128) => format!("CHALLENGE{:05}", index % 100_000),

        // Теги-заглушки
        (category, tag) => format!("{}-{}-{:04}", tag, category.as_str().to_uppercase(), index * 100 + sub),
    }
}

/// Генератор датасета
pub struct DatasetGenerator {
    output_dir: PathBuf,
    config: GeneratorConfig,
    encoder: BarcodeEncoder,
    rng: StdRng,
    scratch: TempDir,
}

impl DatasetGenerator {
    pub fn new(output_dir: impl Into<PathBuf>, seed: u64, config: GeneratorConfig) -> Result<Self, DatasetError> {
        config.validate()?;
        let scratch = tempfile::Builder::new()
            .prefix("barcode-bench-symbols-")
            .tempdir()
            .map_err(|source| DatasetError::Io {
                path: std::env::temp_dir(),
                source,
            })?;

        Ok(Self {
            output_dir: output_dir.into(),
            encoder: BarcodeEncoder::new(config.allow_placeholders),
            config,
            rng: StdRng::seed_from_u64(seed),
            scratch,
        })
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Каталог временных изображений символов (удаляется в `finalize`)
    pub fn scratch_dir(&self) -> &Path {
        self.scratch.path()
    }

    /// Удаление временного каталога
    pub fn finalize(self) -> Result<(), DatasetError> {
        let path = self.scratch.path().to_path_buf();
        self.scratch
            .close()
            .map_err(|source| DatasetError::Io { path, source })
    }

    /// Генерация датасета: `total` кейсов по долям `ratios`.
    ///
    /// Ошибки валидации возвращаются до записи на диск. При `total = 0`
    /// ничего не создаётся.
    pub fn generate(&mut self, total: i64, ratios: &Ratios) -> Result<CategoryCounts, DatasetError> {
        let planned = allocate(total, ratios)?;
        log::info!(
            "generating {} cases: single={}, angled={}, multiple={}, challenging={}",
            planned.total(),
            planned.single,
            planned.angled,
            planned.multiple,
            planned.challenging
        );

        let mut actual = CategoryCounts::default();
        for category in Category::ALL {
            for index in 0..planned.get(category) {
                let generated = match category {
                    Category::Single => self.single_case(index)?,
                    Category::Angled => self.angled_case(index)?,
                    Category::Multiple => self.multiple_case(index)?,
                    Category::Challenging => self.challenging_case(index)?,
                };
                if generated {
                    *actual.slot(category) += 1;
                }
            }
        }

        if actual != planned {
            log::warn!("generated {} of {} planned cases", actual.total(), planned.total());
        }
        Ok(actual)
    }

    fn pick_tag(&mut self) -> Symbology {
        let symbologies = &self.config.symbologies;
        symbologies[self.rng.gen_range(0..symbologies.len())]
    }

    fn size_hint(&self, tag: Symbology, category: Category) -> (u32, u32) {
        if tag.is_two_dimensional() {
            let side = if category == Category::Multiple {
                self.config.multiple_square_size
            } else {
                self.config.square_size
            };
            (side, side)
        } else {
            (self.config.linear_width, self.config.linear_height)
        }
    }

    /// Кодирование с записью символа во временный каталог.
    /// Ошибка кодирования пропускает символ, а не весь прогон.
    fn encode(&self, category: Category, tag: Symbology, payload: &str, name: &str) -> Result<Option<EncodedSymbol>, DatasetError> {
        let (width, height) = self.size_hint(tag, category);
        let symbol = match self.encoder.encode(payload, tag, width, height) {
            Ok(symbol) => symbol,
            Err(e) => {
                log::warn!("{}: skipping symbol: {}", name, e);
                return Ok(None);
            }
        };

        let path = self.scratch.path().join(format!("{}_{}.png", name, tag));
        save_png(&symbol.image, &path)?;
        Ok(Some(symbol))
    }

    fn single_case(&mut self, index: usize) -> Result<bool, DatasetError> {
        let test_id = format!("single_{:03}", index);
        let tag = self.pick_tag();
        let payload = payload_for(Category::Single, tag, index, 0, 0.0);
        let Some(symbol) = self.encode(Category::Single, tag, &payload, &test_id)? else {
            return Ok(false);
        };

        let (canvas, bbox) = compose_single(&self.config, &symbol.image);
        let case = self.base_case(Category::Single, &test_id, &[symbol], vec![bbox], Difficulty::Easy);
        self.write_case(Category::Single, &case, &canvas)?;
        Ok(true)
    }

    fn angled_case(&mut self, index: usize) -> Result<bool, DatasetError> {
        let test_id = format!("angled_{:03}", index);
        let tag = self.pick_tag();
        let angle = self.config.angles[self.rng.gen_range(0..self.config.angles.len())];
        let payload = payload_for(Category::Angled, tag, index, 0, angle);
        let Some(symbol) = self.encode(Category::Angled, tag, &payload, &test_id)? else {
            return Ok(false);
        };

        let (canvas, bbox) = compose_angled(&self.config, &symbol.image, angle);
        let mut case = self.base_case(Category::Angled, &test_id, &[symbol], vec![bbox], Difficulty::Medium);
        case.rotation_angle = angle;
        self.write_case(Category::Angled, &case, &canvas)?;
        Ok(true)
    }

    fn multiple_case(&mut self, index: usize) -> Result<bool, DatasetError> {
        let test_id = format!("multiple_{:03}", index);
        let counts = &self.config.multiple_counts;
        let n = counts[self.rng.gen_range(0..counts.len())];

        let mut symbols = Vec::with_capacity(n);
        for sub in 0..n {
            let tag = self.pick_tag();
            let payload = payload_for(Category::Multiple, tag, index, sub, 0.0);
            if let Some(symbol) = self.encode(Category::Multiple, tag, &payload, &format!("{}_{:02}", test_id, sub))? {
                symbols.push(symbol);
            }
        }
        if symbols.is_empty() {
            log::warn!("{}: no symbol could be encoded, skipping case", test_id);
            return Ok(false);
        }

        let (canvas, boxes) = compose_multiple(&self.config, &symbols, &mut self.rng);
        let case = self.base_case(Category::Multiple, &test_id, &symbols, boxes, Difficulty::Hard);
        self.write_case(Category::Multiple, &case, &canvas)?;
        Ok(true)
    }

    fn challenging_case(&mut self, index: usize) -> Result<bool, DatasetError> {
        let test_id = format!("challenging_{:03}", index);
        let tag = self.pick_tag();
        let severity = Severity::sample(self.config.severe_probability, &mut self.rng);
        let payload = payload_for(Category::Challenging, tag, index, 0, 0.0);
        let Some(symbol) = self.encode(Category::Challenging, tag, &payload, &test_id)? else {
            return Ok(false);
        };

        let (canvas, bbox) = compose_challenging(&self.config, &symbol.image);
        let ctx = DegradationContext {
            background: Rgb([self.config.background; 3]),
            symbol_bbox: bbox,
        };
        let composition = degradation::compose(&canvas, severity, &ctx, &mut self.rng);

        let difficulty = match severity {
            Severity::Light => Difficulty::Hard,
            Severity::Severe => Difficulty::Extreme,
        };
        let mut case = self.base_case(Category::Challenging, &test_id, &[symbol], vec![bbox], difficulty);
        case.degradations_list = Some(
            composition
                .applied
                .iter()
                .map(|d| d.kind().to_string())
                .collect(),
        );
        case.degradations = Some(
            composition
                .applied
                .iter()
                .map(|d| (d.kind().to_string(), d.params()))
                .collect::<BTreeMap<String, Value>>(),
        );
        case.degradation_skipped = composition.skipped;

        self.write_case(Category::Challenging, &case, &composition.image)?;
        Ok(true)
    }

    fn base_case(
        &self,
        category: Category,
        test_id: &str,
        symbols: &[EncodedSymbol],
        boxes: Vec<Rect>,
        difficulty: Difficulty,
    ) -> TestCase {
        let test_type = category.test_type();
        TestCase {
            test_id: test_id.to_string(),
            image_path: format!("{}/{}.png", category.as_str(), test_id),
            barcode_data: symbols.iter().map(|s| s.ground_truth.clone()).collect(),
            barcode_types: symbols.iter().map(|s| s.symbology.to_string()).collect(),
            barcode_count: symbols.len(),
            rotation_angle: 0.0,
            test_type,
            difficulty,
            degradations_list: None,
            degradations: None,
            focus_area: test_type.focus_label().map(str::to_string),
            placeholder: symbols.iter().any(|s| s.placeholder),
            degradation_skipped: Vec::new(),
            barcode_boxes: boxes,
        }
    }

    fn write_case(&self, category: Category, case: &TestCase, image: &RgbImage) -> Result<(), DatasetError> {
        let dir = self.output_dir.join(category.as_str());
        fs::create_dir_all(&dir).map_err(|source| DatasetError::Io {
            path: dir.clone(),
            source,
        })?;

        save_png(image, &dir.join(format!("{}.png", case.test_id)))?;

        let sidecar = dir.join(format!("{}.json", case.test_id));
        let mut json = serde_json::to_string_pretty(case)?;
        json.push('\n');
        fs::write(&sidecar, json).map_err(|source| DatasetError::Io { path: sidecar, source })?;

        log::debug!("wrote {} ({} symbols)", case.test_id, case.barcode_count);
        Ok(())
    }
}

fn save_png(image: &RgbImage, path: &Path) -> Result<(), DatasetError> {
    image
        .save_with_format(path, ImageFormat::Png)
        .map_err(|source| DatasetError::Image {
            path: path.to_path_buf(),
            source,
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocation_default_ratios() {
        let counts = allocate(10, &Ratios::default()).unwrap();
        assert_eq!(
            counts,
            CategoryCounts {
                single: 4,
                angled: 3,
                multiple: 2,
                challenging: 1
            }
        );
    }

    #[test]
    fn test_allocation_remainder_to_challenging() {
        let counts = allocate(11, &Ratios::default()).unwrap();
        assert_eq!((counts.single, counts.angled, counts.multiple), (4, 3, 2));
        assert_eq!(counts.challenging, 2);
        assert_eq!(counts.total(), 11);
    }

    #[test]
    fn test_allocation_edge_cases() {
        assert_eq!(allocate(0, &Ratios::default()).unwrap().total(), 0);
        assert!(matches!(allocate(-1, &Ratios::default()), Err(DatasetError::NegativeTotal(-1))));

        let zero: Ratios = "single=0,angled=0".parse().unwrap();
        assert_eq!(allocate(10, &zero).unwrap(), allocate(10, &Ratios::default()).unwrap());

        let bad = Ratios {
            single: -0.1,
            ..Ratios::default()
        };
        assert!(matches!(allocate(10, &bad), Err(DatasetError::InvalidRatio { .. })));
    }

    #[test]
    fn test_zero_ratio_category_is_empty() {
        let ratios: Ratios = "single=0.5,multiple=0.5".parse().unwrap();
        for total in 0..40 {
            let counts = allocate(total, &ratios).unwrap();
            assert_eq!(counts.angled, 0);
            assert_eq!(counts.challenging, 0);
            assert_eq!(counts.total(), total as usize);
        }

        let ratios: Ratios = "angled=1".parse().unwrap();
        let counts = allocate(7, &ratios).unwrap();
        assert_eq!(counts.angled, 7);
    }

    #[test]
    fn test_ratio_parse_errors() {
        assert!("single".parse::<Ratios>().is_err());
        assert!("bogus=0.3".parse::<Ratios>().is_err());
        assert!("single=abc".parse::<Ratios>().is_err());
    }

    #[test]
    fn test_grid_layout_five() {
        let layout = GridLayout::for_count(5, 1600, 1200);
        assert_eq!((layout.cols, layout.rows), (3, 2));
        assert_eq!((layout.cell_width, layout.cell_height), (533, 600));
        assert_eq!(layout.inner_box(), (373, 420));
        assert_eq!(layout.cell_rect(4), Rect::new(533, 600, 533, 600));
    }

    #[test]
    fn test_grid_layout_counts() {
        for (n, cols, rows) in [(2, 2, 1), (10, 4, 3), (15, 4, 4)] {
            let layout = GridLayout::for_count(n, 1600, 1200);
            assert_eq!((layout.cols, layout.rows), (cols, rows), "n = {}", n);
            assert!(layout.cell_count() >= n);
        }
    }

    #[test]
    fn test_payload_scheme() {
        assert_eq!(payload_for(Category::Single, Symbology::Code128, 123, 0, 0.0), "BARCODE000123");
        assert_eq!(payload_for(Category::Single, Symbology::QrCode, 7, 0, 0.0), "https://example.com/qr/000007");
        assert_eq!(payload_for(Category::Angled, Symbology::Code128, 3, 0, 45.0), "ANGLE450003");
        assert_eq!(payload_for(Category::Multiple, Symbology::Ean8, 1, 2, 0.0), "3000102");
        for tag in Symbology::DEFAULT_SET {
            for category in Category::ALL {
                let payload = payload_for(category, tag, 42, 3, 30.0);
                assert!(tag.is_valid_payload(&payload), "{} {} {}", category, tag, payload);
            }
        }
    }
}
