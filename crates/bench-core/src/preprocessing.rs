//! Модуль улучшения изображения для декодеров
//!
//! Лестница запасных вариантов, если обычный проход ничего не нашёл:
//! - Инвертированное изображение
//! - Растяжение контраста + повышение резкости
//! - То же, инвертированное
//! - Жёсткая бинаризация по порогу

use image::{GrayImage, Luma};
use serde::{Deserialize, Serialize};

/// Шаг лестницы улучшений
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnhanceStep {
    Inverted,
    ContrastSharpen,
    ContrastSharpenInverted,
    Threshold,
}

impl EnhanceStep {
    pub fn as_str(self) -> &'static str {
        match self {
            EnhanceStep::Inverted => "inverted",
            EnhanceStep::ContrastSharpen => "contrast_sharpen",
            EnhanceStep::ContrastSharpenInverted => "contrast_sharpen_inverted",
            EnhanceStep::Threshold => "threshold",
        }
    }
}

/// Конфигурация улучшений
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingConfig {
    /// Пробовать инвертированные варианты
    pub try_inverted: bool,
    /// Пробовать контраст + резкость
    pub contrast_sharpen: bool,
    /// Порог жёсткой бинаризации (None - не пробовать)
    pub threshold: Option<u8>,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            try_inverted: true,
            contrast_sharpen: true,
            threshold: Some(128),
        }
    }
}

/// Процессор изображений
#[derive(Debug, Clone, Default)]
pub struct ImageProcessor {
    config: ProcessingConfig,
}

impl ImageProcessor {
    /// Создание процессора с конфигурацией
    pub fn new(config: ProcessingConfig) -> Self {
        Self { config }
    }

    /// Шаги лестницы в порядке применения
    pub fn steps(&self) -> Vec<EnhanceStep> {
        let mut steps = Vec::with_capacity(4);
        if self.config.try_inverted {
            steps.push(EnhanceStep::Inverted);
        }
        if self.config.contrast_sharpen {
            steps.push(EnhanceStep::ContrastSharpen);
            if self.config.try_inverted {
                steps.push(EnhanceStep::ContrastSharpenInverted);
            }
        }
        if self.config.threshold.is_some() {
            steps.push(EnhanceStep::Threshold);
        }
        steps
    }

    /// Ленивый перебор вариантов: изображение строится только при запросе
    pub fn variants<'a>(&'a self, img: &'a GrayImage) -> impl Iterator<Item = (EnhanceStep, GrayImage)> + 'a {
        self.steps().into_iter().map(move |step| (step, self.apply(step, img)))
    }

    pub fn apply(&self, step: EnhanceStep, img: &GrayImage) -> GrayImage {
        match step {
            EnhanceStep::Inverted => self.invert(img),
            EnhanceStep::ContrastSharpen => self.contrast_sharpen(img),
            EnhanceStep::ContrastSharpenInverted => self.invert(&self.contrast_sharpen(img)),
            EnhanceStep::Threshold => self.threshold(img, self.config.threshold.unwrap_or(128)),
        }
    }

    /// Растяжение контраста + повышение резкости
    pub fn contrast_sharpen(&self, img: &GrayImage) -> GrayImage {
        self.sharpen(&self.contrast_stretch(img))
    }

    /// Инвертирование изображения
    pub fn invert(&self, img: &GrayImage) -> GrayImage {
        let mut result = img.clone();
        for pixel in result.pixels_mut() {
            pixel.0[0] = 255 - pixel.0[0];
        }
        result
    }

    /// Растяжение гистограммы на весь диапазон [0, 255]
    pub fn contrast_stretch(&self, img: &GrayImage) -> GrayImage {
        let (min_val, max_val) = img
            .pixels()
            .fold((255u8, 0u8), |(lo, hi), p| (lo.min(p.0[0]), hi.max(p.0[0])));

        if min_val >= max_val {
            return img.clone();
        }

        let range = (max_val - min_val) as f32;
        let mut result = img.clone();
        for pixel in result.pixels_mut() {
            // (val - min) / (max - min) * 255
            pixel.0[0] = ((pixel.0[0] - min_val) as f32 / range * 255.0) as u8;
        }
        result
    }

    /// Резкость ядром 3x3, края остаются как есть
    pub fn sharpen(&self, img: &GrayImage) -> GrayImage {
        let (width, height) = img.dimensions();
        let mut result = img.clone();
        if width < 3 || height < 3 {
            return result;
        }

        // Kernel:
        //  0 -1  0
        // -1  5 -1
        //  0 -1  0
        for y in 1..height - 1 {
            for x in 1..width - 1 {
                let val = img.get_pixel(x, y).0[0] as i32 * 5
                    - img.get_pixel(x, y - 1).0[0] as i32
                    - img.get_pixel(x, y + 1).0[0] as i32
                    - img.get_pixel(x - 1, y).0[0] as i32
                    - img.get_pixel(x + 1, y).0[0] as i32;
                result.put_pixel(x, y, Luma([val.clamp(0, 255) as u8]));
            }
        }
        result
    }

    /// Жёсткая бинаризация по порогу
    pub fn threshold(&self, img: &GrayImage, threshold: u8) -> GrayImage {
        let mut result = img.clone();
        for pixel in result.pixels_mut() {
            pixel.0[0] = if pixel.0[0] < threshold { 0 } else { 255 };
        }
        result
    }
}
