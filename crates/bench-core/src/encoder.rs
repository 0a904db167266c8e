//! Модуль кодирования штрихкодов
//!
//! Одна запись таблицы на тег символогии. Проверка и ремонт нагрузки живут
//! в записи, вызывающая сторона нагрузку не дополняет и не фильтрует. Теги без
//! кодировщика дают помеченную заглушку, если заглушки разрешены.

use image::imageops::{self, FilterType};
use image::{DynamicImage, GrayImage, Luma, RgbImage};
use qrcode::{EcLevel, QrCode};
use rxing::{BarcodeFormat, MultiFormatWriter, Writer};
use thiserror::Error;

use crate::symbology::Symbology;

/// Тихая зона вокруг QR, в модулях
const QR_QUIET_ZONE: u32 = 4;

#[derive(Error, Debug)]
pub enum EncodeError {
    #[error("invalid payload {payload:?} for {tag} after repair")]
    InvalidPayload { tag: Symbology, payload: String },

    #[error("no encoder for {0} and placeholders are disabled")]
    Unsupported(Symbology),

    #[error("encoder failed for {tag}: {reason}")]
    Backend { tag: Symbology, reason: String },

    #[error("size hint must be positive, got {width}x{height}")]
    InvalidSize { width: u32, height: u32 },
}

/// Закодированный символ; принадлежит генератору до компоновки
#[derive(Debug, Clone)]
pub struct EncodedSymbol {
    pub image: RgbImage,
    pub symbology: Symbology,
    /// Нагрузка, фактически переданная кодировщику (после ремонта)
    pub payload: String,
    /// Текст, который вернёт корректный декодер
    pub ground_truth: String,
    /// Полосатая заглушка вместо настоящего символа
    pub placeholder: bool,
}

type EncodeFn = fn(Symbology, &str, u32, u32) -> Result<GrayImage, EncodeError>;

struct EncoderEntry {
    tag: Symbology,
    encode: EncodeFn,
}

impl EncoderEntry {
    /// Проверка, при необходимости ремонт и повторная проверка
    fn prepare(&self, payload: &str) -> Result<String, EncodeError> {
        if self.tag.is_valid_payload(payload) {
            return Ok(payload.to_string());
        }

        let repaired = self.tag.repair_payload(payload);
        if !self.tag.is_valid_payload(&repaired) {
            return Err(EncodeError::InvalidPayload {
                tag: self.tag,
                payload: payload.to_string(),
            });
        }
        log::debug!("repaired {} payload {:?} -> {:?}", self.tag, payload, repaired);
        Ok(repaired)
    }
}

const ENCODERS: &[EncoderEntry] = &[
    EncoderEntry { tag: Symbology::Code128, encode: encode_linear },
    EncoderEntry { tag: Symbology::Code39, encode: encode_linear },
    EncoderEntry { tag: Symbology::Ean13, encode: encode_linear },
    EncoderEntry { tag: Symbology::Ean8, encode: encode_linear },
    EncoderEntry { tag: Symbology::Itf, encode: encode_linear },
    EncoderEntry { tag: Symbology::QrCode, encode: encode_qr },
];

fn lookup(tag: Symbology) -> Option<&'static EncoderEntry> {
    ENCODERS.iter().find(|entry| entry.tag == tag)
}

/// Есть ли у тега настоящий кодировщик
pub fn has_encoder(tag: Symbology) -> bool {
    lookup(tag).is_some()
}

/// Фронтенд кодировщика
#[derive(Debug, Clone)]
pub struct BarcodeEncoder {
    allow_placeholders: bool,
}

impl Default for BarcodeEncoder {
    fn default() -> Self {
        Self::new(true)
    }
}

impl BarcodeEncoder {
    pub fn new(allow_placeholders: bool) -> Self {
        Self { allow_placeholders }
    }

    /// Кодирование `payload` как `tag`. Размеры - подсказки: QR квадратный со
    /// стороной `max(width_hint, height_hint)`, у 1D высота точная, ширина
    /// приближённая.
    pub fn encode(
        &self,
        payload: &str,
        tag: Symbology,
        width_hint: u32,
        height_hint: u32,
    ) -> Result<EncodedSymbol, EncodeError> {
        if width_hint == 0 || height_hint == 0 {
            return Err(EncodeError::InvalidSize {
                width: width_hint,
                height: height_hint,
            });
        }

        let entry = match lookup(tag) {
            Some(entry) => entry,
            None if self.allow_placeholders => {
                log::warn!("no encoder for {}, emitting placeholder", tag);
                return Ok(self.placeholder(payload, tag, width_hint, height_hint));
            }
            None => return Err(EncodeError::Unsupported(tag)),
        };

        let prepared = entry.prepare(payload)?;
        let gray = (entry.encode)(tag, &prepared, width_hint, height_hint)?;

        Ok(EncodedSymbol {
            image: DynamicImage::ImageLuma8(gray).into_rgb8(),
            symbology: tag,
            ground_truth: tag.canonical_text(&prepared),
            payload: prepared,
            placeholder: false,
        })
    }

    fn placeholder(&self, payload: &str, tag: Symbology, width: u32, height: u32) -> EncodedSymbol {
        let (width, height) = if tag.is_two_dimensional() {
            let side = width.max(height);
            (side, side)
        } else {
            (width, height)
        };
        let gray = placeholder_pattern(payload, width, height);

        EncodedSymbol {
            image: DynamicImage::ImageLuma8(gray).into_rgb8(),
            symbology: tag,
            payload: payload.to_string(),
            ground_truth: payload.to_string(),
            placeholder: true,
        }
    }
}

fn rxing_format(tag: Symbology) -> Option<BarcodeFormat> {
    match tag {
        Symbology::Code128 => Some(BarcodeFormat::CODE_128),
        Symbology::Code39 => Some(BarcodeFormat::CODE_39),
        Symbology::Ean13 => Some(BarcodeFormat::EAN_13),
        Symbology::Ean8 => Some(BarcodeFormat::EAN_8),
        Symbology::Itf => Some(BarcodeFormat::ITF),
        _ => None,
    }
}

/// 1D через писатели rxing. Ширина модуля целая, поэтому итоговая ширина
/// близка к `width`, а строк ровно `height`.
fn encode_linear(tag: Symbology, text: &str, width: u32, height: u32) -> Result<GrayImage, EncodeError> {
    let format = rxing_format(tag).ok_or(EncodeError::Unsupported(tag))?;
    let matrix = MultiFormatWriter
        .encode(text, &format, width as i32, height as i32)
        .map_err(|e| EncodeError::Backend {
            tag,
            reason: e.to_string(),
        })?;

    let (w, h) = (matrix.getWidth(), matrix.getHeight());
    let mut img = GrayImage::from_pixel(w, h, Luma([255]));
    for y in 0..h {
        for x in 0..w {
            if matrix.get(x, y) {
                img.put_pixel(x, y, Luma([0]));
            }
        }
    }
    Ok(img)
}

/// QR через qrcode: отрисовка по модулям, затем масштаб до квадрата со
/// стороной `max(width, height)`.
fn encode_qr(tag: Symbology, text: &str, width: u32, height: u32) -> Result<GrayImage, EncodeError> {
    let qr = QrCode::with_error_correction_level(text.as_bytes(), EcLevel::L).map_err(|e| {
        EncodeError::Backend {
            tag,
            reason: e.to_string(),
        }
    })?;

    let side = width.max(height);
    let modules = qr.width() as u32;
    let full = modules + QR_QUIET_ZONE * 2;
    let module_size = (side / full).max(1);
    let doc_width = full * module_size;

    let mut img = GrayImage::from_pixel(doc_width, doc_width, Luma([255]));
    for y in 0..modules {
        for x in 0..modules {
            if qr[(x as usize, y as usize)] == qrcode::Color::Dark {
                let px = (QR_QUIET_ZONE + x) * module_size;
                let py = (QR_QUIET_ZONE + y) * module_size;
                for dy in 0..module_size {
                    for dx in 0..module_size {
                        img.put_pixel(px + dx, py + dy, Luma([0]));
                    }
                }
            }
        }
    }

    if doc_width == side {
        Ok(img)
    } else {
        Ok(imageops::resize(&img, side, side, FilterType::Nearest))
    }
}

/// Чередующиеся полосы, в нижней пятой части - биты нагрузки, чтобы заглушку
/// было видно глазом.
fn placeholder_pattern(payload: &str, width: u32, height: u32) -> GrayImage {
    let mut img = GrayImage::from_pixel(width, height, Luma([255]));
    let label_height = (height / 5).max(1);
    let stripe_height = height.saturating_sub(label_height);

    let num_lines = payload.chars().count() as u32 * 3;
    let line_width = if num_lines > 0 { width / num_lines } else { width / 10 }.max(1);

    let mut x = 0;
    while x < width {
        let end = (x + line_width).min(width);
        for px in x..end {
            for py in 0..stripe_height {
                img.put_pixel(px, py, Luma([0]));
            }
        }
        x += line_width * 2;
    }

    let bytes = payload.as_bytes();
    if !bytes.is_empty() {
        let bits = bytes.len() as u32 * 8;
        let cell = (width / bits).max(1);
        for (i, byte) in bytes.iter().enumerate() {
            for bit in 0..8u32 {
                if byte & (0x80 >> bit) == 0 {
                    continue;
                }
                let px0 = (i as u32 * 8 + bit) * cell;
                if px0 >= width {
                    break;
                }
                for px in px0..(px0 + cell).min(width) {
                    for py in stripe_height..height {
                        img.put_pixel(px, py, Luma([0]));
                    }
                }
            }
        }
    }

    img
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_qr_is_square() {
        let encoder = BarcodeEncoder::default();
        let symbol = encoder
            .encode("https://example.com/qr/000001", Symbology::QrCode, 300, 200)
            .unwrap();
        assert_eq!(symbol.image.dimensions(), (300, 300));
        assert!(!symbol.placeholder);
        assert_eq!(symbol.ground_truth, "https://example.com/qr/000001");
    }

    #[test]
    fn test_linear_uses_height_hint() {
        let encoder = BarcodeEncoder::default();
        let symbol = encoder.encode("BARCODE000001", Symbology::Code128, 300, 150).unwrap();
        assert_eq!(symbol.image.height(), 150);
        assert!(symbol.image.width() >= 300);
    }

    #[test]
    fn test_ean13_repair_and_ground_truth() {
        let encoder = BarcodeEncoder::default();
        let symbol = encoder.encode("abc123", Symbology::Ean13, 300, 150).unwrap();
        assert_eq!(symbol.payload, "000000000123");
        assert_eq!(symbol.ground_truth.len(), 13);
        assert!(symbol.ground_truth.starts_with("000000000123"));
    }

    #[test]
    fn test_invalid_payload_after_repair() {
        let encoder = BarcodeEncoder::default();
        let err = encoder.encode("@@@", Symbology::Code39, 300, 150).unwrap_err();
        assert!(matches!(err, EncodeError::InvalidPayload { .. }));
    }

    #[test]
    fn test_placeholder_flagged() {
        let encoder = BarcodeEncoder::new(true);
        let symbol = encoder.encode("DM-0001", Symbology::DataMatrix, 250, 200).unwrap();
        assert!(symbol.placeholder);
        assert_eq!(symbol.image.dimensions(), (250, 250));
        // Top-left stripe is dark
        assert_eq!(symbol.image.get_pixel(0, 0).0, [0, 0, 0]);
    }

    #[test]
    fn test_placeholder_disabled() {
        let encoder = BarcodeEncoder::new(false);
        let err = encoder.encode("X", Symbology::Aztec, 100, 100).unwrap_err();
        assert!(matches!(err, EncodeError::Unsupported(Symbology::Aztec)));
        assert!(!has_encoder(Symbology::Aztec));
        assert!(has_encoder(Symbology::Itf));
    }
}
