//! Символогии штрихкодов
//!
//! Закрытый набор тегов с правилами валидности полезной нагрузки
//! и процедурой «ремонта» для невалидных строк.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Символы, допустимые в CODE39 (кроме букв и цифр)
const CODE39_EXTRA: &[char] = &['-', '$', '%', '+', '/', '.', ' '];

/// Максимальная длина нагрузки для CODE39 / CODE128
const LINEAR_TEXT_CAP: usize = 15;

/// Длина ITF по умолчанию
const ITF_LENGTH: usize = 14;

/// Тег символогии
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Symbology {
    #[serde(rename = "CODE128")]
    Code128,
    #[serde(rename = "CODE39")]
    Code39,
    #[serde(rename = "EAN13")]
    Ean13,
    #[serde(rename = "EAN8")]
    Ean8,
    #[serde(rename = "ITF")]
    Itf,
    #[serde(rename = "QR_CODE")]
    QrCode,
    // Теги без кодировщика: только placeholder
    #[serde(rename = "CODABAR")]
    Codabar,
    #[serde(rename = "DATA_MATRIX")]
    DataMatrix,
    #[serde(rename = "PDF_417")]
    Pdf417,
    #[serde(rename = "AZTEC")]
    Aztec,
}

impl Symbology {
    /// Набор по умолчанию для генерации датасета
    pub const DEFAULT_SET: [Symbology; 6] = [
        Symbology::Code128,
        Symbology::Code39,
        Symbology::Ean13,
        Symbology::Ean8,
        Symbology::Itf,
        Symbology::QrCode,
    ];

    pub const ALL: [Symbology; 10] = [
        Symbology::Code128,
        Symbology::Code39,
        Symbology::Ean13,
        Symbology::Ean8,
        Symbology::Itf,
        Symbology::QrCode,
        Symbology::Codabar,
        Symbology::DataMatrix,
        Symbology::Pdf417,
        Symbology::Aztec,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Symbology::Code128 => "CODE128",
            Symbology::Code39 => "CODE39",
            Symbology::Ean13 => "EAN13",
            Symbology::Ean8 => "EAN8",
            Symbology::Itf => "ITF",
            Symbology::QrCode => "QR_CODE",
            Symbology::Codabar => "CODABAR",
            Symbology::DataMatrix => "DATA_MATRIX",
            Symbology::Pdf417 => "PDF_417",
            Symbology::Aztec => "AZTEC",
        }
    }

    /// Квадратный 2D-символ (сторона = max(w, h))
    pub fn is_two_dimensional(self) -> bool {
        matches!(
            self,
            Symbology::QrCode | Symbology::DataMatrix | Symbology::Aztec
        )
    }

    /// Проверка валидности нагрузки без ремонта
    pub fn is_valid_payload(self, payload: &str) -> bool {
        match self {
            Symbology::Ean13 => is_digits_of_len(payload, 12),
            Symbology::Ean8 => is_digits_of_len(payload, 7),
            Symbology::Itf => {
                !payload.is_empty()
                    && payload.len() % 2 == 0
                    && payload.chars().all(|c| c.is_ascii_digit())
            }
            Symbology::Code39 => {
                !payload.is_empty()
                    && payload.chars().count() <= LINEAR_TEXT_CAP
                    && payload.chars().all(is_code39_char)
            }
            Symbology::Code128 => {
                !payload.is_empty()
                    && payload.chars().count() <= LINEAR_TEXT_CAP
                    && payload.chars().all(is_code128_char)
            }
            Symbology::QrCode => true,
            // Для тегов без кодировщика ограничений нет
            Symbology::Codabar | Symbology::DataMatrix | Symbology::Pdf417 | Symbology::Aztec => {
                true
            }
        }
    }

    /// Ремонт нагрузки по правилам символогии.
    ///
    /// Результат может остаться невалидным (например, пустая строка для CODE39),
    /// это проверяет вызывающая сторона через [`Symbology::is_valid_payload`].
    pub fn repair_payload(self, payload: &str) -> String {
        match self {
            Symbology::Ean13 => pad_digits(payload, 12),
            Symbology::Ean8 => pad_digits(payload, 7),
            Symbology::Itf => pad_digits(payload, ITF_LENGTH),
            Symbology::Code39 => payload
                .chars()
                .map(|c| c.to_ascii_uppercase())
                .filter(|&c| is_code39_char(c))
                .take(LINEAR_TEXT_CAP)
                .collect(),
            Symbology::Code128 => payload
                .chars()
                .filter(|&c| is_code128_char(c))
                .take(LINEAR_TEXT_CAP)
                .collect(),
            _ => payload.to_string(),
        }
    }

    /// Текст, который вернёт корректный декодер для уже валидной нагрузки
    /// (EAN13/EAN8 дополняются контрольной цифрой).
    pub fn canonical_text(self, payload: &str) -> String {
        match self {
            Symbology::Ean13 | Symbology::Ean8 => {
                format!("{}{}", payload, gtin_check_digit(payload))
            }
            _ => payload.to_string(),
        }
    }

    /// Разбор имени формата, как его сообщает декодер
    /// ("QR_CODE", "QR-Code", "CODE_128", "EAN-13", "I2/5" ...).
    pub fn from_format_name(name: &str) -> Option<Symbology> {
        let normalized: String = name
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .map(|c| c.to_ascii_uppercase())
            .collect();

        match normalized.as_str() {
            "CODE128" => Some(Symbology::Code128),
            "CODE39" => Some(Symbology::Code39),
            "EAN13" => Some(Symbology::Ean13),
            "EAN8" => Some(Symbology::Ean8),
            "ITF" | "I25" | "ITF14" => Some(Symbology::Itf),
            "QRCODE" | "QR" => Some(Symbology::QrCode),
            "CODABAR" => Some(Symbology::Codabar),
            "DATAMATRIX" => Some(Symbology::DataMatrix),
            "PDF417" => Some(Symbology::Pdf417),
            "AZTEC" => Some(Symbology::Aztec),
            _ => None,
        }
    }
}

impl fmt::Display for Symbology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Symbology {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Symbology::ALL
            .iter()
            .copied()
            .find(|tag| tag.as_str() == s)
            .ok_or_else(|| format!("unknown symbology tag: {}", s))
    }
}

/// Контрольная цифра GTIN (EAN-8 / EAN-13): веса 3,1,3,... справа налево
pub fn gtin_check_digit(digits: &str) -> u32 {
    let sum: u32 = digits
        .chars()
        .rev()
        .filter_map(|c| c.to_digit(10))
        .enumerate()
        .map(|(i, d)| if i % 2 == 0 { d * 3 } else { d })
        .sum();
    (10 - sum % 10) % 10
}

fn is_digits_of_len(payload: &str, len: usize) -> bool {
    payload.len() == len && payload.chars().all(|c| c.is_ascii_digit())
}

fn pad_digits(payload: &str, width: usize) -> String {
    let digits: String = payload
        .chars()
        .filter(|c| c.is_ascii_digit())
        .take(width)
        .collect();
    format!("{:0>width$}", digits, width = width)
}

fn is_code39_char(c: char) -> bool {
    c.is_ascii_uppercase() || c.is_ascii_digit() || CODE39_EXTRA.contains(&c)
}

fn is_code128_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || CODE39_EXTRA.contains(&c)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ean13_repair_pads_left() {
        let repaired = Symbology::Ean13.repair_payload("abc123");
        assert_eq!(repaired, "000000000123");
        assert!(Symbology::Ean13.is_valid_payload(&repaired));
    }

    #[test]
    fn test_ean13_repair_truncates() {
        let repaired = Symbology::Ean13.repair_payload("9000000000001");
        assert_eq!(repaired, "900000000000");
    }

    #[test]
    fn test_itf_default_length() {
        let repaired = Symbology::Itf.repair_payload("12-34");
        assert_eq!(repaired, "00000000001234");
        assert!(Symbology::Itf.is_valid_payload(&repaired));
        assert!(!Symbology::Itf.is_valid_payload("123"));
    }

    #[test]
    fn test_code39_repair_filters_alphabet() {
        let repaired = Symbology::Code39.repair_payload("abc_def@12345678901234");
        assert_eq!(repaired, "ABCDEF123456789");
        assert_eq!(Symbology::Code39.repair_payload("@@@"), "");
        assert!(!Symbology::Code39.is_valid_payload(""));
    }

    #[test]
    fn test_code128_keeps_case() {
        assert_eq!(Symbology::Code128.repair_payload("Hello_World!"), "HelloWorld");
    }

    #[test]
    fn test_check_digits() {
        assert_eq!(gtin_check_digit("400638133393"), 1);
        assert_eq!(gtin_check_digit("9638507"), 4);
        assert_eq!(Symbology::Ean13.canonical_text("400638133393"), "4006381333931");
        assert_eq!(Symbology::Itf.canonical_text("12345678901234"), "12345678901234");
    }

    #[test]
    fn test_format_names() {
        assert_eq!(Symbology::from_format_name("QR_CODE"), Some(Symbology::QrCode));
        assert_eq!(Symbology::from_format_name("QR-Code"), Some(Symbology::QrCode));
        assert_eq!(Symbology::from_format_name("CODE_128"), Some(Symbology::Code128));
        assert_eq!(Symbology::from_format_name("EAN-13"), Some(Symbology::Ean13));
        assert_eq!(Symbology::from_format_name("I2/5"), Some(Symbology::Itf));
        assert_eq!(Symbology::from_format_name("UPC_E"), None);
    }

    #[test]
    fn test_serde_names() {
        let json = serde_json::to_string(&Symbology::QrCode).unwrap();
        assert_eq!(json, "\"QR_CODE\"");
        assert_eq!("PDF_417".parse::<Symbology>(), Ok(Symbology::Pdf417));
    }
}
