//! Каталог деградаций изображения
//!
//! Закрытый набор параметризованных искажений: фотометрические, геометрические,
//! перекрытия и имитация поверхности. Каждая деградация - вариант перечисления
//! со своей записью параметров; вся случайность идёт через переданный RNG.

use std::fmt;
use std::str::FromStr;

use image::imageops::{self, FilterType};
use image::{Rgb, RgbImage};
use nalgebra::Point2;
use rand::seq::SliceRandom;
use rand::Rng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

use crate::geometry::{self, Border, Rect};

/// Амплитуда «рваного» края, пикселей
const TEAR_JITTER: i64 = 15;

/// Ошибки применения деградации
#[derive(Error, Debug)]
pub enum DegradationError {
    #[error("{kind}: invalid parameter: {reason}")]
    InvalidParameter { kind: DegradationKind, reason: String },

    #[error("{kind}: degenerate geometry: {reason}")]
    Degenerate { kind: DegradationKind, reason: String },
}

/// Тег деградации
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DegradationKind {
    GaussianNoise,
    SaltPepperNoise,
    LowContrast,
    LowBrightness,
    HighBrightness,
    Shadows,
    Reflections,
    ColorInversion,
    ChannelDropout,
    GaussianBlur,
    MotionBlur,
    PerspectiveWarp,
    LowResolution,
    Crumpling,
    CylindricalWarp,
    Occlusion,
    PartialCutoff,
    BackgroundClutter,
    TornEdges,
}

impl DegradationKind {
    pub const ALL: [DegradationKind; 19] = [
        DegradationKind::GaussianNoise,
        DegradationKind::SaltPepperNoise,
        DegradationKind::LowContrast,
        DegradationKind::LowBrightness,
        DegradationKind::HighBrightness,
        DegradationKind::Shadows,
        DegradationKind::Reflections,
        DegradationKind::ColorInversion,
        DegradationKind::ChannelDropout,
        DegradationKind::GaussianBlur,
        DegradationKind::MotionBlur,
        DegradationKind::PerspectiveWarp,
        DegradationKind::LowResolution,
        DegradationKind::Crumpling,
        DegradationKind::CylindricalWarp,
        DegradationKind::Occlusion,
        DegradationKind::PartialCutoff,
        DegradationKind::BackgroundClutter,
        DegradationKind::TornEdges,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            DegradationKind::GaussianNoise => "gaussian_noise",
            DegradationKind::SaltPepperNoise => "salt_pepper_noise",
            DegradationKind::LowContrast => "low_contrast",
            DegradationKind::LowBrightness => "low_brightness",
            DegradationKind::HighBrightness => "high_brightness",
            DegradationKind::Shadows => "shadows",
            DegradationKind::Reflections => "reflections",
            DegradationKind::ColorInversion => "color_inversion",
            DegradationKind::ChannelDropout => "channel_dropout",
            DegradationKind::GaussianBlur => "gaussian_blur",
            DegradationKind::MotionBlur => "motion_blur",
            DegradationKind::PerspectiveWarp => "perspective_warp",
            DegradationKind::LowResolution => "low_resolution",
            DegradationKind::Crumpling => "crumpling",
            DegradationKind::CylindricalWarp => "cylindrical_warp",
            DegradationKind::Occlusion => "occlusion",
            DegradationKind::PartialCutoff => "partial_cutoff",
            DegradationKind::BackgroundClutter => "background_clutter",
            DegradationKind::TornEdges => "torn_edges",
        }
    }
}

impl fmt::Display for DegradationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DegradationKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        DegradationKind::ALL
            .iter()
            .copied()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| format!("unknown degradation: {}", s))
    }
}

/// Уровень жёсткости параметров
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Light,
    Severe,
}

impl Severity {
    /// Severe с вероятностью `severe_probability`
    pub fn sample<R: Rng + ?Sized>(severe_probability: f64, rng: &mut R) -> Severity {
        if rng.gen::<f64>() < severe_probability {
            Severity::Severe
        } else {
            Severity::Light
        }
    }

    fn is_severe(self) -> bool {
        self == Severity::Severe
    }

    /// Выбор между диапазоном light и severe
    fn pick<T>(self, light: T, severe: T) -> T {
        match self {
            Severity::Light => light,
            Severity::Severe => severe,
        }
    }
}

/// Сторона изображения
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Edge {
    Top,
    Bottom,
    Left,
    Right,
}

impl Edge {
    const ALL: [Edge; 4] = [Edge::Top, Edge::Bottom, Edge::Left, Edge::Right];

    fn as_str(self) -> &'static str {
        match self {
            Edge::Top => "top",
            Edge::Bottom => "bottom",
            Edge::Left => "left",
            Edge::Right => "right",
        }
    }
}

/// Направление смаза
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MotionDirection {
    Horizontal,
    Vertical,
    DiagDown,
    DiagUp,
}

impl MotionDirection {
    const ALL: [MotionDirection; 4] = [
        MotionDirection::Horizontal,
        MotionDirection::Vertical,
        MotionDirection::DiagDown,
        MotionDirection::DiagUp,
    ];

    fn step(self) -> (i64, i64) {
        match self {
            MotionDirection::Horizontal => (1, 0),
            MotionDirection::Vertical => (0, 1),
            MotionDirection::DiagDown => (1, 1),
            MotionDirection::DiagUp => (-1, 1),
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            MotionDirection::Horizontal => "horizontal",
            MotionDirection::Vertical => "vertical",
            MotionDirection::DiagDown => "diag_down",
            MotionDirection::DiagUp => "diag_up",
        }
    }
}

/// Форма тени
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ShadowShape {
    /// Градиент от тёмной стороны `edge`
    Linear { edge: Edge },
    /// Тёмный центр в точке (cx, cy)
    Radial { cx: f64, cy: f64 },
}

/// Блик
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Spot {
    pub x: i64,
    pub y: i64,
    pub radius: i64,
    pub intensity: f64,
}

/// Прямоугольник фонового «мусора»
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClutterRect {
    pub rect: Rect,
    pub color: [u8; 3],
}

/// Контекст сэмплирования: фон холста и положение символа на нём
#[derive(Debug, Clone, Copy)]
pub struct DegradationContext {
    pub background: Rgb<u8>,
    pub symbol_bbox: Rect,
}

/// Деградация с реализованными параметрами
#[derive(Debug, Clone, PartialEq)]
pub enum Degradation {
    GaussianNoise { std: f64 },
    SaltPepperNoise { amount: f64 },
    LowContrast { alpha: f64, beta: f64 },
    LowBrightness { beta: f64 },
    HighBrightness { beta: f64 },
    Shadows { shape: ShadowShape, darkness: f64 },
    Reflections { spots: Vec<Spot> },
    ColorInversion,
    ChannelDropout { channels: Vec<usize> },
    GaussianBlur { kernel_size: u32 },
    MotionBlur { kernel_size: u32, direction: MotionDirection },
    PerspectiveWarp { margin: f32, src: [[f32; 2]; 4], dst: [[f32; 2]; 4] },
    LowResolution { scale: f64 },
    Crumpling { amplitude: f64 },
    CylindricalWarp { curvature: f64 },
    Occlusion { rect: Rect, gray: u8 },
    PartialCutoff { edge: Edge, fraction: f64, fill: [u8; 3] },
    BackgroundClutter { rects: Vec<ClutterRect>, alpha: f64 },
    TornEdges { edge: Edge, depth: u32, fill: [u8; 3] },
}

/// Пропущенная деградация (ошибка применения)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkippedDegradation {
    pub tag: DegradationKind,
    pub reason: String,
}

/// Результат последовательного применения нескольких деградаций
#[derive(Debug, Clone)]
pub struct Composition {
    pub image: RgbImage,
    pub applied: Vec<Degradation>,
    pub skipped: Vec<SkippedDegradation>,
}

/// Число деградаций на один сложный кейс
pub fn sample_count<R: Rng + ?Sized>(severity: Severity, rng: &mut R) -> usize {
    match severity {
        Severity::Light => rng.gen_range(2..=3),
        Severity::Severe => rng.gen_range(3..=5),
    }
}

/// Выбор `k` различных тегов без возвращения, порядок = порядок применения
pub fn sample_tags<R: Rng + ?Sized>(severity: Severity, rng: &mut R) -> Vec<DegradationKind> {
    let count = sample_count(severity, rng);
    let mut tags = DegradationKind::ALL.to_vec();
    tags.shuffle(rng);
    tags.truncate(count);
    tags
}

/// Композиция деградаций для сложного кейса.
///
/// Ошибка одной деградации не прерывает цепочку: она попадает в `skipped`,
/// а изображение передаётся дальше без изменений.
pub fn compose<R: Rng + ?Sized>(
    img: &RgbImage,
    severity: Severity,
    ctx: &DegradationContext,
    rng: &mut R,
) -> Composition {
    let tags = sample_tags(severity, rng);
    let mut image = img.clone();
    let mut applied = Vec::with_capacity(tags.len());
    let mut skipped = Vec::new();

    for tag in tags {
        let degradation = Degradation::sample(tag, severity, image.dimensions(), ctx, rng);
        match degradation.apply(&image, rng) {
            Ok(next) => {
                image = next;
                applied.push(degradation);
            }
            Err(e) => {
                log::warn!("skipping degradation {}: {}", tag, e);
                skipped.push(SkippedDegradation {
                    tag,
                    reason: e.to_string(),
                });
            }
        }
    }

    Composition {
        image,
        applied,
        skipped,
    }
}

impl Degradation {
    pub fn kind(&self) -> DegradationKind {
        match self {
            Degradation::GaussianNoise { .. } => DegradationKind::GaussianNoise,
            Degradation::SaltPepperNoise { .. } => DegradationKind::SaltPepperNoise,
            Degradation::LowContrast { .. } => DegradationKind::LowContrast,
            Degradation::LowBrightness { .. } => DegradationKind::LowBrightness,
            Degradation::HighBrightness { .. } => DegradationKind::HighBrightness,
            Degradation::Shadows { .. } => DegradationKind::Shadows,
            Degradation::Reflections { .. } => DegradationKind::Reflections,
            Degradation::ColorInversion => DegradationKind::ColorInversion,
            Degradation::ChannelDropout { .. } => DegradationKind::ChannelDropout,
            Degradation::GaussianBlur { .. } => DegradationKind::GaussianBlur,
            Degradation::MotionBlur { .. } => DegradationKind::MotionBlur,
            Degradation::PerspectiveWarp { .. } => DegradationKind::PerspectiveWarp,
            Degradation::LowResolution { .. } => DegradationKind::LowResolution,
            Degradation::Crumpling { .. } => DegradationKind::Crumpling,
            Degradation::CylindricalWarp { .. } => DegradationKind::CylindricalWarp,
            Degradation::Occlusion { .. } => DegradationKind::Occlusion,
            Degradation::PartialCutoff { .. } => DegradationKind::PartialCutoff,
            Degradation::BackgroundClutter { .. } => DegradationKind::BackgroundClutter,
            Degradation::TornEdges { .. } => DegradationKind::TornEdges,
        }
    }

    /// Сэмплирование параметров для изображения размера `dims`
    pub fn sample<R: Rng + ?Sized>(
        kind: DegradationKind,
        severity: Severity,
        dims: (u32, u32),
        ctx: &DegradationContext,
        rng: &mut R,
    ) -> Degradation {
        let (w, h) = (dims.0 as f64, dims.1 as f64);
        let s = severity;

        match kind {
            DegradationKind::GaussianNoise => Degradation::GaussianNoise {
                std: rng.gen_range(s.pick(5.0..15.0, 10.0..25.0)),
            },
            DegradationKind::SaltPepperNoise => Degradation::SaltPepperNoise {
                amount: rng.gen_range(s.pick(0.005..0.02, 0.01..0.05)),
            },
            DegradationKind::LowContrast => Degradation::LowContrast {
                alpha: rng.gen_range(s.pick(0.6..0.8, 0.5..0.7)),
                beta: rng.gen_range(s.pick(-10.0..20.0, -20.0..10.0)),
            },
            DegradationKind::LowBrightness => Degradation::LowBrightness {
                beta: rng.gen_range(s.pick(-40.0..-20.0, -60.0..-30.0)),
            },
            DegradationKind::HighBrightness => Degradation::HighBrightness {
                beta: rng.gen_range(s.pick(20.0..40.0, 30.0..60.0)),
            },
            DegradationKind::Shadows => {
                let shape = if rng.gen_bool(0.5) {
                    ShadowShape::Linear {
                        edge: pick(&Edge::ALL, rng),
                    }
                } else {
                    ShadowShape::Radial {
                        cx: rng.gen_range(w * 0.2..=w * 0.8).round(),
                        cy: rng.gen_range(h * 0.2..=h * 0.8).round(),
                    }
                };
                Degradation::Shadows {
                    shape,
                    darkness: rng.gen_range(s.pick(0.7..0.85, 0.6..0.8)),
                }
            }
            DegradationKind::Reflections => {
                let count = rng.gen_range(1..=s.pick(2, 3));
                let spots = (0..count)
                    .map(|_| Spot {
                        x: rng.gen_range(w * 0.2..=w * 0.8) as i64,
                        y: rng.gen_range(h * 0.2..=h * 0.8) as i64,
                        radius: rng.gen_range(s.pick(15..=30, 20..=40)),
                        intensity: rng.gen_range(s.pick(80.0..150.0, 100.0..180.0)),
                    })
                    .collect();
                Degradation::Reflections { spots }
            }
            DegradationKind::ColorInversion => Degradation::ColorInversion,
            DegradationKind::ChannelDropout => {
                let drop_count = if s.is_severe() && rng.gen::<f64>() < 0.4 { 2 } else { 1 };
                let mut channels = vec![0usize, 1, 2];
                channels.shuffle(rng);
                channels.truncate(drop_count);
                Degradation::ChannelDropout { channels }
            }
            DegradationKind::GaussianBlur => Degradation::GaussianBlur {
                kernel_size: pick(s.pick(&[3u32, 5, 7][..], &[5, 7, 9, 11][..]), rng),
            },
            DegradationKind::MotionBlur => Degradation::MotionBlur {
                kernel_size: pick(s.pick(&[5u32, 7, 9, 11][..], &[9, 11, 13, 15][..]), rng),
                direction: pick(&MotionDirection::ALL, rng),
            },
            DegradationKind::PerspectiveWarp => {
                let margin = s.pick(80.0f32, 60.0);
                let jitter = s.pick(20i32, 40);
                let (wf, hf) = (dims.0 as f32, dims.1 as f32);
                let src = [
                    [margin, margin],
                    [wf - margin, margin],
                    [wf - margin, hf - margin],
                    [margin, hf - margin],
                ];
                let mut dst = src;
                for corner in dst.iter_mut() {
                    corner[0] += rng.gen_range(-jitter..=jitter) as f32;
                    corner[1] += rng.gen_range(-jitter..=jitter) as f32;
                }
                Degradation::PerspectiveWarp { margin, src, dst }
            }
            DegradationKind::LowResolution => Degradation::LowResolution {
                scale: rng.gen_range(s.pick(0.5..0.7, 0.4..0.6)),
            },
            DegradationKind::Crumpling => Degradation::Crumpling {
                amplitude: rng.gen_range(s.pick(3.0..10.0, 8.0..15.0)),
            },
            DegradationKind::CylindricalWarp => Degradation::CylindricalWarp {
                curvature: rng.gen_range(s.pick(5e-5..2e-4, 1e-4..3e-4)),
            },
            DegradationKind::Occlusion => {
                let bbox = ctx.symbol_bbox;
                let (lo, hi) = s.pick((0.10, 0.25), (0.15, 0.35));
                let occ_w = fraction_of(bbox.width, lo, hi, rng);
                let occ_h = fraction_of(bbox.height, lo, hi, rng);
                let x = rng.gen_range(bbox.x..=bbox.x + bbox.width.saturating_sub(occ_w));
                let y = rng.gen_range(bbox.y..=bbox.y + bbox.height.saturating_sub(occ_h));
                Degradation::Occlusion {
                    rect: Rect::new(x, y, occ_w, occ_h),
                    gray: rng.gen(),
                }
            }
            DegradationKind::PartialCutoff => Degradation::PartialCutoff {
                edge: pick(&Edge::ALL, rng),
                fraction: rng.gen_range(s.pick(0.05..0.12, 0.08..0.18)),
                fill: ctx.background.0,
            },
            DegradationKind::BackgroundClutter => {
                let count = rng.gen_range(s.pick(3..=6, 5..=10));
                let max_x = dims.0.saturating_sub(10);
                let max_y = dims.1.saturating_sub(10);
                let rects = (0..count)
                    .map(|_| {
                        let x = rng.gen_range(0..=max_x);
                        let y = rng.gen_range(0..=max_y);
                        let rw = rng.gen_range(20..=80u32);
                        let rh = rng.gen_range(20..=80u32);
                        ClutterRect {
                            rect: Rect::new(x, y, rw, rh).clipped(dims.0, dims.1),
                            color: rng.gen(),
                        }
                    })
                    .collect();
                Degradation::BackgroundClutter {
                    rects,
                    alpha: rng.gen_range(s.pick(0.15..0.3, 0.2..0.4)),
                }
            }
            DegradationKind::TornEdges => {
                let edge = pick(&Edge::ALL, rng);
                let side = match edge {
                    Edge::Top | Edge::Bottom => dims.1,
                    Edge::Left | Edge::Right => dims.0,
                };
                let (lo, hi) = s.pick((0.03, 0.08), (0.05, 0.12));
                Degradation::TornEdges {
                    edge,
                    depth: fraction_of(side, lo, hi, rng),
                    fill: ctx.background.0,
                }
            }
        }
    }

    /// Реализованные параметры для метаданных кейса
    pub fn params(&self) -> Value {
        match self {
            Degradation::GaussianNoise { std } => json!({ "std": round_to(*std, 2) }),
            Degradation::SaltPepperNoise { amount } => json!({ "amount": round_to(*amount, 3) }),
            Degradation::LowContrast { alpha, beta } => {
                json!({ "alpha": round_to(*alpha, 2), "beta": round_to(*beta, 2) })
            }
            Degradation::LowBrightness { beta } | Degradation::HighBrightness { beta } => {
                json!({ "beta": round_to(*beta, 2) })
            }
            Degradation::Shadows { shape, darkness } => match shape {
                ShadowShape::Linear { edge } => json!({
                    "type": "linear",
                    "side": edge.as_str(),
                    "darkness": round_to(*darkness, 2),
                }),
                ShadowShape::Radial { cx, cy } => json!({
                    "type": "radial",
                    "center": [cx, cy],
                    "darkness": round_to(*darkness, 2),
                }),
            },
            Degradation::Reflections { spots } => json!({
                "num_spots": spots.len(),
                "spots": spots
                    .iter()
                    .map(|spot| json!({
                        "center": [spot.x, spot.y],
                        "radius": spot.radius,
                        "intensity": round_to(spot.intensity, 1),
                    }))
                    .collect::<Vec<_>>(),
            }),
            Degradation::ColorInversion => json!({ "inverted": true }),
            Degradation::ChannelDropout { channels } => json!({ "dropped_channels": channels }),
            Degradation::GaussianBlur { kernel_size } => json!({
                "kernel_size": kernel_size,
                "sigma": round_to(gaussian_sigma(*kernel_size), 3),
            }),
            Degradation::MotionBlur {
                kernel_size,
                direction,
            } => json!({ "kernel_size": kernel_size, "direction": direction.as_str() }),
            Degradation::PerspectiveWarp { margin, src, dst } => {
                let offsets: Vec<[f32; 2]> = src
                    .iter()
                    .zip(dst.iter())
                    .map(|(s, d)| [d[0] - s[0], d[1] - s[1]])
                    .collect();
                json!({ "margin": margin, "corner_offsets": offsets })
            }
            Degradation::LowResolution { scale } => json!({ "scale_down": round_to(*scale, 2) }),
            Degradation::Crumpling { amplitude } => json!({ "intensity": round_to(*amplitude, 2) }),
            Degradation::CylindricalWarp { curvature } => {
                json!({ "curvature": round_to(*curvature, 6) })
            }
            Degradation::Occlusion { rect, gray } => json!({
                "rect": [rect.x, rect.y, rect.width, rect.height],
                "color": gray,
            }),
            Degradation::PartialCutoff { edge, fraction, .. } => {
                json!({ "side": edge.as_str(), "fraction": round_to(*fraction, 3) })
            }
            Degradation::BackgroundClutter { rects, alpha } => json!({
                "blend_alpha": round_to(*alpha, 2),
                "rect_count": rects.len(),
            }),
            Degradation::TornEdges { edge, depth, .. } => {
                json!({ "edge": edge.as_str(), "tear_depth": depth })
            }
        }
    }

    fn invalid(&self, reason: impl Into<String>) -> DegradationError {
        DegradationError::InvalidParameter {
            kind: self.kind(),
            reason: reason.into(),
        }
    }

    fn validate(&self, img: &RgbImage) -> Result<(), DegradationError> {
        if img.width() == 0 || img.height() == 0 {
            return Err(DegradationError::Degenerate {
                kind: self.kind(),
                reason: "empty image".to_string(),
            });
        }

        match self {
            Degradation::GaussianNoise { std } if !std.is_finite() || *std < 0.0 => {
                Err(self.invalid(format!("std = {}", std)))
            }
            Degradation::SaltPepperNoise { amount } if !(0.0..=1.0).contains(amount) => {
                Err(self.invalid(format!("amount = {}", amount)))
            }
            Degradation::LowContrast { alpha, beta } if !alpha.is_finite() || !beta.is_finite() => {
                Err(self.invalid("non-finite alpha/beta"))
            }
            Degradation::Shadows { darkness, .. } if !(0.0..=1.0).contains(darkness) => {
                Err(self.invalid(format!("darkness = {}", darkness)))
            }
            Degradation::ChannelDropout { channels } if channels.iter().any(|&c| c > 2) => {
                Err(self.invalid(format!("channels = {:?}", channels)))
            }
            Degradation::GaussianBlur { kernel_size } | Degradation::MotionBlur { kernel_size, .. }
                if *kernel_size == 0 || kernel_size % 2 == 0 =>
            {
                Err(self.invalid(format!("kernel_size = {}", kernel_size)))
            }
            Degradation::LowResolution { scale } if !(*scale > 0.0 && *scale <= 1.0) => {
                Err(self.invalid(format!("scale = {}", scale)))
            }
            Degradation::PartialCutoff { fraction, .. } if !(0.0..1.0).contains(fraction) => {
                Err(self.invalid(format!("fraction = {}", fraction)))
            }
            Degradation::BackgroundClutter { alpha, .. } if !(0.0..=1.0).contains(alpha) => {
                Err(self.invalid(format!("alpha = {}", alpha)))
            }
            _ => Ok(()),
        }
    }

    /// Применение к изображению. Чистая функция от (img, параметры, состояние rng).
    pub fn apply<R: Rng + ?Sized>(&self, img: &RgbImage, rng: &mut R) -> Result<RgbImage, DegradationError> {
        self.validate(img)?;
        let (w, h) = img.dimensions();

        let out = match self {
            Degradation::GaussianNoise { std } => {
                let normal = Normal::new(0.0, *std).map_err(|e| self.invalid(e.to_string()))?;
                let mut out = img.clone();
                for pixel in out.pixels_mut() {
                    for c in pixel.0.iter_mut() {
                        *c = clamp_u8(*c as f64 + normal.sample(rng));
                    }
                }
                out
            }
            Degradation::SaltPepperNoise { amount } => {
                let total = (amount * w as f64 * h as f64) as usize;
                let salt = total / 2;
                let mut out = img.clone();
                for i in 0..total {
                    let value = if i < salt { 255 } else { 0 };
                    let x = rng.gen_range(0..w);
                    let y = rng.gen_range(0..h);
                    out.put_pixel(x, y, Rgb([value; 3]));
                }
                out
            }
            Degradation::LowContrast { alpha, beta } => affine(img, *alpha, *beta),
            Degradation::LowBrightness { beta } | Degradation::HighBrightness { beta } => {
                affine(img, 1.0, *beta)
            }
            Degradation::Shadows { shape, darkness } => shadow(img, *shape, *darkness),
            Degradation::Reflections { spots } => reflections(img, spots),
            Degradation::ColorInversion => invert(img),
            Degradation::ChannelDropout { channels } => {
                let mut out = img.clone();
                for pixel in out.pixels_mut() {
                    for &c in channels {
                        pixel.0[c] = 0;
                    }
                }
                out
            }
            Degradation::GaussianBlur { kernel_size } => gaussian_blur(img, *kernel_size),
            Degradation::MotionBlur {
                kernel_size,
                direction,
            } => motion_blur(img, *kernel_size, *direction),
            Degradation::PerspectiveWarp { src, dst, .. } => {
                let to_points = |corners: &[[f32; 2]; 4]| corners.map(|[x, y]| Point2::new(x, y));
                let degenerate = |reason: &str| DegradationError::Degenerate {
                    kind: self.kind(),
                    reason: reason.to_string(),
                };
                let matrix = geometry::find_homography(to_points(src), to_points(dst))
                    .ok_or_else(|| degenerate("no homography for corner set"))?;
                geometry::warp_perspective(img, &matrix, w, h, Border::Replicate)
                    .ok_or_else(|| degenerate("singular homography"))?
            }
            Degradation::LowResolution { scale } => {
                let sw = ((w as f64 * scale) as u32).max(1);
                let sh = ((h as f64 * scale) as u32).max(1);
                let small = imageops::resize(img, sw, sh, FilterType::Triangle);
                imageops::resize(&small, w, h, FilterType::Nearest)
            }
            Degradation::Crumpling { amplitude } => {
                let a = *amplitude as f32;
                geometry::remap(img, w, h, Border::Replicate, |x, y| {
                    let (xf, yf) = (x as f32, y as f32);
                    (
                        xf + a * (yf / 10.0).sin() * (xf / 10.0).cos(),
                        yf + a * (yf / 15.0).cos() * (xf / 15.0).sin(),
                    )
                })
            }
            Degradation::CylindricalWarp { curvature } => {
                let c = *curvature as f32;
                let half = w as f32 / 2.0;
                geometry::remap(img, w, h, Border::Replicate, |x, y| {
                    let dx = x as f32 - half;
                    (x as f32, y as f32 + c * dx * dx)
                })
            }
            Degradation::Occlusion { rect, gray } => {
                let mut out = img.clone();
                fill_rect(&mut out, rect, Rgb([*gray; 3]));
                out
            }
            Degradation::PartialCutoff { edge, fraction, fill } => {
                let band_w = (w as f64 * fraction) as u32;
                let band_h = (h as f64 * fraction) as u32;
                let band = match edge {
                    Edge::Top => Rect::new(0, 0, w, band_h),
                    Edge::Bottom => Rect::new(0, h - band_h, w, band_h),
                    Edge::Left => Rect::new(0, 0, band_w, h),
                    Edge::Right => Rect::new(w - band_w, 0, band_w, h),
                };
                let mut out = img.clone();
                fill_rect(&mut out, &band, Rgb(*fill));
                out
            }
            Degradation::BackgroundClutter { rects, alpha } => {
                let mut clutter = img.clone();
                for item in rects {
                    fill_rect(&mut clutter, &item.rect, Rgb(item.color));
                }
                let mut out = img.clone();
                for (dst, src) in out.pixels_mut().zip(clutter.pixels()) {
                    for c in 0..3 {
                        let blended = src.0[c] as f64 * alpha + dst.0[c] as f64 * (1.0 - alpha);
                        dst.0[c] = clamp_u8(blended);
                    }
                }
                out
            }
            Degradation::TornEdges { edge, depth, fill } => torn_edges(img, *edge, *depth, Rgb(*fill), rng),
        };

        Ok(out)
    }
}

/// Сигма ядра Гаусса по размеру ядра (как при sigma = 0 в OpenCV)
pub fn gaussian_sigma(kernel_size: u32) -> f64 {
    0.3 * ((kernel_size as f64 - 1.0) * 0.5 - 1.0) + 0.8
}

fn pick<T: Copy, R: Rng + ?Sized>(items: &[T], rng: &mut R) -> T {
    items[rng.gen_range(0..items.len())]
}

/// Целая доля стороны в [lo, hi], не меньше 1 и не больше самой стороны
fn fraction_of<R: Rng + ?Sized>(side: u32, lo: f64, hi: f64, rng: &mut R) -> u32 {
    let lo_px = ((side as f64 * lo) as u32).max(1);
    let hi_px = ((side as f64 * hi) as u32).max(lo_px);
    rng.gen_range(lo_px..=hi_px).min(side.max(1))
}

fn round_to(value: f64, places: i32) -> f64 {
    let factor = 10f64.powi(places);
    (value * factor).round() / factor
}

fn clamp_u8(value: f64) -> u8 {
    value.round().clamp(0.0, 255.0) as u8
}

fn affine(img: &RgbImage, alpha: f64, beta: f64) -> RgbImage {
    let mut out = img.clone();
    for pixel in out.pixels_mut() {
        for c in pixel.0.iter_mut() {
            *c = clamp_u8(*c as f64 * alpha + beta);
        }
    }
    out
}

/// Инвертирование цвета
pub fn invert(img: &RgbImage) -> RgbImage {
    let mut out = img.clone();
    for pixel in out.pixels_mut() {
        for c in pixel.0.iter_mut() {
            *c = 255 - *c;
        }
    }
    out
}

fn fill_rect(img: &mut RgbImage, rect: &Rect, color: Rgb<u8>) {
    let clipped = rect.clipped(img.width(), img.height());
    for y in clipped.y..clipped.bottom() {
        for x in clipped.x..clipped.right() {
            img.put_pixel(x, y, color);
        }
    }
}

fn shadow(img: &RgbImage, shape: ShadowShape, darkness: f64) -> RgbImage {
    let (w, h) = img.dimensions();
    let (wf, hf) = (w as f64, h as f64);
    let max_dist = (wf * wf + hf * hf).sqrt();

    let mut out = img.clone();
    for (x, y, pixel) in out.enumerate_pixels_mut() {
        let (xf, yf) = (x as f64, y as f64);
        let gradient = match shape {
            ShadowShape::Linear { edge: Edge::Left } => xf / wf,
            ShadowShape::Linear { edge: Edge::Right } => 1.0 - xf / wf,
            ShadowShape::Linear { edge: Edge::Top } => yf / hf,
            ShadowShape::Linear { edge: Edge::Bottom } => 1.0 - yf / hf,
            ShadowShape::Radial { cx, cy } => {
                let dist = ((xf - cx).powi(2) + (yf - cy).powi(2)).sqrt();
                (dist / max_dist).min(1.0)
            }
        };
        let mask = gradient * (1.0 - darkness) + darkness;
        for c in pixel.0.iter_mut() {
            *c = clamp_u8(*c as f64 * mask);
        }
    }
    out
}

fn reflections(img: &RgbImage, spots: &[Spot]) -> RgbImage {
    let (w, h) = (img.width() as i64, img.height() as i64);
    let mut out = img.clone();

    for spot in spots {
        if spot.radius <= 0 {
            continue;
        }
        let radius = spot.radius as f64;
        for y in (spot.y - spot.radius).max(0)..(spot.y + spot.radius).min(h) {
            for x in (spot.x - spot.radius).max(0)..(spot.x + spot.radius).min(w) {
                let dist = (((x - spot.x).pow(2) + (y - spot.y).pow(2)) as f64).sqrt();
                if dist >= radius {
                    continue;
                }
                let blend = (1.0 - dist / radius) * (spot.intensity / 255.0);
                let pixel = out.get_pixel_mut(x as u32, y as u32);
                for c in pixel.0.iter_mut() {
                    *c = clamp_u8(*c as f64 * (1.0 - blend * 0.5) + blend * 255.0);
                }
            }
        }
    }
    out
}

fn gaussian_blur(img: &RgbImage, kernel_size: u32) -> RgbImage {
    imageproc::filter::gaussian_blur_f32(img, gaussian_sigma(kernel_size) as f32)
}

fn motion_blur(img: &RgbImage, kernel_size: u32, direction: MotionDirection) -> RgbImage {
    let kernel = vec![1.0 / kernel_size as f64; kernel_size as usize];
    convolve_line(img, &kernel, direction.step())
}

/// Свёртка 1D-ядром вдоль направления `step`, граница - повтор крайнего пикселя
fn convolve_line(img: &RgbImage, kernel: &[f64], step: (i64, i64)) -> RgbImage {
    let (w, h) = (img.width() as i64, img.height() as i64);
    let half = (kernel.len() / 2) as i64;
    let mut out = RgbImage::new(img.width(), img.height());

    for y in 0..h {
        for x in 0..w {
            let mut acc = [0.0f64; 3];
            for (i, weight) in kernel.iter().enumerate() {
                let offset = i as i64 - half;
                let sx = (x + offset * step.0).clamp(0, w - 1);
                let sy = (y + offset * step.1).clamp(0, h - 1);
                let p = img.get_pixel(sx as u32, sy as u32);
                for c in 0..3 {
                    acc[c] += p.0[c] as f64 * weight;
                }
            }
            out.put_pixel(x as u32, y as u32, Rgb(acc.map(clamp_u8)));
        }
    }
    out
}

fn torn_edges<R: Rng + ?Sized>(img: &RgbImage, edge: Edge, depth: u32, fill: Rgb<u8>, rng: &mut R) -> RgbImage {
    let (w, h) = img.dimensions();
    let mut out = img.clone();
    let tear = |rng: &mut R, limit: u32| -> u32 {
        (depth as i64 + rng.gen_range(-TEAR_JITTER..=TEAR_JITTER)).clamp(0, limit as i64) as u32
    };

    match edge {
        Edge::Top | Edge::Bottom => {
            for x in 0..w {
                let t = tear(rng, h);
                let rows = if edge == Edge::Top { 0..t } else { h - t..h };
                for y in rows {
                    out.put_pixel(x, y, fill);
                }
            }
        }
        Edge::Left | Edge::Right => {
            for y in 0..h {
                let t = tear(rng, w);
                let cols = if edge == Edge::Left { 0..t } else { w - t..w };
                for x in cols {
                    out.put_pixel(x, y, fill);
                }
            }
        }
    }
    out
}
