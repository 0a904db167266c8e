//! Integration tests for dataset generation

use std::fs;
use std::path::{Path, PathBuf};

use bench_core::config::GeneratorConfig;
use bench_core::dataset::{compose_angled, DatasetGenerator, GridLayout, Ratios};
use bench_core::encoder::BarcodeEncoder;
use bench_core::model::{TestCase, TestType};
use bench_core::symbology::Symbology;
use image::Rgb;

fn generate(dir: &Path, total: i64, ratios: &str, seed: u64) -> bench_core::CategoryCounts {
    let ratios: Ratios = ratios.parse().unwrap();
    let mut generator = DatasetGenerator::new(dir, seed, GeneratorConfig::default()).unwrap();
    let counts = generator.generate(total, &ratios).unwrap();
    generator.finalize().unwrap();
    counts
}

fn files(dir: &Path) -> Vec<PathBuf> {
    let mut out = Vec::new();
    if !dir.exists() {
        return out;
    }
    for entry in fs::read_dir(dir).unwrap() {
        let path = entry.unwrap().path();
        if path.is_dir() {
            out.extend(files(&path));
        } else {
            out.push(path);
        }
    }
    out.sort();
    out
}

fn sidecars(dir: &Path) -> Vec<TestCase> {
    files(dir)
        .into_iter()
        .filter(|p| p.extension().is_some_and(|e| e == "json"))
        .map(|p| serde_json::from_str(&fs::read_to_string(p).unwrap()).unwrap())
        .collect()
}

const DEFAULT_RATIOS: &str = "single=0.4,angled=0.3,multiple=0.2,challenging=0.1";

#[test]
fn test_allocation_rounding_writes_all_cases() {
    let dir = tempfile::tempdir().unwrap();
    let counts = generate(dir.path(), 10, DEFAULT_RATIOS, 7);

    assert_eq!((counts.single, counts.angled, counts.multiple, counts.challenging), (4, 3, 2, 1));
    let cases = sidecars(dir.path());
    assert_eq!(cases.len(), 10);

    for case in &cases {
        assert_eq!(case.barcode_data.len(), case.barcode_count);
        assert_eq!(case.barcode_types.len(), case.barcode_count);
        let image = dir.path().join(&case.image_path);
        assert!(image.is_file(), "missing {}", image.display());
    }
    assert!(cases.iter().all(|c| c.test_type != TestType::ExistingDataset));
}

#[test]
fn test_remainder_goes_to_challenging() {
    let dir = tempfile::tempdir().unwrap();
    let counts = generate(dir.path(), 11, DEFAULT_RATIOS, 7);
    assert_eq!((counts.single, counts.angled, counts.multiple, counts.challenging), (4, 3, 2, 2));
    assert_eq!(sidecars(&dir.path().join("challenging")).len(), 2);
}

#[test]
fn test_same_seed_is_byte_identical() {
    let a = tempfile::tempdir().unwrap();
    let b = tempfile::tempdir().unwrap();
    generate(a.path(), 8, DEFAULT_RATIOS, 1234);
    generate(b.path(), 8, DEFAULT_RATIOS, 1234);

    let files_a = files(a.path());
    let files_b = files(b.path());
    assert_eq!(files_a.len(), 16);
    assert_eq!(files_a.len(), files_b.len());
    for (fa, fb) in files_a.iter().zip(&files_b) {
        assert_eq!(fa.strip_prefix(a.path()).unwrap(), fb.strip_prefix(b.path()).unwrap());
        assert_eq!(fs::read(fa).unwrap(), fs::read(fb).unwrap(), "{} differs", fa.display());
    }
}

#[test]
fn test_zero_total_writes_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("dataset");
    let counts = generate(&out, 0, DEFAULT_RATIOS, 1);
    assert_eq!(counts.total(), 0);
    assert!(files(&out).is_empty());
}

#[test]
fn test_zero_ratio_category_is_absent() {
    let dir = tempfile::tempdir().unwrap();
    let counts = generate(dir.path(), 6, "single=0.5,angled=0.5,multiple=0,challenging=0", 3);
    assert_eq!(counts.multiple, 0);
    assert_eq!(counts.total(), 6);
    assert!(sidecars(&dir.path().join("multiple")).is_empty());
}

#[test]
fn test_negative_total_fails_before_writing() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("dataset");
    let mut generator = DatasetGenerator::new(&out, 1, GeneratorConfig::default()).unwrap();
    assert!(generator.generate(-1, &Ratios::default()).is_err());
    assert!(!out.exists());
}

#[test]
fn test_scratch_directory_is_removed() {
    let dir = tempfile::tempdir().unwrap();
    let mut generator = DatasetGenerator::new(dir.path(), 5, GeneratorConfig::default()).unwrap();
    generator.generate(2, &Ratios::default()).unwrap();
    let scratch = generator.scratch_dir().to_path_buf();
    assert!(scratch.is_dir());
    generator.finalize().unwrap();
    assert!(!scratch.exists());
}

#[test]
fn test_angled_symbol_is_not_clipped() {
    let config = GeneratorConfig::default();
    let symbol = BarcodeEncoder::default()
        .encode("ANGLE450001", Symbology::Code128, config.linear_width, config.linear_height)
        .unwrap();
    let (canvas, bbox) = compose_angled(&config, &symbol.image, 45.0);

    assert_eq!(canvas.dimensions(), (800, 600));
    let fill = Rgb([config.background; 3]);
    let margin = config.margin;
    for (x, y, px) in canvas.enumerate_pixels() {
        let in_band = x < margin || y < margin || x >= 800 - margin || y >= 600 - margin;
        if in_band {
            assert_eq!(*px, fill, "border pixel ({}, {}) is not background", x, y);
        }
    }
    assert!(bbox.x >= margin && bbox.y >= margin);
    assert!(bbox.right() <= 800 - margin && bbox.bottom() <= 600 - margin);
}

#[test]
fn test_multiple_symbols_do_not_overlap() {
    let dir = tempfile::tempdir().unwrap();
    generate(dir.path(), 5, "multiple=1", 99);

    let cases = sidecars(&dir.path().join("multiple"));
    assert_eq!(cases.len(), 5);
    for case in cases {
        assert_eq!(case.barcode_boxes.len(), case.barcode_count);
        let layout = GridLayout::for_count(case.barcode_count, 1600, 1200);
        let (inner_w, inner_h) = layout.inner_box();
        for (i, a) in case.barcode_boxes.iter().enumerate() {
            assert!(a.width <= inner_w && a.height <= inner_h, "{}: box {:?} too large", case.test_id, a);
            for b in &case.barcode_boxes[i + 1..] {
                assert!(!a.intersects(b), "{}: {:?} overlaps {:?}", case.test_id, a, b);
            }
        }
    }
}

#[test]
fn test_challenging_records_degradations() {
    let dir = tempfile::tempdir().unwrap();
    generate(dir.path(), 4, "challenging=1", 11);

    for case in sidecars(&dir.path().join("challenging")) {
        let tags = case.degradation_tags();
        assert!(tags.len() + case.degradation_skipped.len() >= 2);
        let params = case.degradations.as_ref().unwrap();
        assert_eq!(params.len(), tags.len());
        for tag in tags {
            assert!(params.contains_key(tag), "{}: no params for {}", case.test_id, tag);
        }
        assert_eq!(case.focus_area.as_deref(), Some("challenging_conditions"));
    }
}
