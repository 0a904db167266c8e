//! HTML-отчёт
//!
//! Отчёт строится только из `AnalysisReport`, статистика здесь не
//! пересчитывается. Рядом пишется `analysis.json`. Графики рисуются отдельно
//! и подключаются по относительным путям `charts/*.png`.

use std::fs;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::analysis::{AnalysisReport, FocusAreaStats, GroupStats};

pub const REPORT_FILE: &str = "report.html";
pub const ANALYSIS_FILE: &str = "analysis.json";

/// Ссылки на графики: (файл, подпись)
pub const CHARTS: [(&str, &str); 3] = [
    ("charts/detection_time_comparison.png", "Detection time by backend (successful cases)"),
    ("charts/success_rate_comparison.png", "Success rate by backend"),
    ("charts/performance_distributions.png", "Detection time distributions"),
];

/// Сколько неудач показывать в таблице
const MAX_FAILURE_ROWS: usize = 200;

#[derive(Error, Debug)]
pub enum ReportError {
    #[error("cannot write {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot serialize analysis: {0}")]
    Json(#[from] serde_json::Error),
}

const STYLE: &str = r#"
body { font-family: -apple-system, "Segoe UI", Helvetica, Arial, sans-serif; margin: 2em auto; max-width: 1100px; color: #222; }
h1 { border-bottom: 2px solid #444; padding-bottom: .3em; }
h2 { margin-top: 2em; border-bottom: 1px solid #ccc; }
table { border-collapse: collapse; margin: 1em 0; width: 100%; }
th, td { border: 1px solid #ddd; padding: 6px 10px; text-align: left; }
th { background: #f3f3f3; }
td.num { text-align: right; font-variant-numeric: tabular-nums; }
.summary { display: flex; gap: 1.5em; flex-wrap: wrap; }
.card { border: 1px solid #ddd; border-radius: 6px; padding: 1em 1.5em; min-width: 160px; }
.card .value { font-size: 1.8em; font-weight: bold; }
.muted { color: #777; }
figure { margin: 1em 0; }
figure img { max-width: 100%; border: 1px solid #eee; }
"#;

pub fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

fn percent(rate: f64) -> String {
    format!("{:.1}%", rate * 100.0)
}

fn ms(value: f64) -> String {
    format!("{:.2}", value)
}

fn card(label: &str, value: &str) -> String {
    format!(
        "<div class=\"card\"><div class=\"muted\">{}</div><div class=\"value\">{}</div></div>\n",
        escape_html(label),
        escape_html(value)
    )
}

fn table(headers: &[&str], rows: &[Vec<String>]) -> String {
    let mut html = String::from("<table>\n<tr>");
    for h in headers {
        html.push_str(&format!("<th>{}</th>", escape_html(h)));
    }
    html.push_str("</tr>\n");
    for row in rows {
        html.push_str("<tr>");
        for (i, cell) in row.iter().enumerate() {
            // Первая колонка - подпись, остальные - числа
            if i == 0 {
                html.push_str(&format!("<td>{}</td>", escape_html(cell)));
            } else {
                html.push_str(&format!("<td class=\"num\">{}</td>", escape_html(cell)));
            }
        }
        html.push_str("</tr>\n");
    }
    html.push_str("</table>\n");
    html
}

fn executive_summary(report: &AnalysisReport) -> String {
    let overall = &report.overall;
    let mut html = String::from("<h2>Executive summary</h2>\n<div class=\"summary\">\n");
    html.push_str(&card("Measurements", &overall.total.to_string()));
    html.push_str(&card("Successful", &overall.successful.to_string()));
    html.push_str(&card("Failed", &overall.failed.to_string()));
    html.push_str(&card("Success rate", &percent(overall.success_rate)));
    html.push_str(&card("Backends", &overall.libraries.len().to_string()));
    html.push_str("</div>\n");

    let best: Vec<Vec<String>> = report
        .focus_areas
        .iter()
        .filter_map(|(area, stats)| {
            stats.best.as_ref().map(|best| {
                let rate = stats.libraries.get(best).map(|s| s.success_rate).unwrap_or(0.0);
                vec![area.clone(), best.clone(), percent(rate)]
            })
        })
        .collect();
    if !best.is_empty() {
        html.push_str(&table(&["Focus area", "Best backend", "Success rate"], &best));
    }

    if !report.test_types.is_empty() {
        let rows: Vec<Vec<String>> = report
            .test_types
            .iter()
            .map(|(t, n)| vec![t.clone(), n.to_string()])
            .collect();
        html.push_str(&table(&["Test type", "Cases"], &rows));
    }
    if report.placeholder_excluded > 0 {
        html.push_str(&format!(
            "<p class=\"muted\">{} measurements on placeholder symbols were excluded from these statistics.</p>\n",
            report.placeholder_excluded
        ));
    }
    html
}

fn focus_section(title: &str, stats: Option<&FocusAreaStats>, multiple: bool) -> String {
    let mut html = format!("<h2>{}</h2>\n", escape_html(title));
    let Some(stats) = stats.filter(|s| !s.libraries.is_empty()) else {
        html.push_str("<p class=\"muted\">No cases of this type were measured.</p>\n");
        return html;
    };

    html.push_str(&format!("<p>{} test cases.</p>\n", stats.total_tests));
    let mut headers = vec!["Rank", "Backend", "Measured", "Decoded", "Success rate", "Mean time (ms)"];
    if multiple {
        headers.extend(["Avg. barcodes detected", "Scalability"]);
    }

    let rows: Vec<Vec<String>> = stats
        .ranking
        .iter()
        .enumerate()
        .filter_map(|(i, name)| stats.libraries.get(name).map(|s| (i, name, s)))
        .map(|(i, name, s)| {
            let mut row = vec![
                (i + 1).to_string(),
                name.clone(),
                s.count.to_string(),
                s.successful.to_string(),
                percent(s.success_rate),
                ms(s.mean_time_ms),
            ];
            if multiple {
                row.push(s.avg_barcodes_detected.map(|v| format!("{:.2}", v)).unwrap_or_default());
                row.push(s.scalability.map(|v| format!("{:.3}", v)).unwrap_or_default());
            }
            row
        })
        .collect();
    html.push_str(&table(&headers, &rows));
    html
}

fn grouped_tables(title: &str, key_label: &str, groups: &[(String, Vec<(String, &GroupStats)>)]) -> String {
    if groups.iter().all(|(_, entries)| entries.is_empty()) {
        return String::new();
    }
    let mut html = format!("<h2>{}</h2>\n", escape_html(title));
    for (lib, entries) in groups.iter().filter(|(_, e)| !e.is_empty()) {
        html.push_str(&format!("<h3>{}</h3>\n", escape_html(lib)));
        let rows: Vec<Vec<String>> = entries
            .iter()
            .map(|(key, s)| vec![key.clone(), s.count.to_string(), percent(s.success_rate), ms(s.mean_time_ms)])
            .collect();
        html.push_str(&table(&[key_label, "Cases", "Success rate", "Mean time (ms)"], &rows));
    }
    html
}

fn backend_comparison(report: &AnalysisReport) -> String {
    let mut html = String::from("<h2>Backend comparison</h2>\n");
    let rows: Vec<Vec<String>> = report
        .libraries
        .iter()
        .map(|(name, s)| {
            let t = &s.detection_time_ms;
            vec![
                name.clone(),
                s.count.to_string(),
                percent(s.success_rate),
                ms(t.mean),
                ms(t.median),
                ms(t.min),
                ms(t.max),
                ms(t.std),
                s.timeouts.to_string(),
                s.errors.to_string(),
            ]
        })
        .collect();
    html.push_str(&table(
        &[
            "Backend", "Measured", "Success rate", "Mean (ms)", "Median (ms)", "Min (ms)", "Max (ms)", "Std (ms)",
            "Timeouts", "Errors",
        ],
        &rows,
    ));
    html.push_str("<p class=\"muted\">Timing statistics cover successful decodes only.</p>\n");

    for (path, caption) in CHARTS {
        html.push_str(&format!(
            "<figure><img src=\"{}\" alt=\"{}\"><figcaption>{}</figcaption></figure>\n",
            escape_html(path),
            escape_html(caption),
            escape_html(caption)
        ));
    }
    html
}

fn failures_section(report: &AnalysisReport) -> String {
    let mut html = String::from("<h2>Failures and omissions</h2>\n");
    if report.failures.is_empty() && report.omitted_cases.is_empty() && report.unclassified == 0 {
        html.push_str("<p>Every measured case was decoded.</p>\n");
        return html;
    }

    if !report.failures.is_empty() {
        html.push_str(&format!("<h3>Failed decodes ({})</h3>\n", report.failures.len()));
        let rows: Vec<Vec<String>> = report
            .failures
            .iter()
            .take(MAX_FAILURE_ROWS)
            .map(|f| {
                vec![
                    f.test_case_id.clone(),
                    f.library_name.clone(),
                    f.status.clone(),
                    f.error_message.clone().unwrap_or_default(),
                ]
            })
            .collect();
        html.push_str(&table(&["Case", "Backend", "Status", "Error"], &rows));
        if report.failures.len() > MAX_FAILURE_ROWS {
            html.push_str(&format!(
                "<p class=\"muted\">{} more failures in {}.</p>\n",
                report.failures.len() - MAX_FAILURE_ROWS,
                ANALYSIS_FILE
            ));
        }
    }

    if !report.omitted_cases.is_empty() {
        html.push_str(&format!("<h3>Omitted cases ({})</h3>\n", report.omitted_cases.len()));
        let rows: Vec<Vec<String>> = report
            .omitted_cases
            .iter()
            .map(|o| vec![o.path.clone(), o.reason.clone()])
            .collect();
        html.push_str(&table(&["File", "Reason"], &rows));
    }
    if report.unclassified > 0 {
        html.push_str(&format!(
            "<p class=\"muted\">{} measurements had no case metadata.</p>\n",
            report.unclassified
        ));
    }
    html
}

/// Полный HTML-документ
pub fn render_html(report: &AnalysisReport) -> String {
    let mut html = String::from("<!DOCTYPE html>\n<html lang=\"en\">\n<head>\n<meta charset=\"utf-8\">\n");
    html.push_str("<title>Barcode decoder benchmark</title>\n");
    html.push_str(&format!("<style>{}</style>\n</head>\n<body>\n", STYLE));
    html.push_str("<h1>Barcode decoder benchmark</h1>\n");
    html.push_str(&format!(
        "<p class=\"muted\">Generated {}</p>\n",
        escape_html(&report.generated)
    ));

    html.push_str(&executive_summary(report));
    html.push_str(&focus_section(
        "Angled barcodes",
        report.focus_areas.get("angled"),
        false,
    ));
    html.push_str(&focus_section(
        "Multiple barcodes per image",
        report.focus_areas.get("multiple"),
        true,
    ));
    html.push_str(&focus_section(
        "Challenging conditions",
        report.focus_areas.get("challenging"),
        false,
    ));
    if let Some(existing) = report.focus_areas.get("existing_dataset").filter(|s| s.total_tests > 0) {
        html.push_str(&focus_section("Existing dataset", Some(existing), false));
    }

    let impact: Vec<(String, Vec<(String, &GroupStats)>)> = report
        .degradation_impact
        .iter()
        .map(|(lib, tags)| (lib.clone(), tags.iter().map(|(t, s)| (t.clone(), s)).collect()))
        .collect();
    html.push_str(&grouped_tables("Degradation impact", "Degradation", &impact));

    html.push_str(&backend_comparison(report));

    let rotation: Vec<(String, Vec<(String, &GroupStats)>)> = report
        .by_rotation
        .iter()
        .map(|(lib, angles)| (lib.clone(), angles.iter().map(|(a, s)| (format!("{}°", a), s)).collect()))
        .collect();
    html.push_str(&grouped_tables("By rotation angle", "Angle", &rotation));

    let counts: Vec<(String, Vec<(String, &GroupStats)>)> = report
        .by_barcode_count
        .iter()
        .map(|(lib, counts)| (lib.clone(), counts.iter().map(|(n, s)| (n.to_string(), s)).collect()))
        .collect();
    html.push_str(&grouped_tables("By barcode count", "Barcodes", &counts));

    html.push_str(&failures_section(report));
    html.push_str("</body>\n</html>\n");
    html
}

/// Запись `report.html` и `analysis.json` в каталог
pub fn write_report(dir: &Path, report: &AnalysisReport) -> Result<PathBuf, ReportError> {
    fs::create_dir_all(dir).map_err(|source| ReportError::Io {
        path: dir.to_path_buf(),
        source,
    })?;

    let json_path = dir.join(ANALYSIS_FILE);
    let mut json = serde_json::to_string_pretty(report)?;
    json.push('\n');
    fs::write(&json_path, json).map_err(|source| ReportError::Io {
        path: json_path.clone(),
        source,
    })?;

    let html_path = dir.join(REPORT_FILE);
    fs::write(&html_path, render_html(report)).map_err(|source| ReportError::Io {
        path: html_path.clone(),
        source,
    })?;

    log::info!("report written to {}", html_path.display());
    Ok(html_path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::{AreaLibraryStats, FailureEntry, LibraryStats};

    fn sample_report() -> AnalysisReport {
        let mut report = AnalysisReport::default();
        report.overall.total = 4;
        report.overall.successful = 3;
        report.overall.failed = 1;
        report.overall.success_rate = 0.75;
        report.overall.libraries = vec!["rxing".to_string()];
        report.libraries.insert("rxing".to_string(), LibraryStats::default());

        let mut angled = FocusAreaStats {
            total_tests: 2,
            ranking: vec!["rxing".to_string()],
            best: Some("rxing".to_string()),
            ..FocusAreaStats::default()
        };
        angled.libraries.insert(
            "rxing".to_string(),
            AreaLibraryStats {
                count: 2,
                successful: 1,
                success_rate: 0.5,
                mean_time_ms: 12.5,
                ..AreaLibraryStats::default()
            },
        );
        report.focus_areas.insert("angled".to_string(), angled);
        report.failures.push(FailureEntry {
            test_case_id: "angled_001".to_string(),
            library_name: "rxing".to_string(),
            status: "error".to_string(),
            error_message: Some("<boom>".to_string()),
        });
        report
    }

    #[test]
    fn test_escape_html() {
        assert_eq!(escape_html("<a href=\"x\">&'"), "&lt;a href=&quot;x&quot;&gt;&amp;&#39;");
    }

    #[test]
    fn test_render_sections() {
        let html = render_html(&sample_report());
        assert!(html.contains("Executive summary"));
        assert!(html.contains("75.0%"));
        assert!(html.contains("12.50"));
        assert!(html.contains("No cases of this type were measured."));
        assert!(html.contains("charts/success_rate_comparison.png"));
        assert!(html.contains("&lt;boom&gt;"));
        assert!(!html.contains("<boom>"));
    }

    #[test]
    fn test_write_report_files() {
        let dir = tempfile::tempdir().unwrap();
        let report = sample_report();
        let html = write_report(dir.path(), &report).unwrap();
        assert!(html.ends_with(REPORT_FILE));

        let json = fs::read_to_string(dir.path().join(ANALYSIS_FILE)).unwrap();
        let parsed: AnalysisReport = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, report);
    }
}
