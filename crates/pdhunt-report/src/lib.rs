//! Report model and xlsx/text rendering.
//!
//! [`build_report`] is pure: it arranges a store snapshot into sheets.
//! [`write_workbook`] and [`render_text_summary`] turn that model into the
//! workbook file and the console/email summary.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use pdhunt_core::{JobPosting, PiRecord, PipelineError, Region};
use pdhunt_storage::{SourceRunRecord, SourceRunStatus};
use rust_xlsxwriter::{Format, Workbook, XlsxError};
use serde::Serialize;
use thiserror::Error;
use tracing::info;

pub const CRATE_NAME: &str = "pdhunt-report";

pub const MAX_COLUMN_WIDTH: usize = 50;
const DESCRIPTION_PREVIEW_CHARS: usize = 500;

pub const POSTING_COLUMNS: &[&str] = &[
    "Title",
    "PI Name",
    "Institution",
    "Tier",
    "Country",
    "Field",
    "Match Score",
    "Salary",
    "Duration",
    "Posted Date",
    "Deadline",
    "Job URL",
    "Source",
    "First Seen",
    "Last Seen",
    "Description",
];

pub const PI_COLUMNS: &[&str] = &[
    "PI Name",
    "Affiliation",
    "Recommendation Score",
    "h-index",
    "Citations",
    "Papers",
    "Discovered Via",
    "Scholar ID",
];

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("workbook error: {0}")]
    Xlsx(#[from] XlsxError),
    #[error("writing {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl From<ReportError> for PipelineError {
    fn from(err: ReportError) -> Self {
        PipelineError::Report(err.to_string())
    }
}

/// Everything the report needs, read from the store in one go.
#[derive(Debug, Clone, Default)]
pub struct ReportSnapshot {
    /// Every stored posting.
    pub postings: Vec<JobPosting>,
    pub recommended_pis: Vec<PiRecord>,
    /// Per-adapter outcomes of the run being reported, if any.
    pub source_runs: Vec<SourceRunRecord>,
    /// Start of the current run; postings first seen at or after it are new.
    pub run_started_at: Option<DateTime<Utc>>,
    /// Watched PIs whose lab page changed since the previous check.
    pub lab_pages_changed: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Cell {
    Text(String),
    Number(f64),
    Empty,
}

impl Cell {
    fn text(value: impl Into<String>) -> Self {
        Cell::Text(value.into())
    }

    fn opt(value: Option<&str>) -> Self {
        match value {
            Some(v) if !v.trim().is_empty() => Cell::Text(v.to_string()),
            _ => Cell::Empty,
        }
    }

    fn count(value: Option<u32>) -> Self {
        value.map(|v| Cell::Number(f64::from(v))).unwrap_or(Cell::Empty)
    }

    pub fn display(&self) -> String {
        match self {
            Cell::Text(s) => s.clone(),
            Cell::Number(n) if n.fract() == 0.0 => format!("{n:.0}"),
            Cell::Number(n) => format!("{n:.1}"),
            Cell::Empty => String::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Sheet {
    pub name: String,
    pub headers: Vec<String>,
    pub rows: Vec<Vec<Cell>>,
}

impl Sheet {
    fn new(name: &str, headers: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            headers: headers.iter().map(|h| h.to_string()).collect(),
            rows: Vec::new(),
        }
    }

    /// Rows excluding a placeholder.
    pub fn data_rows(&self) -> usize {
        if self.is_placeholder() {
            0
        } else {
            self.rows.len()
        }
    }

    fn is_placeholder(&self) -> bool {
        match &self.rows[..] {
            [only] => {
                matches!(only.first(), Some(Cell::Text(t)) if t.starts_with("No "))
                    && only.iter().skip(1).all(|c| *c == Cell::Empty)
            }
            _ => false,
        }
    }

    fn with_placeholder(mut self, message: &str) -> Self {
        if self.rows.is_empty() {
            let mut row = vec![Cell::Empty; self.headers.len().max(1)];
            row[0] = Cell::text(message);
            self.rows.push(row);
        }
        self
    }

    /// Content-fitted widths, capped at [`MAX_COLUMN_WIDTH`].
    pub fn column_widths(&self) -> Vec<usize> {
        (0..self.headers.len())
            .map(|col| {
                let widest = self
                    .rows
                    .iter()
                    .filter_map(|row| row.get(col))
                    .map(|cell| cell.display().chars().count())
                    .chain(std::iter::once(self.headers[col].chars().count()))
                    .max()
                    .unwrap_or(0);
                (widest + 2).min(MAX_COLUMN_WIDTH)
            })
            .collect()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RegionCount {
    pub total: usize,
    pub new: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Report {
    pub generated_at: DateTime<Utc>,
    pub total_postings: usize,
    pub new_postings: usize,
    pub by_region: BTreeMap<Region, RegionCount>,
    pub recommended_pis: usize,
    pub lab_pages_changed: Vec<String>,
    pub sheets: Vec<Sheet>,
}

impl Report {
    pub fn sheet(&self, name: &str) -> Option<&Sheet> {
        self.sheets.iter().find(|s| s.name == name)
    }

    pub fn file_name(&self) -> String {
        format!("PostdocSearch_{}.xlsx", self.generated_at.format("%Y-%m-%d_%H%M%S"))
    }
}

pub fn region_sheet_name(region: Region) -> &'static str {
    match region {
        Region::Us => "US",
        Region::Eu => "EU",
        Region::Asia => "Asia",
        Region::Other => "Other",
    }
}

fn posting_row(p: &JobPosting) -> Vec<Cell> {
    let description = p.description.as_deref().map(|d| {
        if d.chars().count() > DESCRIPTION_PREVIEW_CHARS {
            d.chars().take(DESCRIPTION_PREVIEW_CHARS).collect::<String>()
        } else {
            d.to_string()
        }
    });
    vec![
        Cell::text(&p.title),
        Cell::opt(p.pi_name.as_deref()),
        Cell::opt(p.institution.as_deref()),
        Cell::text(p.tier.to_string()),
        Cell::opt(p.country.as_deref()),
        Cell::opt(p.field.as_deref()),
        Cell::Number(p.match_score),
        Cell::opt(p.salary.as_deref()),
        Cell::opt(p.duration.as_deref()),
        Cell::opt(p.posted_date.as_deref()),
        Cell::opt(p.deadline.as_deref()),
        Cell::opt(p.url.as_deref()),
        Cell::text(&p.source_id),
        Cell::text(p.discovered_at.format("%Y-%m-%d").to_string()),
        Cell::text(p.last_seen_at.format("%Y-%m-%d").to_string()),
        Cell::opt(description.as_deref()),
    ]
}

fn pi_row(pi: &PiRecord) -> Vec<Cell> {
    vec![
        Cell::text(&pi.name),
        Cell::opt(pi.affiliation.as_deref()),
        Cell::Number(pi.recommendation_score),
        Cell::count(pi.h_index),
        Cell::count(pi.citation_count),
        Cell::count(pi.paper_count),
        Cell::opt(pi.discovered_via.as_deref()),
        Cell::text(&pi.external_id),
    ]
}

fn source_run_line(run: &SourceRunRecord) -> String {
    match run.status {
        SourceRunStatus::Succeeded => format!("ok ({} found, {} new)", run.found, run.inserted),
        SourceRunStatus::Partial => format!(
            "partial ({} found, {} new): {}",
            run.found,
            run.inserted,
            run.error.as_deref().unwrap_or("unknown error")
        ),
        SourceRunStatus::Failed => format!("failed: {}", run.error.as_deref().unwrap_or("unknown error")),
    }
}

/// Arrange a snapshot into the Summary, per-region, PI and history sheets.
pub fn build_report(snapshot: &ReportSnapshot, generated_at: DateTime<Utc>) -> Report {
    let is_new = |p: &JobPosting| snapshot.run_started_at.is_some_and(|since| p.discovered_at >= since);

    // Tier ascending, then score descending; the sort is stable so equal keys
    // keep store order.
    let mut ranked: Vec<&JobPosting> = snapshot.postings.iter().collect();
    ranked.sort_by(|a, b| a.tier.cmp(&b.tier).then_with(|| b.match_score.total_cmp(&a.match_score)));

    let mut by_region: BTreeMap<Region, RegionCount> =
        Region::ALL.iter().map(|r| (*r, RegionCount::default())).collect();
    let mut region_sheets = Vec::new();
    for region in Region::ALL {
        let mut sheet = Sheet::new(region_sheet_name(region), POSTING_COLUMNS);
        let count = by_region.entry(region).or_default();
        for posting in ranked.iter().filter(|p| p.region == region) {
            sheet.rows.push(posting_row(posting));
            count.total += 1;
            if is_new(posting) {
                count.new += 1;
            }
        }
        region_sheets.push(sheet.with_placeholder("No postings in this region"));
    }

    let mut pis: Vec<&PiRecord> = snapshot.recommended_pis.iter().collect();
    pis.sort_by(|a, b| b.recommendation_score.total_cmp(&a.recommendation_score));
    let mut pi_sheet = Sheet::new("PI Recommendations", PI_COLUMNS);
    pi_sheet.rows = pis.iter().map(|pi| pi_row(pi)).collect();
    let pi_sheet = pi_sheet.with_placeholder("No PI recommendations yet");

    let mut history: Vec<&JobPosting> = snapshot.postings.iter().collect();
    history.sort_by(|a, b| b.discovered_at.cmp(&a.discovered_at));
    let mut history_sheet = Sheet::new("All History", POSTING_COLUMNS);
    history_sheet.rows = history.iter().map(|p| posting_row(p)).collect();
    let history_sheet = history_sheet.with_placeholder("No postings recorded yet");

    let total_postings = ranked.len();
    let new_postings = by_region.values().map(|c| c.new).sum();

    let mut summary = Sheet::new("Summary", &["Metric", "Value"]);
    let mut metric = |name: &str, value: Cell| summary.rows.push(vec![Cell::text(name), value]);
    metric("Generated at", Cell::text(generated_at.format("%Y-%m-%d %H:%M:%S UTC").to_string()));
    metric("Stored postings", Cell::Number(total_postings as f64));
    metric("New this run", Cell::Number(new_postings as f64));
    for (region, count) in &by_region {
        metric(
            &format!("{} postings", region_sheet_name(*region)),
            Cell::Number(count.total as f64),
        );
    }
    metric("PI recommendations", Cell::Number(snapshot.recommended_pis.len() as f64));
    for run in &snapshot.source_runs {
        metric(&format!("Source {}", run.source_id), Cell::text(source_run_line(run)));
    }
    for name in &snapshot.lab_pages_changed {
        metric("Lab page changed", Cell::text(name));
    }

    let mut sheets = vec![summary];
    sheets.extend(region_sheets);
    sheets.push(pi_sheet);
    sheets.push(history_sheet);

    Report {
        generated_at,
        total_postings,
        new_postings,
        by_region,
        recommended_pis: snapshot.recommended_pis.len(),
        lab_pages_changed: snapshot.lab_pages_changed.clone(),
        sheets,
    }
}

fn render_workbook(report: &Report) -> Result<Vec<u8>, XlsxError> {
    let mut workbook = Workbook::new();
    let header = Format::new().set_bold();

    for sheet in &report.sheets {
        let worksheet = workbook.add_worksheet();
        worksheet.set_name(&sheet.name)?;
        for (col, title) in sheet.headers.iter().enumerate() {
            worksheet.write_string_with_format(0, col as u16, title, &header)?;
        }
        for (r, row) in sheet.rows.iter().enumerate() {
            let row_index = (r + 1) as u32;
            for (col, cell) in row.iter().enumerate() {
                match cell {
                    Cell::Text(text) => {
                        worksheet.write_string(row_index, col as u16, text)?;
                    }
                    Cell::Number(n) => {
                        worksheet.write_number(row_index, col as u16, *n)?;
                    }
                    Cell::Empty => {}
                }
            }
        }
        worksheet.set_freeze_panes(1, 0)?;
        for (col, width) in sheet.column_widths().into_iter().enumerate() {
            worksheet.set_column_width(col as u16, width as f64)?;
        }
    }

    workbook.save_to_buffer()
}

/// Write the workbook into `dir`, creating it if needed. The file appears
/// under its final name only once fully written.
pub fn write_workbook(report: &Report, dir: &Path) -> Result<PathBuf, ReportError> {
    let io_err = |path: &Path| {
        let path = path.to_path_buf();
        move |source| ReportError::Io { path, source }
    };

    fs::create_dir_all(dir).map_err(io_err(dir))?;
    let bytes = render_workbook(report)?;

    let final_path = dir.join(report.file_name());
    let tmp_path = dir.join(format!(".{}.tmp", report.file_name()));
    fs::write(&tmp_path, &bytes).map_err(io_err(&tmp_path))?;
    if let Err(source) = fs::rename(&tmp_path, &final_path) {
        let _ = fs::remove_file(&tmp_path);
        return Err(ReportError::Io {
            path: final_path,
            source,
        });
    }

    info!(path = %final_path.display(), bytes = bytes.len(), "workbook written");
    Ok(final_path)
}

/// Plain-text summary for the console and the notification body.
pub fn render_text_summary(report: &Report) -> String {
    let mut lines = vec![
        format!("Postdoc search report, {}", report.generated_at.format("%Y-%m-%d %H:%M UTC")),
        String::new(),
        format!("Stored postings: {} ({} new)", report.total_postings, report.new_postings),
    ];
    for (region, count) in &report.by_region {
        lines.push(format!(
            "  {:<6} {:>4} ({} new)",
            region_sheet_name(*region),
            count.total,
            count.new
        ));
    }
    lines.push(format!("PI recommendations: {}", report.recommended_pis));

    let top: Vec<String> = Region::ALL
        .iter()
        .filter_map(|r| report.sheet(region_sheet_name(*r)))
        .flat_map(|s| s.rows.iter().take(if s.data_rows() == 0 { 0 } else { 3 }).map(move |row| (s, row)))
        .map(|(sheet, row)| {
            let cell = |i: usize| row.get(i).map(Cell::display).unwrap_or_default();
            format!("  [{}] {} | {} | {} | score {}", sheet.name, cell(3), cell(0), cell(2), cell(6))
        })
        .collect();
    if !top.is_empty() {
        lines.push(String::new());
        lines.push("Top postings:".to_string());
        lines.extend(top);
    }

    if let Some(summary) = report.sheet("Summary") {
        let sources: Vec<String> = summary
            .rows
            .iter()
            .filter_map(|row| match (&row[0], row.get(1)) {
                (Cell::Text(name), Some(value)) if name.starts_with("Source ") => {
                    Some(format!("  {}: {}", &name["Source ".len()..], value.display()))
                }
                _ => None,
            })
            .collect();
        if !sources.is_empty() {
            lines.push(String::new());
            lines.push("Sources:".to_string());
            lines.extend(sources);
        }
    }

    if !report.lab_pages_changed.is_empty() {
        lines.push(String::new());
        lines.push("Watched lab pages changed:".to_string());
        lines.extend(report.lab_pages_changed.iter().map(|name| format!("  {name}")));
    }

    lines.join("\n")
}
