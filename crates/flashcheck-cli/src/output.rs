//! Output formatting for flashcheck (table, json, csv)

use std::io::Write;
use std::path::{Path, PathBuf};

use clap::ValueEnum;
use colored::Colorize;
use flashcheck_core::{CollaboratorError, ReportRow, ReportSink, VerificationReport, VersionMarker};
use serde::Serialize;
use tabled::{Table, Tabled};

/// Output format options
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum OutputFormat {
    /// ASCII table format (default)
    #[default]
    Table,
    /// JSON format
    Json,
    /// CSV format
    Csv,
}

impl OutputFormat {
    /// Pick the format of a report file from its extension
    pub fn for_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("json") => Self::Json,
            Some(ext) if ext.eq_ignore_ascii_case("csv") => Self::Csv,
            _ => Self::Table,
        }
    }
}

/// Context for output rendering
pub struct OutputContext {
    pub format: OutputFormat,
    pub quiet: bool,
}

impl OutputContext {
    pub fn new(format: OutputFormat, no_color: bool, quiet: bool) -> Self {
        if no_color {
            colored::control::set_override(false);
        }
        Self { format, quiet }
    }

    /// Print an info message (unless in quiet mode)
    pub fn info(&self, msg: &str) {
        if !self.quiet {
            eprintln!("{}", msg);
        }
    }

    /// Print an error message
    pub fn error(&self, msg: &str) {
        eprintln!("{}", msg.red());
    }

    /// Print the pass/fail summary (unless in quiet mode)
    pub fn summary(&self, report: &VerificationReport) {
        if self.quiet {
            return;
        }
        let failures = report.failures().count();
        if report.passed() {
            eprintln!(
                "{} {} message(s) within cycle time",
                "PASSED".green().bold(),
                report.len()
            );
        } else {
            eprintln!(
                "{} {} of {} message(s) missing or too slow",
                "FAILED".red().bold(),
                failures,
                report.len()
            );
        }
    }

    /// Print version markers in the configured format
    pub fn print_versions(&self, versions: &[VersionMarker]) {
        let rows: Vec<VersionRow> = versions.iter().map(VersionRow::from).collect();
        match self.format {
            OutputFormat::Table => {
                if rows.is_empty() {
                    self.info("No version markers configured");
                } else {
                    println!("{}", Table::new(&rows));
                }
            }
            OutputFormat::Json => {
                println!(
                    "{}",
                    serde_json::to_string_pretty(versions).unwrap_or_else(|_| "[]".to_string())
                );
            }
            OutputFormat::Csv => {
                println!("label,symbol,address,value");
                for row in &rows {
                    println!(
                        "{},{},{},{}",
                        escape_csv(&row.label),
                        escape_csv(&row.symbol),
                        row.address,
                        row.value
                    );
                }
            }
        }
    }
}

// =============================================================================
// Report rendering
// =============================================================================

/// Report row display for the verify and analyze commands
#[derive(Debug, Tabled, Serialize)]
pub struct ReportTableRow {
    #[tabled(rename = "Channel")]
    pub channel: u8,
    #[tabled(rename = "Identifier")]
    pub identifier: String,
    #[tabled(rename = "Expected (ms)")]
    pub expected_cycle_ms: u32,
    #[tabled(rename = "Observed (ms)")]
    pub observed_cycle_ms: String,
    #[tabled(rename = "Received")]
    pub received: String,
    #[tabled(rename = "Result")]
    pub result: String,
    #[tabled(rename = "Note")]
    pub note: String,
}

impl From<ReportRow> for ReportTableRow {
    fn from(row: ReportRow) -> Self {
        Self {
            channel: row.channel,
            identifier: row.identifier,
            expected_cycle_ms: row.expected_cycle_ms,
            observed_cycle_ms: row.observed_cycle_ms,
            received: if row.received { "yes" } else { "no" }.to_string(),
            result: row.result,
            note: row.note,
        }
    }
}

/// Version marker display
#[derive(Debug, Tabled, Serialize)]
pub struct VersionRow {
    #[tabled(rename = "Marker")]
    pub label: String,
    #[tabled(rename = "Symbol")]
    pub symbol: String,
    #[tabled(rename = "Address")]
    pub address: String,
    #[tabled(rename = "Value")]
    pub value: String,
}

impl From<&VersionMarker> for VersionRow {
    fn from(marker: &VersionMarker) -> Self {
        Self {
            label: marker.label.clone(),
            symbol: marker.symbol.clone(),
            address: marker
                .address
                .map(|a| format!("0x{:08X}", a))
                .unwrap_or_else(|| "N/A".to_string()),
            value: marker
                .value
                .as_ref()
                .map(hex::encode_upper)
                .unwrap_or_else(|| "N/A".to_string()),
        }
    }
}

const CSV_HEADER: &str =
    "Channel,Identifier,ExpectedCycleMs,ObservedCycleMs,Received,Result,Note";

/// Render a report in `format`
pub fn render_report(report: &VerificationReport, format: OutputFormat) -> String {
    match format {
        OutputFormat::Table => render_table(report),
        OutputFormat::Json => render_json(report),
        OutputFormat::Csv => render_csv(report),
    }
}

fn render_table(report: &VerificationReport) -> String {
    let mut out = format!("Run {}\n", report.run_id());

    if !report.versions().is_empty() {
        let versions: Vec<VersionRow> = report.versions().iter().map(VersionRow::from).collect();
        out.push_str(&Table::new(&versions).to_string());
        out.push('\n');
    }

    if report.is_empty() {
        out.push_str("No expected messages\n");
    } else {
        let rows: Vec<ReportTableRow> = report.rows().into_iter().map(ReportTableRow::from).collect();
        out.push_str(&Table::new(&rows).to_string());
        out.push('\n');
    }
    out
}

fn render_json(report: &VerificationReport) -> String {
    let value = serde_json::json!({
        "run_id": report.run_id(),
        "passed": report.passed(),
        "versions": report.versions(),
        "entries": report.rows(),
    });
    serde_json::to_string_pretty(&value).unwrap_or_else(|_| "{}".to_string())
}

fn render_csv(report: &VerificationReport) -> String {
    let mut out = String::from(CSV_HEADER);
    out.push('\n');
    for row in report.rows() {
        let fields = [
            row.channel.to_string(),
            row.identifier,
            row.expected_cycle_ms.to_string(),
            row.observed_cycle_ms,
            row.received.to_string(),
            row.result,
            row.note,
        ];
        let escaped: Vec<String> = fields.iter().map(|f| escape_csv(f)).collect();
        out.push_str(&escaped.join(","));
        out.push('\n');
    }
    out
}

/// Escape a value for CSV output
fn escape_csv(value: &str) -> String {
    if value.contains(',') || value.contains('"') || value.contains('\n') {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

// =============================================================================
// Report sinks
// =============================================================================

/// Writes the rendered report to a stream (stdout in practice)
pub struct WriterSink<W: Write> {
    format: OutputFormat,
    out: W,
}

impl<W: Write> WriterSink<W> {
    pub fn new(format: OutputFormat, out: W) -> Self {
        Self { format, out }
    }
}

impl<W: Write> ReportSink for WriterSink<W> {
    fn emit(&mut self, report: &VerificationReport) -> Result<(), CollaboratorError> {
        self.out
            .write_all(render_report(report, self.format).as_bytes())
            .and_then(|()| self.out.flush())
            .map_err(|e| CollaboratorError::Emit(e.to_string()))
    }
}

/// Persists the report to a file, format chosen by extension
pub struct FileSink {
    path: PathBuf,
}

impl FileSink {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

impl ReportSink for FileSink {
    fn emit(&mut self, report: &VerificationReport) -> Result<(), CollaboratorError> {
        let io_err = |source| CollaboratorError::Io {
            path: self.path.display().to_string(),
            source,
        };

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        let rendered = render_report(report, OutputFormat::for_path(&self.path));
        std::fs::write(&self.path, rendered).map_err(io_err)?;

        tracing::info!(path = %self.path.display(), "Report written");
        Ok(())
    }
}

/// Fans one report out to several sinks
#[derive(Default)]
pub struct Sinks(Vec<Box<dyn ReportSink>>);

impl Sinks {
    pub fn push(&mut self, sink: Box<dyn ReportSink>) {
        self.0.push(sink);
    }
}

impl ReportSink for Sinks {
    fn emit(&mut self, report: &VerificationReport) -> Result<(), CollaboratorError> {
        for sink in &mut self.0 {
            sink.emit(report)?;
        }
        Ok(())
    }
}
