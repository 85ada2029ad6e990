//! Common surface for measured and estimated cost reports: JSON or a boxed
//! text table, always tagged with where the numbers came from.

use std::fmt::Write as _;
use std::io::Write as _;

use colored::Colorize;
use num_format::{Locale, ToFormattedString};
use serde::{Serialize, Serializer};

use crate::error::Result;

/// Where a cost figure came from.
#[derive(Copy, Clone, Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Provenance {
    /// Summed from provider-reported per-call cost
    Measured,
    /// Derived from token counts and a price table
    Estimated,
}

impl Provenance {
    pub fn as_str(self) -> &'static str {
        match self {
            Provenance::Measured => "measured",
            Provenance::Estimated => "estimated",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReportRow {
    pub label: String,
    pub tokens: Option<i64>,
    pub cost_usd: f64,
}

pub trait CostReport: Serialize {
    fn provenance(&self) -> Provenance;
    fn title(&self) -> String;
    /// Header of the first column ("Date", "Model", ...)
    fn key_header(&self) -> &'static str;
    /// Header of the token column, if rows carry token figures
    fn tokens_header(&self) -> Option<&'static str> {
        None
    }
    fn rows(&self) -> Vec<ReportRow>;
    /// Unrounded grand total
    fn total_cost(&self) -> f64;
    fn total_tokens(&self) -> Option<i64> {
        None
    }
    fn note(&self) -> Option<String> {
        None
    }
    fn empty_message(&self) -> String {
        "No matching usage.".to_string()
    }
}

pub fn emit<R: CostReport>(report: &R, json: bool, locale: &Locale) -> Result<()> {
    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    if json {
        serde_json::to_writer_pretty(&mut out, report)?;
        writeln!(out)?;
    } else {
        out.write_all(render_text(report, locale).as_bytes())?;
    }
    Ok(())
}

pub fn render_text<R: CostReport>(report: &R, locale: &Locale) -> String {
    let mut text = String::new();
    let _ = writeln!(
        text,
        "{} {}",
        report.title().bold(),
        format!("[{}]", report.provenance().as_str()).dimmed()
    );

    let rows = report.rows();
    if rows.is_empty() {
        let _ = writeln!(text, "{}", report.empty_message());
        let _ = writeln!(text, "Total: {}", format_cost(0.0).yellow().bold());
    } else {
        let tokens_header = report.tokens_header();
        let mut headers = vec![report.key_header()];
        if let Some(h) = tokens_header {
            headers.push(h);
        }
        headers.push("Cost");

        let mut table = SimpleTable::new(headers).header_style(|s| s.cyan().bold());
        for row in &rows {
            let mut cells = vec![row.label.clone()];
            if tokens_header.is_some() {
                cells.push(format_tokens_opt(row.tokens, locale));
            }
            cells.push(format_cost(row.cost_usd));
            table.add_row(cells);
        }

        let mut footer = vec!["Total".yellow().bold().to_string()];
        if tokens_header.is_some() {
            footer.push(format_tokens_opt(report.total_tokens(), locale).yellow().to_string());
        }
        footer.push(format_cost(report.total_cost()).yellow().bold().to_string());
        table.set_footer(footer);
        text.push_str(&table.render());
    }

    if let Some(note) = report.note() {
        let _ = writeln!(text, "{note}");
    }
    text
}

/// Round to cents. Applied per value at display time only.
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

pub fn round6(value: f64) -> f64 {
    (value * 1_000_000.0).round() / 1_000_000.0
}

pub fn serialize_usd<S: Serializer>(value: &f64, serializer: S) -> std::result::Result<S::Ok, S::Error> {
    serializer.serialize_f64(round2(*value))
}

pub fn format_cost(value: f64) -> String {
    let cents = (value.abs() * 100.0).round() as u64;
    let sign = if value < 0.0 && cents > 0 { "-" } else { "" };
    format!(
        "{sign}${}.{:02}",
        (cents / 100).to_formatted_string(&Locale::en),
        cents % 100
    )
}

pub fn format_tokens(value: i64, locale: &Locale) -> String {
    value.to_formatted_string(locale)
}

fn format_tokens_opt(value: Option<i64>, locale: &Locale) -> String {
    value
        .map(|v| format_tokens(v, locale))
        .unwrap_or_else(|| "-".into())
}

/// 1234 -> "1.2k", 2_500_000 -> "2.5M", 999 -> "999". Sign is kept.
pub fn format_tokens_short(value: i64) -> String {
    let magnitude = value.unsigned_abs();
    if magnitude >= 1_000_000 {
        format!("{:.1}M", value as f64 / 1_000_000.0)
    } else if magnitude >= 1_000 {
        format!("{:.1}k", value as f64 / 1_000.0)
    } else {
        value.to_string()
    }
}

/// Simple table with box-drawing characters
struct SimpleTable {
    headers: Vec<String>,
    rows: Vec<Vec<String>>,
    header_style: Option<fn(&str) -> colored::ColoredString>,
    footer: Option<Vec<String>>,
}

impl SimpleTable {
    fn new(headers: Vec<&str>) -> Self {
        Self {
            headers: headers.into_iter().map(String::from).collect(),
            rows: Vec::new(),
            header_style: None,
            footer: None,
        }
    }

    fn header_style(mut self, f: fn(&str) -> colored::ColoredString) -> Self {
        self.header_style = Some(f);
        self
    }

    fn add_row(&mut self, row: Vec<String>) {
        self.rows.push(row);
    }

    fn set_footer(&mut self, footer: Vec<String>) {
        self.footer = Some(footer);
    }

    fn render(&self) -> String {
        let num_cols = self.headers.len();
        let mut widths: Vec<usize> = self.headers.iter().map(|h| h.chars().count()).collect();
        for row in self.rows.iter().chain(self.footer.iter()) {
            for (i, cell) in row.iter().enumerate().take(num_cols) {
                widths[i] = widths[i].max(strip_ansi(cell).chars().count());
            }
        }

        let mut out = String::new();
        border(&mut out, &widths, ('┌', '┬', '┐'));

        out.push('│');
        for (i, header) in self.headers.iter().enumerate() {
            let padded = format!("{:width$}", header, width = widths[i]);
            match self.header_style {
                Some(style) => {
                    let _ = write!(out, " {} │", style(&padded));
                }
                None => {
                    let _ = write!(out, " {padded} │");
                }
            }
        }
        out.push('\n');
        border(&mut out, &widths, ('├', '┼', '┤'));

        for row in &self.rows {
            cells(&mut out, &widths, row);
        }
        if let Some(footer) = &self.footer {
            border(&mut out, &widths, ('├', '┼', '┤'));
            cells(&mut out, &widths, footer);
        }
        border(&mut out, &widths, ('└', '┴', '┘'));
        out
    }
}

fn border(out: &mut String, widths: &[usize], (left, mid, right): (char, char, char)) {
    out.push(left);
    for (i, w) in widths.iter().enumerate() {
        out.push_str(&"─".repeat(*w + 2));
        out.push(if i + 1 < widths.len() { mid } else { right });
    }
    out.push('\n');
}

fn cells(out: &mut String, widths: &[usize], row: &[String]) {
    out.push('│');
    for (i, cell) in row.iter().enumerate().take(widths.len()) {
        let pad = widths[i].saturating_sub(strip_ansi(cell).chars().count());
        // Right-align everything but the key column
        if i == 0 {
            let _ = write!(out, " {}{} │", cell, " ".repeat(pad));
        } else {
            let _ = write!(out, " {}{} │", " ".repeat(pad), cell);
        }
    }
    out.push('\n');
}

fn strip_ansi(s: &str) -> String {
    let mut result = String::new();
    let mut in_escape = false;
    for c in s.chars() {
        if c == '\x1b' {
            in_escape = true;
        } else if in_escape {
            if c == 'm' {
                in_escape = false;
            }
        } else {
            result.push(c);
        }
    }
    result
}
