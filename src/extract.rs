//! Measured cost: per-call usage records from session logs, grouped by day
//! or by model.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use chrono::{
    DateTime, Datelike, Duration as ChronoDuration, FixedOffset, NaiveDate, NaiveDateTime, Utc,
};
use chrono_tz::Tz;
use clap::ValueEnum;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use tracing::{debug, trace, warn};
use walkdir::WalkDir;

use crate::error::{CostError, Result};
use crate::report::{CostReport, Provenance, ReportRow, serialize_usd};

pub const UNKNOWN_MODEL: &str = "unknown";
pub const REPORTED_UNKNOWN_MODEL: &str = "unknown (reported)";

#[derive(Copy, Clone, Debug, ValueEnum, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum WeekStart {
    Sunday,
    #[default]
    Monday,
}

#[derive(Copy, Clone, Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum GroupBy {
    Date,
    Model,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DateFilter {
    All,
    Day(NaiveDate),
    /// Inclusive lower bound, no upper bound
    Since(NaiveDate),
    Month { year: i32, month: u32 },
}

impl DateFilter {
    pub fn matches(&self, date: NaiveDate) -> bool {
        match self {
            DateFilter::All => true,
            DateFilter::Day(d) => date == *d,
            DateFilter::Since(start) => date >= *start,
            DateFilter::Month { year, month } => date.year() == *year && date.month() == *month,
        }
    }

    pub fn describe(&self) -> String {
        match self {
            DateFilter::All => "all".to_string(),
            DateFilter::Day(d) => d.format("%Y-%m-%d").to_string(),
            DateFilter::Since(d) => format!("since {}", d.format("%Y-%m-%d")),
            DateFilter::Month { year, month } => format!("{year:04}-{month:02}"),
        }
    }

    pub fn this_week(today: NaiveDate, start: WeekStart) -> Self {
        DateFilter::Since(week_start_for_date(today, start))
    }

    pub fn this_month(today: NaiveDate) -> Self {
        DateFilter::Month {
            year: today.year(),
            month: today.month(),
        }
    }
}

pub fn week_start_for_date(date: NaiveDate, start: WeekStart) -> NaiveDate {
    let weekday = date.weekday().num_days_from_sunday() as i64;
    let start_day = match start {
        WeekStart::Sunday => 0,
        WeekStart::Monday => 1,
    } as i64;
    let diff = (7 + weekday - start_day) % 7;
    date - ChronoDuration::days(diff)
}

pub fn parse_date(raw: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d").map_err(|_| {
        CostError::InvalidArgument(format!("could not parse date '{raw}', expected YYYY-MM-DD"))
    })
}

pub fn parse_month(raw: &str) -> Result<DateFilter> {
    let bad = || CostError::InvalidArgument(format!("could not parse month '{raw}', expected YYYY-MM"));
    let (y, m) = raw.trim().split_once('-').ok_or_else(bad)?;
    if y.len() != 4 || m.len() != 2 {
        return Err(bad());
    }
    let year: i32 = y.parse().map_err(|_| bad())?;
    let month: u32 = m.parse().map_err(|_| bad())?;
    if !(1..=12).contains(&month) {
        return Err(bad());
    }
    Ok(DateFilter::Month { year, month })
}

#[derive(Debug, Deserialize)]
struct RawRecord {
    #[serde(default)]
    timestamp: Option<Value>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    message: Option<RawMessage>,
    #[serde(default)]
    usage: Option<RawUsage>,
}

#[derive(Debug, Deserialize)]
struct RawMessage {
    #[serde(default)]
    timestamp: Option<Value>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    usage: Option<RawUsage>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawUsage {
    #[serde(default, deserialize_with = "lenient_u64")]
    input: u64,
    #[serde(default, deserialize_with = "lenient_u64")]
    output: u64,
    #[serde(default, deserialize_with = "lenient_u64")]
    cache_read: u64,
    #[serde(default, deserialize_with = "lenient_u64")]
    cache_write: u64,
    #[serde(default, deserialize_with = "lenient_u64")]
    total_tokens: u64,
    #[serde(default)]
    cost: Option<RawCost>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawCost {
    #[serde(default)]
    input: Option<f64>,
    #[serde(default)]
    output: Option<f64>,
    #[serde(default)]
    cache_read: Option<f64>,
    #[serde(default)]
    cache_write: Option<f64>,
    total: Option<f64>,
}

/// Token counts are informational; anything that is not a non-negative
/// integer reads as zero instead of rejecting the record.
fn lenient_u64<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<u64, D::Error> {
    Ok(Value::deserialize(deserializer)?.as_u64().unwrap_or(0))
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenCounts {
    pub input: u64,
    pub output: u64,
    pub cache_read: u64,
    pub cache_write: u64,
    pub total: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CostBreakdown {
    pub input: f64,
    pub output: f64,
    pub cache_read: f64,
    pub cache_write: f64,
    pub total: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UsageRecord {
    pub timestamp: DateTime<FixedOffset>,
    pub date: NaiveDate,
    pub model: Option<String>,
    pub tokens: TokenCounts,
    pub cost: CostBreakdown,
}

impl UsageRecord {
    pub fn model_key(&self) -> String {
        model_bucket(self.model.as_deref())
    }
}

/// Grouping key for a reported model id. Missing or blank ids go to
/// `UNKNOWN_MODEL`; a provider that literally reports that id is kept apart
/// under `REPORTED_UNKNOWN_MODEL`.
pub fn model_bucket(model: Option<&str>) -> String {
    match model.map(str::trim).filter(|m| !m.is_empty()) {
        None => UNKNOWN_MODEL.to_string(),
        Some(m) if m == UNKNOWN_MODEL => REPORTED_UNKNOWN_MODEL.to_string(),
        Some(m) => m.to_string(),
    }
}

#[derive(Debug, PartialEq)]
pub enum LineOutcome {
    Record(UsageRecord),
    /// Valid line that does not describe a priced API call
    NotUsage,
    /// Priced call we cannot trust: bad timestamp or a negative/non-finite cost
    Excluded(&'static str),
    Malformed(String),
}

pub fn parse_line(line: &str, tz: Option<&Tz>) -> LineOutcome {
    let raw: RawRecord = match serde_json::from_str(line) {
        Ok(r) => r,
        Err(e) => return LineOutcome::Malformed(e.to_string()),
    };
    let RawRecord {
        timestamp,
        model,
        message,
        usage,
    } = raw;
    let (msg_timestamp, msg_model, msg_usage) = match message {
        Some(m) => (m.timestamp, m.model, m.usage),
        None => (None, None, None),
    };

    let Some(usage) = msg_usage.or(usage) else {
        return LineOutcome::NotUsage;
    };
    let Some(cost) = usage.cost else {
        return LineOutcome::NotUsage;
    };
    let Some(total) = cost.total else {
        return LineOutcome::Malformed("cost object without total".to_string());
    };
    if !total.is_finite() || total < 0.0 {
        return LineOutcome::Excluded("negative or non-finite cost");
    }

    let Some(ts) = [timestamp, msg_timestamp]
        .iter()
        .flatten()
        .filter_map(Value::as_str)
        .find_map(parse_timestamp)
    else {
        return LineOutcome::Excluded("unrecognised timestamp");
    };
    let date = match tz {
        Some(tz) => ts.with_timezone(tz).date_naive(),
        None => ts.date_naive(),
    };

    LineOutcome::Record(UsageRecord {
        timestamp: ts,
        date,
        model: msg_model.or(model),
        tokens: TokenCounts {
            input: usage.input,
            output: usage.output,
            cache_read: usage.cache_read,
            cache_write: usage.cache_write,
            total: usage.total_tokens,
        },
        cost: CostBreakdown {
            input: cost.input.unwrap_or(0.0),
            output: cost.output.unwrap_or(0.0),
            cache_read: cost.cache_read.unwrap_or(0.0),
            cache_write: cost.cache_write.unwrap_or(0.0),
            total,
        },
    })
}

/// RFC 3339, or a bare ISO 8601 date-time read as UTC.
pub fn parse_timestamp(ts: &str) -> Option<DateTime<FixedOffset>> {
    let ts = ts.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(ts) {
        return Some(dt);
    }
    NaiveDateTime::parse_from_str(ts, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc().fixed_offset())
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanStats {
    pub files: u64,
    pub records: u64,
    pub malformed: u64,
    pub excluded: u64,
}

#[derive(Debug, Default)]
pub struct Scan {
    pub records: Vec<UsageRecord>,
    pub stats: ScanStats,
}

pub fn collect_jsonl_files(dir: &Path) -> Result<Vec<PathBuf>> {
    if !dir.is_dir() {
        return Err(CostError::SessionsDirMissing(dir.to_path_buf()));
    }
    std::fs::read_dir(dir).map_err(|source| CostError::SessionsDirUnreadable {
        path: dir.to_path_buf(),
        source,
    })?;

    let mut files = Vec::new();
    for entry in WalkDir::new(dir).follow_links(true) {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                warn!(error = %e, "skipping unreadable entry");
                continue;
            }
        };
        if entry.file_type().is_file()
            && entry.path().extension().and_then(|e| e.to_str()) == Some("jsonl")
        {
            files.push(entry.into_path());
        }
    }
    files.sort();
    Ok(files)
}

pub fn scan_sessions(dir: &Path, tz: Option<&Tz>) -> Result<Scan> {
    let files = collect_jsonl_files(dir)?;
    debug!(dir = %dir.display(), files = files.len(), "scanning session logs");

    let mut scan = Scan::default();
    for file in &files {
        let fh = match File::open(file) {
            Ok(f) => f,
            Err(e) => {
                warn!(file = %file.display(), error = %e, "skipping unreadable log");
                continue;
            }
        };
        scan.stats.files += 1;
        scan_reader(BufReader::new(fh), file, tz, &mut scan);
    }
    debug!(
        records = scan.stats.records,
        malformed = scan.stats.malformed,
        excluded = scan.stats.excluded,
        "scan complete"
    );
    Ok(scan)
}

fn scan_reader<R: BufRead>(reader: R, file: &Path, tz: Option<&Tz>, scan: &mut Scan) {
    for (idx, line) in reader.lines().enumerate() {
        let line_number = idx + 1;
        let line = match line {
            Ok(l) => l,
            Err(e) => {
                trace!(file = %file.display(), line = line_number, error = %e, "failed to read line");
                scan.stats.malformed += 1;
                continue;
            }
        };
        // Fast pre-filter: only priced calls carry a cost object
        if !line.contains("\"cost\"") {
            continue;
        }
        match parse_line(&line, tz) {
            LineOutcome::Record(record) => {
                trace!(
                    file = %file.display(),
                    line = line_number,
                    timestamp = %record.timestamp,
                    cost = record.cost.total,
                    "usage record"
                );
                scan.stats.records += 1;
                scan.records.push(record);
            }
            LineOutcome::NotUsage => {}
            LineOutcome::Excluded(reason) => {
                debug!(file = %file.display(), line = line_number, reason, "excluded usage record");
                scan.stats.excluded += 1;
            }
            LineOutcome::Malformed(error) => {
                debug!(file = %file.display(), line = line_number, %error, "skipping malformed line");
                scan.stats.malformed += 1;
            }
        }
    }
}

#[derive(Debug, Serialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CostRow {
    pub key: String,
    #[serde(serialize_with = "serialize_usd")]
    pub cost_usd: f64,
    pub records: u64,
    pub total_tokens: u64,
}

#[derive(Default)]
struct RowAccumulator {
    cost_usd: f64,
    records: u64,
    total_tokens: u64,
}

impl RowAccumulator {
    fn add(&mut self, record: &UsageRecord) {
        self.cost_usd += record.cost.total;
        self.records += 1;
        self.total_tokens += record.tokens.total;
    }

    fn finish(self, key: String) -> CostRow {
        CostRow {
            key,
            cost_usd: self.cost_usd,
            records: self.records,
            total_tokens: self.total_tokens,
        }
    }
}

/// Date → summed cost for records passing `filter`, ascending by date.
pub fn group_by_date(records: &[UsageRecord], filter: &DateFilter) -> Vec<CostRow> {
    let mut map: BTreeMap<NaiveDate, RowAccumulator> = BTreeMap::new();
    for record in records.iter().filter(|r| filter.matches(r.date)) {
        map.entry(record.date).or_default().add(record);
    }
    map.into_iter()
        .map(|(date, acc)| acc.finish(date.format("%Y-%m-%d").to_string()))
        .collect()
}

/// Model → summed cost over every record, most expensive first.
pub fn group_by_model(records: &[UsageRecord]) -> Vec<CostRow> {
    let mut map: BTreeMap<String, RowAccumulator> = BTreeMap::new();
    for record in records {
        map.entry(record.model_key())
            .or_default()
            .add(record);
    }
    let mut rows: Vec<CostRow> = map.into_iter().map(|(model, acc)| acc.finish(model)).collect();
    rows.sort_by(|a, b| b.cost_usd.total_cmp(&a.cost_usd).then_with(|| a.key.cmp(&b.key)));
    rows
}

#[derive(Debug, Serialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CostTotal {
    #[serde(serialize_with = "serialize_usd")]
    pub cost_usd: f64,
    pub records: u64,
    pub total_tokens: u64,
}

fn total_of(rows: &[CostRow]) -> CostTotal {
    CostTotal {
        cost_usd: rows.iter().map(|r| r.cost_usd).sum(),
        records: rows.iter().map(|r| r.records).sum(),
        total_tokens: rows.iter().map(|r| r.total_tokens).sum(),
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MeasuredReport {
    pub generated_at: String,
    pub sessions_dir: String,
    pub provenance: Provenance,
    pub group_by: GroupBy,
    pub filter: String,
    pub rows: Vec<CostRow>,
    pub total: CostTotal,
    pub scan: ScanStats,
}

/// By-model grouping always covers every record; `filter` applies to date
/// grouping only.
pub fn build_report(
    scan: &Scan,
    sessions_dir: &Path,
    filter: &DateFilter,
    group_by: GroupBy,
    now: DateTime<Utc>,
) -> MeasuredReport {
    let (rows, filter_desc) = match group_by {
        GroupBy::Date => (group_by_date(&scan.records, filter), filter.describe()),
        GroupBy::Model => (group_by_model(&scan.records), DateFilter::All.describe()),
    };
    let total = total_of(&rows);
    MeasuredReport {
        generated_at: now.to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
        sessions_dir: sessions_dir.display().to_string(),
        provenance: Provenance::Measured,
        group_by,
        filter: filter_desc,
        rows,
        total,
        scan: scan.stats,
    }
}

impl CostReport for MeasuredReport {
    fn provenance(&self) -> Provenance {
        Provenance::Measured
    }

    fn title(&self) -> String {
        match self.group_by {
            GroupBy::Date => format!("Cost by date ({})", self.filter),
            GroupBy::Model => "Cost by model (all dates)".to_string(),
        }
    }

    fn key_header(&self) -> &'static str {
        match self.group_by {
            GroupBy::Date => "Date",
            GroupBy::Model => "Model",
        }
    }

    fn tokens_header(&self) -> Option<&'static str> {
        Some("Tokens")
    }

    fn rows(&self) -> Vec<ReportRow> {
        self.rows
            .iter()
            .map(|r| ReportRow {
                label: r.key.clone(),
                tokens: Some(r.total_tokens as i64),
                cost_usd: r.cost_usd,
            })
            .collect()
    }

    fn total_cost(&self) -> f64 {
        self.total.cost_usd
    }

    fn total_tokens(&self) -> Option<i64> {
        Some(self.total.total_tokens as i64)
    }

    fn note(&self) -> Option<String> {
        let skipped = self.scan.malformed + self.scan.excluded;
        (skipped > 0).then(|| format!("Skipped {skipped} unparseable usage line(s)."))
    }

    fn empty_message(&self) -> String {
        format!("No usage records in {}.", self.sessions_dir)
    }
}
