//! Daily token snapshots built from an externally supplied session listing.
//!
//! A snapshot records each session's *cumulative* context size at the moment
//! it was taken. Counts shrink when a session is compacted, so two snapshots
//! only bound usage loosely; see `estimate`.

use std::collections::BTreeMap;
use std::io::{IsTerminal, Read};
use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::error::{CostError, Result};
use crate::extract::model_bucket;
use crate::pricing::PriceTable;
use crate::report::round6;

/// One entry of the session listing payload.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SessionDescriptor {
    pub key: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub total_tokens: Option<u64>,
    #[serde(default)]
    pub channel: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SessionEntry {
    pub model: String,
    pub total_tokens: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Summary {
    #[serde(default)]
    pub total_tokens: u64,
    #[serde(default)]
    pub by_model: BTreeMap<String, u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EstimatedCost {
    pub total: f64,
    #[serde(default)]
    pub by_model: BTreeMap<String, f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub date: NaiveDate,
    pub generated_at: DateTime<Utc>,
    #[serde(default)]
    pub sessions: BTreeMap<String, SessionEntry>,
    #[serde(default)]
    pub summary: Summary,
    /// Advisory only: cumulative tokens priced with the fixed-mix formula
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_cost: Option<EstimatedCost>,
}

/// Read the listing from `input`, or from stdin when it is not a terminal.
pub fn read_payload(input: Option<&Path>) -> Result<String> {
    if let Some(path) = input {
        debug!(path = %path.display(), "reading session listing");
        return Ok(std::fs::read_to_string(path)?);
    }
    let stdin = std::io::stdin();
    if stdin.is_terminal() {
        return Err(CostError::NoInput);
    }
    let mut raw = String::new();
    stdin.lock().read_to_string(&mut raw)?;
    Ok(raw)
}

/// Accepts a bare array of sessions or an object with a `sessions` array.
pub fn parse_listing(raw: &str) -> Result<Vec<SessionDescriptor>> {
    if raw.trim().is_empty() {
        return Err(CostError::EmptyPayload);
    }
    let value: Value = serde_json::from_str(raw).map_err(CostError::MalformedPayload)?;
    let sessions = match value {
        Value::Array(_) => value,
        Value::Object(mut obj) => match obj.remove("sessions") {
            Some(sessions @ Value::Array(_)) => sessions,
            _ => {
                return Err(CostError::MalformedPayload(serde::de::Error::custom(
                    "expected an object with a `sessions` array",
                )));
            }
        },
        _ => {
            return Err(CostError::MalformedPayload(serde::de::Error::custom(
                "expected a JSON array of sessions",
            )));
        }
    };
    serde_json::from_value(sessions).map_err(CostError::MalformedPayload)
}

/// Token totals above this cannot be compared as signed deltas.
const MAX_TOKENS: u64 = i64::MAX as u64;

pub fn build_snapshot(
    sessions: &[SessionDescriptor],
    date: NaiveDate,
    now: DateTime<Utc>,
    prices: &PriceTable,
) -> Result<Snapshot> {
    let mut entries = BTreeMap::new();
    for s in sessions {
        let entry = SessionEntry {
            model: model_bucket(s.model.as_deref()),
            total_tokens: s.total_tokens.unwrap_or(0),
            channel: s.channel.clone(),
        };
        if entries.insert(s.key.clone(), entry).is_some() {
            warn!(key = %s.key, "duplicate session key in listing, keeping the last one");
        }
    }

    let mut by_model: BTreeMap<String, u64> = BTreeMap::new();
    let mut total_tokens = 0u64;
    for (key, entry) in &entries {
        let slot = by_model.entry(entry.model.clone()).or_insert(0);
        *slot = add_tokens(*slot, entry.total_tokens, key)?;
        total_tokens = add_tokens(total_tokens, entry.total_tokens, key)?;
    }
    let summary = Summary {
        total_tokens,
        by_model,
    };

    Ok(Snapshot {
        date,
        generated_at: now,
        sessions: entries,
        estimated_cost: Some(estimate_cumulative(&summary, prices)),
        summary,
    })
}

fn add_tokens(acc: u64, tokens: u64, key: &str) -> Result<u64> {
    acc.checked_add(tokens)
        .filter(|sum| *sum <= MAX_TOKENS)
        .ok_or_else(|| {
            CostError::MalformedPayload(serde::de::Error::custom(format!(
                "token count for session '{key}' is out of range ({tokens})"
            )))
        })
}

pub fn estimate_cumulative(summary: &Summary, prices: &PriceTable) -> EstimatedCost {
    let by_model: BTreeMap<String, f64> = summary
        .by_model
        .iter()
        .map(|(model, tokens)| (model.clone(), prices.estimate(model, *tokens)))
        .collect();
    EstimatedCost {
        total: round6(by_model.values().sum()),
        by_model: by_model.into_iter().map(|(m, c)| (m, round6(c))).collect(),
    }
}

pub fn snapshot_path(dir: &Path, date: NaiveDate) -> PathBuf {
    dir.join(format!("{}.json", date.format("%Y-%m-%d")))
}

/// Replace the snapshot for `snapshot.date`, creating `dir` if needed.
pub fn write_snapshot(dir: &Path, snapshot: &Snapshot) -> Result<PathBuf> {
    std::fs::create_dir_all(dir)?;
    let path = snapshot_path(dir, snapshot.date);
    let tmp = path.with_extension("json.tmp");
    let contents = serde_json::to_string_pretty(snapshot)?;
    let written = std::fs::write(&tmp, contents + "\n").and_then(|()| std::fs::rename(&tmp, &path));
    if let Err(e) = written {
        let _ = std::fs::remove_file(&tmp);
        return Err(e.into());
    }
    info!(
        path = %path.display(),
        sessions = snapshot.sessions.len(),
        tokens = snapshot.summary.total_tokens,
        "snapshot written"
    );
    Ok(path)
}

/// `Ok(None)` when no snapshot exists for `date`.
pub fn load_snapshot(dir: &Path, date: NaiveDate) -> Result<Option<Snapshot>> {
    let path = snapshot_path(dir, date);
    let contents = match std::fs::read_to_string(&path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "no snapshot");
            return Ok(None);
        }
        Err(e) => return Err(e.into()),
    };
    let snapshot = serde_json::from_str(&contents)
        .map_err(|source| CostError::SnapshotCorrupt { path, source })?;
    Ok(Some(snapshot))
}
