//! Estimated daily cost from two consecutive snapshots.
//!
//! Snapshot counts are cumulative and reset on compaction, so a model whose
//! count went down contributes no cost at all. A shrink is never a refund.

use std::collections::BTreeMap;
use std::path::Path;

use chrono::{Duration as ChronoDuration, NaiveDate};
use serde::Serialize;
use tracing::{debug, info};

use crate::error::{CostError, Result};
use crate::pricing::PriceTable;
use crate::report::{
    CostReport, Provenance, ReportRow, format_cost, format_tokens_short, serialize_usd,
};
use crate::snapshot::{Snapshot, estimate_cumulative, load_snapshot};

#[derive(Copy, Clone, Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EstimateMode {
    Delta,
    Cumulative,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TokenFigures {
    pub today: u64,
    pub previous: Option<u64>,
    pub delta: Option<i64>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ModelEstimate {
    #[serde(flatten)]
    pub tokens: TokenFigures,
    #[serde(serialize_with = "serialize_usd")]
    pub estimated_usd: f64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CostFigures {
    #[serde(serialize_with = "serialize_usd")]
    pub estimated_usd: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EstimateReport {
    pub date: NaiveDate,
    pub comparison_date: Option<NaiveDate>,
    pub mode: EstimateMode,
    pub cumulative: bool,
    pub provenance: Provenance,
    pub tokens: TokenFigures,
    pub cost: CostFigures,
    pub models: BTreeMap<String, ModelEstimate>,
    pub summary: String,
}

/// Load the target day's snapshot and the day before, then estimate.
pub fn run_estimate(dir: &Path, date: NaiveDate, prices: &PriceTable) -> Result<EstimateReport> {
    let today = load_snapshot(dir, date)?.ok_or_else(|| CostError::SnapshotMissing {
        date,
        dir: dir.to_path_buf(),
    })?;
    let previous_date = date - ChronoDuration::days(1);
    let previous = load_snapshot(dir, previous_date)?;
    if previous.is_none() {
        info!(%previous_date, "no previous snapshot, reporting cumulative totals");
    }
    Ok(estimate(&today, previous.as_ref(), prices))
}

pub fn estimate(today: &Snapshot, previous: Option<&Snapshot>, prices: &PriceTable) -> EstimateReport {
    match previous {
        Some(prev) => estimate_delta(today, prev, prices),
        None => estimate_cumulative_report(today, prices),
    }
}

fn estimate_delta(today: &Snapshot, previous: &Snapshot, prices: &PriceTable) -> EstimateReport {
    let mut models = BTreeMap::new();
    let mut today_total = 0u64;
    let mut previous_total = 0u64;
    let mut delta_total = 0i64;
    let mut cost_total = 0.0;

    for (model, &now) in &today.summary.by_model {
        let before = previous.summary.by_model.get(model).copied().unwrap_or(0);
        let delta = signed_delta(now, before);
        let cost = if delta > 0 {
            prices.estimate(model, delta.unsigned_abs())
        } else {
            if delta < 0 {
                debug!(%model, now, before, "token count shrank, likely compaction; no cost");
            }
            0.0
        };

        today_total = today_total.saturating_add(now);
        previous_total = previous_total.saturating_add(before);
        delta_total = delta_total.saturating_add(delta);
        cost_total += cost;
        models.insert(
            model.clone(),
            ModelEstimate {
                tokens: TokenFigures {
                    today: now,
                    previous: Some(before),
                    delta: Some(delta),
                },
                estimated_usd: cost,
            },
        );
    }

    let summary = format!(
        "{} tokens, ~{} estimated",
        format_tokens_short(delta_total),
        format_cost(cost_total)
    );
    EstimateReport {
        date: today.date,
        comparison_date: Some(previous.date),
        mode: EstimateMode::Delta,
        cumulative: false,
        provenance: Provenance::Estimated,
        tokens: TokenFigures {
            today: today_total,
            previous: Some(previous_total),
            delta: Some(delta_total),
        },
        cost: CostFigures {
            estimated_usd: cost_total,
        },
        models,
        summary,
    }
}

fn estimate_cumulative_report(today: &Snapshot, prices: &PriceTable) -> EstimateReport {
    let fresh = estimate_cumulative(&today.summary, prices);
    let stored = today.estimated_cost.as_ref();
    let total_cost = stored.map(|c| c.total).unwrap_or(fresh.total);

    let models: BTreeMap<String, ModelEstimate> = today
        .summary
        .by_model
        .iter()
        .map(|(model, &tokens)| {
            let cost = stored
                .and_then(|c| c.by_model.get(model))
                .or_else(|| fresh.by_model.get(model))
                .copied()
                .unwrap_or(0.0);
            (
                model.clone(),
                ModelEstimate {
                    tokens: TokenFigures {
                        today: tokens,
                        previous: None,
                        delta: None,
                    },
                    estimated_usd: cost,
                },
            )
        })
        .collect();
    let today_total = today
        .summary
        .by_model
        .values()
        .fold(0u64, |acc, n| acc.saturating_add(*n));

    let summary = format!(
        "{} tokens cumulative, ~{} estimated (no snapshot for {} to compare)",
        format_tokens_short(clamp_i64(today_total)),
        format_cost(total_cost),
        today.date - ChronoDuration::days(1)
    );
    EstimateReport {
        date: today.date,
        comparison_date: None,
        mode: EstimateMode::Cumulative,
        cumulative: true,
        provenance: Provenance::Estimated,
        tokens: TokenFigures {
            today: today_total,
            previous: None,
            delta: None,
        },
        cost: CostFigures {
            estimated_usd: total_cost,
        },
        models,
        summary,
    }
}

/// `now - before` without wrapping; stored counts are unsigned and may be
/// hand-edited.
fn signed_delta(now: u64, before: u64) -> i64 {
    let delta = i128::from(now) - i128::from(before);
    i64::try_from(delta).unwrap_or(if delta > 0 { i64::MAX } else { i64::MIN })
}

fn clamp_i64(n: u64) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

impl CostReport for EstimateReport {
    fn provenance(&self) -> Provenance {
        Provenance::Estimated
    }

    fn title(&self) -> String {
        match self.comparison_date {
            Some(prev) => format!("Estimated daily cost for {} (vs {})", self.date, prev),
            None => format!("Cumulative estimate as of {}", self.date),
        }
    }

    fn key_header(&self) -> &'static str {
        "Model"
    }

    fn tokens_header(&self) -> Option<&'static str> {
        Some(if self.cumulative { "Tokens" } else { "Delta" })
    }

    fn rows(&self) -> Vec<ReportRow> {
        self.models
            .iter()
            .map(|(model, m)| ReportRow {
                label: model.clone(),
                tokens: Some(m.tokens.delta.unwrap_or(clamp_i64(m.tokens.today))),
                cost_usd: m.estimated_usd,
            })
            .collect()
    }

    fn total_cost(&self) -> f64 {
        self.cost.estimated_usd
    }

    fn total_tokens(&self) -> Option<i64> {
        Some(self.tokens.delta.unwrap_or(clamp_i64(self.tokens.today)))
    }

    fn note(&self) -> Option<String> {
        Some(self.summary.clone())
    }

    fn empty_message(&self) -> String {
        format!("Snapshot for {} lists no models.", self.date)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::{EstimatedCost, Summary};
    use chrono::{DateTime, Utc};

    fn ymd(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn snap(date: NaiveDate, models: &[(&str, u64)]) -> Snapshot {
        let by_model: BTreeMap<String, u64> =
            models.iter().map(|(m, t)| (m.to_string(), *t)).collect();
        Snapshot {
            date,
            generated_at: DateTime::<Utc>::UNIX_EPOCH,
            sessions: BTreeMap::new(),
            summary: Summary {
                total_tokens: by_model.values().sum(),
                by_model,
            },
            estimated_cost: None,
        }
    }

    #[test]
    fn growth_is_priced_with_blended_rate() {
        let prices = PriceTable::bundled().unwrap();
        let today = snap(ymd(2026, 1, 30), &[("claude-sonnet-4", 5000)]);
        let prev = snap(ymd(2026, 1, 29), &[("claude-sonnet-4", 2000)]);
        let report = estimate(&today, Some(&prev), &prices);

        assert_eq!(report.mode, EstimateMode::Delta);
        assert!(!report.cumulative);
        assert_eq!(report.comparison_date, Some(ymd(2026, 1, 29)));
        let m = &report.models["claude-sonnet-4"];
        assert_eq!(m.tokens.delta, Some(3000));
        assert!((m.estimated_usd - 0.0342).abs() < 1e-12);
        assert_eq!(format_cost(report.cost.estimated_usd), "$0.03");
        assert_eq!(report.summary, "3.0k tokens, ~$0.03 estimated");
    }

    #[test]
    fn shrinking_count_costs_nothing() {
        let prices = PriceTable::bundled().unwrap();
        let today = snap(ymd(2026, 1, 30), &[("modelX", 1000)]);
        let prev = snap(ymd(2026, 1, 29), &[("modelX", 4000)]);
        let report = estimate(&today, Some(&prev), &prices);

        let m = &report.models["modelX"];
        assert_eq!(m.tokens.delta, Some(-3000));
        assert_eq!(m.estimated_usd, 0.0);
        assert_eq!(report.tokens.delta, Some(-3000));
        assert_eq!(report.cost.estimated_usd, 0.0);
    }

    #[test]
    fn negative_deltas_reduce_token_total_but_not_cost() {
        let prices = PriceTable::bundled().unwrap();
        let today = snap(ymd(2026, 1, 30), &[("claude-sonnet-4", 5000), ("modelX", 1000)]);
        let prev = snap(ymd(2026, 1, 29), &[("claude-sonnet-4", 2000), ("modelX", 4000)]);
        let report = estimate(&today, Some(&prev), &prices);
        assert_eq!(report.tokens.delta, Some(0));
        assert!((report.cost.estimated_usd - 0.0342).abs() < 1e-12);
    }

    #[test]
    fn new_model_counts_from_zero_and_vanished_model_is_ignored() {
        let prices = PriceTable::bundled().unwrap();
        let today = snap(ymd(2026, 1, 30), &[("claude-opus-4", 1000)]);
        let prev = snap(ymd(2026, 1, 29), &[("claude-sonnet-4", 9000)]);
        let report = estimate(&today, Some(&prev), &prices);
        assert_eq!(report.models.len(), 1);
        let m = &report.models["claude-opus-4"];
        assert_eq!(m.tokens.previous, Some(0));
        assert_eq!(m.tokens.delta, Some(1000));
        // 0.3 * 15 + 0.7 * 75 = 57 per million
        assert!((m.estimated_usd - 0.057).abs() < 1e-12);
    }

    #[test]
    fn missing_previous_is_cumulative() {
        let prices = PriceTable::bundled().unwrap();
        let today = snap(ymd(2026, 1, 30), &[("claude-sonnet-4", 100_000)]);
        let report = estimate(&today, None, &prices);
        assert!(report.cumulative);
        assert_eq!(report.mode, EstimateMode::Cumulative);
        assert_eq!(report.comparison_date, None);
        assert_eq!(report.tokens.delta, None);
        assert!((report.cost.estimated_usd - 1.14).abs() < 1e-9);
        assert!(report.summary.contains("cumulative"));
        assert!(!report.summary.to_lowercase().contains("daily"));
        assert!(!report.title().to_lowercase().contains("daily"));
    }

    #[test]
    fn cumulative_prefers_stored_estimate() {
        let prices = PriceTable::bundled().unwrap();
        let mut today = snap(ymd(2026, 1, 30), &[("claude-sonnet-4", 100_000)]);
        today.estimated_cost = Some(EstimatedCost {
            total: 2.5,
            by_model: BTreeMap::new(),
        });
        let report = estimate(&today, None, &prices);
        assert_eq!(report.cost.estimated_usd, 2.5);
    }

    #[test]
    fn cumulative_rows_agree_with_stored_total() {
        let prices = PriceTable::bundled().unwrap();
        let mut today = snap(ymd(2026, 1, 30), &[("claude-sonnet-4", 100_000), ("modelX", 1000)]);
        today.estimated_cost = Some(EstimatedCost {
            total: 2.5,
            by_model: BTreeMap::from([("claude-sonnet-4".to_string(), 2.5)]),
        });
        let report = estimate(&today, None, &prices);
        assert_eq!(report.models["claude-sonnet-4"].estimated_usd, 2.5);
        // Not in the stored breakdown: priced fresh
        assert!((report.models["modelX"].estimated_usd - 0.0114).abs() < 1e-12);
        let rows_sum: f64 = report.rows().iter().map(|r| r.cost_usd).sum();
        assert!((rows_sum - 2.5).abs() < 0.02);
        assert_eq!(report.total_cost(), 2.5);
    }

    #[test]
    fn huge_counts_do_not_wrap_the_delta_sign() {
        let prices = PriceTable::bundled().unwrap();
        let today = snap(ymd(2026, 1, 30), &[("m", u64::MAX)]);
        let prev = snap(ymd(2026, 1, 29), &[("m", 1)]);
        let report = estimate(&today, Some(&prev), &prices);
        assert_eq!(report.models["m"].tokens.delta, Some(i64::MAX));
        assert!(report.cost.estimated_usd > 0.0);

        let today = snap(ymd(2026, 1, 30), &[("m", 0)]);
        let prev = snap(ymd(2026, 1, 29), &[("m", u64::MAX)]);
        let report = estimate(&today, Some(&prev), &prices);
        assert_eq!(report.models["m"].tokens.delta, Some(i64::MIN));
        assert_eq!(report.cost.estimated_usd, 0.0);
    }

    #[test]
    fn per_model_rounding_is_independent_of_total() {
        let prices = PriceTable::bundled().unwrap();
        // Each model costs 0.00456; rounded rows show $0.00, total shows $0.01
        let today = snap(ymd(2026, 1, 30), &[("a", 400), ("b", 400)]);
        let prev = snap(ymd(2026, 1, 29), &[]);
        let report = estimate(&today, Some(&prev), &prices);
        let rows = report.rows();
        assert!(rows.iter().all(|r| format_cost(r.cost_usd) == "$0.00"));
        assert_eq!(format_cost(report.total_cost()), "$0.01");
    }

    #[test]
    fn json_shape() {
        let prices = PriceTable::bundled().unwrap();
        let today = snap(ymd(2026, 1, 30), &[("claude-sonnet-4", 5000)]);
        let prev = snap(ymd(2026, 1, 29), &[("claude-sonnet-4", 2000)]);
        let v = serde_json::to_value(estimate(&today, Some(&prev), &prices)).unwrap();
        assert_eq!(v["date"], "2026-01-30");
        assert_eq!(v["comparisonDate"], "2026-01-29");
        assert_eq!(v["provenance"], "estimated");
        assert_eq!(v["cumulative"], false);
        assert_eq!(v["tokens"]["delta"], 3000);
        assert_eq!(v["models"]["claude-sonnet-4"]["previous"], 2000);
        assert_eq!(v["models"]["claude-sonnet-4"]["estimatedUsd"], 0.03);
        assert_eq!(v["cost"]["estimatedUsd"], 0.03);
    }
}
