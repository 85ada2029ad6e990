//! Price table for token-count estimates.
//!
//! The bundled table lives in `data/pricing.json`; the config file's `pricing`
//! section can override entries, the reference model and the assumed input
//! share. Lookup is by longest matching model-id prefix, and anything
//! unrecognised is priced as the reference model.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{CostError, Result};

pub const DEFAULT_INPUT_RATIO: f64 = 0.3;

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Pricing {
    pub input_per_million: f64,
    pub output_per_million: f64,
    /// Per-model override of the assumed input-token share
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_ratio: Option<f64>,
}

/// Shape shared by the bundled table and the config file's `pricing` section.
#[derive(Debug, Default, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct PricingConfig {
    pub default_model: Option<String>,
    pub input_ratio: Option<f64>,
    #[serde(default)]
    pub models: HashMap<String, Pricing>,
}

#[derive(Debug, Clone)]
pub struct PriceTable {
    entries: Vec<(String, Pricing)>,
    default_model: String,
    default_pricing: Pricing,
    input_ratio: f64,
}

impl PriceTable {
    #[cfg(test)]
    pub fn bundled() -> Result<Self> {
        Self::from_config(bundled_config()?)
    }

    /// Bundled table with `overrides` layered on top.
    pub fn with_overrides(overrides: Option<&PricingConfig>) -> Result<Self> {
        let mut cfg = bundled_config()?;
        if let Some(o) = overrides {
            if let Some(model) = &o.default_model {
                cfg.default_model = Some(model.clone());
            }
            if let Some(ratio) = o.input_ratio {
                cfg.input_ratio = Some(ratio);
            }
            for (model, pricing) in &o.models {
                cfg.models.insert(normalize_model(model), pricing.clone());
            }
        }
        Self::from_config(cfg)
    }

    pub fn from_config(cfg: PricingConfig) -> Result<Self> {
        let input_ratio = cfg.input_ratio.unwrap_or(DEFAULT_INPUT_RATIO);
        check_ratio("pricing.inputRatio", input_ratio)?;

        let mut entries = Vec::with_capacity(cfg.models.len());
        for (model, pricing) in cfg.models {
            if let Some(r) = pricing.input_ratio {
                check_ratio(&format!("pricing.models.{model}.inputRatio"), r)?;
            }
            entries.push((normalize_model(&model), pricing));
        }
        // Longest prefix first for matching
        entries.sort_by(|a, b| b.0.len().cmp(&a.0.len()).then_with(|| a.0.cmp(&b.0)));

        let default_model = cfg
            .default_model
            .ok_or_else(|| CostError::InvalidArgument("pricing.defaultModel is not set".into()))?;
        let default_pricing = find_prefix(&entries, &normalize_model(&default_model))
            .cloned()
            .ok_or_else(|| {
                CostError::InvalidArgument(format!(
                    "pricing.defaultModel '{default_model}' has no entry in the price table"
                ))
            })?;

        Ok(PriceTable {
            entries,
            default_model,
            default_pricing,
            input_ratio,
        })
    }

    pub fn default_model(&self) -> &str {
        &self.default_model
    }

    /// Pricing for `model`, falling back to the reference model.
    pub fn lookup(&self, model: &str) -> &Pricing {
        match find_prefix(&self.entries, &normalize_model(model)) {
            Some(p) => p,
            None => {
                debug!(model, fallback = %self.default_model, "no price entry, using reference model");
                &self.default_pricing
            }
        }
    }

    /// Blended USD per million tokens under the assumed input/output mix.
    pub fn blended_per_million(&self, model: &str) -> f64 {
        let pricing = self.lookup(model);
        let ratio = pricing.input_ratio.unwrap_or(self.input_ratio);
        ratio * pricing.input_per_million + (1.0 - ratio) * pricing.output_per_million
    }

    pub fn estimate(&self, model: &str, tokens: u64) -> f64 {
        tokens as f64 * self.blended_per_million(model) / 1_000_000.0
    }
}

fn bundled_config() -> Result<PricingConfig> {
    let raw = include_str!("../data/pricing.json");
    Ok(serde_json::from_str(raw)?)
}

fn find_prefix<'a>(entries: &'a [(String, Pricing)], model: &str) -> Option<&'a Pricing> {
    entries
        .iter()
        .find(|(prefix, _)| model.starts_with(prefix.as_str()))
        .map(|(_, p)| p)
}

fn check_ratio(name: &str, ratio: f64) -> Result<()> {
    if (0.0..=1.0).contains(&ratio) {
        Ok(())
    } else {
        Err(CostError::InvalidArgument(format!(
            "{name} must be between 0 and 1, got {ratio}"
        )))
    }
}

pub fn normalize_model(model: &str) -> String {
    let mut m = model.trim().to_lowercase();
    for prefix in ["anthropic/", "openrouter/", "openai/"] {
        if let Some(rest) = m.strip_prefix(prefix) {
            m = rest.to_string();
        }
    }
    m
}
