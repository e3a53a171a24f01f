//! In-memory billing state: pricing map, running total cost and the global
//! cost-limit gate.
//!
//! The total is recomputed from persisted daily usage at boot (and after
//! admin pricing changes), then advanced incrementally per response. Cost is
//! never refunded.

use std::collections::HashMap;
use std::sync::RwLock;

use thiserror::Error;

use crate::store::{BillingConfig, ModelPricingRow, UsageByModelRow};

#[derive(Debug, Error)]
#[error("global cost limit exceeded: total=${total:.6}, limit=${limit:.6}")]
pub struct CostLimitExceeded {
    pub total: f64,
    pub limit: f64,
}

#[derive(Default)]
struct BillingInner {
    cfg: BillingConfig,
    total_cost: f64,
    price_by_model: HashMap<String, ModelPricingRow>,
}

#[derive(Default)]
pub struct BillingState {
    inner: RwLock<BillingInner>,
}

impl BillingState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild the pricing map and recompute the running total from daily
    /// usage roll-ups at current prices.
    pub fn reload(
        &self,
        cfg: BillingConfig,
        pricing: &[ModelPricingRow],
        usage: &[UsageByModelRow],
    ) {
        let price_by_model = build_model_pricing_map(pricing);
        let mut total_cost = 0.0;
        for row in usage {
            total_cost += calculate_cost_by_tokens(
                &row.model,
                row.input_tokens,
                row.output_tokens,
                &price_by_model,
            );
        }

        let mut inner = self.inner.write().expect("billing lock");
        inner.cfg = cfg;
        inner.total_cost = total_cost;
        inner.price_by_model = price_by_model;
    }

    pub fn snapshot(&self) -> (BillingConfig, f64) {
        let inner = self.inner.read().expect("billing lock");
        (inner.cfg.clone(), inner.total_cost)
    }

    /// Gate applied during admission: a limit of 0 disables the check.
    pub fn check_global_cost_limit(&self) -> Result<(), CostLimitExceeded> {
        let (cfg, total_cost) = self.snapshot();
        if cfg.global_cost_limit_usd <= 0.0 {
            return Ok(());
        }
        if total_cost >= cfg.global_cost_limit_usd {
            return Err(CostLimitExceeded {
                total: round_cost(total_cost),
                limit: round_cost(cfg.global_cost_limit_usd),
            });
        }
        Ok(())
    }

    /// Advance the running total after a response. Unknown models and
    /// non-finite or non-positive deltas are no-ops; the total never
    /// decreases.
    pub fn add_cost_from_usage(&self, model_id: &str, input_tokens: i64, output_tokens: i64) {
        let model_id = model_id.trim();
        if model_id.is_empty() {
            return;
        }
        let input_tokens = input_tokens.max(0);
        let output_tokens = output_tokens.max(0);
        if input_tokens == 0 && output_tokens == 0 {
            return;
        }

        let mut inner = self.inner.write().expect("billing lock");
        let Some(pricing) = inner.price_by_model.get(model_id) else {
            return;
        };

        let delta = ((input_tokens as f64 * pricing.input_price_per_1k)
            + (output_tokens as f64 * pricing.output_price_per_1k))
            / 1_000.0;
        if delta.is_nan() || delta.is_infinite() || delta <= 0.0 {
            return;
        }
        inner.total_cost += delta;
    }
}

/// Index pricing rows under every candidate key so lookups succeed for both
/// the bare model id and its `us.`-prefixed inference-profile form.
pub fn build_model_pricing_map(pricing: &[ModelPricingRow]) -> HashMap<String, ModelPricingRow> {
    let mut out = HashMap::with_capacity(pricing.len() * 2);
    for row in pricing {
        let model_id = row.model_id.trim();
        if model_id.is_empty() {
            continue;
        }
        for key in candidate_model_pricing_keys(model_id) {
            out.insert(key, row.clone());
        }
    }
    out
}

fn candidate_model_pricing_keys(model_id: &str) -> Vec<String> {
    let model_id = model_id.trim();
    if model_id.is_empty() {
        return Vec::new();
    }

    let mut keys = vec![model_id.to_string()];
    if let Some(trimmed) = model_id.strip_prefix("us.") {
        if !trimmed.trim().is_empty() {
            keys.push(trimmed.to_string());
        }
    } else {
        keys.push(format!("us.{model_id}"));
    }
    keys
}

pub fn calculate_cost_by_tokens(
    model_id: &str,
    input_tokens: i64,
    output_tokens: i64,
    price_by_model: &HashMap<String, ModelPricingRow>,
) -> f64 {
    let Some(pricing) = price_by_model.get(model_id.trim()) else {
        return 0.0;
    };
    let input_tokens = input_tokens.max(0);
    let output_tokens = output_tokens.max(0);

    const TOKEN_BASE: f64 = 1_000.0;
    (input_tokens as f64 / TOKEN_BASE) * pricing.input_price_per_1k
        + (output_tokens as f64 / TOKEN_BASE) * pricing.output_price_per_1k
}

/// Round to 1e-9 for export; non-finite values collapse to 0.
pub fn round_cost(value: f64) -> f64 {
    if value.is_nan() || value.is_infinite() {
        return 0.0;
    }
    (value * 1_000_000_000.0).round() / 1_000_000_000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pricing(model_id: &str, input: f64, output: f64) -> ModelPricingRow {
        ModelPricingRow {
            model_id: model_id.into(),
            input_price_per_1k: input,
            output_price_per_1k: output,
        }
    }

    fn usage(model: &str, input: i64, output: i64) -> UsageByModelRow {
        UsageByModelRow {
            client_id: "c1".into(),
            model: model.into(),
            input_tokens: input,
            output_tokens: output,
            total_tokens: input + output,
            request_count: 1,
        }
    }

    #[test]
    fn pricing_lookup_tolerates_regional_prefix() {
        let map = build_model_pricing_map(&[pricing("anthropic.claude-x", 3.0, 15.0)]);
        assert!(map.contains_key("anthropic.claude-x"));
        assert!(map.contains_key("us.anthropic.claude-x"));

        let prefixed = build_model_pricing_map(&[pricing("us.anthropic.claude-y", 1.0, 2.0)]);
        assert!(prefixed.contains_key("anthropic.claude-y"));
        assert!(prefixed.contains_key("us.anthropic.claude-y"));
    }

    #[test]
    fn cost_accrues_under_either_model_form() {
        let state = BillingState::new();
        state.reload(
            BillingConfig::default(),
            &[pricing("anthropic.claude-x", 3.0, 15.0)],
            &[],
        );

        state.add_cost_from_usage("us.anthropic.claude-x", 1000, 1000);
        let (_, total) = state.snapshot();
        assert!((total - 0.018).abs() < 1e-12);
    }

    #[test]
    fn unknown_models_and_bad_deltas_are_no_ops() {
        let state = BillingState::new();
        state.reload(
            BillingConfig::default(),
            &[pricing("anthropic.claude-x", 3.0, 15.0)],
            &[],
        );

        state.add_cost_from_usage("mystery-model", 1000, 1000);
        state.add_cost_from_usage("anthropic.claude-x", 0, 0);
        state.add_cost_from_usage("anthropic.claude-x", -5, -5);
        state.add_cost_from_usage("", 1000, 1000);
        let (_, total) = state.snapshot();
        assert_eq!(total, 0.0);
    }

    #[test]
    fn total_never_decreases() {
        let state = BillingState::new();
        state.reload(
            BillingConfig::default(),
            &[pricing("anthropic.claude-x", 3.0, 15.0)],
            &[],
        );

        let mut last = 0.0;
        for _ in 0..10 {
            state.add_cost_from_usage("anthropic.claude-x", 100, 100);
            let (_, total) = state.snapshot();
            assert!(total >= last);
            last = total;
        }
    }

    #[test]
    fn reload_recomputes_total_from_usage_rows() {
        let state = BillingState::new();
        state.reload(
            BillingConfig {
                global_cost_limit_usd: 1.0,
            },
            &[pricing("anthropic.claude-x", 3.0, 15.0)],
            &[usage("us.anthropic.claude-x", 2000, 1000)],
        );
        let (cfg, total) = state.snapshot();
        assert_eq!(cfg.global_cost_limit_usd, 1.0);
        // 2k input at $3/1k + 1k output at $15/1k.
        assert!((total - 0.021).abs() < 1e-12);
    }

    #[test]
    fn cost_limit_boundary() {
        let state = BillingState::new();
        let rows = [pricing("m", 1.0, 1.0)];

        state.reload(
            BillingConfig {
                global_cost_limit_usd: 0.01,
            },
            &rows,
            &[usage("m", 9, 0)],
        );
        // total 0.009 < limit: pass.
        assert!(state.check_global_cost_limit().is_ok());

        state.reload(
            BillingConfig {
                global_cost_limit_usd: 0.01,
            },
            &rows,
            &[usage("m", 10, 1)],
        );
        // total 0.011 >= limit: reject with details.
        let err = state.check_global_cost_limit().unwrap_err();
        assert!(err.to_string().contains("global cost limit exceeded"));

        // Limit 0 disables the gate.
        state.reload(BillingConfig::default(), &rows, &[usage("m", 10_000, 0)]);
        assert!(state.check_global_cost_limit().is_ok());
    }

    #[test]
    fn round_cost_normalizes() {
        assert_eq!(round_cost(f64::NAN), 0.0);
        assert_eq!(round_cost(f64::INFINITY), 0.0);
        assert_eq!(round_cost(0.123456789123), 0.123456789);
    }
}
