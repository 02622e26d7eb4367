use std::collections::BTreeMap;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::config::ModelSettings;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelUsage {
    pub calls: u64,
    pub failed_calls: u64,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub cost_usd: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CostReport {
    pub models: BTreeMap<String, ModelUsage>,
    pub total_calls: u64,
    pub total_cost_usd: f64,
}

/// Running per-model totals. Only ever grows; shared by every worker.
#[derive(Debug, Default)]
pub struct CostLedger {
    models: Mutex<BTreeMap<String, ModelUsage>>,
}

impl CostLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, model: &ModelSettings, usage: TokenUsage) {
        let cost = model.cost_usd(usage.prompt_tokens, usage.completion_tokens);
        let mut models = self.models.lock();
        let entry = models.entry(model.key()).or_default();
        entry.calls += 1;
        entry.prompt_tokens += usage.prompt_tokens;
        entry.completion_tokens += usage.completion_tokens;
        entry.cost_usd += cost;
        tracing::debug!(
            "{}: {} prompt + {} completion tokens (${cost:.6})",
            model.key(),
            usage.prompt_tokens,
            usage.completion_tokens
        );
    }

    /// A call that produced no usable response still counts as a call.
    pub fn record_failure(&self, model: &ModelSettings) {
        let mut models = self.models.lock();
        let entry = models.entry(model.key()).or_default();
        entry.calls += 1;
        entry.failed_calls += 1;
    }

    pub fn total_calls(&self) -> u64 {
        self.models.lock().values().map(|usage| usage.calls).sum()
    }

    pub fn report(&self) -> CostReport {
        let models = self.models.lock().clone();
        CostReport {
            total_calls: models.values().map(|usage| usage.calls).sum(),
            total_cost_usd: models.values().map(|usage| usage.cost_usd).sum(),
            models,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LlmSettings;

    #[test]
    fn ledger_accumulates_per_model() {
        let settings = LlmSettings::default();
        let ledger = CostLedger::new();
        ledger.record(
            &settings.primary,
            TokenUsage {
                prompt_tokens: 1_000_000,
                completion_tokens: 0,
            },
        );
        ledger.record_failure(&settings.fallback);
        let report = ledger.report();
        assert_eq!(report.total_calls, 2);
        assert!((report.total_cost_usd - 0.5).abs() < 1e-9);
        assert_eq!(report.models["anthropic:claude-3-5-sonnet-latest"].failed_calls, 1);
    }
}
