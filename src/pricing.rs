use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::types::{PricingConfig, Usage};
use crate::{CalciferError, Result};

const TOKENS_PER_K: f64 = 1000.0;

/// In-memory pricing table. Providers register their own price lists at
/// startup; registration is an idempotent overwrite.
pub struct PricingRegistry {
    pricing: RwLock<HashMap<String, PricingConfig>>,
}

impl PricingRegistry {
    pub fn new() -> Self {
        Self {
            pricing: RwLock::new(HashMap::new()),
        }
    }

    pub fn register(&self, model: &str, config: PricingConfig) -> Result<()> {
        if model.is_empty() {
            return Err(CalciferError::InvalidArgument(
                "model cannot be empty".to_string(),
            ));
        }
        self.pricing.write().insert(model.to_string(), config);
        Ok(())
    }

    pub fn get(&self, model: &str) -> Option<PricingConfig> {
        self.pricing.read().get(model).copied()
    }
}

impl Default for PricingRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Token-based USD cost. Unknown models price at zero so new models are not
/// blocked on pricing metadata.
#[derive(Clone)]
pub struct CostCalculator {
    pricing: Arc<PricingRegistry>,
}

impl CostCalculator {
    pub fn new(pricing: Arc<PricingRegistry>) -> Self {
        Self { pricing }
    }

    pub fn calculate(&self, model: &str, usage: &Usage) -> Result<f64> {
        if model.is_empty() {
            return Err(CalciferError::InvalidArgument(
                "model cannot be empty".to_string(),
            ));
        }

        let Some(pricing) = self.pricing.get(model) else {
            return Ok(0.0);
        };

        let input_cost = f64::from(usage.prompt_tokens) / TOKENS_PER_K * pricing.input_cost_per_1k;
        let output_cost =
            f64::from(usage.completion_tokens) / TOKENS_PER_K * pricing.output_cost_per_1k;
        Ok(input_cost + output_cost)
    }
}
