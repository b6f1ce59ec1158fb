use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::providers::Provider;

/// A billable backend model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    pub model_id: String,
    /// Inferred from the model name when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<Provider>,
    pub input_price_per_million: f64,
    pub output_price_per_million: f64,
    #[serde(default)]
    pub context_window_size: u64,
    #[serde(default = "default_true")]
    pub is_active: bool,
}

impl ModelConfig {
    pub fn new(model_id: &str, provider: Provider, input: f64, output: f64, context_window_size: u64) -> Self {
        Self {
            model_id: model_id.to_string(),
            provider: Some(provider),
            input_price_per_million: input,
            output_price_per_million: output,
            context_window_size,
            is_active: true,
        }
    }

    pub fn provider(&self) -> Option<Provider> {
        self.provider.or_else(|| Provider::from_model_id(&self.model_id))
    }
}

/// Per-model price override carried by a custom tier
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelPricing {
    #[serde(default)]
    pub model_id: String,
    pub input_price_per_million: f64,
    pub output_price_per_million: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PricingTier {
    pub tier_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub min_monthly_spend: f64,
    pub input_markup_percent: f64,
    pub output_markup_percent: f64,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default)]
    pub is_custom: bool,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub custom_model_pricing: HashMap<String, ModelPricing>,
}

impl PricingTier {
    pub fn new(tier_id: &str, input_markup_percent: f64, output_markup_percent: f64) -> Self {
        Self {
            tier_id: tier_id.to_string(),
            name: tier_id.to_string(),
            min_monthly_spend: 0.0,
            input_markup_percent,
            output_markup_percent,
            is_active: true,
            is_custom: false,
            custom_model_pricing: HashMap::new(),
        }
    }

    /// Markups are percentages on top of base cost and never negative
    pub fn has_valid_markups(&self) -> bool {
        self.input_markup_percent >= 0.0 && self.output_markup_percent >= 0.0
    }

    /// Mean of the two markups, as recorded on request logs
    pub fn average_markup_percent(&self) -> f64 {
        (self.input_markup_percent + self.output_markup_percent) / 2.0
    }
}

/// A user's billing account. Balance may be negative.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    pub id: String,
    #[serde(default)]
    pub email: String,
    pub balance: f64,
    pub tier_id: String,
    #[serde(default = "default_true")]
    pub is_active: bool,
    /// Opt-in to the tier's per-model overrides
    #[serde(default)]
    pub custom_pricing: bool,
}

impl Account {
    pub fn new(id: &str, balance: f64, tier_id: &str) -> Self {
        Self {
            id: id.to_string(),
            email: String::new(),
            balance,
            tier_id: tier_id.to_string(),
            is_active: true,
            custom_pricing: false,
        }
    }
}

fn default_true() -> bool {
    true
}

/// Cost of one request
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CostBreakdown {
    pub model_id: String,
    pub tier_id: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    /// Effective per-million prices after any custom override
    pub input_price_per_million: f64,
    pub output_price_per_million: f64,
    pub custom_pricing_applied: bool,
    pub input_cost: f64,
    pub output_cost: f64,
    pub base_cost: f64,
    pub input_markup: f64,
    pub output_markup: f64,
    pub markup: f64,
    pub total_cost: f64,
    pub markup_percent: f64,
}

impl CostBreakdown {
    pub fn zero() -> Self {
        Self::default()
    }

    pub fn calculate_total(&mut self) {
        self.base_cost = self.input_cost + self.output_cost;
        self.markup = self.input_markup + self.output_markup;
        self.total_cost = self.base_cost + self.markup;
    }
}
