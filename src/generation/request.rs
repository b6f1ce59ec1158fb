use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::GenerationDefaults;
use crate::error::GatewayError;
use crate::optimizer::{OptimizationMode, OptimizationStatus};
use crate::pricing::PreflightEstimate;
use crate::providers::{Credentials, GenerateParams, KeySource, Provider, Usage};

/// Inbound generation request, as handed over by the HTTP layer
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationRequest {
    /// Set by the authenticating layer, not by the body
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub api_key_id: Option<String>,
    pub model: String,
    pub prompt: String,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub top_p: Option<f64>,
    #[serde(default)]
    pub stream: bool,
    #[serde(default)]
    pub optimization_mode: Option<String>,
    /// Bring-your-own-key credentials
    #[serde(default, alias = "apiKeys")]
    pub credentials: Credentials,
}

impl GenerationRequest {
    pub fn new(user_id: &str, model: &str, prompt: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            model: model.to_string(),
            prompt: prompt.to_string(),
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<(), GatewayError> {
        if self.model.trim().is_empty() {
            return Err(GatewayError::InvalidRequest("model is required".into()));
        }
        if self.prompt.trim().is_empty() {
            return Err(GatewayError::InvalidRequest("prompt is required".into()));
        }
        if self.user_id.trim().is_empty() {
            return Err(GatewayError::InvalidRequest("user is required".into()));
        }
        Ok(())
    }

    pub fn mode(&self) -> OptimizationMode {
        OptimizationMode::parse(self.optimization_mode.as_deref())
    }

    /// `max_tokens` of 0 counts as absent
    pub fn effective_max_tokens(&self, defaults: &GenerationDefaults) -> u32 {
        self.max_tokens.filter(|n| *n > 0).unwrap_or(defaults.max_tokens)
    }

    pub fn params(&self, prompt: String, defaults: &GenerationDefaults) -> GenerateParams {
        GenerateParams::new(prompt)
            .max_tokens(self.effective_max_tokens(defaults))
            .temperature(self.temperature.unwrap_or(defaults.temperature))
            .top_p(self.top_p.unwrap_or(defaults.top_p))
    }
}

/// Cost and optimization details reported alongside the text
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultMetadata {
    pub request_id: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub base_cost: f64,
    pub markup_amount: f64,
    pub total_cost: f64,
    pub tier_id: String,
    pub markup_percent: f64,
    pub custom_pricing_applied: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub balance_after: Option<f64>,
    pub key_source: KeySource,
    pub was_optimized: bool,
    pub optimization_status: OptimizationStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub optimization_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallback_reason: Option<String>,
    /// Backed by backend-reported usage; zero otherwise
    pub tokens_saved: u64,
    pub savings_amount: f64,
    /// Heuristic figures, never billed
    pub estimated_tokens_saved: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_estimated_tokens_saved: Option<u64>,
    pub preflight: PreflightEstimate,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
}

impl From<Usage> for ResultUsage {
    fn from(usage: Usage) -> Self {
        Self {
            input_tokens: usage.input_tokens,
            output_tokens: usage.output_tokens,
            total_tokens: usage.total(),
        }
    }
}

/// Blocking-mode result
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationResult {
    pub id: String,
    pub text: String,
    pub model: String,
    pub provider: Provider,
    pub usage: ResultUsage,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub metadata: ResultMetadata,
}

impl GenerationResult {
    pub fn was_optimized(&self) -> bool {
        self.metadata.was_optimized
    }

    pub fn optimization_status(&self) -> OptimizationStatus {
        self.metadata.optimization_status
    }

    pub fn fallback_reason(&self) -> Option<&str> {
        self.metadata.fallback_reason.as_deref()
    }

    pub fn tokens_saved(&self) -> u64 {
        self.metadata.tokens_saved
    }

    pub fn savings_amount(&self) -> f64 {
        self.metadata.savings_amount
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_applied() {
        let defaults = GenerationDefaults::default();
        let mut request = GenerationRequest::new("u1", "m1", "hi");
        request.max_tokens = Some(0);

        let params = request.params("hi".into(), &defaults);
        assert_eq!(params.max_tokens, Some(1000));
        assert_eq!(params.temperature, Some(0.7));
        assert_eq!(params.top_p, Some(1.0));

        request.max_tokens = Some(64);
        request.temperature = Some(0.0);
        let params = request.params("hi".into(), &defaults);
        assert_eq!(params.max_tokens, Some(64));
        assert_eq!(params.temperature, Some(0.0));
    }

    #[test]
    fn test_validation() {
        assert!(GenerationRequest::new("u1", "m1", "hi").validate().is_ok());
        assert!(matches!(
            GenerationRequest::new("u1", "", "hi").validate(),
            Err(GatewayError::InvalidRequest(_))
        ));
        assert!(matches!(
            GenerationRequest::new("u1", "m1", "  ").validate(),
            Err(GatewayError::InvalidRequest(_))
        ));
    }

    #[test]
    fn test_inbound_shape() {
        let body = r#"{
            "model": "gpt-4o-mini-2024-07-18",
            "prompt": "hello",
            "maxTokens": 50,
            "topP": 0.9,
            "stream": true,
            "optimizationMode": "efficiency",
            "credentials": {"openai": "sk-user"}
        }"#;
        let request: GenerationRequest = serde_json::from_str(body).unwrap();
        assert_eq!(request.max_tokens, Some(50));
        assert!(request.stream);
        assert_eq!(request.mode(), OptimizationMode::Efficiency);
        assert_eq!(request.credentials.key_for(Provider::OpenAI), Some("sk-user"));
    }
}
