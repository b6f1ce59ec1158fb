//! Prompt/response compression
//!
//! Two stages, tried in order: a deterministic rule pass and, when that
//! changes nothing, one call to a low-cost auxiliary model. Auxiliary
//! failures fall back to the original text unless
//! `optimization.fallback_on_failure` is off. Token figures computed here
//! are estimates; only `aux_usage` carries backend-reported counts.

pub mod rules;

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::config::OptimizationConfig;
use crate::error::GatewayError;
use crate::logging::truncate_for_log;
use crate::providers::{GenerateParams, GenerationClient, Usage};
use crate::tokens::estimate_tokens;

pub use rules::apply_rules;

const PROMPT_MAX_TOKENS: u32 = 300;
const RESPONSE_MAX_TOKENS: u32 = 800;
const OPTIMIZER_TEMPERATURE: f64 = 0.1;
const LOG_PREVIEW_CHARS: usize = 80;

const TOKENS_SAVED_MARKER: &str = "[tokens_saved]=";

const RESPONSE_PREFIXES: &[&str] = &[
    "Optimized prompt:",
    "Optimized response:",
    "Optimized version:",
    "Here's the optimized version:",
    "The optimized version is:",
];

pub const FALLBACK_OPTIMIZATION_FAILED: &str = "optimization_failed";
pub const FALLBACK_RESPONSE_OPTIMIZATION_FAILED: &str = "response_optimization_failed";

/// Appended to an optimized streaming prompt
pub const OUTPUT_EFFICIENCY_HINT: &str =
    "\n\nIMPORTANT: Make your response token-efficient while preserving all essential information.";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OptimizationMode {
    /// Preserve context and clarity
    #[default]
    Context,
    /// Keep only core information
    Efficiency,
}

impl OptimizationMode {
    /// Anything but "efficiency" means context
    pub fn parse(value: Option<&str>) -> Self {
        match value.map(|v| v.trim().to_ascii_lowercase()) {
            Some(v) if v == "efficiency" => Self::Efficiency,
            _ => Self::Context,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Context => "context",
            Self::Efficiency => "efficiency",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizationStatus {
    #[default]
    NotAttempted,
    Success,
    Failed,
    PartialSuccess,
}

impl OptimizationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotAttempted => "not_attempted",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::PartialSuccess => "partial_success",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizationType {
    RuleBased,
    AiBased,
}

impl OptimizationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RuleBased => "rule_based",
            Self::AiBased => "ai_based",
        }
    }
}

/// Outcome of one optimization attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizationResult {
    pub original_text: String,
    /// Equal to `original_text` unless `was_optimized`
    pub optimized_text: String,
    pub was_optimized: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub optimization_type: Option<OptimizationType>,
    pub status: OptimizationStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallback_reason: Option<String>,
    /// length/4 heuristics, never billed
    pub estimated_original_tokens: u64,
    pub estimated_optimized_tokens: u64,
    /// Usage reported by the auxiliary model, when it was called
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aux_usage: Option<Usage>,
    /// The model's own `[tokens_saved]` claim on responses
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_estimated_tokens_saved: Option<u64>,
}

impl OptimizationResult {
    fn unchanged(text: &str, status: OptimizationStatus) -> Self {
        let estimate = estimate_tokens(text);
        Self {
            original_text: text.to_string(),
            optimized_text: text.to_string(),
            was_optimized: false,
            optimization_type: None,
            status,
            fallback_reason: None,
            estimated_original_tokens: estimate,
            estimated_optimized_tokens: estimate,
            aux_usage: None,
            model_estimated_tokens_saved: None,
        }
    }

    fn optimized(original: &str, optimized: String, kind: OptimizationType) -> Self {
        Self {
            estimated_optimized_tokens: estimate_tokens(&optimized),
            optimized_text: optimized,
            was_optimized: true,
            optimization_type: Some(kind),
            ..Self::unchanged(original, OptimizationStatus::Success)
        }
    }

    pub fn not_attempted(text: &str) -> Self {
        Self::unchanged(text, OptimizationStatus::NotAttempted)
    }

    /// Advisory saving from the length heuristic
    pub fn estimated_tokens_saved(&self) -> i64 {
        self.estimated_original_tokens as i64 - self.estimated_optimized_tokens as i64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Target {
    Prompt,
    Response,
}

impl Target {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Prompt => "prompt",
            Self::Response => "response",
        }
    }
}

/// Compression through a designated auxiliary model
pub struct Optimizer {
    client: Arc<dyn GenerationClient>,
    config: OptimizationConfig,
}

impl Optimizer {
    pub fn new(client: Arc<dyn GenerationClient>, config: OptimizationConfig) -> Self {
        Self { client, config }
    }

    pub fn model_id(&self) -> &str {
        self.client.model_id()
    }

    pub fn config(&self) -> &OptimizationConfig {
        &self.config
    }

    /// Only texts strictly longer than `threshold` bytes are worth a pass
    pub fn should_optimize(text: &str, threshold: usize) -> bool {
        text.len() > threshold
    }

    pub async fn optimize_prompt_with_mode(
        &self,
        prompt: &str,
        mode: OptimizationMode,
        cancel: &CancellationToken,
    ) -> Result<OptimizationResult, GatewayError> {
        self.optimize(Target::Prompt, prompt, mode, cancel).await
    }

    pub async fn optimize_response_with_mode(
        &self,
        response: &str,
        mode: OptimizationMode,
        cancel: &CancellationToken,
    ) -> Result<OptimizationResult, GatewayError> {
        self.optimize(Target::Response, response, mode, cancel).await
    }

    async fn optimize(
        &self,
        target: Target,
        text: &str,
        mode: OptimizationMode,
        cancel: &CancellationToken,
    ) -> Result<OptimizationResult, GatewayError> {
        let threshold = match target {
            Target::Prompt => self.config.prompt_threshold,
            Target::Response => self.config.response_threshold,
        };
        if !self.config.enabled || !Self::should_optimize(text, threshold) {
            return Ok(OptimizationResult::not_attempted(text));
        }

        let rule_optimized = apply_rules(text);
        if rule_optimized != text {
            let result = OptimizationResult::optimized(text, rule_optimized, OptimizationType::RuleBased);
            log_result(target, &result);
            return Ok(result);
        }

        let (instruction, max_tokens) = match target {
            Target::Prompt => (prompt_instruction(text, mode), PROMPT_MAX_TOKENS),
            Target::Response => (response_instruction(text, mode), RESPONSE_MAX_TOKENS),
        };
        let params = GenerateParams::new(instruction)
            .max_tokens(max_tokens)
            .temperature(OPTIMIZER_TEMPERATURE);

        let response = match self.client.generate(&params, cancel).await {
            Ok(response) => response,
            Err(GatewayError::Cancelled) => return Err(GatewayError::Cancelled),
            Err(e) if self.config.fallback_on_failure => {
                tracing::warn!(
                    target_text = target.as_str(),
                    model = %self.client.model_id(),
                    error = %e,
                    "Model-based optimization failed, using original text"
                );
                let mut result = OptimizationResult::unchanged(text, OptimizationStatus::Failed);
                result.fallback_reason = Some(FALLBACK_OPTIMIZATION_FAILED.to_string());
                return Ok(result);
            }
            Err(e) => {
                return Err(GatewayError::Optimization(format!(
                    "{} optimization via {} failed: {}",
                    target.as_str(),
                    self.client.model_id(),
                    e
                )))
            }
        };

        let mut cleaned = clean_response(&response.text);
        let mut model_estimate = None;
        if target == Target::Response {
            let (body, estimate) = split_tokens_saved(&cleaned);
            cleaned = body;
            model_estimate = estimate;
        }

        let mut result = if !cleaned.is_empty() && cleaned != text {
            OptimizationResult::optimized(text, cleaned, OptimizationType::AiBased)
        } else {
            OptimizationResult::unchanged(text, OptimizationStatus::NotAttempted)
        };
        result.aux_usage = Some(response.usage);
        result.model_estimated_tokens_saved = model_estimate.filter(|_| result.was_optimized);

        log_result(target, &result);
        Ok(result)
    }
}

fn prompt_instruction(prompt: &str, mode: OptimizationMode) -> String {
    match mode {
        OptimizationMode::Context => format!(
            "Optimize this prompt for token efficiency while preserving context and clarity. \
             Remove unnecessary words but keep essential information.\n\n\"{}\"\n\nOptimized:",
            prompt
        ),
        OptimizationMode::Efficiency => format!(
            "Aggressively minimize tokens. Keep only core information. \
             Remove all non-essential context.\n\n\"{}\"\n\nOptimized:",
            prompt
        ),
    }
}

fn response_instruction(response: &str, mode: OptimizationMode) -> String {
    match mode {
        OptimizationMode::Context => format!(
            "Rewrite for token efficiency while preserving context. \
             Append {}<number> at end.\n\n{}",
            TOKENS_SAVED_MARKER, response
        ),
        OptimizationMode::Efficiency => format!(
            "Aggressively minimize tokens. Keep only core info. \
             Append {}<number> at end.\n\n{}",
            TOKENS_SAVED_MARKER, response
        ),
    }
}

/// Strip wrapping quotes and the usual "Optimized ...:" lead-ins
pub fn clean_response(text: &str) -> String {
    let mut cleaned = text.trim().trim_matches(|c: char| c == '"' || c == '\'').to_string();
    for prefix in RESPONSE_PREFIXES {
        if let Some(rest) = cleaned.strip_prefix(prefix) {
            cleaned = rest.trim().to_string();
        }
    }
    cleaned
}

/// Split off a trailing `[tokens_saved]=N`; the last marker wins
fn split_tokens_saved(text: &str) -> (String, Option<u64>) {
    let Some(idx) = text.rfind(TOKENS_SAVED_MARKER) else {
        return (text.to_string(), None);
    };

    let digits: String = text[idx + TOKENS_SAVED_MARKER.len()..]
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    (text[..idx].trim().to_string(), digits.parse().ok())
}

fn log_result(target: Target, result: &OptimizationResult) {
    if result.was_optimized {
        tracing::info!(
            target_text = target.as_str(),
            optimization_type = result.optimization_type.map(|t| t.as_str()),
            estimated_original_tokens = result.estimated_original_tokens,
            estimated_optimized_tokens = result.estimated_optimized_tokens,
            "Optimization completed"
        );
        tracing::debug!(
            target_text = target.as_str(),
            original = %truncate_for_log(&result.original_text, LOG_PREVIEW_CHARS),
            optimized = %truncate_for_log(&result.optimized_text, LOG_PREVIEW_CHARS),
            "Optimized text preview"
        );
    } else {
        tracing::debug!(target_text = target.as_str(), "Optimization left text unchanged");
    }
}
