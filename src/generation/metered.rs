//! One-shot metering: price, write the audit entry and adjust the balance
//!
//! A [`Meter`] is consumed by [`Meter::finish`], so a request can be metered
//! at most once no matter how its stream ends.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Instant;

use super::request::ResultMetadata;
use crate::audit::{AuditLog, RequestLogEntry, RequestStatus};
use crate::error::GatewayError;
use crate::metrics;
use crate::optimizer::{OptimizationResult, OptimizationStatus, OptimizationType};
use crate::pricing::calculator::savings_amount;
use crate::pricing::{PreflightEstimate, PricingContext, PricingService};
use crate::providers::{KeySource, Provider, Usage};
use crate::streaming::NormalizedStream;

/// Tokens saved by a model-based pass, from backend-reported usage only.
///
/// Compares the auxiliary call's input tokens with the primary call's; any
/// missing or zero figure means no claim.
pub fn billed_tokens_saved(optimization: &OptimizationResult, primary: &Usage) -> u64 {
    match (optimization.optimization_type, optimization.aux_usage) {
        (Some(OptimizationType::AiBased), Some(aux))
            if optimization.was_optimized && aux.input_tokens > 0 && primary.input_tokens > 0 =>
        {
            aux.input_tokens.saturating_sub(primary.input_tokens)
        }
        _ => 0,
    }
}

/// Optimization outcome as reported for the whole request
#[derive(Debug, Clone)]
pub(crate) struct OptimizationOutcome {
    pub prompt: OptimizationResult,
    pub was_optimized: bool,
    pub optimization_type: Option<OptimizationType>,
    pub status: OptimizationStatus,
    pub fallback_reason: Option<String>,
    pub model_estimated_tokens_saved: Option<u64>,
}

impl OptimizationOutcome {
    pub fn from_prompt(prompt: OptimizationResult) -> Self {
        Self {
            was_optimized: prompt.was_optimized,
            optimization_type: prompt.optimization_type,
            status: prompt.status,
            fallback_reason: prompt.fallback_reason.clone(),
            model_estimated_tokens_saved: None,
            prompt,
        }
    }

    /// Fold in the response pass
    pub fn with_response(mut self, response: &OptimizationResult) -> Self {
        match response.status {
            OptimizationStatus::Failed => {
                self.status = if self.prompt.status == OptimizationStatus::Success {
                    OptimizationStatus::PartialSuccess
                } else {
                    OptimizationStatus::Failed
                };
                self.fallback_reason =
                    Some(crate::optimizer::FALLBACK_RESPONSE_OPTIMIZATION_FAILED.to_string());
            }
            OptimizationStatus::Success => {
                self.status = match self.status {
                    OptimizationStatus::NotAttempted => OptimizationStatus::Success,
                    OptimizationStatus::Failed => OptimizationStatus::PartialSuccess,
                    other => other,
                };
                self.was_optimized |= response.was_optimized;
                self.optimization_type = self.optimization_type.or(response.optimization_type);
                self.model_estimated_tokens_saved = response.model_estimated_tokens_saved;
            }
            _ => {}
        }
        self
    }
}

/// Everything needed to bill a request once usage is known
pub(crate) struct Meter {
    pub request_id: String,
    pub user_id: String,
    pub api_key_id: Option<String>,
    pub provider: Provider,
    pub key_source: KeySource,
    pub streamed: bool,
    pub context: PricingContext,
    pub preflight: PreflightEstimate,
    pub optimization: OptimizationOutcome,
    pub created_at: DateTime<Utc>,
    pub started: Instant,
    pub pricing: Arc<PricingService>,
    pub audit: Arc<AuditLog>,
}

impl Meter {
    pub async fn finish(
        self,
        usage: Usage,
        status: RequestStatus,
        error: Option<&GatewayError>,
    ) -> Result<ResultMetadata, GatewayError> {
        let model_id = self.context.model.model_id.clone();
        let cost = self.context.cost(usage.input_tokens, usage.output_tokens);
        let tokens_saved = billed_tokens_saved(&self.optimization.prompt, &usage);
        let savings = savings_amount(tokens_saved, self.context.effective_input_price());

        let completed_at = Utc::now();
        let duration = self.started.elapsed();
        let optimization_type = self
            .optimization
            .optimization_type
            .map(|t| t.as_str().to_string());

        let entry = RequestLogEntry {
            id: uuid::Uuid::new_v4().to_string(),
            request_id: self.request_id.clone(),
            user_id: self.user_id.clone(),
            api_key_id: self.api_key_id.clone(),
            model_id: model_id.clone(),
            provider: self.provider.as_str().to_string(),
            key_source: self.key_source.as_str().to_string(),
            streamed: self.streamed,
            input_tokens: usage.input_tokens,
            output_tokens: usage.output_tokens,
            base_cost: cost.base_cost,
            markup_amount: cost.markup,
            total_cost: cost.total_cost,
            tier_id: cost.tier_id.clone(),
            markup_percent: cost.markup_percent,
            was_optimized: self.optimization.was_optimized,
            optimization_status: self.optimization.status.as_str().to_string(),
            optimization_type: optimization_type.clone(),
            fallback_reason: self.optimization.fallback_reason.clone(),
            tokens_saved,
            savings_amount: savings,
            created_at: self.created_at,
            completed_at,
            duration_ms: duration.as_millis() as u64,
            status,
            error_message: error.map(|e| e.to_string()),
        };
        // The entry is written before charging, so a billed request always has one
        if let Err(e) = self.audit.record(&entry).await {
            tracing::error!(request_id = %self.request_id, user_id = %self.user_id, error = %e, "Failed to write request log, request not billed");
            return Err(e);
        }

        // Zero usage is billed as zero; the balance is left alone
        let balance_after = if cost.total_cost > 0.0 {
            match self.pricing.adjust_balance(&self.user_id, -cost.total_cost).await {
                Ok(balance) => Some(balance),
                Err(e) => {
                    tracing::error!(
                        request_id = %self.request_id,
                        user_id = %self.user_id,
                        total_cost = cost.total_cost,
                        error = %e,
                        "Failed to charge logged request"
                    );
                    return Err(e);
                }
            }
        } else {
            None
        };

        let provider = self.provider.as_str();
        metrics::record_tokens(provider, &model_id, "input", usage.input_tokens);
        metrics::record_tokens(provider, &model_id, "output", usage.output_tokens);
        metrics::record_cost(&model_id, &cost.tier_id, cost.total_cost);
        metrics::record_duration(provider, &model_id, duration);
        if let Some(err) = error {
            metrics::record_error(provider, &model_id, err.kind());
        }

        Ok(ResultMetadata {
            request_id: self.request_id,
            input_tokens: usage.input_tokens,
            output_tokens: usage.output_tokens,
            base_cost: cost.base_cost,
            markup_amount: cost.markup,
            total_cost: cost.total_cost,
            tier_id: cost.tier_id,
            markup_percent: cost.markup_percent,
            custom_pricing_applied: cost.custom_pricing_applied,
            balance_after,
            key_source: self.key_source,
            was_optimized: self.optimization.was_optimized,
            optimization_status: self.optimization.status,
            optimization_type,
            fallback_reason: self.optimization.fallback_reason,
            tokens_saved,
            savings_amount: savings,
            estimated_tokens_saved: self.optimization.prompt.estimated_tokens_saved(),
            model_estimated_tokens_saved: self.optimization.model_estimated_tokens_saved,
            preflight: self.preflight,
            duration_ms: duration.as_millis() as u64,
        })
    }

    /// Meter a request that failed before producing usage
    pub async fn fail(self, error: &GatewayError) {
        let status = match error {
            GatewayError::Cancelled => RequestStatus::Cancelled,
            _ => RequestStatus::Error,
        };
        let request_id = self.request_id.clone();
        if let Err(e) = self.finish(Usage::default(), status, Some(error)).await {
            tracing::error!(request_id = %request_id, error = %e, "Failed to record failed request");
        }
    }
}

/// Normalized stream that meters its request exactly once.
///
/// Metering happens when the stream reaches end (or fails), on
/// [`MeteredStream::close`], or, failing both, in a background task when the
/// stream is dropped.
pub struct MeteredStream {
    inner: NormalizedStream,
    meter: Option<Meter>,
    metadata: Option<ResultMetadata>,
    id: String,
    created_at: DateTime<Utc>,
}

impl MeteredStream {
    pub(crate) fn new(inner: NormalizedStream, meter: Meter) -> Self {
        Self {
            id: meter.request_id.clone(),
            created_at: meter.created_at,
            inner,
            meter: Some(meter),
            metadata: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn provider(&self) -> Provider {
        self.inner.provider()
    }

    pub fn model_id(&self) -> &str {
        self.inner.model_id()
    }

    /// Latched usage so far
    pub fn usage(&self) -> Usage {
        self.inner.usage()
    }

    pub fn finish_reason(&self) -> Option<&str> {
        self.inner.finish_reason()
    }

    /// Set once the request has been metered
    pub fn metadata(&self) -> Option<&ResultMetadata> {
        self.metadata.as_ref()
    }

    /// `Ok(0)` at end of stream, after which the request has been metered
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize, GatewayError> {
        let result = self.inner.read(buf).await;
        self.meter_if_finished().await;
        result
    }

    pub async fn next_fragment(&mut self) -> Result<Option<String>, GatewayError> {
        let result = self.inner.next_fragment().await;
        self.meter_if_finished().await;
        result
    }

    pub async fn read_to_string(&mut self) -> Result<String, GatewayError> {
        let result = self.inner.read_to_string().await;
        self.meter_if_finished().await;
        result
    }

    /// Stop the stream and meter what was used. Idempotent.
    pub async fn close(&mut self) -> Result<Option<ResultMetadata>, GatewayError> {
        let status = self.terminal_status();
        let error = self.inner.error().cloned();
        self.inner.close();
        self.meter_with(status, error.as_ref()).await?;
        Ok(self.metadata.clone())
    }

    fn terminal_status(&self) -> RequestStatus {
        if self.inner.is_eof() {
            RequestStatus::Success
        } else if self.inner.error().is_some() {
            RequestStatus::Error
        } else {
            RequestStatus::Cancelled
        }
    }

    async fn meter_if_finished(&mut self) {
        if self.meter.is_none() || !self.inner.is_finished() {
            return;
        }
        let status = self.terminal_status();
        let error = self.inner.error().cloned();
        if let Err(e) = self.meter_with(status, error.as_ref()).await {
            tracing::error!(request_id = %self.id, error = %e, "Failed to meter stream");
        }
    }

    async fn meter_with(
        &mut self,
        status: RequestStatus,
        error: Option<&GatewayError>,
    ) -> Result<(), GatewayError> {
        let Some(meter) = self.meter.take() else {
            return Ok(());
        };
        let usage = self.inner.usage();
        if usage.is_zero() && status == RequestStatus::Success {
            tracing::warn!(
                request_id = %self.id,
                provider = %self.inner.provider(),
                model = %self.inner.model_id(),
                "Stream ended without reported usage, billing zero"
            );
        }
        self.metadata = Some(meter.finish(usage, status, error).await?);
        Ok(())
    }
}

impl Drop for MeteredStream {
    fn drop(&mut self) {
        let Some(meter) = self.meter.take() else {
            return;
        };
        let usage = self.inner.usage();
        let status = self.terminal_status();
        let error = self.inner.error().cloned();
        self.inner.close();

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    let request_id = meter.request_id.clone();
                    if let Err(e) = meter.finish(usage, status, error.as_ref()).await {
                        tracing::error!(request_id = %request_id, error = %e, "Failed to meter dropped stream");
                    }
                });
            }
            Err(_) => {
                tracing::error!(request_id = %self.id, "Stream dropped outside a runtime, request not metered");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ai_result(aux_input: u64) -> OptimizationResult {
        let mut result = OptimizationResult::not_attempted("some long prompt text");
        result.was_optimized = true;
        result.optimization_type = Some(OptimizationType::AiBased);
        result.status = OptimizationStatus::Success;
        result.aux_usage = Some(Usage::new(aux_input, 20));
        result
    }

    #[test]
    fn test_savings_need_real_usage_on_both_sides() {
        assert_eq!(billed_tokens_saved(&ai_result(120), &Usage::new(80, 10)), 40);
        assert_eq!(billed_tokens_saved(&ai_result(0), &Usage::new(80, 10)), 0);
        assert_eq!(billed_tokens_saved(&ai_result(120), &Usage::new(0, 0)), 0);
        // Never negative
        assert_eq!(billed_tokens_saved(&ai_result(50), &Usage::new(80, 10)), 0);
    }

    #[test]
    fn test_rule_based_savings_are_advisory() {
        let mut result = ai_result(120);
        result.optimization_type = Some(OptimizationType::RuleBased);
        assert_eq!(billed_tokens_saved(&result, &Usage::new(80, 10)), 0);
    }

    #[test]
    fn test_response_failure_status() {
        let mut failed = OptimizationResult::not_attempted("x");
        failed.status = OptimizationStatus::Failed;

        let prompt_ok = ai_result(10);
        let outcome = OptimizationOutcome::from_prompt(prompt_ok).with_response(&failed);
        assert_eq!(outcome.status, OptimizationStatus::PartialSuccess);
        assert_eq!(outcome.fallback_reason.as_deref(), Some("response_optimization_failed"));

        let untouched = OptimizationResult::not_attempted("x");
        let outcome = OptimizationOutcome::from_prompt(untouched).with_response(&failed);
        assert_eq!(outcome.status, OptimizationStatus::Failed);
    }
}
