//! Request orchestration
//!
//! Per request: optimize (optional) → select adapter → generate → meter →
//! log. Streaming requests are metered when their stream ends, closes or is
//! dropped, whichever happens first.

pub mod metered;
pub mod request;

use chrono::Utc;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use crate::audit::{AuditLog, RequestStatus};
use crate::config::{Config, GenerationDefaults};
use crate::error::GatewayError;
use crate::metrics;
use crate::optimizer::{
    OptimizationMode, OptimizationResult, Optimizer, OUTPUT_EFFICIENCY_HINT,
};
use crate::pricing::PricingService;
use crate::providers::{ClientFactory, Credentials, Provider, ResolvedClient};
use crate::store::Store;
use crate::tokens::TokenCounter;

use metered::{Meter, OptimizationOutcome};

pub use metered::{billed_tokens_saved, MeteredStream};
pub use request::{GenerationRequest, GenerationResult, ResultMetadata, ResultUsage};

/// A request that passed validation, pricing and adapter selection
struct Prepared {
    meter: Meter,
    client: ResolvedClient,
    mode: OptimizationMode,
}

pub struct GenerationService {
    factory: Arc<dyn ClientFactory>,
    pricing: Arc<PricingService>,
    audit: Arc<AuditLog>,
    optimizer: Option<Arc<Optimizer>>,
    tokens: Arc<TokenCounter>,
    defaults: GenerationDefaults,
    optimize_responses: bool,
}

impl GenerationService {
    /// Wire the pipeline from configuration. The optimizer is built with
    /// server credentials; if that fails, requests run unoptimized.
    pub fn new(factory: Arc<dyn ClientFactory>, store: Arc<dyn Store>, config: &Config) -> Self {
        let optimizer = if config.optimization.enabled {
            build_optimizer(factory.as_ref(), config)
        } else {
            None
        };

        Self {
            pricing: Arc::new(PricingService::new(
                store.clone(),
                Duration::from_secs(config.cache.ttl_seconds),
            )),
            audit: Arc::new(AuditLog::new(store)),
            optimizer,
            tokens: Arc::new(TokenCounter::new()),
            defaults: config.generation.clone(),
            optimize_responses: config.optimization.optimize_responses,
            factory,
        }
    }

    /// Replace the configured optimizer
    pub fn with_optimizer(mut self, optimizer: Option<Optimizer>) -> Self {
        self.optimizer = optimizer.map(Arc::new);
        self
    }

    pub fn with_token_counter(mut self, tokens: Arc<TokenCounter>) -> Self {
        self.tokens = tokens;
        self
    }

    pub fn pricing(&self) -> &Arc<PricingService> {
        &self.pricing
    }

    pub fn audit(&self) -> &Arc<AuditLog> {
        &self.audit
    }

    /// Blocking generation
    pub async fn generate(
        &self,
        request: &GenerationRequest,
        cancel: &CancellationToken,
    ) -> Result<GenerationResult, GatewayError> {
        let prepared = self.prepare(request, false).await?;
        let Prepared { mut meter, client, mode } = prepared;
        let model_id = meter.context.model.model_id.clone();

        let prompt_result = match self.optimize_prompt(&request.prompt, mode, cancel).await {
            Ok(result) => result,
            Err(e) => {
                meter.fail(&e).await;
                return Err(e);
            }
        };
        let params = request.params(prompt_result.optimized_text.clone(), &self.defaults);
        meter.optimization = OptimizationOutcome::from_prompt(prompt_result);

        metrics::record_request(client.client.provider().as_str(), &model_id, "blocking");
        let response = match client.client.generate(&params, cancel).await {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!(
                    request_id = %meter.request_id,
                    provider = %client.client.provider(),
                    model = %model_id,
                    error = %e,
                    "Generation failed"
                );
                meter.fail(&e).await;
                return Err(e);
            }
        };

        let mut text = response.text;
        if let Some(optimizer) = self.optimizer.as_ref().filter(|_| self.optimize_responses) {
            match optimizer.optimize_response_with_mode(&text, mode, cancel).await {
                Ok(result) => {
                    if result.was_optimized {
                        text = result.optimized_text.clone();
                    }
                    meter.optimization = meter.optimization.with_response(&result);
                }
                Err(e) => {
                    // Primary call already ran; bill it before surfacing the error
                    if let Err(meter_err) = meter.finish(response.usage, RequestStatus::Error, Some(&e)).await {
                        tracing::error!(error = %meter_err, "Failed to meter request");
                    }
                    return Err(e);
                }
            }
        }

        let id = meter.request_id.clone();
        let created_at = meter.created_at;
        let metadata = meter.finish(response.usage, RequestStatus::Success, None).await?;

        Ok(GenerationResult {
            id,
            text,
            model: model_id,
            provider: response.provider,
            usage: response.usage.into(),
            finish_reason: response.finish_reason,
            created_at,
            metadata,
        })
    }

    /// Streaming generation. The returned stream carries result metadata
    /// once it has been drained or closed.
    pub async fn generate_stream(
        &self,
        request: &GenerationRequest,
        cancel: &CancellationToken,
    ) -> Result<MeteredStream, GatewayError> {
        let prepared = self.prepare(request, true).await?;
        let Prepared { mut meter, client, mode } = prepared;
        let model_id = meter.context.model.model_id.clone();

        let prompt_result = match self.optimize_prompt(&request.prompt, mode, cancel).await {
            Ok(result) => result,
            Err(e) => {
                meter.fail(&e).await;
                return Err(e);
            }
        };
        let mut prompt = prompt_result.optimized_text.clone();
        if prompt_result.was_optimized {
            prompt.push_str(OUTPUT_EFFICIENCY_HINT);
        }
        let params = request.params(prompt, &self.defaults);
        meter.optimization = OptimizationOutcome::from_prompt(prompt_result);

        metrics::record_request(client.client.provider().as_str(), &model_id, "stream");
        match client.client.generate_stream(&params, cancel).await {
            Ok(handle) => Ok(MeteredStream::new(handle.into_reader(), meter)),
            Err(e) => {
                tracing::warn!(
                    request_id = %meter.request_id,
                    provider = %client.client.provider(),
                    model = %model_id,
                    error = %e,
                    "Stream setup failed"
                );
                meter.fail(&e).await;
                Err(e)
            }
        }
    }

    /// Validate, resolve pricing and pick the adapter
    async fn prepare(&self, request: &GenerationRequest, streamed: bool) -> Result<Prepared, GatewayError> {
        request.validate()?;

        let account = self.pricing.active_account(&request.user_id).await?;
        let model = self.pricing.get_model_config(&request.model).await?;
        let tier = self.pricing.tier_for(&account).await?;
        let context = crate::pricing::PricingContext { account, tier, model };

        let provider = context
            .model
            .provider()
            .ok_or_else(|| GatewayError::Config(format!("no provider for model {}", request.model)))?;
        let client = self
            .factory
            .client_for(&context.model.model_id, provider, &request.credentials)?;

        let preflight = self.pricing.preflight_estimate(
            &context,
            &request.prompt,
            request.effective_max_tokens(&self.defaults),
            &self.tokens,
        );

        let request_id = uuid::Uuid::new_v4().to_string();
        tracing::info!(
            request_id = %request_id,
            user_id = %request.user_id,
            model = %context.model.model_id,
            provider = %provider,
            key_source = client.key_source.as_str(),
            streamed,
            estimated_cost = preflight.estimated_cost,
            "Generation request received"
        );

        let meter = Meter {
            request_id,
            user_id: request.user_id.clone(),
            api_key_id: request.api_key_id.clone(),
            provider,
            key_source: client.key_source,
            streamed,
            context,
            preflight,
            optimization: OptimizationOutcome::from_prompt(OptimizationResult::not_attempted(&request.prompt)),
            created_at: Utc::now(),
            started: Instant::now(),
            pricing: self.pricing.clone(),
            audit: self.audit.clone(),
        };

        Ok(Prepared { meter, client, mode: request.mode() })
    }

    async fn optimize_prompt(
        &self,
        prompt: &str,
        mode: OptimizationMode,
        cancel: &CancellationToken,
    ) -> Result<OptimizationResult, GatewayError> {
        let Some(optimizer) = &self.optimizer else {
            return Ok(OptimizationResult::not_attempted(prompt));
        };
        let result = optimizer.optimize_prompt_with_mode(prompt, mode, cancel).await?;
        metrics::record_optimization(
            result.status.as_str(),
            result.optimization_type.map_or("none", |t| t.as_str()),
        );
        Ok(result)
    }
}

fn build_optimizer(factory: &dyn ClientFactory, config: &Config) -> Option<Arc<Optimizer>> {
    let model = &config.optimization.model;
    let Some(provider) = Provider::from_model_id(model) else {
        tracing::warn!(model = %model, "Cannot determine provider for optimization model, optimizer disabled");
        return None;
    };

    match factory.client_for(model, provider, &Credentials::default()) {
        Ok(resolved) => Some(Arc::new(Optimizer::new(resolved.client, config.optimization.clone()))),
        Err(e) => {
            tracing::warn!(model = %model, error = %e, "Optimization model unavailable, optimizer disabled");
            None
        }
    }
}
