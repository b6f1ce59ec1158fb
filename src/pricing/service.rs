use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

use crate::cache::{CacheStats, LoadFuture, TtlCache};
use crate::error::GatewayError;
use crate::pricing::calculator;
use crate::pricing::catalog::ModelCatalog;
use crate::pricing::models::{Account, CostBreakdown, ModelConfig, PricingTier};
use crate::store::{self, Query, Store};
use crate::tokens::TokenCounter;

/// Everything needed to price one request, resolved once up front
#[derive(Debug, Clone)]
pub struct PricingContext {
    pub account: Account,
    pub tier: PricingTier,
    pub model: ModelConfig,
}

impl PricingContext {
    pub fn cost(&self, input_tokens: u64, output_tokens: u64) -> CostBreakdown {
        calculator::calculate_cost(&self.account, &self.tier, &self.model, input_tokens, output_tokens)
    }

    /// Input price after any custom override
    pub fn effective_input_price(&self) -> f64 {
        calculator::effective_prices(&self.account, &self.tier, &self.model).0
    }
}

/// Advisory cost estimate computed before generating; never billed
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PreflightEstimate {
    pub estimated_input_tokens: u64,
    pub estimated_output_tokens: u64,
    pub estimated_cost: f64,
    pub balance: f64,
    pub sufficient_funds: bool,
}

/// Model, tier and account lookups (cached) plus balance adjustment
pub struct PricingService {
    store: Arc<dyn Store>,
    catalog: ModelCatalog,
    tiers: TtlCache<String, PricingTier>,
    default_tier: TtlCache<(), PricingTier>,
    accounts: TtlCache<String, Account>,
}

impl PricingService {
    pub fn new(store: Arc<dyn Store>, ttl: Duration) -> Self {
        Self {
            catalog: ModelCatalog::new(store.clone(), ttl),
            tiers: TtlCache::new("pricing_tiers", ttl),
            default_tier: TtlCache::new("default_tier", ttl),
            accounts: TtlCache::new("accounts", ttl),
            store,
        }
    }

    pub fn catalog(&self) -> &ModelCatalog {
        &self.catalog
    }

    /// Active model with a resolvable provider
    pub async fn get_model_config(&self, model_id: &str) -> Result<ModelConfig, GatewayError> {
        let model = self
            .catalog
            .get(model_id)
            .await?
            .ok_or_else(|| GatewayError::Config(format!("unknown model: {}", model_id)))?;

        if !model.is_active {
            return Err(GatewayError::Config(format!("model is not active: {}", model_id)));
        }
        if model.provider().is_none() {
            return Err(GatewayError::Config(format!(
                "cannot determine provider for model: {}",
                model_id
            )));
        }
        Ok(model)
    }

    /// Cached account snapshot; a missing account is a store error
    pub async fn get_account(&self, user_id: &str) -> Result<Account, GatewayError> {
        let store = self.store.clone();
        let id = user_id.to_string();
        self.accounts
            .get_with(user_id.to_string(), move || -> LoadFuture<Account> {
                Box::pin(async move {
                    store::get_as::<Account>(store.as_ref(), store::USERS, &id)
                        .await?
                        .ok_or_else(|| GatewayError::Store(format!("account not found: {}", id)))
                })
            })
            .await
    }

    /// Account that is allowed to generate. Balance is not checked.
    pub async fn active_account(&self, user_id: &str) -> Result<Account, GatewayError> {
        let account = self.get_account(user_id).await?;
        if !account.is_active {
            return Err(GatewayError::Balance(format!("account {} is not active", user_id)));
        }
        Ok(account)
    }

    /// Active non-custom tier with valid markups and the lowest minimum monthly spend
    pub async fn default_tier(&self) -> Result<PricingTier, GatewayError> {
        let store = self.store.clone();
        self.default_tier
            .get_with((), move || -> LoadFuture<PricingTier> {
                Box::pin(async move {
                    let query = Query::new()
                        .eq("is_active", true)
                        .eq("is_custom", false)
                        .order_by("min_monthly_spend");
                    store::query_as::<PricingTier>(store.as_ref(), store::PRICING_TIERS, &query)
                        .await?
                        .into_iter()
                        .find(|tier| {
                            if !tier.has_valid_markups() {
                                tracing::warn!(tier_id = %tier.tier_id, "Skipping pricing tier with negative markup");
                            }
                            tier.has_valid_markups()
                        })
                        .ok_or_else(|| GatewayError::Config("no default pricing tier configured".into()))
                })
            })
            .await
    }

    /// Account's tier, or the default tier when it is missing, inactive or unreadable
    pub async fn tier_for(&self, account: &Account) -> Result<PricingTier, GatewayError> {
        let store = self.store.clone();
        let tier_id = account.tier_id.clone();
        let lookup = self
            .tiers
            .get_with(account.tier_id.clone(), move || -> LoadFuture<PricingTier> {
                Box::pin(async move {
                    store::get_as::<PricingTier>(store.as_ref(), store::PRICING_TIERS, &tier_id)
                        .await?
                        .ok_or_else(|| GatewayError::Store(format!("pricing tier not found: {}", tier_id)))
                })
            })
            .await;

        match lookup {
            Ok(tier) if !tier.has_valid_markups() => {
                tracing::warn!(
                    tier_id = %tier.tier_id,
                    user_id = %account.id,
                    input_markup_percent = tier.input_markup_percent,
                    output_markup_percent = tier.output_markup_percent,
                    "Pricing tier has negative markup, using default tier"
                );
                self.default_tier().await
            }
            Ok(tier) if tier.is_active => Ok(tier),
            Ok(tier) => {
                tracing::warn!(tier_id = %tier.tier_id, user_id = %account.id, "Pricing tier inactive, using default tier");
                self.default_tier().await
            }
            Err(e) => {
                tracing::warn!(tier_id = %account.tier_id, user_id = %account.id, error = %e, "Pricing tier lookup failed, using default tier");
                self.default_tier().await
            }
        }
    }

    pub async fn pricing_context(&self, user_id: &str, model_id: &str) -> Result<PricingContext, GatewayError> {
        let account = self.get_account(user_id).await?;
        let model = self.get_model_config(model_id).await?;
        let tier = self.tier_for(&account).await?;
        Ok(PricingContext { account, tier, model })
    }

    pub async fn resolve_cost(
        &self,
        user_id: &str,
        model_id: &str,
        input_tokens: u64,
        output_tokens: u64,
    ) -> Result<CostBreakdown, GatewayError> {
        let context = self.pricing_context(user_id, model_id).await?;
        let cost = context.cost(input_tokens, output_tokens);
        tracing::debug!(
            user_id,
            model = %model_id,
            tier_id = %cost.tier_id,
            input_tokens,
            output_tokens,
            total_cost = cost.total_cost,
            "Resolved request cost"
        );
        Ok(cost)
    }

    /// Estimated cost from a tokenizer count of the prompt and the output ceiling
    pub fn preflight_estimate(
        &self,
        context: &PricingContext,
        prompt: &str,
        max_tokens: u32,
        counter: &TokenCounter,
    ) -> PreflightEstimate {
        let estimated_input_tokens = counter.count_for_model(prompt, &context.model.model_id);
        let estimated_output_tokens = u64::from(max_tokens);
        let estimated_cost = context.cost(estimated_input_tokens, estimated_output_tokens).total_cost;
        let balance = context.account.balance;
        let sufficient_funds = balance >= estimated_cost;

        if !sufficient_funds {
            tracing::warn!(
                user_id = %context.account.id,
                model = %context.model.model_id,
                balance,
                estimated_cost,
                "Balance below estimated cost, proceeding (overdraft allowed)"
            );
        } else {
            tracing::debug!(
                user_id = %context.account.id,
                estimated_input_tokens,
                estimated_output_tokens,
                estimated_cost,
                "Pre-flight estimate"
            );
        }

        PreflightEstimate {
            estimated_input_tokens,
            estimated_output_tokens,
            estimated_cost,
            balance,
            sufficient_funds,
        }
    }

    /// Add `delta` to the balance atomically at the store. No funds check.
    pub async fn adjust_balance(&self, user_id: &str, delta: f64) -> Result<f64, GatewayError> {
        let updated = self
            .store
            .run_atomic(
                store::USERS,
                user_id,
                Box::new(move |doc: &mut Value| {
                    let current = doc.get("balance").and_then(Value::as_f64).unwrap_or(0.0);
                    doc["balance"] = json!(current + delta);
                    Ok(())
                }),
            )
            .await?;

        self.accounts.invalidate(&user_id.to_string()).await;

        let balance = updated.get("balance").and_then(Value::as_f64).unwrap_or(0.0);
        tracing::info!(user_id, delta, balance, "Adjusted account balance");
        Ok(balance)
    }

    pub fn calculate_savings_fee(&self, tier: &PricingTier, input_tokens_saved: u64, output_tokens_saved: u64) -> f64 {
        calculator::savings_fee(tier, input_tokens_saved, output_tokens_saved)
    }

    pub async fn cache_stats(&self) -> Vec<CacheStats> {
        vec![
            self.catalog.stats().await,
            self.tiers.stats().await,
            self.default_tier.stats().await,
            self.accounts.stats().await,
        ]
    }
}
