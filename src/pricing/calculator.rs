use crate::pricing::models::{Account, CostBreakdown, ModelConfig, PricingTier};

/// Prices (per million) that apply to this account on this model.
///
/// A tier override is used only when the account opted in and the tier
/// carries an entry for the model.
pub fn effective_prices(account: &Account, tier: &PricingTier, model: &ModelConfig) -> (f64, f64, bool) {
    if account.custom_pricing {
        if let Some(pricing) = tier.custom_model_pricing.get(&model.model_id) {
            return (pricing.input_price_per_million, pricing.output_price_per_million, true);
        }
    }
    (model.input_price_per_million, model.output_price_per_million, false)
}

/// Base cost plus per-direction percentage markup. Pure.
pub fn calculate_cost(
    account: &Account,
    tier: &PricingTier,
    model: &ModelConfig,
    input_tokens: u64,
    output_tokens: u64,
) -> CostBreakdown {
    let (input_price, output_price, custom) = effective_prices(account, tier, model);

    let input_cost = (input_tokens as f64 / 1_000_000.0) * input_price;
    let output_cost = (output_tokens as f64 / 1_000_000.0) * output_price;

    let mut breakdown = CostBreakdown {
        model_id: model.model_id.clone(),
        tier_id: tier.tier_id.clone(),
        input_tokens,
        output_tokens,
        input_price_per_million: input_price,
        output_price_per_million: output_price,
        custom_pricing_applied: custom,
        input_cost,
        output_cost,
        input_markup: input_cost * (tier.input_markup_percent / 100.0),
        output_markup: output_cost * (tier.output_markup_percent / 100.0),
        markup_percent: tier.average_markup_percent(),
        ..Default::default()
    };
    breakdown.calculate_total();
    breakdown
}

/// Value of saved input tokens at the effective input price
pub fn savings_amount(tokens_saved: u64, input_price_per_million: f64) -> f64 {
    tokens_saved as f64 / 1_000_000.0 * input_price_per_million
}

/// Tier-markup fee on saved tokens
pub fn savings_fee(tier: &PricingTier, input_tokens_saved: u64, output_tokens_saved: u64) -> f64 {
    let input = input_tokens_saved as f64 * (tier.input_markup_percent / 100.0) / 1_000_000.0;
    let output = output_tokens_saved as f64 * (tier.output_markup_percent / 100.0) / 1_000_000.0;
    input + output
}
