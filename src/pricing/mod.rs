//! Pricing and metering
//!
//! Costs are priced per million tokens; tiers add a percentage markup per
//! direction. Balances are adjusted through the store's atomic primitive and
//! may go negative.

pub mod calculator;
pub mod catalog;
pub mod models;
pub mod service;

pub use catalog::{default_catalog, ModelCatalog};
pub use models::{Account, CostBreakdown, ModelConfig, ModelPricing, PricingTier};
pub use service::{PreflightEstimate, PricingContext, PricingService};
