use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::cache::{CacheStats, LoadFuture, TtlCache};
use crate::error::GatewayError;
use crate::pricing::models::ModelConfig;
use crate::providers::Provider;
use crate::store::{self, Query, Store};

type Catalog = Arc<HashMap<String, ModelConfig>>;

const CATALOG_KEY: &str = "all";

/// Public list prices used when the store holds no model configurations
pub fn default_catalog() -> Vec<ModelConfig> {
    use Provider::{Anthropic, Google, OpenAI};

    let entries: &[(&str, Provider, f64, f64, u64)] = &[
        ("gpt-4.1-2025-04-14", OpenAI, 2.00, 8.00, 128_000),
        ("gpt-4.1-mini-2025-04-14", OpenAI, 0.40, 1.60, 128_000),
        ("gpt-4.1-nano-2025-04-14", OpenAI, 0.10, 0.40, 128_000),
        ("gpt-4.5-preview-2025-02-27", OpenAI, 75.00, 150.00, 128_000),
        ("gpt-4o-2024-08-06", OpenAI, 2.50, 10.00, 128_000),
        ("gpt-4o-2024-11-20", OpenAI, 2.50, 10.00, 128_000),
        ("gpt-4o-2024-05-13", OpenAI, 5.00, 15.00, 128_000),
        ("gpt-4o-mini-2024-07-18", OpenAI, 0.15, 0.60, 128_000),
        ("o1-2024-12-17", OpenAI, 15.00, 60.00, 128_000),
        ("o3-2025-04-16", OpenAI, 2.00, 8.00, 128_000),
        ("o3-mini-2025-01-31", OpenAI, 1.10, 4.40, 128_000),
        ("o1-mini-2024-09-12", OpenAI, 1.10, 4.40, 128_000),
        ("codex-mini-latest", OpenAI, 1.50, 6.00, 128_000),
        ("gemini-2.5-pro", Google, 1.25, 10.00, 1_000_000),
        ("gemini-2.5-flash", Google, 0.30, 2.50, 1_000_000),
        ("gemini-2.5-flash-lite-preview-06-17", Google, 0.10, 0.40, 1_000_000),
        ("gemini-2.0-flash", Google, 0.075, 0.30, 1_048_576),
        ("gemini-2.0-flash-lite", Google, 0.05, 0.20, 1_048_576),
        ("gemini-1.5-flash", Google, 0.075, 0.30, 1_048_576),
        ("gemini-1.5-flash-8b", Google, 0.05, 0.20, 1_048_576),
        ("gemini-1.5-pro", Google, 3.50, 10.50, 1_048_576),
        ("claude-opus-4-20250514", Anthropic, 15.00, 75.00, 200_000),
        ("claude-sonnet-4-20250514", Anthropic, 3.00, 15.00, 200_000),
        ("claude-3-7-sonnet-20250219", Anthropic, 3.00, 15.00, 200_000),
        ("claude-3-5-sonnet-20241022", Anthropic, 3.00, 15.00, 200_000),
        ("claude-3-5-sonnet-20240620", Anthropic, 3.00, 15.00, 200_000),
        ("claude-3-5-haiku-20241022", Anthropic, 0.80, 4.00, 200_000),
        ("claude-3-opus-20240229", Anthropic, 15.00, 75.00, 200_000),
        ("claude-3-haiku-20240307", Anthropic, 0.25, 1.25, 200_000),
        ("claude-opus-4-0", Anthropic, 15.00, 75.00, 200_000),
        ("claude-sonnet-4-0", Anthropic, 3.00, 15.00, 200_000),
        ("claude-3-7-sonnet-latest", Anthropic, 3.00, 15.00, 200_000),
        ("claude-3-5-sonnet-latest", Anthropic, 3.00, 15.00, 200_000),
        ("claude-3-5-haiku-latest", Anthropic, 0.80, 4.00, 200_000),
    ];

    entries
        .iter()
        .map(|(id, provider, input, output, context)| {
            ModelConfig::new(id, *provider, *input, *output, *context)
        })
        .collect()
}

/// Bulk-loaded model configurations, refreshed in the background on expiry
pub struct ModelCatalog {
    store: Arc<dyn Store>,
    cache: TtlCache<&'static str, Catalog>,
}

impl ModelCatalog {
    pub fn new(store: Arc<dyn Store>, ttl: Duration) -> Self {
        Self {
            store,
            cache: TtlCache::new("model_configurations", ttl),
        }
    }

    /// Every known model, active or not
    pub async fn all(&self) -> Result<Catalog, GatewayError> {
        let store = self.store.clone();
        self.cache
            .get_with(CATALOG_KEY, move || -> LoadFuture<Catalog> {
                Box::pin(load_catalog(store))
            })
            .await
    }

    pub async fn get(&self, model_id: &str) -> Result<Option<ModelConfig>, GatewayError> {
        Ok(self.all().await?.get(model_id).cloned())
    }

    /// Drop the cached catalog; the next lookup reloads from the store
    pub async fn invalidate(&self) {
        self.cache.invalidate(&CATALOG_KEY).await;
    }

    pub async fn stats(&self) -> CacheStats {
        let mut stats = self.cache.stats().await;
        if let Some(catalog) = self.cache.peek(&CATALOG_KEY).await {
            stats.entries = catalog.len();
        }
        stats
    }
}

async fn load_catalog(store: Arc<dyn Store>) -> Result<Catalog, GatewayError> {
    let loaded = store::query_as::<ModelConfig>(
        store.as_ref(),
        store::MODEL_CONFIGURATIONS,
        &Query::new(),
    )
    .await;

    let models = match loaded {
        Ok(models) if !models.is_empty() => {
            tracing::info!(count = models.len(), "Loaded model configurations from store");
            models
        }
        Ok(_) => {
            tracing::info!("No model configurations in store, using default catalog");
            default_catalog()
        }
        Err(e) => {
            tracing::warn!(error = %e, "Failed to load model configurations, using default catalog");
            default_catalog()
        }
    };

    Ok(Arc::new(
        models.into_iter().map(|m| (m.model_id.clone(), m)).collect(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[test]
    fn test_default_catalog_is_resolvable() {
        let catalog = default_catalog();
        assert!(catalog.len() > 30);
        for model in &catalog {
            assert!(model.provider().is_some(), "{} has no provider", model.model_id);
            assert!(model.is_active);
        }

        let gpt = catalog.iter().find(|m| m.model_id == "gpt-4.1-2025-04-14").unwrap();
        assert_eq!(gpt.input_price_per_million, 2.0);
        assert_eq!(gpt.output_price_per_million, 8.0);
    }

    #[tokio::test]
    async fn test_empty_store_uses_default_catalog() {
        let catalog = ModelCatalog::new(Arc::new(MemoryStore::new()), Duration::from_secs(300));

        let model = catalog.get("gemini-2.0-flash").await.unwrap().unwrap();
        assert_eq!(model.provider(), Some(Provider::Google));
        assert!(catalog.get("no-such-model").await.unwrap().is_none());

        let stats = catalog.stats().await;
        assert_eq!(stats.entries, default_catalog().len());
        assert_eq!(stats.ttl_seconds, 300);
        assert!(!stats.should_refresh);
    }

    #[tokio::test]
    async fn test_store_catalog_replaces_defaults() {
        let store = Arc::new(MemoryStore::new());
        let model = ModelConfig::new("m1", Provider::OpenAI, 2.0, 8.0, 128_000);
        store::put_as(store.as_ref(), store::MODEL_CONFIGURATIONS, "m1", &model)
            .await
            .unwrap();

        let catalog = ModelCatalog::new(store.clone(), Duration::from_secs(300));
        assert_eq!(catalog.get("m1").await.unwrap(), Some(model));
        assert!(catalog.get("gpt-4.1-2025-04-14").await.unwrap().is_none());

        // Cached until invalidated
        let other = ModelConfig::new("m2", Provider::Google, 0.1, 0.2, 1000);
        store::put_as(store.as_ref(), store::MODEL_CONFIGURATIONS, "m2", &other)
            .await
            .unwrap();
        assert!(catalog.get("m2").await.unwrap().is_none());
        catalog.invalidate().await;
        assert!(catalog.get("m2").await.unwrap().is_some());
    }
}
