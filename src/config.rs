use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::providers::Provider;

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub providers: ProvidersConfig,
    pub optimization: OptimizationConfig,
    pub cache: CacheConfig,
    pub store: StoreConfig,
    pub logging: LoggingConfig,
    pub generation: GenerationDefaults,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ProvidersConfig {
    pub openai: ProviderConfig,
    pub anthropic: AnthropicConfig,
    pub gemini: ProviderConfig,
}

impl Default for ProvidersConfig {
    fn default() -> Self {
        Self {
            openai: ProviderConfig::with_base_url("https://api.openai.com/v1"),
            anthropic: AnthropicConfig::default(),
            gemini: ProviderConfig::with_base_url(
                "https://generativelanguage.googleapis.com/v1beta",
            ),
        }
    }
}

impl ProvidersConfig {
    /// Connection settings shared by every provider kind
    pub fn connection(&self, provider: Provider) -> &ProviderConfig {
        match provider {
            Provider::OpenAI => &self.openai,
            Provider::Anthropic => &self.anthropic.connection,
            Provider::Google => &self.gemini,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ProviderConfig {
    pub enabled: bool,
    /// Server-side credential; empty means only caller-supplied keys work.
    pub api_key: String,
    pub base_url: String,
    pub timeout_seconds: u64,
}

impl ProviderConfig {
    fn with_base_url(base_url: &str) -> Self {
        Self {
            enabled: true,
            api_key: String::new(),
            base_url: base_url.to_string(),
            timeout_seconds: 120,
        }
    }

    pub fn has_server_key(&self) -> bool {
        self.enabled && !self.api_key.trim().is_empty()
    }
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self::with_base_url("")
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AnthropicConfig {
    #[serde(flatten)]
    pub connection: ProviderConfig,
    pub api_version: String,
}

impl Default for AnthropicConfig {
    fn default() -> Self {
        Self {
            connection: ProviderConfig::with_base_url("https://api.anthropic.com/v1"),
            api_version: "2023-06-01".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct OptimizationConfig {
    pub enabled: bool,
    /// When false, an auxiliary-model failure fails the whole request.
    pub fallback_on_failure: bool,
    /// Low-cost model used for the model-based pass
    pub model: String,
    pub prompt_threshold: usize,
    pub response_threshold: usize,
    pub optimize_responses: bool,
}

impl Default for OptimizationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            fallback_on_failure: true,
            model: "gemini-2.0-flash".to_string(),
            prompt_threshold: 50,
            response_threshold: 100,
            optimize_responses: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CacheConfig {
    pub ttl_seconds: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { ttl_seconds: 300 }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StoreConfig {
    pub database_url: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite://./data/gateway.db".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    /// "plain" or "json"
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "plain".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct GenerationDefaults {
    pub max_tokens: u32,
    pub temperature: f64,
    pub top_p: f64,
}

impl Default for GenerationDefaults {
    fn default() -> Self {
        Self {
            max_tokens: 1000,
            temperature: 0.7,
            top_p: 1.0,
        }
    }
}

/// Load `config.toml` (optional) overlaid with `METERED_GATEWAY__*` variables
pub fn load_config() -> anyhow::Result<Config> {
    load_config_from(Path::new("config"))
}

pub fn load_config_from(path: &Path) -> anyhow::Result<Config> {
    let source = path.to_string_lossy();
    let config = config::Config::builder()
        .add_source(config::File::with_name(&source).required(false))
        .add_source(config::Environment::with_prefix("METERED_GATEWAY").separator("__"))
        .build()?;

    let mut cfg: Config = config.try_deserialize()?;
    apply_provider_env_keys(&mut cfg);
    validate_config(&cfg)?;

    Ok(cfg)
}

/// Conventional provider variables fill in server keys left empty by the file
fn apply_provider_env_keys(cfg: &mut Config) {
    let slots = [
        ("OPENAI_API_KEY", &mut cfg.providers.openai.api_key),
        ("ANTHROPIC_API_KEY", &mut cfg.providers.anthropic.connection.api_key),
        ("GOOGLE_API_KEY", &mut cfg.providers.gemini.api_key),
    ];
    for (var, slot) in slots {
        if slot.is_empty() {
            if let Ok(value) = std::env::var(var) {
                *slot = value;
            }
        }
    }
}

pub(crate) fn validate_config(cfg: &Config) -> anyhow::Result<()> {
    if ![Provider::OpenAI, Provider::Anthropic, Provider::Google]
        .iter()
        .any(|p| cfg.providers.connection(*p).enabled)
    {
        anyhow::bail!("At least one provider must be enabled");
    }

    if cfg.cache.ttl_seconds == 0 {
        anyhow::bail!("cache.ttl_seconds must be greater than zero");
    }

    match cfg.logging.format.as_str() {
        "plain" | "json" => {}
        other => anyhow::bail!("Invalid logging format '{}', expected plain or json", other),
    }

    if cfg.optimization.enabled {
        if cfg.optimization.model.is_empty() {
            anyhow::bail!("optimization.model cannot be empty when optimization is enabled");
        }
        if let Some(provider) = Provider::from_model_id(&cfg.optimization.model) {
            if !cfg.providers.connection(provider).enabled {
                anyhow::bail!(
                    "Optimization model '{}' uses {} provider, but {} is disabled",
                    cfg.optimization.model,
                    provider,
                    provider
                );
            }
        }
    }

    Ok(())
}
