//! Backend adapters
//!
//! Every provider implements [`GenerationClient`]: a blocking `generate`
//! and a `generate_stream` returning a [`StreamHandle`]. Usage reported by
//! an adapter always comes from the backend's own token counts; when the
//! backend reports nothing the adapter reports zero.

pub mod anthropic;
pub mod gemini;
pub mod openai;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::config::ProvidersConfig;
use crate::error::{GatewayError, ProviderError};
use crate::logging::SensitiveApiKey;
use crate::streaming::StreamHandle;

pub use anthropic::AnthropicClient;
pub use gemini::GeminiClient;
pub use openai::OpenAiClient;

/// Backend identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    OpenAI,
    Anthropic,
    #[serde(alias = "gemini")]
    Google,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OpenAI => "openai",
            Self::Anthropic => "anthropic",
            Self::Google => "google",
        }
    }

    /// Infer the provider from the conventional model name prefix
    pub fn from_model_id(model_id: &str) -> Option<Self> {
        let model = model_id.to_ascii_lowercase();
        if model.starts_with("gpt") || model.starts_with("o1") || model.starts_with("o3") || model.starts_with("o4") {
            Some(Self::OpenAI)
        } else if model.starts_with("claude") {
            Some(Self::Anthropic)
        } else if model.starts_with("gemini") {
            Some(Self::Google)
        } else {
            None
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Provider {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "openai" => Ok(Self::OpenAI),
            "anthropic" => Ok(Self::Anthropic),
            "google" | "gemini" => Ok(Self::Google),
            other => Err(GatewayError::Config(format!("unsupported provider: {}", other))),
        }
    }
}

/// Token counts as reported by a backend
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl Usage {
    pub fn new(input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            input_tokens,
            output_tokens,
        }
    }

    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }

    pub fn is_zero(&self) -> bool {
        self.input_tokens == 0 && self.output_tokens == 0
    }
}

/// Parameters of one generation call
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerateParams {
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    /// Provider-specific extras, merged verbatim into the request body
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl GenerateParams {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Default::default()
        }
    }

    pub fn max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn temperature(mut self, temperature: f64) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn top_p(mut self, top_p: f64) -> Self {
        self.top_p = Some(top_p);
        self
    }

    /// Reject params no backend would accept
    pub(crate) fn validate(&self, provider: Provider, model_id: &str) -> Result<(), ProviderError> {
        if self.prompt.is_empty() {
            return Err(ProviderError::permanent(
                provider.as_str(),
                model_id,
                "prompt parameter is required and must be a non-empty string",
            ));
        }
        Ok(())
    }
}

/// Blocking generation result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerateResponse {
    pub text: String,
    pub usage: Usage,
    pub finish_reason: Option<String>,
    pub model_id: String,
    pub provider: Provider,
}

/// Common capability of every backend adapter
#[async_trait]
pub trait GenerationClient: Send + Sync {
    fn provider(&self) -> Provider;

    fn model_id(&self) -> &str;

    /// Full round-trip; cancelled when `cancel` fires
    async fn generate(
        &self,
        params: &GenerateParams,
        cancel: &CancellationToken,
    ) -> Result<GenerateResponse, GatewayError>;

    /// Open a stream; `cancel` also tears down any stream machinery later
    async fn generate_stream(
        &self,
        params: &GenerateParams,
        cancel: &CancellationToken,
    ) -> Result<StreamHandle, GatewayError>;
}

/// Caller-supplied (bring-your-own-key) credentials, by provider
#[derive(Clone, Default, Deserialize)]
pub struct Credentials {
    #[serde(default)]
    pub openai: Option<String>,
    #[serde(default)]
    pub anthropic: Option<String>,
    #[serde(default, alias = "gemini")]
    pub google: Option<String>,
}

impl Credentials {
    pub fn key_for(&self, provider: Provider) -> Option<&str> {
        let key = match provider {
            Provider::OpenAI => self.openai.as_deref(),
            Provider::Anthropic => self.anthropic.as_deref(),
            Provider::Google => self.google.as_deref(),
        };
        key.filter(|k| !k.trim().is_empty())
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mask = |key: &Option<String>| key.as_deref().map(|k| SensitiveApiKey::new(k).to_string());
        f.debug_struct("Credentials")
            .field("openai", &mask(&self.openai))
            .field("anthropic", &mask(&self.anthropic))
            .field("google", &mask(&self.google))
            .finish()
    }
}

/// Where the credential for a call came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeySource {
    UserProvided,
    ServerConfig,
}

impl KeySource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UserProvided => "user_provided",
            Self::ServerConfig => "server_config",
        }
    }
}

/// A ready-to-use client plus the provenance of its credential
#[derive(Clone)]
pub struct ResolvedClient {
    pub client: Arc<dyn GenerationClient>,
    pub key_source: KeySource,
}

/// Builds adapters for a model
pub trait ClientFactory: Send + Sync {
    fn client_for(
        &self,
        model_id: &str,
        provider: Provider,
        credentials: &Credentials,
    ) -> Result<ResolvedClient, GatewayError>;
}

/// HTTP-backed adapters built from the provider configuration
pub struct HttpClientFactory {
    http: reqwest::Client,
    providers: ProvidersConfig,
}

impl HttpClientFactory {
    pub fn new(providers: ProvidersConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            providers,
        }
    }
}

impl ClientFactory for HttpClientFactory {
    fn client_for(
        &self,
        model_id: &str,
        provider: Provider,
        credentials: &Credentials,
    ) -> Result<ResolvedClient, GatewayError> {
        let connection = self.providers.connection(provider);
        if !connection.enabled {
            return Err(GatewayError::Config(format!("provider {} is disabled", provider)));
        }

        // A caller key for this provider wins over the server key
        let (api_key, key_source) = match credentials.key_for(provider) {
            Some(key) => (key.to_string(), KeySource::UserProvided),
            None if connection.has_server_key() => {
                (connection.api_key.clone(), KeySource::ServerConfig)
            }
            None => {
                return Err(GatewayError::Config(format!(
                    "no API key available for provider {}",
                    provider
                )))
            }
        };

        tracing::debug!(
            provider = %provider,
            model = %model_id,
            key_source = key_source.as_str(),
            api_key = %SensitiveApiKey::new(&api_key),
            "Resolved provider credentials"
        );

        let client: Arc<dyn GenerationClient> = match provider {
            Provider::OpenAI => Arc::new(OpenAiClient::new(
                self.http.clone(),
                connection.clone(),
                api_key,
                model_id,
            )),
            Provider::Anthropic => Arc::new(AnthropicClient::new(
                self.http.clone(),
                self.providers.anthropic.clone(),
                api_key,
                model_id,
            )),
            Provider::Google => Arc::new(GeminiClient::new(
                self.http.clone(),
                connection.clone(),
                api_key,
                model_id,
            )),
        };

        Ok(ResolvedClient { client, key_source })
    }
}

/// Send a request, racing it against cancellation, and map non-2xx statuses
pub(crate) async fn send_checked(
    request: reqwest::RequestBuilder,
    cancel: &CancellationToken,
    provider: Provider,
    model_id: &str,
    api_key: &str,
) -> Result<reqwest::Response, GatewayError> {
    let result = tokio::select! {
        _ = cancel.cancelled() => return Err(GatewayError::Cancelled),
        result = request.send() => result,
    };

    let response = result
        .map_err(|e| ProviderError::from_reqwest(provider.as_str(), model_id, &e).redact(api_key))?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        tracing::warn!(
            provider = %provider,
            model = %model_id,
            status = status.as_u16(),
            "Upstream returned error status"
        );
        return Err(
            ProviderError::from_status(provider.as_str(), model_id, status.as_u16(), &body)
                .redact(api_key)
                .into(),
        );
    }

    Ok(response)
}

/// Read and decode a JSON body, racing it against cancellation
pub(crate) async fn read_json<T: serde::de::DeserializeOwned>(
    response: reqwest::Response,
    cancel: &CancellationToken,
    provider: Provider,
    model_id: &str,
) -> Result<T, GatewayError> {
    let bytes = tokio::select! {
        _ = cancel.cancelled() => return Err(GatewayError::Cancelled),
        bytes = response.bytes() => bytes,
    }
    .map_err(|e| ProviderError::from_reqwest(provider.as_str(), model_id, &e))?;

    serde_json::from_slice(&bytes).map_err(|e| {
        ProviderError::transient(
            provider.as_str(),
            model_id,
            format!("failed to decode response: {}", e),
        )
        .into()
    })
}

/// Log and zero-fill when the backend did not report usage
pub(crate) fn reported_usage(provider: Provider, model_id: &str, usage: Option<Usage>) -> Usage {
    match usage {
        Some(usage) if !usage.is_zero() => usage,
        _ => {
            tracing::warn!(
                provider = %provider,
                model = %model_id,
                "Backend reported no usage; recording zero tokens"
            );
            Usage::default()
        }
    }
}
