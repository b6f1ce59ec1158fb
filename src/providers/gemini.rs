use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use super::{read_json, reported_usage, send_checked, GenerateParams, GenerateResponse, GenerationClient, Provider, Usage};
use crate::{
    config::ProviderConfig,
    error::{GatewayError, ProviderError},
    models::gemini::{Content, GenerateContentRequest, GenerateContentResponse, GenerationConfig, Part, UsageMetadata},
    streaming::{decode_sse_stream, BridgedSource, Decoded, EventDecoder, StreamHandle, StreamUnit},
};

/// Gemini generateContent adapter
pub struct GeminiClient {
    http: Client,
    config: ProviderConfig,
    api_key: String,
    model_id: String,
}

impl GeminiClient {
    pub fn new(http: Client, config: ProviderConfig, api_key: String, model_id: &str) -> Self {
        Self {
            http,
            config,
            api_key,
            model_id: model_id.to_string(),
        }
    }

    fn build_request(&self, params: &GenerateParams) -> GenerateContentRequest {
        let generation_config = GenerationConfig {
            temperature: params.temperature,
            top_p: params.top_p,
            max_output_tokens: params.max_tokens,
        };
        let has_config = generation_config.temperature.is_some()
            || generation_config.top_p.is_some()
            || generation_config.max_output_tokens.is_some();

        GenerateContentRequest {
            contents: vec![Content {
                role: Some("user".to_string()),
                parts: vec![Part {
                    text: Some(params.prompt.clone()),
                }],
            }],
            generation_config: has_config.then_some(generation_config),
            extra: params.extra.clone(),
        }
    }

    async fn send(
        &self,
        action: &str,
        body: &GenerateContentRequest,
        cancel: &CancellationToken,
    ) -> Result<reqwest::Response, GatewayError> {
        let url = format!(
            "{}/models/{}:{}",
            self.config.base_url.trim_end_matches('/'),
            self.model_id,
            action
        );

        let mut query = vec![("key", self.api_key.as_str())];
        if action == "streamGenerateContent" {
            query.push(("alt", "sse"));
        }

        let request = self
            .http
            .post(&url)
            .query(&query)
            .header("Content-Type", "application/json")
            .timeout(Duration::from_secs(self.config.timeout_seconds))
            .json(body);

        send_checked(request, cancel, Provider::Google, &self.model_id, &self.api_key).await
    }
}

fn usage_from(metadata: Option<&UsageMetadata>) -> Option<Usage> {
    metadata.map(|m| Usage::new(m.prompt_token_count, m.candidates_token_count))
}

#[async_trait]
impl GenerationClient for GeminiClient {
    fn provider(&self) -> Provider {
        Provider::Google
    }

    fn model_id(&self) -> &str {
        &self.model_id
    }

    async fn generate(
        &self,
        params: &GenerateParams,
        cancel: &CancellationToken,
    ) -> Result<GenerateResponse, GatewayError> {
        params.validate(Provider::Google, &self.model_id)?;
        let body = self.build_request(params);
        let response = self.send("generateContent", &body, cancel).await?;
        let result: GenerateContentResponse =
            read_json(response, cancel, Provider::Google, &self.model_id).await?;

        if result.candidates.is_empty() {
            return Err(ProviderError::permanent(
                Provider::Google.as_str(),
                &self.model_id,
                "no candidates returned from API",
            )
            .into());
        }

        let usage = reported_usage(
            Provider::Google,
            &self.model_id,
            usage_from(result.usage_metadata.as_ref()),
        );

        tracing::info!(
            provider = "google",
            model = %self.model_id,
            input_tokens = usage.input_tokens,
            output_tokens = usage.output_tokens,
            "Generation completed"
        );

        Ok(GenerateResponse {
            text: result.text(),
            usage,
            finish_reason: result.finish_reason().map(str::to_string),
            model_id: self.model_id.clone(),
            provider: Provider::Google,
        })
    }

    async fn generate_stream(
        &self,
        params: &GenerateParams,
        cancel: &CancellationToken,
    ) -> Result<StreamHandle, GatewayError> {
        params.validate(Provider::Google, &self.model_id)?;
        let body = self.build_request(params);
        let response = self.send("streamGenerateContent", &body, cancel).await?;

        let producer = decode_sse_stream(
            response,
            GeminiDecoder::new(&self.model_id),
            Provider::Google,
            &self.model_id,
        );
        let source = BridgedSource::spawn(producer, cancel);
        Ok(StreamHandle::new(Provider::Google, &self.model_id, source))
    }
}

/// Decodes streamed `GenerateContentResponse` chunks
pub struct GeminiDecoder {
    model_id: String,
}

impl GeminiDecoder {
    pub fn new(model_id: &str) -> Self {
        Self {
            model_id: model_id.to_string(),
        }
    }
}

impl EventDecoder for GeminiDecoder {
    fn decode(&mut self, data: &str) -> Result<Decoded, ProviderError> {
        let chunk: GenerateContentResponse = serde_json::from_str(data).map_err(|e| {
            ProviderError::transient("google", &self.model_id, format!("invalid stream chunk: {}", e))
        })?;

        let unit = StreamUnit {
            text: chunk.text(),
            usage: usage_from(chunk.usage_metadata.as_ref()),
            finish_reason: chunk.finish_reason().map(str::to_string),
        };

        if unit == StreamUnit::default() {
            Ok(Decoded::Skip)
        } else {
            Ok(Decoded::Unit(unit))
        }
    }
}
