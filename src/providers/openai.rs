use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use super::{read_json, reported_usage, send_checked, GenerateParams, GenerateResponse, GenerationClient, Provider, Usage};
use crate::{
    config::ProviderConfig,
    error::{GatewayError, ProviderError},
    models::openai::{ChatCompletionChunk, ChatCompletionRequest, ChatCompletionResponse, ChatMessage, StreamOptions},
    streaming::{Decoded, EventDecoder, SseSource, StreamHandle, StreamUnit},
};

/// OpenAI Chat Completions adapter
pub struct OpenAiClient {
    http: Client,
    config: ProviderConfig,
    api_key: String,
    model_id: String,
}

impl OpenAiClient {
    pub fn new(http: Client, config: ProviderConfig, api_key: String, model_id: &str) -> Self {
        Self {
            http,
            config,
            api_key,
            model_id: model_id.to_string(),
        }
    }

    fn build_request(&self, params: &GenerateParams, stream: bool) -> ChatCompletionRequest {
        let mut extra = params.extra.clone();
        // Usage only arrives on streams when explicitly requested
        let include_usage = extra
            .remove("include_usage")
            .and_then(|v| v.as_bool())
            .unwrap_or(true);

        ChatCompletionRequest {
            model: self.model_id.clone(),
            messages: vec![ChatMessage {
                role: "user".to_string(),
                content: params.prompt.clone(),
            }],
            max_tokens: params.max_tokens,
            temperature: params.temperature,
            top_p: params.top_p,
            stream: stream.then_some(true),
            stream_options: stream.then_some(StreamOptions { include_usage }),
            extra,
        }
    }

    async fn send(
        &self,
        body: &ChatCompletionRequest,
        cancel: &CancellationToken,
    ) -> Result<reqwest::Response, GatewayError> {
        let url = format!(
            "{}/chat/completions",
            self.config.base_url.trim_end_matches('/')
        );

        let request = self
            .http
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .timeout(Duration::from_secs(self.config.timeout_seconds))
            .json(body);

        send_checked(request, cancel, Provider::OpenAI, &self.model_id, &self.api_key).await
    }
}

#[async_trait]
impl GenerationClient for OpenAiClient {
    fn provider(&self) -> Provider {
        Provider::OpenAI
    }

    fn model_id(&self) -> &str {
        &self.model_id
    }

    async fn generate(
        &self,
        params: &GenerateParams,
        cancel: &CancellationToken,
    ) -> Result<GenerateResponse, GatewayError> {
        params.validate(Provider::OpenAI, &self.model_id)?;
        let body = self.build_request(params, false);
        let response = self.send(&body, cancel).await?;
        let completion: ChatCompletionResponse =
            read_json(response, cancel, Provider::OpenAI, &self.model_id).await?;

        let Some(choice) = completion.choices.into_iter().next() else {
            return Err(ProviderError::permanent(
                Provider::OpenAI.as_str(),
                &self.model_id,
                "no choices returned from API",
            )
            .into());
        };

        let usage = reported_usage(
            Provider::OpenAI,
            &self.model_id,
            completion
                .usage
                .map(|u| Usage::new(u.prompt_tokens, u.completion_tokens)),
        );

        tracing::info!(
            provider = "openai",
            model = %self.model_id,
            input_tokens = usage.input_tokens,
            output_tokens = usage.output_tokens,
            "Generation completed"
        );

        Ok(GenerateResponse {
            text: choice.message.content.unwrap_or_default(),
            usage,
            finish_reason: choice.finish_reason,
            model_id: self.model_id.clone(),
            provider: Provider::OpenAI,
        })
    }

    async fn generate_stream(
        &self,
        params: &GenerateParams,
        cancel: &CancellationToken,
    ) -> Result<StreamHandle, GatewayError> {
        params.validate(Provider::OpenAI, &self.model_id)?;
        let body = self.build_request(params, true);
        let response = self.send(&body, cancel).await?;

        let source = SseSource::new(
            response,
            OpenAiDecoder::new(&self.model_id),
            cancel,
            Provider::OpenAI,
            &self.model_id,
        );
        Ok(StreamHandle::new(Provider::OpenAI, &self.model_id, source))
    }
}

/// Decodes `chat.completion.chunk` payloads
pub struct OpenAiDecoder {
    model_id: String,
}

impl OpenAiDecoder {
    pub fn new(model_id: &str) -> Self {
        Self {
            model_id: model_id.to_string(),
        }
    }
}

impl EventDecoder for OpenAiDecoder {
    fn decode(&mut self, data: &str) -> Result<Decoded, ProviderError> {
        if data.trim() == "[DONE]" {
            return Ok(Decoded::End);
        }

        let chunk: ChatCompletionChunk = serde_json::from_str(data).map_err(|e| {
            ProviderError::transient("openai", &self.model_id, format!("invalid stream chunk: {}", e))
        })?;

        let mut unit = StreamUnit {
            usage: chunk
                .usage
                .map(|u| Usage::new(u.prompt_tokens, u.completion_tokens)),
            ..Default::default()
        };
        if let Some(choice) = chunk.choices.into_iter().next() {
            unit.text = choice.delta.content.unwrap_or_default();
            unit.finish_reason = choice.finish_reason;
        }

        if unit == StreamUnit::default() {
            Ok(Decoded::Skip)
        } else {
            Ok(Decoded::Unit(unit))
        }
    }
}
