use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use super::{read_json, reported_usage, send_checked, GenerateParams, GenerateResponse, GenerationClient, Provider, Usage};
use crate::{
    config::AnthropicConfig,
    error::{GatewayError, ProviderError},
    models::anthropic::{ContentDelta, Message, MessagesRequest, MessagesResponse, StreamEvent},
    streaming::{Decoded, EventDecoder, SseSource, StreamHandle, StreamUnit},
};

/// Messages API requires an explicit ceiling
const DEFAULT_MAX_TOKENS: u32 = 1000;

/// Anthropic Messages adapter
pub struct AnthropicClient {
    http: Client,
    config: AnthropicConfig,
    api_key: String,
    model_id: String,
}

impl AnthropicClient {
    pub fn new(http: Client, config: AnthropicConfig, api_key: String, model_id: &str) -> Self {
        Self {
            http,
            config,
            api_key,
            model_id: model_id.to_string(),
        }
    }

    fn build_request(&self, params: &GenerateParams, stream: bool) -> MessagesRequest {
        MessagesRequest {
            model: self.model_id.clone(),
            messages: vec![Message {
                role: "user".to_string(),
                content: params.prompt.clone(),
            }],
            max_tokens: params.max_tokens.filter(|n| *n > 0).unwrap_or(DEFAULT_MAX_TOKENS),
            temperature: params.temperature,
            top_p: params.top_p,
            stream: stream.then_some(true),
            extra: params.extra.clone(),
        }
    }

    async fn send(
        &self,
        body: &MessagesRequest,
        cancel: &CancellationToken,
    ) -> Result<reqwest::Response, GatewayError> {
        let connection = &self.config.connection;
        let url = format!("{}/messages", connection.base_url.trim_end_matches('/'));

        let request = self
            .http
            .post(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", &self.config.api_version)
            .header("Content-Type", "application/json")
            .timeout(Duration::from_secs(connection.timeout_seconds))
            .json(body);

        send_checked(request, cancel, Provider::Anthropic, &self.model_id, &self.api_key).await
    }
}

#[async_trait]
impl GenerationClient for AnthropicClient {
    fn provider(&self) -> Provider {
        Provider::Anthropic
    }

    fn model_id(&self) -> &str {
        &self.model_id
    }

    async fn generate(
        &self,
        params: &GenerateParams,
        cancel: &CancellationToken,
    ) -> Result<GenerateResponse, GatewayError> {
        params.validate(Provider::Anthropic, &self.model_id)?;
        let body = self.build_request(params, false);
        let response = self.send(&body, cancel).await?;
        let message: MessagesResponse =
            read_json(response, cancel, Provider::Anthropic, &self.model_id).await?;

        let text: String = message
            .content
            .iter()
            .filter(|block| block.block_type == "text")
            .filter_map(|block| block.text.as_deref())
            .collect();

        if text.is_empty() && message.content.is_empty() {
            return Err(ProviderError::permanent(
                Provider::Anthropic.as_str(),
                &self.model_id,
                "no content returned from API",
            )
            .into());
        }

        let usage = reported_usage(
            Provider::Anthropic,
            &self.model_id,
            Some(Usage::new(message.usage.input_tokens, message.usage.output_tokens)),
        );

        tracing::info!(
            provider = "anthropic",
            model = %self.model_id,
            input_tokens = usage.input_tokens,
            output_tokens = usage.output_tokens,
            "Generation completed"
        );

        Ok(GenerateResponse {
            text,
            usage,
            finish_reason: message.stop_reason,
            model_id: self.model_id.clone(),
            provider: Provider::Anthropic,
        })
    }

    async fn generate_stream(
        &self,
        params: &GenerateParams,
        cancel: &CancellationToken,
    ) -> Result<StreamHandle, GatewayError> {
        params.validate(Provider::Anthropic, &self.model_id)?;
        let body = self.build_request(params, true);
        let response = self.send(&body, cancel).await?;

        let source = SseSource::new(
            response,
            AnthropicDecoder::new(&self.model_id),
            cancel,
            Provider::Anthropic,
            &self.model_id,
        );
        Ok(StreamHandle::new(Provider::Anthropic, &self.model_id, source))
    }
}

/// Decodes typed Messages stream events.
///
/// Input tokens arrive on `message_start`, output tokens on `message_delta`.
pub struct AnthropicDecoder {
    model_id: String,
}

impl AnthropicDecoder {
    pub fn new(model_id: &str) -> Self {
        Self {
            model_id: model_id.to_string(),
        }
    }
}

impl EventDecoder for AnthropicDecoder {
    fn decode(&mut self, data: &str) -> Result<Decoded, ProviderError> {
        let event: StreamEvent = serde_json::from_str(data).map_err(|e| {
            ProviderError::transient("anthropic", &self.model_id, format!("invalid stream event: {}", e))
        })?;

        let decoded = match event {
            StreamEvent::MessageStart { message } => match message.usage {
                Some(usage) => Decoded::Unit(StreamUnit::usage(Usage::new(
                    usage.input_tokens,
                    usage.output_tokens,
                ))),
                None => Decoded::Skip,
            },
            StreamEvent::ContentBlockStart { content_block, .. } => match content_block.text {
                Some(text) if !text.is_empty() => Decoded::Unit(StreamUnit::text(text)),
                _ => Decoded::Skip,
            },
            StreamEvent::ContentBlockDelta { delta, .. } => match delta {
                ContentDelta::TextDelta { text } => Decoded::Unit(StreamUnit::text(text)),
                ContentDelta::InputJsonDelta { .. }
                | ContentDelta::ThinkingDelta { .. }
                | ContentDelta::SignatureDelta { .. } => Decoded::Skip,
            },
            StreamEvent::MessageDelta { delta, usage } => Decoded::Unit(StreamUnit {
                text: String::new(),
                usage: usage.map(|u| Usage::new(u.input_tokens, u.output_tokens)),
                finish_reason: delta.stop_reason,
            }),
            StreamEvent::ContentBlockStop { .. } | StreamEvent::Ping => Decoded::Skip,
            StreamEvent::MessageStop => Decoded::End,
            StreamEvent::Error { error } => {
                let retryable = error.error_type == "overloaded_error" || error.error_type == "api_error";
                return Err(ProviderError {
                    provider: "anthropic".to_string(),
                    model_id: self.model_id.clone(),
                    status_code: None,
                    error_code: Some(error.error_type),
                    message: error.message,
                    retryable,
                });
            }
        };

        Ok(decoded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProviderConfig;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client_for(server: &MockServer) -> AnthropicClient {
        let config = AnthropicConfig {
            connection: ProviderConfig {
                enabled: true,
                api_key: String::new(),
                base_url: format!("{}/v1", server.uri()),
                timeout_seconds: 5,
            },
            api_version: "2023-06-01".to_string(),
        };
        AnthropicClient::new(
            Client::new(),
            config,
            "sk-ant-test-key".to_string(),
            "claude-3-5-haiku-20241022",
        )
    }

    #[tokio::test]
    async fn test_generate_sends_version_header() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .and(header("x-api-key", "sk-ant-test-key"))
            .and(header("anthropic-version", "2023-06-01"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": "msg_1",
                "type": "message",
                "role": "assistant",
                "content": [{"type": "text", "text": "Bonjour"}],
                "model": "claude-3-5-haiku-20241022",
                "stop_reason": "end_turn",
                "usage": {"input_tokens": 12, "output_tokens": 4}
            })))
            .mount(&server)
            .await;

        let response = client_for(&server)
            .generate(&GenerateParams::new("Say hello in French"), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(response.text, "Bonjour");
        assert_eq!(response.usage, Usage::new(12, 4));
        assert_eq!(response.finish_reason.as_deref(), Some("end_turn"));
    }

    #[tokio::test]
    async fn test_generate_server_error_is_retryable() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(529).set_body_json(serde_json::json!({
                "type": "error",
                "error": {"type": "overloaded_error", "message": "Overloaded"}
            })))
            .mount(&server)
            .await;

        let err = client_for(&server)
            .generate(&GenerateParams::new("Hi"), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_stream_collects_split_usage() {
        let server = MockServer::start().await;
        let sse = concat!(
            "event: message_start\n",
            "data: {\"type\":\"message_start\",\"message\":{\"id\":\"msg_1\",\"type\":\"message\",\"role\":\"assistant\",\"content\":[],\"model\":\"claude-3-5-haiku-20241022\",\"usage\":{\"input_tokens\":25,\"output_tokens\":1}}}\n\n",
            "event: content_block_start\n",
            "data: {\"type\":\"content_block_start\",\"index\":0,\"content_block\":{\"type\":\"text\",\"text\":\"\"}}\n\n",
            "event: ping\n",
            "data: {\"type\":\"ping\"}\n\n",
            "event: content_block_delta\n",
            "data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"Hello\"}}\n\n",
            "event: content_block_delta\n",
            "data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\" there\"}}\n\n",
            "event: content_block_stop\n",
            "data: {\"type\":\"content_block_stop\",\"index\":0}\n\n",
            "event: message_delta\n",
            "data: {\"type\":\"message_delta\",\"delta\":{\"stop_reason\":\"end_turn\",\"stop_sequence\":null},\"usage\":{\"output_tokens\":15}}\n\n",
            "event: message_stop\n",
            "data: {\"type\":\"message_stop\"}\n\n",
        );
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(sse, "text/event-stream"))
            .mount(&server)
            .await;

        let mut stream = client_for(&server)
            .generate_stream(&GenerateParams::new("Hi"), &CancellationToken::new())
            .await
            .unwrap()
            .into_reader();

        assert_eq!(stream.read_to_string().await.unwrap(), "Hello there");
        assert_eq!(stream.usage(), Usage::new(25, 15));
        assert_eq!(stream.finish_reason(), Some("end_turn"));
    }

    #[test]
    fn test_decoder_error_event() {
        let mut decoder = AnthropicDecoder::new("claude-3-5-haiku-20241022");
        let err = decoder
            .decode(r#"{"type":"error","error":{"type":"overloaded_error","message":"Overloaded"}}"#)
            .unwrap_err();
        assert_eq!(err.error_code.as_deref(), Some("overloaded_error"));
        assert!(err.retryable);
    }
}
