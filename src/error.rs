use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use serde_json::json;
use std::fmt;

/// Failure reported by (or while talking to) a backend provider.
///
/// Carries enough context to diagnose the failure without the credential
/// that was used for the call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProviderError {
    pub provider: String,
    pub model_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    pub message: String,
    pub retryable: bool,
}

impl ProviderError {
    /// Error built from a non-success HTTP status and the raw response body
    pub fn from_status(provider: &str, model_id: &str, status: u16, body: &str) -> Self {
        let (message, error_code) = parse_error_body(body);
        Self {
            provider: provider.to_string(),
            model_id: model_id.to_string(),
            status_code: Some(status),
            error_code,
            message,
            retryable: is_retryable_status(Some(status)),
        }
    }

    /// Error without a usable status code (transport failure, malformed payload)
    pub fn transient(provider: &str, model_id: &str, message: impl Into<String>) -> Self {
        Self {
            provider: provider.to_string(),
            model_id: model_id.to_string(),
            status_code: None,
            error_code: None,
            message: message.into(),
            retryable: true,
        }
    }

    /// Error the caller has to fix (e.g. an empty completion); never retried
    pub fn permanent(provider: &str, model_id: &str, message: impl Into<String>) -> Self {
        Self {
            retryable: false,
            ..Self::transient(provider, model_id, message)
        }
    }

    pub fn from_reqwest(provider: &str, model_id: &str, err: &reqwest::Error) -> Self {
        let status = err.status().map(|s| s.as_u16());
        Self {
            provider: provider.to_string(),
            model_id: model_id.to_string(),
            status_code: status,
            error_code: None,
            message: err.to_string(),
            retryable: is_retryable_status(status),
        }
    }

    /// Replace every occurrence of `secret` in the message
    pub fn redact(mut self, secret: &str) -> Self {
        self.message = crate::logging::redact_secret(&self.message, secret);
        self
    }
}

impl fmt::Display for ProviderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status_code {
            Some(status) => write!(
                f,
                "[{}:{}] ({}) {}",
                self.provider, self.model_id, status, self.message
            ),
            None => write!(f, "[{}:{}] {}", self.provider, self.model_id, self.message),
        }
    }
}

impl std::error::Error for ProviderError {}

/// 401/402/403/404/429 are caller or quota problems; everything else,
/// including a missing status, is treated as transient.
pub fn is_retryable_status(status: Option<u16>) -> bool {
    !matches!(status, Some(401 | 402 | 403 | 404 | 429))
}

/// Pull a message and code out of the usual `{"error": {...}}` envelopes
fn parse_error_body(body: &str) -> (String, Option<String>) {
    let fallback = || {
        if body.trim().is_empty() {
            "Unknown error".to_string()
        } else {
            body.to_string()
        }
    };

    let Ok(value) = serde_json::from_str::<serde_json::Value>(body) else {
        return (fallback(), None);
    };
    let error = value.get("error").unwrap_or(&value);

    let message = error
        .get("message")
        .and_then(|m| m.as_str())
        .map(str::to_string)
        .unwrap_or_else(fallback);

    // OpenAI uses "code", Anthropic "type", Gemini "status"
    let code = ["code", "type", "status"].iter().find_map(|key| {
        error.get(*key).and_then(|v| match v {
            serde_json::Value::String(s) => Some(s.clone()),
            serde_json::Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
    });

    (message, code)
}

/// Gateway error types
#[derive(Debug, Clone, thiserror::Error)]
pub enum GatewayError {
    /// Backend call failed
    #[error("Provider error: {0}")]
    Provider(ProviderError),
    /// Unknown or inactive model/tier, missing credentials
    #[error("Configuration error: {0}")]
    Config(String),
    /// Auxiliary optimization call failed and fallback is disabled
    #[error("Optimization error: {0}")]
    Optimization(String),
    /// Account is not allowed to generate
    #[error("Balance error: {0}")]
    Balance(String),
    /// Store collaborator failure
    #[error("Store error: {0}")]
    Store(String),
    /// Malformed request
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
    /// Caller cancelled or timed out
    #[error("Request cancelled")]
    Cancelled,
}

impl GatewayError {
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Provider(err) => err.retryable,
            Self::Store(_) => true,
            _ => false,
        }
    }

    /// Stable snake_case name, used in responses and metric labels
    pub fn kind(&self) -> &'static str {
        error_type_name(self)
    }
}

impl From<ProviderError> for GatewayError {
    fn from(err: ProviderError) -> Self {
        Self::Provider(err)
    }
}

impl From<sqlx::Error> for GatewayError {
    fn from(err: sqlx::Error) -> Self {
        Self::Store(err.to_string())
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(err: serde_json::Error) -> Self {
        Self::InvalidRequest(format!("JSON error: {}", err))
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = match &self {
            Self::Provider(err) => match err.status_code {
                Some(401 | 403) => StatusCode::BAD_GATEWAY,
                Some(code) => StatusCode::from_u16(code).unwrap_or(StatusCode::BAD_GATEWAY),
                None => StatusCode::BAD_GATEWAY,
            },
            Self::Config(_) => StatusCode::BAD_REQUEST,
            Self::Optimization(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Balance(_) => StatusCode::FORBIDDEN,
            Self::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            Self::Cancelled => StatusCode::REQUEST_TIMEOUT,
        };

        let mut error = json!({
            "message": self.to_string(),
            "type": error_type_name(&self),
        });
        if let Self::Provider(err) = &self {
            error["provider"] = json!(err.provider);
            error["model"] = json!(err.model_id);
            error["retryable"] = json!(err.retryable);
        }

        (status, Json(json!({ "error": error }))).into_response()
    }
}

fn error_type_name(error: &GatewayError) -> &'static str {
    match error {
        GatewayError::Provider(_) => "provider_error",
        GatewayError::Config(_) => "config_error",
        GatewayError::Optimization(_) => "optimization_error",
        GatewayError::Balance(_) => "balance_error",
        GatewayError::Store(_) => "store_error",
        GatewayError::InvalidRequest(_) => "invalid_request",
        GatewayError::Cancelled => "cancelled",
    }
}
