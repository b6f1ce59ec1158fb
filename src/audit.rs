//! Request audit log
//!
//! One immutable entry per request, written after usage is known.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;

use crate::error::GatewayError;
use crate::store::{self, Query, Store};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Success,
    Error,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestLogEntry {
    pub id: String,
    pub request_id: String,
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key_id: Option<String>,
    pub model_id: String,
    pub provider: String,
    pub key_source: String,
    pub streamed: bool,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub base_cost: f64,
    pub markup_amount: f64,
    pub total_cost: f64,
    /// Tier as it was when the request was priced
    pub tier_id: String,
    pub markup_percent: f64,
    pub was_optimized: bool,
    pub optimization_status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub optimization_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_reason: Option<String>,
    pub tokens_saved: u64,
    pub savings_amount: f64,
    /// Milliseconds since the epoch so range queries compare numerically
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub completed_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub status: RequestStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct UsageSummary {
    pub user_id: String,
    pub request_count: u64,
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
    pub total_tokens: u64,
    pub total_cost: f64,
    pub tokens_saved: u64,
    pub savings_amount: f64,
}

pub struct AuditLog {
    store: Arc<dyn Store>,
}

impl AuditLog {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Write a new entry. Entries are never overwritten.
    pub async fn record(&self, entry: &RequestLogEntry) -> Result<(), GatewayError> {
        if self.store.get_by_id(store::REQUEST_LOGS, &entry.id).await?.is_some() {
            return Err(GatewayError::Store(format!("request log {} already exists", entry.id)));
        }
        store::put_as(self.store.as_ref(), store::REQUEST_LOGS, &entry.id, entry).await?;

        tracing::info!(
            request_id = %entry.request_id,
            user_id = %entry.user_id,
            model = %entry.model_id,
            provider = %entry.provider,
            input_tokens = entry.input_tokens,
            output_tokens = entry.output_tokens,
            total_cost = entry.total_cost,
            status = ?entry.status,
            "Request logged"
        );
        Ok(())
    }

    pub async fn get(&self, id: &str) -> Result<Option<RequestLogEntry>, GatewayError> {
        store::get_as(self.store.as_ref(), store::REQUEST_LOGS, id).await
    }

    /// Entries created in `[from, to]`, oldest first
    pub async fn entries_for_user(
        &self,
        user_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<RequestLogEntry>, GatewayError> {
        let query = Query::new()
            .eq("user_id", user_id)
            .range(
                "created_at",
                Some(json!(from.timestamp_millis())),
                Some(json!(to.timestamp_millis())),
            )
            .order_by("created_at");
        store::query_as(self.store.as_ref(), store::REQUEST_LOGS, &query).await
    }

    pub async fn user_usage(
        &self,
        user_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<UsageSummary, GatewayError> {
        let entries = self.entries_for_user(user_id, from, to).await?;
        let summary = entries.iter().fold(
            UsageSummary {
                user_id: user_id.to_string(),
                ..Default::default()
            },
            |mut acc, entry| {
                acc.request_count += 1;
                acc.total_input_tokens += entry.input_tokens;
                acc.total_output_tokens += entry.output_tokens;
                acc.total_cost += entry.total_cost;
                acc.tokens_saved += entry.tokens_saved;
                acc.savings_amount += entry.savings_amount;
                acc
            },
        );
        Ok(UsageSummary {
            total_tokens: summary.total_input_tokens + summary.total_output_tokens,
            ..summary
        })
    }
}
