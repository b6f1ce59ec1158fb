use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use std::time::Duration;

/// Register metric descriptions with whatever recorder the embedding process installed.
/// Safe to call more than once.
pub fn init_metric_descriptions() {
    describe_counter!("gateway_requests_total", "Total number of generation requests");
    describe_counter!("gateway_tokens_total", "Backend-reported tokens billed");
    describe_histogram!(
        "gateway_request_duration_seconds",
        "Request duration in seconds"
    );
    describe_histogram!("gateway_request_cost", "Total billed cost per request");
    describe_counter!("gateway_errors_total", "Total number of failed requests");
    describe_counter!(
        "gateway_optimizations_total",
        "Prompt optimization outcomes"
    );
    describe_gauge!("gateway_info", "Gateway version information");

    gauge!("gateway_info", "version" => env!("CARGO_PKG_VERSION")).set(1.0);
}

/// Record a request; `mode` is "blocking" or "stream"
pub fn record_request(provider: &str, model: &str, mode: &str) {
    counter!(
        "gateway_requests_total",
        "provider" => provider.to_string(),
        "model" => model.to_string(),
        "mode" => mode.to_string(),
    )
    .increment(1);
}

pub fn record_tokens(provider: &str, model: &str, token_type: &str, count: u64) {
    counter!(
        "gateway_tokens_total",
        "provider" => provider.to_string(),
        "model" => model.to_string(),
        "type" => token_type.to_string(),
    )
    .increment(count);
}

pub fn record_cost(model: &str, tier_id: &str, total_cost: f64) {
    histogram!(
        "gateway_request_cost",
        "model" => model.to_string(),
        "tier" => tier_id.to_string(),
    )
    .record(total_cost);
}

pub fn record_duration(provider: &str, model: &str, duration: Duration) {
    histogram!(
        "gateway_request_duration_seconds",
        "provider" => provider.to_string(),
        "model" => model.to_string(),
    )
    .record(duration.as_secs_f64());
}

pub fn record_error(provider: &str, model: &str, error_type: &str) {
    counter!(
        "gateway_errors_total",
        "provider" => provider.to_string(),
        "model" => model.to_string(),
        "error_type" => error_type.to_string(),
    )
    .increment(1);
}

pub fn record_optimization(status: &str, optimization_type: &str) {
    counter!(
        "gateway_optimizations_total",
        "status" => status.to_string(),
        "type" => optimization_type.to_string(),
    )
    .increment(1);
}
