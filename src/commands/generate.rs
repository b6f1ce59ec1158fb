use anyhow::Result;
use colored::Colorize;
use std::io::Write;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::cli::GenerateArgs;
use metered_gateway::config::Config;
use metered_gateway::generation::{GenerationRequest, GenerationService, ResultMetadata};
use metered_gateway::logging::SensitiveApiKey;
use metered_gateway::providers::{Credentials, HttpClientFactory};
use metered_gateway::store::SqliteStore;

/// Run one request against the configured store and providers
pub async fn execute(cfg: &Config, args: GenerateArgs) -> Result<()> {
    let store = Arc::new(SqliteStore::connect(&cfg.store.database_url).await?);
    let factory = Arc::new(HttpClientFactory::new(cfg.providers.clone()));
    let service = GenerationService::new(factory, store, cfg);

    let request = build_request(&args);
    let cancel = CancellationToken::new();

    // Ctrl-C cancels the in-flight request; the stream is still metered
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            ctrl_c.cancel();
        }
    });

    info!(model = %request.model, stream = request.stream, "Running generation");

    if request.stream {
        let mut stream = service.generate_stream(&request, &cancel).await?;
        let mut stdout = std::io::stdout();
        loop {
            match stream.next_fragment().await {
                Ok(Some(fragment)) => {
                    print!("{}", fragment);
                    stdout.flush()?;
                }
                Ok(None) => break,
                Err(e) => {
                    stream.close().await?;
                    return Err(e.into());
                }
            }
        }
        println!();
        let metadata = stream.close().await?;
        if let Some(metadata) = metadata {
            print_metadata(&metadata);
        }
    } else {
        let result = service.generate(&request, &cancel).await?;
        println!("{}", result.text);
        println!();
        println!(
            "  {}: {} ({})",
            "Model".cyan(),
            result.model,
            result.provider
        );
        if let Some(reason) = &result.finish_reason {
            println!("  {}: {}", "Finish".cyan(), reason);
        }
        print_metadata(&result.metadata);
    }

    Ok(())
}

fn build_request(args: &GenerateArgs) -> GenerationRequest {
    let mut request = GenerationRequest::new(&args.user, &args.model, &args.prompt);
    request.stream = args.stream;
    request.max_tokens = args.max_tokens;
    request.temperature = args.temperature;
    request.optimization_mode = args.mode.clone();
    if let Some(key) = &args.api_key {
        info!(api_key = %SensitiveApiKey::new(key), "Using caller-provided API key");
        // The adapter picks the entry for the model's provider
        request.credentials = Credentials {
            openai: Some(key.clone()),
            anthropic: Some(key.clone()),
            google: Some(key.clone()),
        };
    }
    request
}

fn print_metadata(metadata: &ResultMetadata) {
    println!("{}", "Usage:".bold());
    println!(
        "  {}: {} in / {} out",
        "Tokens".cyan(),
        metadata.input_tokens,
        metadata.output_tokens
    );
    println!(
        "  {}: ${:.6} (base ${:.6} + markup ${:.6}, tier {})",
        "Cost".cyan(),
        metadata.total_cost,
        metadata.base_cost,
        metadata.markup_amount,
        metadata.tier_id
    );
    if let Some(balance) = metadata.balance_after {
        let shown = format!("${:.6}", balance);
        let shown = if balance < 0.0 { shown.red() } else { shown.green() };
        println!("  {}: {}", "Balance".cyan(), shown);
    }
    println!(
        "  {}: {} (estimated ${:.6})",
        "Pre-flight".cyan(),
        if metadata.preflight.sufficient_funds {
            "ok".green()
        } else {
            "low balance".yellow()
        },
        metadata.preflight.estimated_cost
    );
    println!(
        "  {}: {}",
        "Optimization".cyan(),
        metadata.optimization_status.as_str()
    );
    if let Some(kind) = &metadata.optimization_type {
        println!("    Type: {}", kind);
    }
    if let Some(reason) = &metadata.fallback_reason {
        println!("    Fallback: {}", reason.yellow());
    }
    if metadata.tokens_saved > 0 {
        println!(
            "    Saved: {} tokens (${:.6})",
            metadata.tokens_saved, metadata.savings_amount
        );
    }
    println!("  {}: {}", "Request".cyan(), metadata.request_id.dimmed());
}
