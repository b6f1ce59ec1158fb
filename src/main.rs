use anyhow::Result;
use clap::Parser;

mod cli;
mod commands;

use metered_gateway::{config, init_tracing};

#[tokio::main]
async fn main() -> Result<()> {
    let args = cli::Cli::parse();

    // Version needs no configuration
    if let cli::Commands::Version = args.command {
        println!("Metered Gateway v{}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    let cfg = config::load_config_from(&args.config)?;
    init_tracing(&cfg.logging);
    metered_gateway::metrics::init_metric_descriptions();

    match args.command {
        cli::Commands::Generate(generate) => commands::generate::execute(&cfg, generate).await?,
        cli::Commands::Test => commands::test::execute(&cfg)?,
        cli::Commands::Version => {}
    }

    Ok(())
}
