use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "metered-gateway", version, about = "Metered LLM Gateway")]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "config.toml", global = true)]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Run one request through the full pipeline
    Generate(GenerateArgs),

    /// Test configuration validity
    Test,

    /// Show version information
    Version,
}

#[derive(Args, Debug, Clone)]
pub struct GenerateArgs {
    /// Account to bill
    #[arg(short, long)]
    pub user: String,

    /// Model ID, e.g. gpt-4o-mini-2024-07-18
    #[arg(short, long)]
    pub model: String,

    /// Stream fragments as they arrive
    #[arg(short, long)]
    pub stream: bool,

    /// Optimization mode: context or efficiency
    #[arg(long)]
    pub mode: Option<String>,

    #[arg(long)]
    pub max_tokens: Option<u32>,

    #[arg(long)]
    pub temperature: Option<f64>,

    /// Caller-supplied key for the model's provider
    #[arg(long, env = "METERED_GATEWAY_BYOK_KEY", hide_env_values = true)]
    pub api_key: Option<String>,

    pub prompt: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_generate() {
        let cli = Cli::parse_from([
            "metered-gateway",
            "generate",
            "--user",
            "u1",
            "--model",
            "gemini-2.0-flash",
            "--stream",
            "--mode",
            "efficiency",
            "--max-tokens",
            "64",
            "Explain TCP slow start",
        ]);

        match cli.command {
            Commands::Generate(args) => {
                assert_eq!(args.user, "u1");
                assert_eq!(args.model, "gemini-2.0-flash");
                assert!(args.stream);
                assert_eq!(args.mode.as_deref(), Some("efficiency"));
                assert_eq!(args.max_tokens, Some(64));
                assert_eq!(args.prompt, "Explain TCP slow start");
            }
            other => panic!("unexpected command: {:?}", other),
        }
        assert_eq!(cli.config, PathBuf::from("config.toml"));
    }

    #[test]
    fn test_parse_test_with_config() {
        let cli = Cli::parse_from(["metered-gateway", "test", "--config", "/etc/gw.toml"]);
        assert!(matches!(cli.command, Commands::Test));
        assert_eq!(cli.config, PathBuf::from("/etc/gw.toml"));
    }
}
