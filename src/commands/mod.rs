//! Command implementations for the CLI
//!
//! - generate: run one metered request against the configured store
//! - test: validate configuration and print the resolved provider set

pub mod generate;
