//! Command line of the demo binary.

use clap::Parser;
use std::path::PathBuf;

/// In-memory MD-SAL DOM data store.
#[derive(Debug, Parser)]
#[command(name = "mdsal-dom-inmemory")]
#[command(about = "Run an in-memory MD-SAL DOM data store", long_about = None)]
pub struct Cli {
    /// Store configuration, TOML or JSON.
    #[arg(short, long, default_value = "/etc/mdsal/store.toml")]
    pub config: PathBuf,

    /// Log filter directives, overriding the configured ones.
    #[arg(long, env = "MDSAL_LOG_FILTER")]
    pub log_filter: Option<String>,

    /// Ping-pong transactions to commit.
    #[arg(short, long, default_value_t = 3)]
    pub transactions: u32,
}
