//! Command-line interface

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Identity-aware access proxy with whitelist inspection and approval gates
#[derive(Parser, Debug)]
#[command(name = "authproxy")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short, long, env = "AUTHPROXY_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Port to listen on (overrides config)
    #[arg(short, long, env = "AUTHPROXY_PORT")]
    pub port: Option<u16>,

    /// Host to bind to (overrides config)
    #[arg(long, env = "AUTHPROXY_HOST")]
    pub host: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(
        long,
        default_value = "info",
        env = "AUTHPROXY_LOG_LEVEL",
        global = true
    )]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "AUTHPROXY_LOG_FORMAT", global = true)]
    pub log_format: Option<String>,

    /// Subcommand (optional - defaults to server mode)
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start the proxy server (default)
    Serve,

    /// Validate a configuration file and exit
    Check {
        /// Path to configuration file (defaults to --config)
        file: Option<PathBuf>,
    },
}
