//! Authproxy - identity-aware access proxy
//!
//! Short-lived tunnels, whitelist inspection, human approval gates, durable
//! audit.

use std::process::ExitCode;

use clap::Parser;
use tracing::error;

use authproxy::{
    cli::{Cli, Command},
    config::Config,
    server::Server,
    setup_tracing,
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    match cli.command {
        Some(Command::Check { ref file }) => {
            let path = file.clone().or_else(|| cli.config.clone());
            run_check(path.as_deref())
        }
        Some(Command::Serve) | None => run_server(cli).await,
    }
}

/// Validate a configuration file and report.
fn run_check(path: Option<&std::path::Path>) -> ExitCode {
    match Config::load(path) {
        Ok(config) => {
            println!(
                "Configuration OK: {} connection(s), {} local user(s), {} identity provider(s)",
                config.connections.len(),
                config.auth.users.len(),
                config.auth.oidc.len(),
            );
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("Configuration invalid: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Run the proxy server.
async fn run_server(cli: Cli) -> ExitCode {
    let mut config = match Config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    // CLI flags override the config file
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    if let Some(host) = cli.host {
        config.server.host = host;
    }

    let server = Server::new(config, cli.config);
    match server.run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("Server error: {e}");
            ExitCode::FAILURE
        }
    }
}
