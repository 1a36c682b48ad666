//! Authproxy Library
//!
//! Identity-aware access proxy: clients authenticate once, open short-lived
//! identity-bound tunnels to named backends, and every operation through a
//! tunnel is whitelist-inspected, optionally human-approved, forwarded, and
//! durably audited.
//!
//! # Pipeline
//!
//! ```text
//! authenticate -> token -> connect (policy) -> tunnel
//!   -> operation -> inspect -> [approval gate] -> forward -> audit
//!   -> sweep reaps the tunnel at expiry or close
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod approval;
pub mod audit;
pub mod auth;
pub mod cli;
pub mod config;
pub mod error;
pub mod filter;
pub mod forwarder;
pub mod generation;
pub mod policy;
pub mod registry;
pub mod server;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        Some("json") => {
            subscriber.with(fmt::layer().json()).init();
        }
        _ => {
            subscriber.with(fmt::layer()).init();
        }
    }

    Ok(())
}
