//! Active configuration generation.
//!
//! Connection specs are compiled from configuration into an immutable
//! [`Catalog`]. The live catalog is held behind [`ActiveCatalog`] and replaced
//! wholesale on reload — readers grab an `Arc` and keep it; tunnels pin the
//! `Arc<ConnectionSpec>` they were created with, so in-flight operations keep
//! the generation they started with even across a swap.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tracing::info;

use crate::config::{BackendKind, Config, ConnectionConfig, RemoteStoreConfig};
use crate::filter::{self, CompiledRule, Decision};
use crate::{Error, Result};

/// A proxyable backend definition, compiled and immutable for one generation.
#[derive(Debug)]
pub struct ConnectionSpec {
    /// Connection name (the `/api/connect/{name}` key)
    pub name: String,
    /// Human-readable description
    pub description: String,
    /// Backend protocol family
    pub backend_type: BackendKind,
    /// Target address
    pub target: String,
    /// Roles that may open tunnels
    pub allowed_roles: Vec<String>,
    /// Whether operations require external approval
    pub approval_required: bool,
    /// Roles exempt from the approval requirement
    pub approval_exempt_roles: Vec<String>,
    /// Compiled whitelist, evaluated in order
    pub rules: Vec<CompiledRule>,
    /// Hard cap on tunnel lifetime
    pub max_duration: Duration,
    /// Tunnel lifetime when the client does not request one
    pub default_duration: Duration,
    /// Generation this spec belongs to
    pub generation: u64,
}

impl ConnectionSpec {
    fn compile(name: &str, config: &ConnectionConfig, generation: u64) -> Result<Self> {
        let rules = filter::compile_rules(config.backend_type, &config.whitelist)
            .map_err(|e| Error::Config(format!("Connection '{name}': {e}")))?;

        Ok(Self {
            name: name.to_string(),
            description: config.description.clone(),
            backend_type: config.backend_type,
            target: config.target.clone(),
            allowed_roles: config.allowed_roles.clone(),
            approval_required: config.approval_required,
            approval_exempt_roles: config.approval_exempt_roles.clone(),
            rules,
            max_duration: config.max_duration,
            default_duration: config.default_duration,
            generation,
        })
    }

    /// Inspect one raw operation against this spec's whitelist.
    #[must_use]
    pub fn inspect(&self, raw: &[u8]) -> Decision {
        filter::inspect(self.backend_type, &self.rules, raw)
    }
}

/// One immutable configuration generation.
#[derive(Debug)]
pub struct Catalog {
    /// Monotonic generation counter
    pub generation: u64,
    specs: HashMap<String, Arc<ConnectionSpec>>,
}

impl Catalog {
    /// Compile a catalog from configuration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if any whitelist rule fails to compile.
    pub fn compile(config: &Config, generation: u64) -> Result<Self> {
        let mut specs = HashMap::with_capacity(config.connections.len());
        for (name, conn) in &config.connections {
            specs.insert(
                name.clone(),
                Arc::new(ConnectionSpec::compile(name, conn, generation)?),
            );
        }
        Ok(Self { generation, specs })
    }

    /// Look up a spec by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<ConnectionSpec>> {
        self.specs.get(name).map(Arc::clone)
    }

    /// All specs in this generation.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<ConnectionSpec>> {
        self.specs.values()
    }

    /// Number of specs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.specs.len()
    }

    /// Whether the catalog is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }
}

/// Holder of the live catalog; swapped atomically on reload.
pub struct ActiveCatalog {
    inner: RwLock<Arc<Catalog>>,
}

impl ActiveCatalog {
    /// Compile generation 1 from the startup configuration.
    ///
    /// # Errors
    ///
    /// Propagates compile failures; the server does not start on a bad config.
    pub fn new(config: &Config) -> Result<Self> {
        let catalog = Catalog::compile(config, 1)?;
        Ok(Self {
            inner: RwLock::new(Arc::new(catalog)),
        })
    }

    /// The current generation. Callers hold the returned `Arc` for as long as
    /// they need a consistent view.
    #[must_use]
    pub fn current(&self) -> Arc<Catalog> {
        Arc::clone(&self.inner.read())
    }

    /// Compile `config` as the next generation and swap it in.
    ///
    /// The swap is atomic; a compile failure leaves the previous generation
    /// active.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the new snapshot fails to compile.
    pub fn install(&self, config: &Config) -> Result<u64> {
        let next_gen = self.inner.read().generation + 1;
        let catalog = Arc::new(Catalog::compile(config, next_gen)?);
        *self.inner.write() = catalog;
        info!(generation = next_gen, "Installed configuration generation");
        Ok(next_gen)
    }
}

/// Client for the optional remote configuration store.
pub struct RemoteStore {
    config: RemoteStoreConfig,
    http: reqwest::Client,
}

impl RemoteStore {
    /// Create from configuration.
    #[must_use]
    pub fn new(config: RemoteStoreConfig) -> Self {
        let http = reqwest::Client::builder()
            .timeout(config.fetch_timeout)
            .build()
            .unwrap_or_default();
        Self { config, http }
    }

    /// Fetch and parse a full configuration snapshot.
    ///
    /// # Errors
    ///
    /// Transport failures surface as [`Error::Http`]; an unparseable or
    /// invalid snapshot as [`Error::Config`].
    pub async fn fetch(&self) -> Result<Config> {
        let mut request = self.http.get(&self.config.url);
        if let Some(ref token) = self.config.bearer_token {
            request = request.bearer_auth(token);
        }

        let body = request.send().await?.error_for_status()?.text().await?;
        Config::from_yaml_str(&body)
    }
}
