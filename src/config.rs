//! Configuration management

use std::{collections::HashMap, env, path::Path, time::Duration};

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
#[derive(Default)]
pub struct Config {
    /// Server configuration
    pub server: ServerConfig,
    /// Authentication configuration (local users, token signing, OIDC providers)
    pub auth: AuthConfig,
    /// Approval gate configuration
    pub approval: ApprovalConfig,
    /// Audit trail configuration
    pub audit: AuditConfig,
    /// Tunnel registry configuration
    pub registry: RegistryConfig,
    /// Admin endpoints configuration
    pub admin: AdminConfig,
    /// Backend forwarding timeouts
    pub forwarder: ForwarderConfig,
    /// Optional remote configuration store
    pub remote_store: Option<RemoteStoreConfig>,
    /// Proxyable connection specifications, keyed by name
    pub connections: HashMap<String, ConnectionConfig>,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
    /// Externally visible base URL (defaults to `http://host:port`)
    pub base_url: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8077,
            base_url: None,
        }
    }
}

impl ServerConfig {
    /// The base URL clients should use to reach this server.
    #[must_use]
    pub fn base_url(&self) -> String {
        self.base_url
            .clone()
            .unwrap_or_else(|| format!("http://{}:{}", self.host, self.port))
    }
}

/// Authentication configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Token signing secret. Supports `auto` (random per process) and
    /// `env:VAR_NAME` indirection.
    pub token_secret: String,
    /// Lifetime of issued bearer tokens
    #[serde(with = "humantime_serde")]
    pub token_ttl: Duration,
    /// Local users (username/password path)
    pub users: Vec<LocalUserConfig>,
    /// Federated identity providers
    pub oidc: Vec<OidcProviderConfig>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            token_secret: "auto".to_string(),
            token_ttl: Duration::from_secs(8 * 3600),
            users: Vec::new(),
            oidc: Vec::new(),
        }
    }
}

impl AuthConfig {
    /// Resolve the token signing secret (expand env vars, generate if `auto`).
    #[must_use]
    pub fn resolve_token_secret(&self) -> String {
        if self.token_secret == "auto" {
            use rand::RngExt;
            let random_bytes: [u8; 32] = rand::rng().random();
            base64::Engine::encode(
                &base64::engine::general_purpose::URL_SAFE_NO_PAD,
                random_bytes,
            )
        } else if let Some(var_name) = self.token_secret.strip_prefix("env:") {
            env::var(var_name).unwrap_or_else(|_| self.token_secret.clone())
        } else {
            self.token_secret.clone()
        }
    }
}

/// A locally-authenticated user
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalUserConfig {
    /// Username
    pub username: String,
    /// Hex-encoded SHA-256 digest of the password
    pub password_sha256: String,
    /// Email address
    #[serde(default)]
    pub email: Option<String>,
    /// Role set granted at login
    #[serde(default)]
    pub roles: Vec<String>,
}

/// Federated identity provider (OIDC authorization-code flow)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OidcProviderConfig {
    /// Provider name shown in `/api/info`
    pub name: String,
    /// Whether this provider is offered to clients
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Issuer URL
    pub issuer: String,
    /// OAuth client id
    pub client_id: String,
    /// OAuth client secret (supports `env:VAR_NAME`)
    pub client_secret: String,
    /// Authorization endpoint (default: `{issuer}/authorize`)
    #[serde(default)]
    pub authorize_url: Option<String>,
    /// Token endpoint (default: `{issuer}/oauth/token`)
    #[serde(default)]
    pub token_url: Option<String>,
    /// User-info endpoint (default: `{issuer}/userinfo`)
    #[serde(default)]
    pub userinfo_url: Option<String>,
    /// Claim in the user-info document carrying the role list
    #[serde(default = "default_roles_claim")]
    pub roles_claim: String,
    /// Redirect URL registered with the provider
    pub redirect_url: String,
    /// How long a started login flow stays redeemable
    #[serde(default = "default_flow_ttl", with = "humantime_serde")]
    pub flow_ttl: Duration,
}

fn default_true() -> bool {
    true
}

fn default_roles_claim() -> String {
    "roles".to_string()
}

fn default_flow_ttl() -> Duration {
    Duration::from_secs(300)
}

impl OidcProviderConfig {
    /// Resolve the client secret (expand env vars).
    #[must_use]
    pub fn resolve_client_secret(&self) -> String {
        if let Some(var_name) = self.client_secret.strip_prefix("env:") {
            env::var(var_name).unwrap_or_else(|_| self.client_secret.clone())
        } else {
            self.client_secret.clone()
        }
    }

    /// Authorization endpoint, derived from the issuer when not set.
    #[must_use]
    pub fn authorize_url(&self) -> String {
        self.authorize_url
            .clone()
            .unwrap_or_else(|| format!("{}/authorize", self.issuer.trim_end_matches('/')))
    }

    /// Token endpoint, derived from the issuer when not set.
    #[must_use]
    pub fn token_url(&self) -> String {
        self.token_url
            .clone()
            .unwrap_or_else(|| format!("{}/oauth/token", self.issuer.trim_end_matches('/')))
    }

    /// User-info endpoint, derived from the issuer when not set.
    #[must_use]
    pub fn userinfo_url(&self) -> String {
        self.userinfo_url
            .clone()
            .unwrap_or_else(|| format!("{}/userinfo", self.issuer.trim_end_matches('/')))
    }
}

/// Approval gate configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApprovalConfig {
    /// Webhook URL notified when an operation enters `pending`
    pub webhook_url: Option<String>,
    /// HMAC secret for signing webhook payloads (supports `env:VAR_NAME`)
    pub webhook_secret: Option<String>,
    /// Bearer token approvers present on the decision callback
    pub approver_token: Option<String>,
    /// How long a pending operation waits before resolving timed-out
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for ApprovalConfig {
    fn default() -> Self {
        Self {
            webhook_url: None,
            webhook_secret: None,
            approver_token: None,
            timeout: Duration::from_secs(60),
        }
    }
}

impl ApprovalConfig {
    /// Resolve the webhook secret (expand env vars).
    #[must_use]
    pub fn resolve_webhook_secret(&self) -> Option<String> {
        self.webhook_secret.as_ref().map(|s| {
            if let Some(var_name) = s.strip_prefix("env:") {
                env::var(var_name).unwrap_or_else(|_| s.clone())
            } else {
                s.clone()
            }
        })
    }
}

/// Audit trail configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    /// File the append-only audit trail is written to
    pub path: String,
    /// Bounded queue depth; producers block (never drop) when full
    pub queue_capacity: usize,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            path: "authproxy-audit.log".to_string(),
            queue_capacity: 1024,
        }
    }
}

/// Tunnel registry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Interval of the background expiry sweep
    #[serde(with = "humantime_serde")]
    pub sweep_interval: Duration,
    /// How long closed/expired entries stay visible before removal
    #[serde(with = "humantime_serde")]
    pub retention: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(30),
            retention: Duration::from_secs(300),
        }
    }
}

/// Admin endpoints configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AdminConfig {
    /// Bearer token guarding `/api/admin/*` (endpoints disabled when unset)
    pub bearer_token: Option<String>,
}

/// Backend forwarding timeouts
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ForwarderConfig {
    /// Timeout for establishing one backend connection attempt
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
    /// Timeout for one forwarded operation's backend I/O
    #[serde(with = "humantime_serde")]
    pub io_timeout: Duration,
    /// Connection-establishment retry attempts (with exponential backoff)
    pub connect_attempts: usize,
}

impl Default for ForwarderConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            io_timeout: Duration::from_secs(30),
            connect_attempts: 3,
        }
    }
}

/// Optional remote configuration store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteStoreConfig {
    /// URL returning a full YAML configuration snapshot
    pub url: String,
    /// Bearer token presented to the store
    #[serde(default)]
    pub bearer_token: Option<String>,
    /// Fetch timeout
    #[serde(default = "default_fetch_timeout", with = "humantime_serde")]
    pub fetch_timeout: Duration,
}

fn default_fetch_timeout() -> Duration {
    Duration::from_secs(10)
}

/// One proxyable backend definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Human-readable description
    #[serde(default)]
    pub description: String,
    /// Backend protocol family, selects the matcher and forwarder
    #[serde(rename = "type")]
    pub backend_type: BackendKind,
    /// Target address (`host:port` for wire protocols, base URL for http)
    pub target: String,
    /// Roles that may open tunnels to this backend
    #[serde(default)]
    pub allowed_roles: Vec<String>,
    /// Whether operations require external approval
    #[serde(default)]
    pub approval_required: bool,
    /// Roles exempt from the approval requirement
    #[serde(default)]
    pub approval_exempt_roles: Vec<String>,
    /// Ordered allow-rules; first match wins, no match denies
    #[serde(default)]
    pub whitelist: Vec<WhitelistRuleConfig>,
    /// Hard cap on tunnel lifetime
    #[serde(default = "default_max_duration", with = "humantime_serde")]
    pub max_duration: Duration,
    /// Tunnel lifetime when the client does not request one
    #[serde(default = "default_tunnel_duration", with = "humantime_serde")]
    pub default_duration: Duration,
}

fn default_max_duration() -> Duration {
    Duration::from_secs(4 * 3600)
}

fn default_tunnel_duration() -> Duration {
    Duration::from_secs(1800)
}

/// Backend protocol family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// `PostgreSQL` wire target, SQL text operations
    Postgres,
    /// `MySQL` wire target, SQL text operations
    Mysql,
    /// Redis wire target, command text operations
    Redis,
    /// HTTP target, request-line operations
    Http,
}

impl BackendKind {
    /// Name used in API responses and audit records.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Postgres => "postgres",
            Self::Mysql => "mysql",
            Self::Redis => "redis",
            Self::Http => "http",
        }
    }

    /// Whether operations for this backend are normalized command text.
    #[must_use]
    pub fn is_command_protocol(self) -> bool {
        matches!(self, Self::Postgres | Self::Mysql | Self::Redis)
    }
}

/// One whitelist allow-rule
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WhitelistRuleConfig {
    /// Pattern: normalized text, optional single trailing `*`, or `regex:...`
    pub pattern: String,
    /// Put matches of this rule behind the approval gate
    #[serde(default)]
    pub require_approval: bool,
}

impl Config {
    /// Load configuration from file and environment
    ///
    /// # Errors
    ///
    /// Returns an error if the config file does not exist or cannot be parsed.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        figment = figment.merge(Env::prefixed("AUTHPROXY_").split("__"));

        let config: Self = figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Parse a configuration snapshot (remote store payload).
    ///
    /// # Errors
    ///
    /// Returns an error if the YAML does not parse or fails validation.
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Self =
            serde_yaml::from_str(yaml).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate cross-field constraints that serde cannot express.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` naming the first offending field.
    pub fn validate(&self) -> Result<()> {
        for user in &self.auth.users {
            if user.password_sha256.len() != 64
                || !user.password_sha256.bytes().all(|b| b.is_ascii_hexdigit())
            {
                return Err(Error::Config(format!(
                    "User '{}': password_sha256 must be a 64-char hex digest",
                    user.username
                )));
            }
        }

        for (name, conn) in &self.connections {
            if conn.target.is_empty() {
                return Err(Error::Config(format!(
                    "Connection '{name}': target must not be empty"
                )));
            }
            if conn.allowed_roles.is_empty() {
                return Err(Error::Config(format!(
                    "Connection '{name}': allowed_roles must not be empty"
                )));
            }
            if conn.default_duration > conn.max_duration {
                return Err(Error::Config(format!(
                    "Connection '{name}': default_duration exceeds max_duration"
                )));
            }
            for rule in &conn.whitelist {
                if let Some(expr) = rule.pattern.strip_prefix("regex:") {
                    regex::Regex::new(expr).map_err(|e| {
                        Error::Config(format!(
                            "Connection '{name}': invalid whitelist regex '{expr}': {e}"
                        ))
                    })?;
                }
            }
        }

        Ok(())
    }
}

/// Custom humantime serde module for Duration
pub mod humantime_serde {
    use std::time::Duration;

    use serde::{self, Deserialize, Deserializer, Serializer};

    /// Serialize Duration to human-readable string (e.g., "30s")
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the serializer fails.
    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format!("{}s", duration.as_secs()))
    }

    /// Deserialize human-readable duration string (e.g., "30s", "5m", "100ms")
    ///
    /// # Errors
    ///
    /// Returns a deserialization error if the string cannot be parsed as a duration.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse(&s).map_err(serde::de::Error::custom)
    }

    /// Parse "30s", "5m", "2h", "100ms", or a bare number of seconds.
    pub(crate) fn parse(s: &str) -> Result<Duration, String> {
        let bad = |_| format!("invalid duration: {s}");
        if let Some(ms) = s.strip_suffix("ms") {
            ms.parse::<u64>().map(Duration::from_millis).map_err(bad)
        } else if let Some(secs) = s.strip_suffix('s') {
            secs.parse::<u64>().map(Duration::from_secs).map_err(bad)
        } else if let Some(mins) = s.strip_suffix('m') {
            mins.parse::<u64>()
                .map(|m| Duration::from_secs(m * 60))
                .map_err(bad)
        } else if let Some(hours) = s.strip_suffix('h') {
            hours
                .parse::<u64>()
                .map(|h| Duration::from_secs(h * 3600))
                .map_err(bad)
        } else {
            s.parse::<u64>().map(Duration::from_secs).map_err(bad)
        }
    }

    /// Same format for `Option<Duration>` fields.
    pub mod option {
        use std::time::Duration;

        use serde::{Deserialize, Deserializer, Serializer};

        /// Serialize an optional duration.
        ///
        /// # Errors
        ///
        /// Returns a serialization error if the serializer fails.
        pub fn serialize<S>(
            duration: &Option<Duration>,
            serializer: S,
        ) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            match duration {
                Some(d) => serializer.serialize_str(&format!("{}s", d.as_secs())),
                None => serializer.serialize_none(),
            }
        }

        /// Deserialize an optional duration.
        ///
        /// # Errors
        ///
        /// Returns a deserialization error on an unparseable string.
        pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
        where
            D: Deserializer<'de>,
        {
            let opt: Option<String> = Option::deserialize(deserializer)?;
            opt.map(|s| super::parse(&s).map_err(serde::de::Error::custom))
                .transpose()
        }
    }
}
