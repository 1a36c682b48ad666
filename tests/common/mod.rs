//! Shared harness for end-to-end tests: a fully wired router over an
//! in-memory state, a temp-file audit trail, and request helpers.

// Each test binary uses a different subset of these helpers.
#![allow(dead_code)]

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode};
use tokio::sync::broadcast;
use tower::ServiceExt;

use authproxy::approval::ApprovalGate;
use authproxy::audit::AuditLog;
use authproxy::auth::{LocalAuthenticator, OidcClient, TokenService, sha256_hex};
use authproxy::config::{
    BackendKind, Config, ConnectionConfig, LocalUserConfig, WhitelistRuleConfig,
};
use authproxy::forwarder::ForwarderSet;
use authproxy::generation::ActiveCatalog;
use authproxy::registry::TunnelRegistry;
use authproxy::server::{AppState, create_router};

/// A wired-up server under test.
pub struct TestHarness {
    pub state: Arc<AppState>,
    pub router: axum::Router,
    shutdown: broadcast::Sender<()>,
    audit_writer: tokio::task::JoinHandle<()>,
    audit_path: PathBuf,
    _tmp: tempfile::TempDir,
}

/// A config with two local users and no connections; tests add their own.
pub fn base_config() -> Config {
    let mut config = Config::default();
    config.auth.users = vec![
        LocalUserConfig {
            username: "alice".to_string(),
            password_sha256: sha256_hex("alice-pw"),
            email: Some("alice@example.com".to_string()),
            roles: vec!["developer".to_string(), "dba".to_string()],
        },
        LocalUserConfig {
            username: "eve".to_string(),
            password_sha256: sha256_hex("eve-pw"),
            email: None,
            roles: vec!["intern".to_string()],
        },
    ];
    config.approval.approver_token = Some("approver-secret".to_string());
    config
}

/// A postgres-style connection spec for tests.
pub fn postgres_connection(
    target: &str,
    allowed_roles: &[&str],
    approval_required: bool,
    whitelist: &[&str],
) -> ConnectionConfig {
    ConnectionConfig {
        description: "test connection".to_string(),
        backend_type: BackendKind::Postgres,
        target: target.to_string(),
        allowed_roles: allowed_roles.iter().map(|s| (*s).to_string()).collect(),
        approval_required,
        approval_exempt_roles: Vec::new(),
        whitelist: whitelist
            .iter()
            .map(|p| WhitelistRuleConfig {
                pattern: (*p).to_string(),
                require_approval: false,
            })
            .collect(),
        max_duration: Duration::from_secs(3600),
        default_duration: Duration::from_secs(600),
    }
}

/// Spin up a TCP backend that answers every read with the uppercased bytes.
pub async fn spawn_echo_backend() -> String {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let mut buf = vec![0u8; 4096];
                while let Ok(n) = socket.read(&mut buf).await {
                    if n == 0 {
                        break;
                    }
                    let reply = buf[..n].to_ascii_uppercase();
                    if socket.write_all(&reply).await.is_err() {
                        break;
                    }
                }
            });
        }
    });
    addr
}

/// Build the harness over `config`, with the audit trail in a temp dir.
pub async fn harness(mut config: Config) -> TestHarness {
    let tmp = tempfile::tempdir().unwrap();
    let audit_path = tmp.path().join("audit.log");
    config.audit.path = audit_path.to_string_lossy().into_owned();

    let (shutdown, _) = broadcast::channel(1);
    let (audit, audit_writer) = AuditLog::open(&config.audit, shutdown.subscribe())
        .await
        .unwrap();

    let state = Arc::new(AppState {
        authenticator: LocalAuthenticator::new(config.auth.users.clone()),
        tokens: TokenService::new("e2e-test-secret", config.auth.token_ttl),
        oidc: OidcClient::new(config.auth.oidc.clone()),
        catalog: ActiveCatalog::new(&config).unwrap(),
        registry: TunnelRegistry::new(config.registry.retention),
        gate: ApprovalGate::new(config.approval.clone()),
        forwarders: ForwarderSet::new(&config.forwarder),
        audit,
        remote_store: None,
        config_path: None,
        config,
    });

    TestHarness {
        router: create_router(Arc::clone(&state)),
        state,
        shutdown,
        audit_writer,
        audit_path,
        _tmp: tmp,
    }
}

impl TestHarness {
    /// Send one request through the router.
    pub async fn request(
        &self,
        method: &str,
        path: &str,
        token: Option<&str>,
        json_body: Option<serde_json::Value>,
    ) -> (StatusCode, Vec<u8>) {
        let mut builder = Request::builder().method(method).uri(path);
        if let Some(token) = token {
            builder = builder.header("authorization", format!("Bearer {token}"));
        }
        let body = match json_body {
            Some(value) => {
                builder = builder.header("content-type", "application/json");
                Body::from(serde_json::to_vec(&value).unwrap())
            }
            None => Body::empty(),
        };

        let response = self
            .router
            .clone()
            .oneshot(builder.body(body).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, bytes.to_vec())
    }

    /// Send raw operation bytes to `/api/proxy/{id}`.
    pub async fn proxy_raw(
        &self,
        connection_id: &str,
        token: &str,
        payload: &[u8],
    ) -> (StatusCode, Vec<u8>) {
        let request = Request::builder()
            .method("POST")
            .uri(format!("/api/proxy/{connection_id}"))
            .header("authorization", format!("Bearer {token}"))
            .body(Body::from(payload.to_vec()))
            .unwrap();

        let response = self.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, bytes.to_vec())
    }

    /// Log in and return the bearer token.
    pub async fn login(&self, username: &str, password: &str) -> String {
        let (status, body) = self
            .request(
                "POST",
                "/api/login",
                None,
                Some(serde_json::json!({"username": username, "password": password})),
            )
            .await;
        assert_eq!(status, StatusCode::OK, "login failed: {body:?}");
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        json["token"].as_str().unwrap().to_string()
    }

    /// Open a tunnel and return its connection id.
    pub async fn connect(&self, name: &str, token: &str, duration: Option<&str>) -> String {
        let body = duration.map(|d| serde_json::json!({"duration": d}));
        let (status, bytes) = self
            .request("POST", &format!("/api/connect/{name}"), Some(token), body)
            .await;
        assert_eq!(status, StatusCode::OK, "connect failed");
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        json["connection_id"].as_str().unwrap().to_string()
    }

    /// Stop the audit writer and return every record written, in order.
    pub async fn finish_audit(self) -> Vec<serde_json::Value> {
        self.shutdown.send(()).unwrap();
        self.audit_writer.await.unwrap();

        std::fs::read_to_string(&self.audit_path)
            .unwrap()
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect()
    }
}

/// Count audit records whose event starts with a prefix.
pub fn count_events(records: &[serde_json::Value], prefix: &str) -> usize {
    records
        .iter()
        .filter(|r| {
            r["event"]
                .as_str()
                .is_some_and(|event| event.starts_with(prefix))
        })
        .count()
}

/// Connection config map builder.
pub fn connections(
    entries: Vec<(&str, ConnectionConfig)>,
) -> HashMap<String, ConnectionConfig> {
    entries
        .into_iter()
        .map(|(name, config)| (name.to_string(), config))
        .collect()
}
