//! Proxy server — wiring, background tasks, graceful shutdown.

pub mod handlers;
pub mod middleware;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    Router, middleware as axum_middleware,
    routing::{get, post},
};
use tokio::net::TcpListener;
use tokio::signal;
use tower_http::{catch_panic::CatchPanicLayer, trace::TraceLayer};
use tracing::{debug, info, warn};

use crate::approval::ApprovalGate;
use crate::audit::{AuditLog, AuditRecord};
use crate::auth::{LocalAuthenticator, OidcClient, TokenService};
use crate::config::Config;
use crate::forwarder::ForwarderSet;
use crate::generation::{ActiveCatalog, RemoteStore};
use crate::registry::TunnelRegistry;
use crate::{Error, Result};

/// Shared application state
pub struct AppState {
    /// Full configuration (server, approval, admin sections read at runtime)
    pub config: Config,
    /// Path the startup configuration was loaded from, for file reloads
    pub config_path: Option<PathBuf>,
    /// Local credential checker
    pub authenticator: LocalAuthenticator,
    /// Bearer token issue/validate
    pub tokens: TokenService,
    /// Federated login flows
    pub oidc: OidcClient,
    /// Active configuration generation
    pub catalog: ActiveCatalog,
    /// Tunnel table
    pub registry: TunnelRegistry,
    /// Approval gate
    pub gate: ApprovalGate,
    /// Per-backend-family forwarders
    pub forwarders: ForwarderSet,
    /// Durable audit trail
    pub audit: AuditLog,
    /// Optional remote configuration store
    pub remote_store: Option<RemoteStore>,
}

/// The access proxy server
pub struct Server {
    config: Config,
    config_path: Option<PathBuf>,
}

impl Server {
    /// Create a server from loaded configuration.
    #[must_use]
    pub fn new(config: Config, config_path: Option<PathBuf>) -> Self {
        Self {
            config,
            config_path,
        }
    }

    /// Run until a shutdown signal arrives.
    ///
    /// # Errors
    ///
    /// Returns an error for an unbindable address, an unopenable audit file,
    /// or a configuration that fails to compile.
    pub async fn run(self) -> Result<()> {
        let addr = SocketAddr::new(
            self.config
                .server
                .host
                .parse()
                .map_err(|e| Error::Config(format!("Invalid host: {e}")))?,
            self.config.server.port,
        );

        let (shutdown_tx, _) = tokio::sync::broadcast::channel(1);

        let (audit, audit_writer) =
            AuditLog::open(&self.config.audit, shutdown_tx.subscribe()).await?;

        let catalog = ActiveCatalog::new(&self.config)?;
        let state = Arc::new(AppState {
            authenticator: LocalAuthenticator::new(self.config.auth.users.clone()),
            tokens: TokenService::new(
                &self.config.auth.resolve_token_secret(),
                self.config.auth.token_ttl,
            ),
            oidc: OidcClient::new(self.config.auth.oidc.clone()),
            catalog,
            registry: TunnelRegistry::new(self.config.registry.retention),
            gate: ApprovalGate::new(self.config.approval.clone()),
            forwarders: ForwarderSet::new(&self.config.forwarder),
            audit,
            remote_store: self.config.remote_store.clone().map(RemoteStore::new),
            config_path: self.config_path.clone(),
            config: self.config,
        });

        spawn_sweeper(Arc::clone(&state), shutdown_tx.subscribe());

        let app = create_router(Arc::clone(&state));
        let listener = TcpListener::bind(addr).await?;

        info!("============================================================");
        info!("AUTHPROXY v{}", env!("CARGO_PKG_VERSION"));
        info!("============================================================");
        info!(host = %state.config.server.host, port = state.config.server.port, "Listening");
        info!(
            connections = state.catalog.current().len(),
            generation = state.catalog.current().generation,
            "Connection catalog loaded"
        );
        info!(
            local_users = state.config.auth.users.len(),
            oidc_providers = state.oidc.enabled_providers().count(),
            "Identity providers ready"
        );
        if state.config.approval.webhook_url.is_some() {
            info!("APPROVAL GATE enabled (webhook notifications)");
        } else if state
            .catalog
            .current()
            .iter()
            .any(|spec| spec.approval_required)
        {
            warn!("Approval required on some connections but no approver webhook configured");
        }
        info!(audit_file = %state.config.audit.path, "Audit trail active");
        info!("============================================================");

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal(shutdown_tx))
            .await
            .map_err(|e| Error::Internal(e.to_string()))?;

        info!("Draining audit queue...");
        if let Err(e) = audit_writer.await {
            warn!(error = %e, "Audit writer did not stop cleanly");
        }

        Ok(())
    }
}

/// Create the router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/login", post(handlers::login))
        .route("/api/auth/oidc/login", get(handlers::oidc_login))
        .route("/api/auth/oidc/callback", get(handlers::oidc_callback))
        .route("/api/info", get(handlers::info))
        .route("/api/health", get(handlers::health))
        .route("/api/connections", get(handlers::list_connections))
        .route(
            "/api/connect/{name}",
            post(handlers::connect).delete(handlers::close_tunnel),
        )
        .route("/api/proxy/{connection_id}", post(handlers::proxy))
        .route("/api/approvals/{approval_id}", post(handlers::approval_decision))
        .route("/api/admin/reload", post(handlers::admin_reload))
        // Authentication middleware (applied before other layers)
        .layer(axum_middleware::from_fn_with_state(
            Arc::clone(&state),
            middleware::auth_middleware,
        ))
        .layer(CatchPanicLayer::new())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Background expiry sweep on the configured interval.
fn spawn_sweeper(state: Arc<AppState>, mut shutdown: tokio::sync::broadcast::Receiver<()>) {
    let interval = state.config.registry.sweep_interval;
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let expired = state.registry.sweep().await;
                    for entry in expired {
                        debug!(tunnel = %entry.id, "Sweep expired tunnel");
                        // A disconnected client can leave a pending wait
                        // behind; expiry is the backstop that clears it.
                        state.gate.cancel_for_tunnel(&entry.id);
                        if let Err(e) = state
                            .audit
                            .record(AuditRecord::tunnel_expired(&entry))
                            .await
                        {
                            warn!(error = %e, "Failed to audit tunnel expiry");
                        }
                    }
                }
                _ = shutdown.recv() => {
                    debug!("Expiry sweeper shutting down");
                    break;
                }
            }
        }
    });
}

/// Shutdown signal handler
async fn shutdown_signal(shutdown_tx: tokio::sync::broadcast::Sender<()>) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Shutdown signal received");
    let _ = shutdown_tx.send(());
}
