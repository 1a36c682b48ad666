//! HTTP handlers for the proxy API.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/api/login` | Local credential login, returns a bearer token |
//! | `GET` | `/api/auth/oidc/login` | Start a federated login flow |
//! | `GET` | `/api/auth/oidc/callback` | Provider redirect target |
//! | `GET` | `/api/info` | Capability discovery |
//! | `GET` | `/api/connections` | Specs addressable by the caller's roles |
//! | `POST` | `/api/connect/{name}` | Allocate a tunnel |
//! | `DELETE` | `/api/connect/{connection_id}` | Owner close |
//! | `POST` | `/api/proxy/{connection_id}` | One operation through the pipeline |
//! | `POST` | `/api/approvals/{approval_id}` | Approver decision callback |
//! | `POST` | `/api/admin/reload` | Install a new configuration generation |
//! | `GET` | `/api/health` | Liveness and gauge counts |

use std::sync::Arc;
use std::time::Duration;

use axum::{
    Extension, Json,
    body::Bytes,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Redirect, Response},
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use subtle::ConstantTimeEq;
use tracing::{info, warn};

use super::AppState;
use crate::approval::{ApprovalDecision, ApprovalOutcome, redact_summary};
use crate::audit::AuditRecord;
use crate::auth::Identity;
use crate::config::Config;
use crate::filter::Decision;
use crate::registry::{TunnelEntry, TunnelState};
use crate::{Error, Result, policy};

// ── Request / Response types ───────────────────────────────────────────────

/// `POST /api/login` request body.
#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    /// Username
    pub username: String,
    /// Password
    pub password: String,
}

/// Login response, also delivered base64-encoded to the OIDC `cli_callback`.
#[derive(Debug, Serialize)]
pub struct LoginResponse {
    /// Signed bearer token
    pub token: String,
    /// Token expiry (RFC 3339)
    pub expires_at: String,
    /// The authenticated user
    pub user: UserInfo,
}

/// User block of the login response.
#[derive(Debug, Serialize)]
pub struct UserInfo {
    /// Username
    pub username: String,
    /// Email, when known
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    /// Role set
    pub roles: Vec<String>,
}

/// `GET /api/auth/oidc/login` query parameters.
#[derive(Debug, Deserialize)]
pub struct OidcLoginQuery {
    /// Provider name; defaults to the first enabled provider
    pub provider: Option<String>,
    /// CLI-generated correlation state
    pub state: String,
    /// Where the CLI receives the token data
    pub cli_callback: String,
}

/// `GET /api/auth/oidc/callback` query parameters.
#[derive(Debug, Deserialize)]
pub struct OidcCallbackQuery {
    /// Authorization code from the provider
    pub code: String,
    /// Correlation state issued at flow start
    pub state: String,
}

/// `POST /api/connect/{name}` request body.
#[derive(Debug, Default, Deserialize)]
pub struct ConnectRequest {
    /// Requested tunnel lifetime (e.g. `"30m"`); clamped to the spec's max
    #[serde(default, with = "crate::config::humantime_serde::option")]
    pub duration: Option<Duration>,
}

/// `POST /api/connect/{name}` response.
#[derive(Debug, Serialize)]
pub struct ConnectResponse {
    /// Tunnel id
    pub connection_id: String,
    /// Fixed tunnel expiry (RFC 3339)
    pub expires_at: String,
    /// URL operations are POSTed to
    pub proxy_url: String,
}

/// `POST /api/approvals/{approval_id}` request body.
#[derive(Debug, Deserialize)]
pub struct ApprovalRequest {
    /// `approved` or `denied`
    pub decision: String,
    /// Approver identity for the audit trail
    pub approver: String,
    /// Optional reason
    #[serde(default)]
    pub reason: Option<String>,
}

// ── Helpers ────────────────────────────────────────────────────────────────

/// Render an [`Error`] as its JSON HTTP response.
fn error_response(err: &Error) -> Response {
    (
        err.status_code(),
        Json(json!({
            "error": err.code(),
            "message": err.to_string(),
        })),
    )
        .into_response()
}

fn login_response(state: &AppState, identity: &Identity) -> Result<LoginResponse> {
    let issued = state.tokens.issue(identity)?;
    Ok(LoginResponse {
        token: issued.token,
        expires_at: issued.expires_at.to_rfc3339(),
        user: UserInfo {
            username: identity.username.clone(),
            email: identity.email.clone(),
            roles: identity.roles.clone(),
        },
    })
}

/// Audit, mapping an audit failure onto the request (never the process).
async fn audit(state: &AppState, record: AuditRecord) -> Result<()> {
    state.audit.record(record).await
}

// ── Authentication handlers ────────────────────────────────────────────────

/// `POST /api/login` — local credential path.
pub async fn login(
    State(state): State<Arc<AppState>>,
    Json(body): Json<LoginRequest>,
) -> Response {
    match state.authenticator.authenticate(&body.username, &body.password) {
        Ok(identity) => {
            if let Err(e) = audit(
                &state,
                AuditRecord::login_succeeded(&identity.username, &identity.provider),
            )
            .await
            {
                return error_response(&e);
            }
            match login_response(&state, &identity) {
                Ok(response) => (StatusCode::OK, Json(response)).into_response(),
                Err(e) => error_response(&e),
            }
        }
        Err(e) => {
            warn!(username = %body.username, "Login failed");
            if let Err(audit_err) = audit(
                &state,
                AuditRecord::login_failed(&body.username, "invalid credentials"),
            )
            .await
            {
                return error_response(&audit_err);
            }
            error_response(&e)
        }
    }
}

/// `GET /api/auth/oidc/login` — start a federated flow.
pub async fn oidc_login(
    State(state): State<Arc<AppState>>,
    Query(query): Query<OidcLoginQuery>,
) -> Response {
    let provider = match query.provider {
        Some(name) => name,
        None => match state.oidc.enabled_providers().next() {
            Some(p) => p.name.clone(),
            None => {
                return (
                    StatusCode::NOT_FOUND,
                    Json(json!({
                        "error": "no_provider",
                        "message": "No identity provider is configured",
                    })),
                )
                    .into_response();
            }
        },
    };

    match state
        .oidc
        .begin_flow(&provider, &query.state, &query.cli_callback)
    {
        Ok(redirect_url) => Redirect::temporary(&redirect_url).into_response(),
        Err(e) => error_response(&e),
    }
}

/// `GET /api/auth/oidc/callback` — complete a federated flow and hand the
/// token to the CLI via its callback URL.
pub async fn oidc_callback(
    State(state): State<Arc<AppState>>,
    Query(query): Query<OidcCallbackQuery>,
) -> Response {
    let (identity, cli_callback) = match state.oidc.exchange_code(&query.code, &query.state).await
    {
        Ok(result) => result,
        Err(e) => {
            if let Err(audit_err) = audit(
                &state,
                AuditRecord::login_failed("(oidc)", &e.to_string()),
            )
            .await
            {
                return error_response(&audit_err);
            }
            return error_response(&e);
        }
    };

    if let Err(e) = audit(
        &state,
        AuditRecord::login_succeeded(&identity.username, &identity.provider),
    )
    .await
    {
        return error_response(&e);
    }

    let response = match login_response(&state, &identity) {
        Ok(r) => r,
        Err(e) => return error_response(&e),
    };

    let token_data = match serde_json::to_vec(&response) {
        Ok(bytes) => base64::Engine::encode(
            &base64::engine::general_purpose::URL_SAFE_NO_PAD,
            bytes,
        ),
        Err(e) => return error_response(&e.into()),
    };

    let separator = if cli_callback.contains('?') { '&' } else { '?' };
    Redirect::temporary(&format!("{cli_callback}{separator}token_data={token_data}"))
        .into_response()
}

// ── Discovery handlers ─────────────────────────────────────────────────────

/// `GET /api/info` — capability discovery.
pub async fn info(State(state): State<Arc<AppState>>) -> Response {
    let mut providers = Vec::new();
    if !state.config.auth.users.is_empty() {
        providers.push(json!({
            "name": "local",
            "type": "local",
            "enabled": true,
        }));
    }
    for p in state.oidc.enabled_providers() {
        providers.push(json!({
            "name": p.name,
            "type": "oidc",
            "enabled": p.enabled,
            "redirect_url": p.redirect_url,
        }));
    }

    Json(json!({
        "base_url": state.config.server.base_url(),
        "auth_providers": providers,
    }))
    .into_response()
}

/// `GET /api/health` — liveness and gauge counts (public).
pub async fn health(State(state): State<Arc<AppState>>) -> Response {
    Json(json!({
        "status": "ok",
        "active_tunnels": state.registry.active_count(),
        "pending_approvals": state.gate.pending_count(),
        "generation": state.catalog.current().generation,
    }))
    .into_response()
}

/// `GET /api/connections` — specs addressable by the caller's roles.
pub async fn list_connections(
    State(state): State<Arc<AppState>>,
    Extension(identity): Extension<Identity>,
) -> Response {
    let catalog = state.catalog.current();
    let specs = policy::visible_specs(&catalog, &identity.roles);

    let connections: Vec<serde_json::Value> = specs
        .iter()
        .map(|spec| {
            json!({
                "name": spec.name,
                "type": spec.backend_type.as_str(),
                "metadata": {
                    "description": spec.description,
                    "approval_required": spec.approval_required,
                    "max_duration_secs": spec.max_duration.as_secs(),
                },
            })
        })
        .collect();

    Json(connections).into_response()
}

// ── Tunnel handlers ────────────────────────────────────────────────────────

/// `POST /api/connect/{name}` — allocate a tunnel.
pub async fn connect(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Extension(identity): Extension<Identity>,
    body: Bytes,
) -> Response {
    // An absent body means "use the spec's default duration"
    let request: ConnectRequest = if body.is_empty() {
        ConnectRequest::default()
    } else {
        match serde_json::from_slice(&body) {
            Ok(request) => request,
            Err(e) => {
                return (
                    StatusCode::BAD_REQUEST,
                    Json(json!({
                        "error": "invalid_request",
                        "message": format!("Bad connect request body: {e}"),
                    })),
                )
                    .into_response();
            }
        }
    };

    let catalog = state.catalog.current();
    let access = match policy::resolve(&catalog, &identity.roles, &name) {
        Ok(access) => access,
        Err(e) => {
            if let Err(audit_err) = audit(
                &state,
                AuditRecord::tunnel_denied(&name, &identity.username, &e.to_string()),
            )
            .await
            {
                return error_response(&audit_err);
            }
            return error_response(&e);
        }
    };

    let entry = state.registry.create(
        identity,
        access.spec,
        request.duration,
        access.approval_required,
    );

    if let Err(e) = audit(&state, AuditRecord::tunnel_created(&entry)).await {
        return error_response(&e);
    }

    info!(tunnel = %entry.id, connection = %name, "Tunnel created");
    (
        StatusCode::OK,
        Json(ConnectResponse {
            connection_id: entry.id.clone(),
            expires_at: entry.expires_at().to_rfc3339(),
            proxy_url: format!(
                "{}/api/proxy/{}",
                state.config.server.base_url(),
                entry.id
            ),
        }),
    )
        .into_response()
}

/// `DELETE /api/connect/{connection_id}` — owner close.
pub async fn close_tunnel(
    State(state): State<Arc<AppState>>,
    Path(connection_id): Path<String>,
    Extension(identity): Extension<Identity>,
) -> Response {
    let entry = match state.registry.close(&connection_id, &identity).await {
        Ok(entry) => entry,
        Err(e) => return error_response(&e),
    };

    // Outstanding approval waits resolve cancelled; each suspended operation
    // records its own terminal decision as it resumes.
    let cancelled = state.gate.cancel_for_tunnel(&connection_id);
    if cancelled > 0 {
        info!(tunnel = %connection_id, cancelled, "Cancelled pending approvals on close");
    }

    if let Err(e) = audit(&state, AuditRecord::tunnel_closed(&entry)).await {
        return error_response(&e);
    }

    StatusCode::NO_CONTENT.into_response()
}

// ── The operation pipeline ─────────────────────────────────────────────────

/// `POST /api/proxy/{connection_id}` — one operation through the decision
/// pipeline: ownership, expiry, whitelist, approval, forward; audited at
/// every terminal outcome.
pub async fn proxy(
    State(state): State<Arc<AppState>>,
    Path(connection_id): Path<String>,
    Extension(identity): Extension<Identity>,
    body: Bytes,
) -> Response {
    let entry = match state.registry.get(&connection_id) {
        Ok(entry) => entry,
        Err(e) => return error_response(&e),
    };

    match run_operation(&state, &entry, &identity, &body).await {
        Ok(response_bytes) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "application/octet-stream")],
            response_bytes,
        )
            .into_response(),
        Err(e) => error_response(&e),
    }
}

/// The decision pipeline for one operation. Every exit path below records
/// exactly one `operation.*` audit record.
async fn run_operation(
    state: &AppState,
    entry: &Arc<TunnelEntry>,
    identity: &Identity,
    body: &[u8],
) -> Result<Vec<u8>> {
    // Ownership first: a foreign identity gets no lease and no sequence slot.
    if entry.owner.username != identity.username {
        audit(
            state,
            AuditRecord::operation_denied(entry, None, "not the tunnel owner"),
        )
        .await?;
        return Err(Error::Forbidden(format!(
            "tunnel '{}' is not owned by this identity",
            entry.id
        )));
    }

    // The per-tunnel lease: holds until this operation reaches a terminal
    // decision, serializing same-tunnel operations in arrival order.
    let lease = entry.op_lock.lock().await;

    let result = run_leased_operation(state, entry, body).await;

    drop(lease);

    // The lease is released; if expiry passed while we held it, transition
    // now rather than waiting for the next sweep pass.
    if entry.is_expired() && entry.expire_now() {
        entry.release_backend().await;
        audit(state, AuditRecord::tunnel_expired(entry)).await?;
    }

    result
}

async fn run_leased_operation(
    state: &AppState,
    entry: &Arc<TunnelEntry>,
    body: &[u8],
) -> Result<Vec<u8>> {
    // Terminal-state and expiry checks at the start of every operation, so a
    // late operation is rejected even between sweep passes.
    match entry.state() {
        TunnelState::Closed => {
            audit(
                state,
                AuditRecord::operation_denied(entry, None, "tunnel closed"),
            )
            .await?;
            return Err(Error::TunnelClosed(entry.id.clone()));
        }
        TunnelState::Expired => {
            audit(
                state,
                AuditRecord::operation_denied(entry, None, "tunnel expired"),
            )
            .await?;
            return Err(Error::TunnelExpired(entry.id.clone()));
        }
        TunnelState::Active | TunnelState::AwaitingApproval => {}
    }

    if entry.is_expired() {
        if entry.expire_now() {
            entry.release_backend().await;
            audit(state, AuditRecord::tunnel_expired(entry)).await?;
        }
        audit(
            state,
            AuditRecord::operation_denied(entry, None, "tunnel expired"),
        )
        .await?;
        return Err(Error::TunnelExpired(entry.id.clone()));
    }

    let sequence = entry.next_seq();

    // Whitelist inspection against the spec generation this tunnel pinned.
    let decision = entry.spec.inspect(body);
    let needs_approval = match decision {
        Decision::Deny { reason } => {
            audit(
                state,
                AuditRecord::operation_denied(entry, Some(sequence), &reason),
            )
            .await?;
            return Err(Error::PolicyViolation(reason));
        }
        Decision::RequireApproval => true,
        Decision::Allow => entry.approval_required,
    };

    let mut approved_by = None;
    if needs_approval {
        let summary = redact_summary(body);
        entry.begin_approval();
        audit(
            state,
            AuditRecord::approval_pending(entry, sequence, &summary),
        )
        .await?;

        let outcome = state
            .gate
            .request(
                &entry.id,
                &entry.spec.name,
                &entry.owner.username,
                sequence,
                &summary,
            )
            .await;
        entry.finish_approval();

        match outcome {
            ApprovalOutcome::Approved { approver } => {
                approved_by = Some(approver);
            }
            ApprovalOutcome::Denied { approver, reason } => {
                let detail = format!(
                    "denied by approver {approver}{}",
                    reason.map(|r| format!(": {r}")).unwrap_or_default()
                );
                audit(
                    state,
                    AuditRecord::operation_denied(entry, Some(sequence), &detail),
                )
                .await?;
                return Err(Error::ApprovalDenied(detail));
            }
            ApprovalOutcome::TimedOut => {
                audit(state, AuditRecord::operation_timed_out(entry, sequence)).await?;
                return Err(Error::ApprovalTimeout);
            }
            ApprovalOutcome::Cancelled => {
                audit(state, AuditRecord::operation_cancelled(entry, sequence)).await?;
                return Err(Error::TunnelClosed(entry.id.clone()));
            }
            ApprovalOutcome::NotifyFailed => {
                audit(
                    state,
                    AuditRecord::operation_denied(
                        entry,
                        Some(sequence),
                        "approver notification failed",
                    ),
                )
                .await?;
                return Err(Error::ApprovalDenied(
                    "approver could not be notified".to_string(),
                ));
            }
        }
    }

    // Forward to the real backend.
    let forwarder = state.forwarders.for_kind(entry.spec.backend_type);
    match forwarder.forward(entry, body).await {
        Ok(response) => {
            let detail = format!(
                "forwarded {} bytes, response {} bytes{}",
                body.len(),
                response.len(),
                approved_by
                    .map(|a| format!(", approved by {a}"))
                    .unwrap_or_default()
            );
            audit(
                state,
                AuditRecord::operation_allowed(entry, sequence, detail),
            )
            .await?;
            Ok(response)
        }
        Err(e) => {
            audit(state, AuditRecord::operation_failed(entry, sequence, &e)).await?;
            Err(e)
        }
    }
}

// ── Approver and admin handlers ────────────────────────────────────────────

/// `POST /api/approvals/{approval_id}` — approver decision callback.
///
/// Guarded by the configured approver token; idempotent — only the first
/// decision per operation is accepted, later ones find nothing (404).
pub async fn approval_decision(
    State(state): State<Arc<AppState>>,
    Path(approval_id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<ApprovalRequest>,
) -> Response {
    if let Err(response) =
        check_shared_token(&headers, state.config.approval.approver_token.as_deref())
    {
        return response;
    }

    let decision = match body.decision.as_str() {
        "approved" => ApprovalDecision::Approved {
            approver: body.approver.clone(),
        },
        "denied" => ApprovalDecision::Denied {
            approver: body.approver.clone(),
            reason: body.reason.clone(),
        },
        other => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({
                    "error": "invalid_decision",
                    "message": format!("decision must be 'approved' or 'denied', got '{other}'"),
                })),
            )
                .into_response();
        }
    };

    if state.gate.resolve(&approval_id, decision) {
        (StatusCode::OK, Json(json!({"accepted": true}))).into_response()
    } else {
        (
            StatusCode::NOT_FOUND,
            Json(json!({
                "error": "approval_not_pending",
                "message": "Unknown, already decided, or timed-out approval",
            })),
        )
            .into_response()
    }
}

/// `POST /api/admin/reload` — install a fresh configuration generation.
///
/// Pulls from the remote store when configured, otherwise re-reads the
/// startup config file. The swap is atomic; in-flight operations keep the
/// generation they started with.
pub async fn admin_reload(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Response {
    if let Err(response) =
        check_shared_token(&headers, state.config.admin.bearer_token.as_deref())
    {
        return response;
    }

    let snapshot = if let Some(ref store) = state.remote_store {
        store.fetch().await
    } else if let Some(ref path) = state.config_path {
        Config::load(Some(path))
    } else {
        Err(Error::Config(
            "No remote store or config file to reload from".to_string(),
        ))
    };

    let snapshot = match snapshot {
        Ok(config) => config,
        Err(e) => {
            warn!(error = %e, "Configuration reload fetch failed");
            return error_response(&e);
        }
    };

    match state.catalog.install(&snapshot) {
        Ok(generation) => {
            if let Err(e) = audit(&state, AuditRecord::config_reloaded(generation)).await {
                return error_response(&e);
            }
            (StatusCode::OK, Json(json!({"generation": generation}))).into_response()
        }
        Err(e) => {
            warn!(error = %e, "Configuration reload rejected");
            error_response(&e)
        }
    }
}

/// Check `Authorization: Bearer` against a configured shared token, in
/// constant time. `None` means the endpoint is disabled.
#[allow(clippy::result_large_err)]
fn check_shared_token(
    headers: &HeaderMap,
    expected: Option<&str>,
) -> std::result::Result<(), Response> {
    let Some(expected) = expected else {
        return Err((
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({
                "error": "not_configured",
                "message": "This endpoint has no token configured and is disabled",
            })),
        )
            .into_response());
    };

    let provided = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| {
            v.strip_prefix("Bearer ")
                .or_else(|| v.strip_prefix("bearer "))
        });

    let matches = provided.is_some_and(|p| p.as_bytes().ct_eq(expected.as_bytes()).into());

    if matches {
        Ok(())
    } else {
        Err((
            StatusCode::UNAUTHORIZED,
            [("WWW-Authenticate", "Bearer")],
            Json(json!({
                "error": "unauthorized",
                "message": "Invalid token",
            })),
        )
            .into_response())
    }
}
