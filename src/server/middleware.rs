//! Bearer-token authentication middleware.
//!
//! Every authenticated endpoint validates the `Authorization: Bearer` header
//! per request — tokens are self-contained, so validation is stateless. The
//! recovered [`Identity`] is injected into request extensions for handlers.
//!
//! Public paths (login, discovery, health) bypass the check; the approver
//! callback and admin endpoints carry their own dedicated token checks in
//! their handlers.

use std::sync::Arc;

use axum::{
    Json,
    body::Body,
    extract::State,
    http::{Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use serde_json::json;
use tracing::{debug, warn};

use super::AppState;

/// Paths reachable without a proxy bearer token.
const PUBLIC_PREFIXES: &[&str] = &[
    "/api/login",
    "/api/info",
    "/api/health",
    "/api/auth/",
    "/api/approvals/",
    "/api/admin/",
];

/// Whether a path bypasses bearer authentication.
#[must_use]
pub fn is_public_path(path: &str) -> bool {
    PUBLIC_PREFIXES.iter().any(|p| path.starts_with(p))
}

/// Authentication middleware
pub async fn auth_middleware(
    State(state): State<Arc<AppState>>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    let path = request.uri().path();

    if is_public_path(path) {
        debug!(path = %path, "Public path, skipping auth");
        return next.run(request).await;
    }

    let token = request
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| {
            v.strip_prefix("Bearer ")
                .or_else(|| v.strip_prefix("bearer "))
        });

    let Some(token) = token else {
        warn!(path = %path, "Missing Authorization header");
        return unauthorized_response(
            "missing_token",
            "Missing Authorization header. Use: Authorization: Bearer <token>",
        );
    };

    match state.tokens.validate(token) {
        Ok(identity) => {
            debug!(username = %identity.username, path = %path, "Authenticated request");
            request.extensions_mut().insert(identity);
            next.run(request).await
        }
        Err(e) => {
            warn!(path = %path, error = %e, "Token validation failed");
            unauthorized_response(e.code(), &e.to_string())
        }
    }
}

/// Create a 401 Unauthorized response
fn unauthorized_response(code: &str, message: &str) -> Response {
    (
        StatusCode::UNAUTHORIZED,
        [("WWW-Authenticate", "Bearer")],
        Json(json!({
            "error": code,
            "message": message,
        })),
    )
        .into_response()
}
