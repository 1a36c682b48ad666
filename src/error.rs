//! Error types for the access proxy

use std::io;

use axum::http::StatusCode;
use thiserror::Error;

/// Result type alias for the access proxy
pub type Result<T> = std::result::Result<T, Error>;

/// Access proxy errors
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Username/password did not match a configured user
    #[error("Invalid credentials")]
    InvalidCredentials,

    /// Bearer token past its expiry
    #[error("Token expired")]
    TokenExpired,

    /// Bearer token is not a well-formed token
    #[error("Malformed token")]
    TokenMalformed,

    /// Bearer token signature did not verify
    #[error("Invalid token signature")]
    TokenInvalidSignature,

    /// OIDC flow state is unknown, reused, or expired
    #[error("Invalid or expired login flow state")]
    InvalidState,

    /// Caller's roles grant no access to the connection
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// No connection spec with this name
    #[error("Connection not found: {0}")]
    ConnectionNotFound(String),

    /// No tunnel with this id
    #[error("Tunnel not found: {0}")]
    TunnelNotFound(String),

    /// Tunnel is past its expiry and accepts no further operations
    #[error("Tunnel expired: {0}")]
    TunnelExpired(String),

    /// Tunnel was closed by its owner or the server
    #[error("Tunnel closed: {0}")]
    TunnelClosed(String),

    /// Operation matched no whitelist rule
    #[error("Operation not permitted: {0}")]
    PolicyViolation(String),

    /// Operation could not be parsed for the declared protocol (treated as deny)
    #[error("Unparseable operation: {0}")]
    UnparseableOperation(String),

    /// Approver explicitly denied the operation
    #[error("Operation denied by approver: {0}")]
    ApprovalDenied(String),

    /// No approval decision arrived within the window
    #[error("Approval timed out")]
    ApprovalTimeout,

    /// Backend could not be reached
    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    /// Backend returned an error
    #[error("Backend error: {0}")]
    BackendError(String),

    /// Backend did not respond in time
    #[error("Backend timeout: {0}")]
    BackendTimeout(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP client error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Internal error (audit write failure, registry corruption)
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// HTTP status for this error at the API boundary.
    ///
    /// Authentication failures map to 401, authorization and policy denials
    /// to 403, lookups to 404, backend failures to 502/504, everything else
    /// to 500. Fatal only to the offending request, never to the process.
    #[must_use]
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidCredentials
            | Self::TokenExpired
            | Self::TokenMalformed
            | Self::TokenInvalidSignature
            | Self::InvalidState => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_)
            | Self::TunnelExpired(_)
            | Self::TunnelClosed(_)
            | Self::PolicyViolation(_)
            | Self::UnparseableOperation(_)
            | Self::ApprovalDenied(_)
            | Self::ApprovalTimeout => StatusCode::FORBIDDEN,
            Self::ConnectionNotFound(_) | Self::TunnelNotFound(_) => StatusCode::NOT_FOUND,
            Self::BackendUnavailable(_) | Self::BackendError(_) | Self::Http(_) => {
                StatusCode::BAD_GATEWAY
            }
            Self::BackendTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Self::Config(_) | Self::Io(_) | Self::Json(_) | Self::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Short machine-readable error code for JSON bodies.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Config(_) => "config_error",
            Self::InvalidCredentials => "invalid_credentials",
            Self::TokenExpired => "token_expired",
            Self::TokenMalformed => "token_malformed",
            Self::TokenInvalidSignature => "token_invalid_signature",
            Self::InvalidState => "invalid_state",
            Self::Forbidden(_) => "forbidden",
            Self::ConnectionNotFound(_) => "connection_not_found",
            Self::TunnelNotFound(_) => "tunnel_not_found",
            Self::TunnelExpired(_) => "tunnel_expired",
            Self::TunnelClosed(_) => "tunnel_closed",
            Self::PolicyViolation(_) => "policy_violation",
            Self::UnparseableOperation(_) => "unparseable_operation",
            Self::ApprovalDenied(_) => "approval_denied",
            Self::ApprovalTimeout => "approval_timeout",
            Self::BackendUnavailable(_) => "backend_unavailable",
            Self::BackendError(_) => "backend_error",
            Self::BackendTimeout(_) => "backend_timeout",
            Self::Io(_) => "io_error",
            Self::Json(_) => "json_error",
            Self::Http(_) => "upstream_http_error",
            Self::Internal(_) => "internal_error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_failures_map_to_401() {
        assert_eq!(Error::InvalidCredentials.status_code(), StatusCode::UNAUTHORIZED);
        assert_eq!(Error::TokenExpired.status_code(), StatusCode::UNAUTHORIZED);
        assert_eq!(Error::TokenMalformed.status_code(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            Error::TokenInvalidSignature.status_code(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(Error::InvalidState.status_code(), StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn denials_map_to_403() {
        assert_eq!(
            Error::Forbidden("no role overlap".into()).status_code(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            Error::PolicyViolation("DROP TABLE".into()).status_code(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(Error::ApprovalTimeout.status_code(), StatusCode::FORBIDDEN);
        assert_eq!(
            Error::TunnelExpired("abc".into()).status_code(),
            StatusCode::FORBIDDEN
        );
    }

    #[test]
    fn lookups_map_to_404() {
        assert_eq!(
            Error::ConnectionNotFound("db-prod".into()).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            Error::TunnelNotFound("abc".into()).status_code(),
            StatusCode::NOT_FOUND
        );
    }

    #[test]
    fn backend_failures_map_to_gateway_statuses() {
        assert_eq!(
            Error::BackendUnavailable("db".into()).status_code(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            Error::BackendTimeout("db".into()).status_code(),
            StatusCode::GATEWAY_TIMEOUT
        );
    }

    #[test]
    fn codes_are_stable() {
        assert_eq!(Error::ApprovalTimeout.code(), "approval_timeout");
        assert_eq!(
            Error::ApprovalDenied("nope".into()).code(),
            "approval_denied"
        );
    }
}
