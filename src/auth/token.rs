//! Signed bearer tokens.
//!
//! Tokens are self-contained HS256 JWTs carrying the subject, role set, and
//! expiry. There is no server-side session: validation needs only the signing
//! secret, so any instance sharing the secret can validate any token. Expired
//! tokens are never revived.

use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use jsonwebtoken::{
    Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode,
    errors::ErrorKind,
};
use serde::{Deserialize, Serialize};

use super::Identity;
use crate::{Error, Result};

/// Issuer claim stamped into every token.
const ISSUER: &str = "authproxy";

/// Claims embedded in an issued token.
#[derive(Debug, Serialize, Deserialize)]
struct TokenClaims {
    /// Subject (username)
    sub: String,
    /// Email, when known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    email: Option<String>,
    /// Role set
    roles: Vec<String>,
    /// Source identity provider
    idp: String,
    /// Issuer
    iss: String,
    /// Issued-at (Unix epoch seconds)
    iat: i64,
    /// Expires-at (Unix epoch seconds)
    exp: i64,
}

/// A freshly issued token with its expiry.
#[derive(Debug, Clone)]
pub struct IssuedToken {
    /// The signed bearer value
    pub token: String,
    /// When the token stops validating
    pub expires_at: DateTime<Utc>,
}

/// Issues and validates signed bearer tokens.
pub struct TokenService {
    encoding: EncodingKey,
    decoding: DecodingKey,
    ttl: Duration,
    validation: Validation,
}

impl TokenService {
    /// Create from the resolved signing secret and token lifetime.
    #[must_use]
    pub fn new(secret: &str, ttl: Duration) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        // Expiry must be exact; the proxy and its clients share a clock domain.
        validation.leeway = 0;
        validation.set_issuer(&[ISSUER]);

        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            ttl,
            validation,
        }
    }

    /// Issue a token for an identity.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Internal`] if signing fails.
    pub fn issue(&self, identity: &Identity) -> Result<IssuedToken> {
        let iat = Utc::now().timestamp();
        // exp strictly after iat, even for degenerate sub-second lifetimes
        let exp = iat + i64::try_from(self.ttl.as_secs().max(1)).unwrap_or(i64::MAX);

        let claims = TokenClaims {
            sub: identity.username.clone(),
            email: identity.email.clone(),
            roles: identity.roles.clone(),
            idp: identity.provider.clone(),
            iss: ISSUER.to_string(),
            iat,
            exp,
        };

        let token = encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .map_err(|e| Error::Internal(format!("token signing failed: {e}")))?;

        let expires_at = Utc
            .timestamp_opt(exp, 0)
            .single()
            .ok_or_else(|| Error::Internal("token expiry out of range".to_string()))?;

        Ok(IssuedToken { token, expires_at })
    }

    /// Validate a bearer value and recover the identity it was issued for.
    ///
    /// # Errors
    ///
    /// [`Error::TokenExpired`], [`Error::TokenInvalidSignature`], or
    /// [`Error::TokenMalformed`] depending on what failed.
    pub fn validate(&self, token: &str) -> Result<Identity> {
        let data = decode::<TokenClaims>(token, &self.decoding, &self.validation)
            .map_err(|e| match e.kind() {
                ErrorKind::ExpiredSignature => Error::TokenExpired,
                ErrorKind::InvalidSignature => Error::TokenInvalidSignature,
                _ => Error::TokenMalformed,
            })?;

        let claims = data.claims;
        Ok(Identity {
            username: claims.sub,
            email: claims.email,
            roles: claims.roles,
            provider: claims.idp,
        })
    }
}
