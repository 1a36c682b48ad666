//! Identity and token service.
//!
//! Two ways in: local username/password against config-listed users, or a
//! federated OIDC exchange ([`oidc`]). Both produce an [`Identity`], which the
//! [`token::TokenService`] turns into a signed, self-contained bearer token.
//! Token validation is stateless; the only server-side session-like state in
//! this service is the short-lived OIDC flow correlation table.

pub mod oidc;
pub mod token;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::config::LocalUserConfig;
use crate::{Error, Result};

pub use oidc::OidcClient;
pub use token::{IssuedToken, TokenService};

/// An authenticated principal. Produced per request, never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Identity {
    /// Username (subject)
    pub username: String,
    /// Email address, when the provider supplied one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    /// Role set
    pub roles: Vec<String>,
    /// Source provider (`local` or an OIDC provider name)
    pub provider: String,
}

/// Validates local username/password credentials.
pub struct LocalAuthenticator {
    users: Vec<LocalUserConfig>,
}

impl LocalAuthenticator {
    /// Create from the configured user list.
    #[must_use]
    pub fn new(users: Vec<LocalUserConfig>) -> Self {
        Self { users }
    }

    /// Validate credentials and return the identity.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidCredentials`] when the username is unknown or
    /// the password digest does not match. Both paths return the same error
    /// so callers cannot probe for valid usernames.
    pub fn authenticate(&self, username: &str, password: &str) -> Result<Identity> {
        let digest = sha256_hex(password);

        for user in &self.users {
            if user.username != username {
                continue;
            }
            let matches: bool = digest
                .as_bytes()
                .ct_eq(user.password_sha256.to_ascii_lowercase().as_bytes())
                .into();
            if matches {
                return Ok(Identity {
                    username: user.username.clone(),
                    email: user.email.clone(),
                    roles: user.roles.clone(),
                    provider: "local".to_string(),
                });
            }
            return Err(Error::InvalidCredentials);
        }

        Err(Error::InvalidCredentials)
    }
}

/// Hex-encoded SHA-256 digest of a string.
#[must_use]
pub fn sha256_hex(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_users() -> Vec<LocalUserConfig> {
        vec![LocalUserConfig {
            username: "alice".to_string(),
            // sha256("correct horse")
            password_sha256: sha256_hex("correct horse"),
            email: Some("alice@example.com".to_string()),
            roles: vec!["developer".to_string()],
        }]
    }

    #[test]
    fn authenticate_accepts_valid_credentials() {
        // GIVEN: a configured local user
        let auth = LocalAuthenticator::new(make_users());

        // WHEN: authenticating with the right password
        let identity = auth.authenticate("alice", "correct horse").unwrap();

        // THEN: the identity carries the configured roles and provider
        assert_eq!(identity.username, "alice");
        assert_eq!(identity.roles, vec!["developer"]);
        assert_eq!(identity.provider, "local");
    }

    #[test]
    fn authenticate_rejects_wrong_password() {
        let auth = LocalAuthenticator::new(make_users());
        let err = auth.authenticate("alice", "wrong").unwrap_err();
        assert!(matches!(err, Error::InvalidCredentials));
    }

    #[test]
    fn authenticate_rejects_unknown_user() {
        let auth = LocalAuthenticator::new(make_users());
        let err = auth.authenticate("mallory", "correct horse").unwrap_err();
        assert!(matches!(err, Error::InvalidCredentials));
    }

    #[test]
    fn digest_comparison_is_case_insensitive_on_config_side() {
        // GIVEN: a config digest written in uppercase hex
        let mut users = make_users();
        users[0].password_sha256 = users[0].password_sha256.to_ascii_uppercase();
        let auth = LocalAuthenticator::new(users);

        // THEN: authentication still succeeds
        assert!(auth.authenticate("alice", "correct horse").is_ok());
    }

    #[test]
    fn sha256_hex_is_stable() {
        assert_eq!(
            sha256_hex("password"),
            "5e884898da28047151d0e56f8dc6292773603d0d6aabbdd62a11ef721d1542d8"
        );
    }
}
