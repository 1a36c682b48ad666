//! Federated login via OIDC authorization-code exchange.
//!
//! # Flow
//!
//! 1. The CLI opens `GET /api/auth/oidc/login?state=...&cli_callback=...`.
//!    [`OidcClient::begin_flow`] records a correlation entry keyed by `state`
//!    and redirects the browser to the provider's authorization endpoint.
//! 2. The provider redirects back with `code` + `state`.
//!    [`OidcClient::exchange_code`] redeems the entry (single use), exchanges
//!    the code at the token endpoint, and reads the user-info endpoint to
//!    build an [`Identity`].
//!
//! The correlation entry lives only for the flow window and is removed on
//! completion or expiry — a reused or stale `state` fails with
//! [`Error::InvalidState`]. This table is the only server-side session-like
//! state in the identity service.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::Deserialize;
use tracing::{debug, warn};
use url::Url;

use super::Identity;
use crate::config::OidcProviderConfig;
use crate::{Error, Result};

/// A started, not-yet-redeemed login flow.
#[derive(Debug)]
struct FlowEntry {
    provider: String,
    cli_callback: String,
    started_at: Instant,
    ttl: Duration,
}

impl FlowEntry {
    fn is_stale(&self) -> bool {
        self.started_at.elapsed() >= self.ttl
    }
}

/// Token endpoint response (only the field we use).
#[derive(Debug, Deserialize)]
struct TokenEndpointResponse {
    access_token: String,
}

/// OIDC client — provider configs plus the flow correlation table.
pub struct OidcClient {
    providers: Vec<OidcProviderConfig>,
    flows: DashMap<String, FlowEntry>,
    http: reqwest::Client,
}

impl OidcClient {
    /// Create from the configured provider list.
    #[must_use]
    pub fn new(providers: Vec<OidcProviderConfig>) -> Self {
        Self {
            providers,
            flows: DashMap::new(),
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .unwrap_or_default(),
        }
    }

    /// Enabled providers, for capability discovery.
    pub fn enabled_providers(&self) -> impl Iterator<Item = &OidcProviderConfig> {
        self.providers.iter().filter(|p| p.enabled)
    }

    /// Start a login flow: record the correlation entry and build the
    /// provider redirect URL.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] for an empty state value and
    /// [`Error::Config`] when no enabled provider matches `provider_name`.
    pub fn begin_flow(
        &self,
        provider_name: &str,
        state: &str,
        cli_callback: &str,
    ) -> Result<String> {
        if state.is_empty() {
            return Err(Error::InvalidState);
        }

        let provider = self
            .providers
            .iter()
            .find(|p| p.enabled && p.name == provider_name)
            .ok_or_else(|| Error::Config(format!("Unknown identity provider: {provider_name}")))?;

        self.evict_stale();

        self.flows.insert(
            state.to_string(),
            FlowEntry {
                provider: provider.name.clone(),
                cli_callback: cli_callback.to_string(),
                started_at: Instant::now(),
                ttl: provider.flow_ttl,
            },
        );

        let mut url = Url::parse(&provider.authorize_url())
            .map_err(|e| Error::Config(format!("Invalid authorize_url: {e}")))?;
        url.query_pairs_mut()
            .append_pair("response_type", "code")
            .append_pair("client_id", &provider.client_id)
            .append_pair("redirect_uri", &provider.redirect_url)
            .append_pair("scope", "openid profile email")
            .append_pair("state", state);

        debug!(provider = %provider.name, "Started OIDC login flow");
        Ok(url.to_string())
    }

    /// Redeem a provider callback: consume the state entry, exchange the
    /// authorization code, and fetch the user info.
    ///
    /// Returns the identity and the `cli_callback` recorded at flow start.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidState`] for unknown, reused, or stale state; transport
    /// errors from the provider surface as [`Error::Http`].
    pub async fn exchange_code(&self, code: &str, state: &str) -> Result<(Identity, String)> {
        let entry = self.take_flow(state)?;

        let provider = self
            .providers
            .iter()
            .find(|p| p.name == entry.provider)
            .ok_or_else(|| Error::Internal("provider vanished mid-flow".to_string()))?;

        let token: TokenEndpointResponse = self
            .http
            .post(provider.token_url())
            .form(&[
                ("grant_type", "authorization_code"),
                ("code", code),
                ("redirect_uri", provider.redirect_url.as_str()),
                ("client_id", provider.client_id.as_str()),
                ("client_secret", provider.resolve_client_secret().as_str()),
            ])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let user_info: serde_json::Value = self
            .http
            .get(provider.userinfo_url())
            .bearer_auth(&token.access_token)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let identity = identity_from_user_info(&user_info, provider)?;
        debug!(provider = %provider.name, username = %identity.username, "OIDC exchange complete");

        Ok((identity, entry.cli_callback))
    }

    /// Consume the correlation entry for `state` (single use).
    fn take_flow(&self, state: &str) -> Result<FlowEntry> {
        let Some((_, entry)) = self.flows.remove(state) else {
            warn!("OIDC callback with unknown or reused state");
            return Err(Error::InvalidState);
        };
        if entry.is_stale() {
            warn!(provider = %entry.provider, "OIDC callback after flow window elapsed");
            return Err(Error::InvalidState);
        }
        Ok(entry)
    }

    /// Drop flow entries past their window.
    fn evict_stale(&self) {
        self.flows.retain(|_, entry| !entry.is_stale());
    }
}

/// Build an [`Identity`] from a user-info document.
fn identity_from_user_info(
    user_info: &serde_json::Value,
    provider: &OidcProviderConfig,
) -> Result<Identity> {
    let username = user_info
        .get("preferred_username")
        .or_else(|| user_info.get("email"))
        .or_else(|| user_info.get("sub"))
        .and_then(serde_json::Value::as_str)
        .ok_or_else(|| {
            Error::Internal("user-info document has no usable subject".to_string())
        })?
        .to_string();

    let email = user_info
        .get("email")
        .and_then(serde_json::Value::as_str)
        .map(str::to_string);

    let roles = user_info
        .get(&provider.roles_claim)
        .and_then(serde_json::Value::as_array)
        .map(|arr| {
            arr.iter()
                .filter_map(serde_json::Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();

    Ok(Identity {
        username,
        email,
        roles,
        provider: provider.name.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn make_provider() -> OidcProviderConfig {
        OidcProviderConfig {
            name: "corp-sso".to_string(),
            enabled: true,
            issuer: "https://sso.example.com".to_string(),
            client_id: "authproxy-cli".to_string(),
            client_secret: "shhh".to_string(),
            authorize_url: None,
            token_url: None,
            userinfo_url: None,
            roles_claim: "roles".to_string(),
            redirect_url: "https://proxy.example.com/api/auth/oidc/callback".to_string(),
            flow_ttl: Duration::from_secs(300),
        }
    }

    #[test]
    fn begin_flow_builds_provider_redirect() {
        // GIVEN: a client with one provider
        let client = OidcClient::new(vec![make_provider()]);

        // WHEN: starting a flow
        let url = client
            .begin_flow("corp-sso", "state-123", "http://127.0.0.1:7564/cb")
            .unwrap();

        // THEN: the redirect targets the derived authorize endpoint with the
        // correlation state attached
        assert!(url.starts_with("https://sso.example.com/authorize?"));
        assert!(url.contains("state=state-123"));
        assert!(url.contains("client_id=authproxy-cli"));
        assert!(url.contains("response_type=code"));
    }

    #[test]
    fn begin_flow_rejects_empty_state() {
        let client = OidcClient::new(vec![make_provider()]);
        let err = client.begin_flow("corp-sso", "", "http://cb").unwrap_err();
        assert!(matches!(err, Error::InvalidState));
    }

    #[test]
    fn begin_flow_rejects_unknown_provider() {
        let client = OidcClient::new(vec![make_provider()]);
        assert!(client.begin_flow("other", "s", "http://cb").is_err());
    }

    #[test]
    fn take_flow_is_single_use() {
        // GIVEN: a started flow
        let client = OidcClient::new(vec![make_provider()]);
        client
            .begin_flow("corp-sso", "state-once", "http://cb")
            .unwrap();

        // WHEN: the state is taken twice
        let first = client.take_flow("state-once");
        let second = client.take_flow("state-once");

        // THEN: only the first redemption succeeds
        assert!(first.is_ok());
        assert!(matches!(second.unwrap_err(), Error::InvalidState));
    }

    #[test]
    fn take_flow_rejects_stale_entry() {
        // GIVEN: a flow entry with a zero-length window
        let client = OidcClient::new(vec![make_provider()]);
        client.flows.insert(
            "stale".to_string(),
            FlowEntry {
                provider: "corp-sso".to_string(),
                cli_callback: "http://cb".to_string(),
                started_at: Instant::now() - Duration::from_secs(600),
                ttl: Duration::from_secs(300),
            },
        );

        // THEN: redemption fails closed
        assert!(matches!(
            client.take_flow("stale").unwrap_err(),
            Error::InvalidState
        ));
    }

    #[test]
    fn identity_from_user_info_maps_roles_claim() {
        // GIVEN: a user-info document with a custom roles claim
        let mut provider = make_provider();
        provider.roles_claim = "proxy_roles".to_string();
        let doc = json!({
            "sub": "u-123",
            "preferred_username": "alice",
            "email": "alice@example.com",
            "proxy_roles": ["developer", "dba"]
        });

        // WHEN: mapping
        let identity = identity_from_user_info(&doc, &provider).unwrap();

        // THEN: username, email, and roles come through
        assert_eq!(identity.username, "alice");
        assert_eq!(identity.email.as_deref(), Some("alice@example.com"));
        assert_eq!(identity.roles, vec!["developer", "dba"]);
        assert_eq!(identity.provider, "corp-sso");
    }

    #[test]
    fn identity_from_user_info_falls_back_to_sub() {
        let provider = make_provider();
        let doc = json!({ "sub": "u-456" });
        let identity = identity_from_user_info(&doc, &provider).unwrap();
        assert_eq!(identity.username, "u-456");
        assert!(identity.roles.is_empty());
    }

    #[test]
    fn identity_from_user_info_requires_a_subject() {
        let provider = make_provider();
        let doc = json!({ "name": "nobody" });
        assert!(identity_from_user_info(&doc, &provider).is_err());
    }
}
