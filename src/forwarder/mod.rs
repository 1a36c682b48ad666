//! Tunnel forwarders — relay an approved operation to the real backend.
//!
//! One [`Forwarder`] implementation per backend family, selected by the
//! spec's declared type. Connection-oriented backends ([`tcp`]) establish one
//! backend connection per tunnel and reuse it for the tunnel's lifetime;
//! stateless request-style backends ([`http`]) open a connection per
//! operation. Every forward call is bounded by a timeout, and backend
//! failures surface as typed errors — an in-flight operation is never
//! silently retried (only connection establishment retries, with backoff).

pub mod http;
pub mod tcp;

use async_trait::async_trait;

use crate::config::{BackendKind, ForwarderConfig};
use crate::registry::TunnelEntry;
use crate::Result;

pub use http::HttpForwarder;
pub use tcp::TcpForwarder;

/// Relays one allowed operation to a tunnel's backend.
#[async_trait]
pub trait Forwarder: Send + Sync {
    /// Forward `payload` through `tunnel` and return the backend's response.
    ///
    /// # Errors
    ///
    /// [`crate::Error::BackendUnavailable`], [`crate::Error::BackendError`],
    /// or [`crate::Error::BackendTimeout`].
    async fn forward(&self, tunnel: &TunnelEntry, payload: &[u8]) -> Result<Vec<u8>>;
}

/// The forwarder for each backend family.
pub struct ForwarderSet {
    tcp: TcpForwarder,
    http: HttpForwarder,
}

impl ForwarderSet {
    /// Build from configuration.
    #[must_use]
    pub fn new(config: &ForwarderConfig) -> Self {
        Self {
            tcp: TcpForwarder::new(config),
            http: HttpForwarder::new(config),
        }
    }

    /// Select the forwarder for a backend family.
    #[must_use]
    pub fn for_kind(&self, kind: BackendKind) -> &dyn Forwarder {
        if kind.is_command_protocol() {
            &self.tcp
        } else {
            &self.http
        }
    }
}
