//! Durable, append-only audit trail.
//!
//! Every lifecycle transition (create, approve, deny, close, expire) and
//! every operation decision produces exactly one [`AuditRecord`], written
//! once and never amended. Records flow through a bounded queue into a
//! background writer that appends JSON lines to the audit file and mirrors
//! each record to `tracing` for log aggregators.
//!
//! Under sustained overload the queue applies backpressure: the producer
//! awaits instead of dropping, trading latency for zero audit loss.
//!
//! # Events
//!
//! | Event | When |
//! |-------|------|
//! | `login.succeeded` / `login.failed` | Local or federated authentication |
//! | `tunnel.created` | A connect request allocated a tunnel |
//! | `tunnel.denied` | A connect request was refused |
//! | `tunnel.closed` / `tunnel.expired` | Tunnel reached a terminal state |
//! | `approval.pending` | An operation entered the approval gate |
//! | `operation.allowed` | Operation forwarded to the backend |
//! | `operation.denied` | Whitelist, ownership, expiry, or approver denial |
//! | `operation.timed_out` | Approval window elapsed with no decision |
//! | `operation.cancelled` | Pending approval cancelled by close |
//! | `operation.failed` | Backend unavailable/error/timeout |
//! | `config.reloaded` | A new configuration generation was installed |

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::config::AuditConfig;
use crate::registry::TunnelEntry;
use crate::{Error, Result};

/// One immutable audit entry.
#[derive(Debug, Clone, Serialize)]
pub struct AuditRecord {
    /// Record id.
    pub id: String,
    /// When the record was produced.
    pub ts: DateTime<Utc>,
    /// Event type (see module docs).
    pub event: &'static str,
    /// Affected tunnel, when applicable.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tunnel_id: Option<String>,
    /// Connection name, when applicable.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connection: Option<String>,
    /// Acting identity, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    /// Operation sequence number within its tunnel.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sequence: Option<u64>,
    /// Human-readable detail (reason, approver, byte counts).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl AuditRecord {
    fn new(event: &'static str) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            ts: Utc::now(),
            event,
            tunnel_id: None,
            connection: None,
            username: None,
            sequence: None,
            detail: None,
        }
    }

    fn for_tunnel(event: &'static str, tunnel: &TunnelEntry) -> Self {
        Self {
            tunnel_id: Some(tunnel.id.clone()),
            connection: Some(tunnel.spec.name.clone()),
            username: Some(tunnel.owner.username.clone()),
            ..Self::new(event)
        }
    }

    /// A successful authentication.
    #[must_use]
    pub fn login_succeeded(username: &str, provider: &str) -> Self {
        Self {
            username: Some(username.to_string()),
            detail: Some(format!("provider={provider}")),
            ..Self::new("login.succeeded")
        }
    }

    /// A failed authentication.
    #[must_use]
    pub fn login_failed(username: &str, reason: &str) -> Self {
        Self {
            username: Some(username.to_string()),
            detail: Some(reason.to_string()),
            ..Self::new("login.failed")
        }
    }

    /// A tunnel was allocated.
    #[must_use]
    pub fn tunnel_created(tunnel: &TunnelEntry) -> Self {
        Self {
            detail: Some(format!("expires_at={}", tunnel.expires_at().to_rfc3339())),
            ..Self::for_tunnel("tunnel.created", tunnel)
        }
    }

    /// A connect request was refused before a tunnel existed.
    #[must_use]
    pub fn tunnel_denied(connection: &str, username: &str, reason: &str) -> Self {
        Self {
            connection: Some(connection.to_string()),
            username: Some(username.to_string()),
            detail: Some(reason.to_string()),
            ..Self::new("tunnel.denied")
        }
    }

    /// A tunnel was closed by its owner or shutdown.
    #[must_use]
    pub fn tunnel_closed(tunnel: &TunnelEntry) -> Self {
        Self::for_tunnel("tunnel.closed", tunnel)
    }

    /// The sweep expired a tunnel.
    #[must_use]
    pub fn tunnel_expired(tunnel: &TunnelEntry) -> Self {
        Self::for_tunnel("tunnel.expired", tunnel)
    }

    /// An operation entered the approval gate.
    #[must_use]
    pub fn approval_pending(tunnel: &TunnelEntry, sequence: u64, summary: &str) -> Self {
        Self {
            sequence: Some(sequence),
            detail: Some(summary.to_string()),
            ..Self::for_tunnel("approval.pending", tunnel)
        }
    }

    /// The operation's terminal decision: forwarded.
    #[must_use]
    pub fn operation_allowed(tunnel: &TunnelEntry, sequence: u64, detail: String) -> Self {
        Self {
            sequence: Some(sequence),
            detail: Some(detail),
            ..Self::for_tunnel("operation.allowed", tunnel)
        }
    }

    /// The operation's terminal decision: denied. Sequence is absent for
    /// operations rejected before they entered the tunnel's ordering queue.
    #[must_use]
    pub fn operation_denied(tunnel: &TunnelEntry, sequence: Option<u64>, reason: &str) -> Self {
        Self {
            sequence,
            detail: Some(reason.to_string()),
            ..Self::for_tunnel("operation.denied", tunnel)
        }
    }

    /// The operation's terminal decision: approval window elapsed.
    #[must_use]
    pub fn operation_timed_out(tunnel: &TunnelEntry, sequence: u64) -> Self {
        Self {
            sequence: Some(sequence),
            ..Self::for_tunnel("operation.timed_out", tunnel)
        }
    }

    /// The operation's terminal decision: cancelled while pending.
    #[must_use]
    pub fn operation_cancelled(tunnel: &TunnelEntry, sequence: u64) -> Self {
        Self {
            sequence: Some(sequence),
            ..Self::for_tunnel("operation.cancelled", tunnel)
        }
    }

    /// The operation's terminal decision: backend failure.
    #[must_use]
    pub fn operation_failed(tunnel: &TunnelEntry, sequence: u64, error: &Error) -> Self {
        Self {
            sequence: Some(sequence),
            detail: Some(error.to_string()),
            ..Self::for_tunnel("operation.failed", tunnel)
        }
    }

    /// A configuration generation was installed.
    #[must_use]
    pub fn config_reloaded(generation: u64) -> Self {
        Self {
            detail: Some(format!("generation={generation}")),
            ..Self::new("config.reloaded")
        }
    }
}

/// Producer handle to the audit trail.
#[derive(Clone)]
pub struct AuditLog {
    tx: mpsc::Sender<AuditRecord>,
}

impl AuditLog {
    /// Open the audit file and spawn the writer task.
    ///
    /// The returned handle resolves once the writer has drained and flushed
    /// after a shutdown signal.
    ///
    /// # Errors
    ///
    /// Returns an error if the audit file cannot be opened for append.
    pub async fn open(
        config: &AuditConfig,
        shutdown: broadcast::Receiver<()>,
    ) -> Result<(Self, JoinHandle<()>)> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&config.path)
            .await
            .map_err(|e| Error::Config(format!("Cannot open audit file '{}': {e}", config.path)))?;

        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let handle = tokio::spawn(writer_loop(file, rx, shutdown));

        Ok((Self { tx }, handle))
    }

    /// Append one record.
    ///
    /// Awaits queue space under load: backpressure, never loss.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Internal`] if the writer task is gone; the caller's
    /// request fails rather than proceeding unaudited.
    pub async fn record(&self, record: AuditRecord) -> Result<()> {
        self.tx
            .send(record)
            .await
            .map_err(|_| Error::Internal("audit writer unavailable".to_string()))
    }
}

async fn writer_loop(
    mut file: tokio::fs::File,
    mut rx: mpsc::Receiver<AuditRecord>,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            record = rx.recv() => {
                match record {
                    Some(record) => write_record(&mut file, &record).await,
                    None => break,
                }
            }
            _ = shutdown.recv() => {
                // Drain whatever producers already enqueued, then stop.
                while let Ok(record) = rx.try_recv() {
                    write_record(&mut file, &record).await;
                }
                break;
            }
        }
    }

    if let Err(e) = file.flush().await {
        error!(error = %e, "Audit file flush on shutdown failed");
    }
    debug!("Audit writer stopped");
}

/// Serialize and append one record, flushing so the entry is durable before
/// the next is accepted.
async fn write_record(file: &mut tokio::fs::File, record: &AuditRecord) {
    let line = match serde_json::to_string(record) {
        Ok(json) => json,
        Err(e) => {
            warn!(error = %e, "Failed to serialize audit record");
            return;
        }
    };

    tracing::info!(audit = %line, "audit");

    if let Err(e) = file.write_all(format!("{line}\n").as_bytes()).await {
        error!(error = %e, "Audit file write failed");
        return;
    }
    if let Err(e) = file.flush().await {
        error!(error = %e, "Audit file flush failed");
    }
}
