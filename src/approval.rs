//! Approval gate — suspends an operation pending an external human decision.
//!
//! # State machine
//!
//! `pending -> {approved, denied, timed-out, cancelled}`, all terminal. On
//! entering `pending` the gate notifies the configured approver webhook
//! (HMAC-signed payload carrying the tunnel id, identity, and a redacted
//! operation summary), then suspends the caller on a oneshot receiver bounded
//! by the configured timeout. The caller is resumed by whichever of a
//! decision callback or the timeout fires first; timeout resolves timed-out
//! (fail-closed).
//!
//! Exactly one decision is accepted per operation: the pending entry is
//! removed on first resolution, so duplicate callbacks and late arrivals
//! find nothing and are ignored. Pending operations on different tunnels are
//! independent; same-tunnel ordering is enforced upstream by the registry's
//! per-tunnel lease.

use dashmap::DashMap;
use hmac::{KeyInit, Mac};
use serde_json::json;
use sha2::Sha256;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::config::ApprovalConfig;

/// Decision delivered by the approver callback (or a cancel).
#[derive(Debug, Clone)]
pub enum ApprovalDecision {
    /// The approver allowed the operation.
    Approved {
        /// Who approved.
        approver: String,
    },
    /// The approver rejected the operation.
    Denied {
        /// Who denied.
        approver: String,
        /// Optional reason given by the approver.
        reason: Option<String>,
    },
    /// The wait was cancelled (tunnel closed or client disconnected).
    Cancelled,
}

/// Terminal outcome of one gate wait.
#[derive(Debug, Clone)]
pub enum ApprovalOutcome {
    /// Forward the operation.
    Approved {
        /// Who approved.
        approver: String,
    },
    /// Explicitly denied by an approver.
    Denied {
        /// Who denied.
        approver: String,
        /// Optional reason given by the approver.
        reason: Option<String>,
    },
    /// No decision within the window; fail-closed.
    TimedOut,
    /// Cancelled by close/disconnect; fail-closed.
    Cancelled,
    /// The approver webhook could not be delivered; fail-closed.
    NotifyFailed,
}

struct PendingEntry {
    tunnel_id: String,
    tx: oneshot::Sender<ApprovalDecision>,
}

/// The approval gate.
pub struct ApprovalGate {
    pending: DashMap<String, PendingEntry>,
    http: reqwest::Client,
    config: ApprovalConfig,
}

impl ApprovalGate {
    /// Create from configuration.
    #[must_use]
    pub fn new(config: ApprovalConfig) -> Self {
        Self {
            pending: DashMap::new(),
            http: reqwest::Client::builder()
                .timeout(config.timeout.min(std::time::Duration::from_secs(10)))
                .build()
                .unwrap_or_default(),
            config,
        }
    }

    /// Suspend the calling operation until an approver decides or the window
    /// elapses. Returns the terminal outcome; never blocks past the
    /// configured timeout.
    pub async fn request(
        &self,
        tunnel_id: &str,
        connection: &str,
        username: &str,
        sequence: u64,
        operation_summary: &str,
    ) -> ApprovalOutcome {
        let approval_id = uuid::Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();

        self.pending.insert(
            approval_id.clone(),
            PendingEntry {
                tunnel_id: tunnel_id.to_string(),
                tx,
            },
        );

        if let Err(e) = self
            .notify(&approval_id, tunnel_id, connection, username, sequence, operation_summary)
            .await
        {
            warn!(approval = %approval_id, error = %e, "Approver notification failed");
            self.pending.remove(&approval_id);
            return ApprovalOutcome::NotifyFailed;
        }

        match tokio::time::timeout(self.config.timeout, rx).await {
            Ok(Ok(ApprovalDecision::Approved { approver })) => {
                ApprovalOutcome::Approved { approver }
            }
            Ok(Ok(ApprovalDecision::Denied { approver, reason })) => {
                ApprovalOutcome::Denied { approver, reason }
            }
            Ok(Ok(ApprovalDecision::Cancelled)) | Ok(Err(_)) => ApprovalOutcome::Cancelled,
            Err(_elapsed) => {
                // Remove the entry so a late callback finds nothing.
                self.pending.remove(&approval_id);
                debug!(approval = %approval_id, "Approval window elapsed");
                ApprovalOutcome::TimedOut
            }
        }
    }

    /// Deliver a decision to the operation waiting on `approval_id`.
    ///
    /// Returns `true` if the decision was accepted, `false` for an unknown id
    /// (already resolved, timed out, or never existed) — duplicate and late
    /// decisions are ignored by construction.
    pub fn resolve(&self, approval_id: &str, decision: ApprovalDecision) -> bool {
        match self.pending.remove(approval_id) {
            Some((_, entry)) => {
                // A dropped receiver means the waiter already timed out.
                let _ = entry.tx.send(decision);
                true
            }
            None => {
                debug!(approval = %approval_id, "Decision for unknown or settled approval ignored");
                false
            }
        }
    }

    /// Cancel every pending wait for a tunnel (close/disconnect). Returns the
    /// number of waits cancelled.
    pub fn cancel_for_tunnel(&self, tunnel_id: &str) -> usize {
        let ids: Vec<String> = self
            .pending
            .iter()
            .filter(|e| e.value().tunnel_id == tunnel_id)
            .map(|e| e.key().clone())
            .collect();

        let mut cancelled = 0;
        for id in ids {
            if self.resolve(&id, ApprovalDecision::Cancelled) {
                cancelled += 1;
            }
        }
        cancelled
    }

    /// Pending approval ids for a tunnel (introspection and health).
    #[must_use]
    pub fn pending_for_tunnel(&self, tunnel_id: &str) -> Vec<String> {
        self.pending
            .iter()
            .filter(|e| e.value().tunnel_id == tunnel_id)
            .map(|e| e.key().clone())
            .collect()
    }

    /// Number of operations currently suspended in the gate.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// POST the pending operation to the approver webhook. A gate without a
    /// configured webhook skips delivery and relies on the decision callback
    /// alone; the timeout still fails closed.
    async fn notify(
        &self,
        approval_id: &str,
        tunnel_id: &str,
        connection: &str,
        username: &str,
        sequence: u64,
        operation_summary: &str,
    ) -> crate::Result<()> {
        let Some(ref url) = self.config.webhook_url else {
            debug!(approval = %approval_id, "No approver webhook configured, waiting on callback");
            return Ok(());
        };

        let body = serde_json::to_vec(&json!({
            "approval_id": approval_id,
            "tunnel_id": tunnel_id,
            "connection": connection,
            "username": username,
            "sequence": sequence,
            "operation_summary": operation_summary,
            "expires_in_secs": self.config.timeout.as_secs(),
        }))?;

        let mut request = self
            .http
            .post(url)
            .header("content-type", "application/json");

        if let Some(secret) = self.config.resolve_webhook_secret() {
            let signature = sign_payload(&body, &secret)?;
            request = request.header("x-authproxy-signature", format!("sha256={signature}"));
        }

        request.body(body).send().await?.error_for_status()?;
        Ok(())
    }
}

/// HMAC-SHA256 hex signature over the raw payload bytes.
fn sign_payload(payload: &[u8], secret: &str) -> crate::Result<String> {
    let mut mac = hmac::Hmac::<Sha256>::new_from_slice(secret.as_bytes())
        .map_err(|e| crate::Error::Internal(format!("webhook signing key: {e}")))?;
    mac.update(payload);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Redact an operation payload for the approver notification: lossy UTF-8,
/// collapsed whitespace, truncated to a fixed budget.
#[must_use]
pub fn redact_summary(raw: &[u8]) -> String {
    const BUDGET: usize = 120;

    let text = String::from_utf8_lossy(raw);
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.chars().count() <= BUDGET {
        collapsed
    } else {
        let truncated: String = collapsed.chars().take(BUDGET).collect();
        format!("{truncated}…")
    }
}
