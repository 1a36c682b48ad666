//! Tunnel registry — the authoritative table of active tunnels.
//!
//! Entries live in a `DashMap` keyed by a collision-free random identifier;
//! each entry carries its own locks so unrelated tunnels never contend.
//!
//! # Leases and expiry
//!
//! Every operation holds the entry's `op_lock` for its duration. The lock is
//! both the in-flight lease and the per-tunnel ordering queue: operation
//! *n+1* cannot start until *n* reaches a terminal decision. The background
//! [`TunnelRegistry::sweep`] expires entries past `expires_at`, but never out
//! from under a held lease; a leased entry is skipped and picked up by the
//! post-operation check or the next sweep. Expiry is additionally checked at
//! the start of every operation, so an operation arriving after `expires_at`
//! is rejected even between sweep intervals.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use chrono::{DateTime, TimeZone, Utc};
use dashmap::DashMap;
use rand::RngExt;
use tokio::net::TcpStream;
use tracing::debug;

use crate::auth::Identity;
use crate::generation::ConnectionSpec;
use crate::{Error, Result};

/// Milliseconds since the Unix epoch.
fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_millis()
        .try_into()
        .unwrap_or(u64::MAX)
}

/// Tunnel lifecycle state. Transitions only move forward:
/// `Active -> AwaitingApproval -> (Active | Closed)`, `Active -> Expired`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    /// Accepting operations.
    Active,
    /// An operation is suspended in the approval gate.
    AwaitingApproval,
    /// Closed by its owner or shutdown; terminal.
    Closed,
    /// Passed `expires_at`; terminal.
    Expired,
}

impl TunnelState {
    /// Whether this state accepts no further operations.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Closed | Self::Expired)
    }

    /// Name used in audit records.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::AwaitingApproval => "awaiting-approval",
            Self::Closed => "closed",
            Self::Expired => "expired",
        }
    }
}

#[derive(Debug)]
struct StateCell {
    state: TunnelState,
    terminal_at: Option<Instant>,
}

/// A live, identity-owned channel to one backend.
#[derive(Debug)]
pub struct TunnelEntry {
    /// Collision-free identifier (128-bit random hex).
    pub id: String,
    /// Owning identity; only the owner (or the sweep) may act on the tunnel.
    pub owner: Identity,
    /// The connection spec this tunnel was created against. Pins the
    /// configuration generation for the tunnel's whole lifetime.
    pub spec: Arc<ConnectionSpec>,
    /// Whether this owner's operations go through the approval gate.
    pub approval_required: bool,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    expires_at_ms: u64,
    cell: parking_lot::Mutex<StateCell>,
    /// In-flight lease and per-tunnel ordering queue.
    pub op_lock: tokio::sync::Mutex<()>,
    seq: AtomicU64,
    /// Pooled backend connection for connection-oriented backends.
    /// Exclusively owned by this tunnel, never shared.
    pub backend_conn: tokio::sync::Mutex<Option<TcpStream>>,
}

impl TunnelEntry {
    /// Whether `now` is past this tunnel's fixed expiry.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        now_ms() >= self.expires_at_ms
    }

    /// The fixed expiry instant, set at creation and never extended.
    #[must_use]
    pub fn expires_at(&self) -> DateTime<Utc> {
        let ms = i64::try_from(self.expires_at_ms).unwrap_or(i64::MAX);
        Utc.timestamp_millis_opt(ms).single().unwrap_or_default()
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> TunnelState {
        self.cell.lock().state
    }

    /// Next operation sequence number (monotonic per tunnel).
    pub fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Enter `AwaitingApproval` for the in-flight operation.
    pub(crate) fn begin_approval(&self) {
        let mut cell = self.cell.lock();
        if cell.state == TunnelState::Active {
            cell.state = TunnelState::AwaitingApproval;
        }
    }

    /// Return to `Active` after the gate resolves, unless a terminal
    /// transition happened while the operation was suspended.
    pub(crate) fn finish_approval(&self) {
        let mut cell = self.cell.lock();
        if cell.state == TunnelState::AwaitingApproval {
            cell.state = TunnelState::Active;
        }
    }

    /// Expire from the start-of-operation or post-operation check, between
    /// sweep passes. Returns false if already terminal.
    pub(crate) fn expire_now(&self) -> bool {
        self.mark_expired()
    }

    /// Transition to `Closed`. Returns false if already terminal.
    fn mark_closed(&self) -> bool {
        self.mark_terminal(TunnelState::Closed)
    }

    /// Transition to `Expired`. Returns false if already terminal.
    fn mark_expired(&self) -> bool {
        self.mark_terminal(TunnelState::Expired)
    }

    fn mark_terminal(&self, to: TunnelState) -> bool {
        let mut cell = self.cell.lock();
        if cell.state.is_terminal() {
            return false;
        }
        cell.state = to;
        cell.terminal_at = Some(Instant::now());
        true
    }

    fn terminal_longer_than(&self, retention: Duration) -> bool {
        self.cell
            .lock()
            .terminal_at
            .is_some_and(|at| at.elapsed() >= retention)
    }

    /// Drop the pooled backend connection, closing the socket.
    pub async fn release_backend(&self) {
        let mut conn = self.backend_conn.lock().await;
        if conn.take().is_some() {
            debug!(tunnel = %self.id, "Released backend connection");
        }
    }
}

/// Generate a 128-bit random hex tunnel identifier.
fn generate_tunnel_id() -> String {
    let id: u128 = rand::rng().random();
    format!("{id:032x}")
}

/// The shared tunnel table.
pub struct TunnelRegistry {
    entries: DashMap<String, Arc<TunnelEntry>>,
    retention: Duration,
}

impl TunnelRegistry {
    /// Create an empty registry. `retention` bounds how long terminal entries
    /// stay visible (so late operations see "expired", not "not found").
    #[must_use]
    pub fn new(retention: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            retention,
        }
    }

    /// Allocate a tunnel for `identity` against `spec`.
    ///
    /// The requested duration defaults to the spec's `default_duration` and
    /// is clamped to its `max_duration`. The expiry is fixed here and never
    /// extended.
    pub fn create(
        &self,
        identity: Identity,
        spec: Arc<ConnectionSpec>,
        requested: Option<Duration>,
        approval_required: bool,
    ) -> Arc<TunnelEntry> {
        let duration = requested
            .unwrap_or(spec.default_duration)
            .min(spec.max_duration);
        let expires_at_ms = now_ms().saturating_add(
            duration.as_millis().try_into().unwrap_or(u64::MAX),
        );

        let entry = Arc::new(TunnelEntry {
            id: generate_tunnel_id(),
            owner: identity,
            spec,
            approval_required,
            created_at: Utc::now(),
            expires_at_ms,
            cell: parking_lot::Mutex::new(StateCell {
                state: TunnelState::Active,
                terminal_at: None,
            }),
            op_lock: tokio::sync::Mutex::new(()),
            seq: AtomicU64::new(0),
            backend_conn: tokio::sync::Mutex::new(None),
        });

        self.entries.insert(entry.id.clone(), Arc::clone(&entry));
        entry
    }

    /// Look up a tunnel by id.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TunnelNotFound`] when no entry exists.
    pub fn get(&self, id: &str) -> Result<Arc<TunnelEntry>> {
        self.entries
            .get(id)
            .map(|e| Arc::clone(&e))
            .ok_or_else(|| Error::TunnelNotFound(id.to_string()))
    }

    /// Close a tunnel on behalf of `identity`.
    ///
    /// Returns the entry so the caller can audit and cancel pending waits.
    ///
    /// # Errors
    ///
    /// [`Error::TunnelNotFound`] for an unknown id, [`Error::Forbidden`] when
    /// `identity` does not own the tunnel, [`Error::TunnelClosed`] /
    /// [`Error::TunnelExpired`] when already terminal.
    pub async fn close(&self, id: &str, identity: &Identity) -> Result<Arc<TunnelEntry>> {
        let entry = self.get(id)?;
        if entry.owner.username != identity.username {
            return Err(Error::Forbidden(format!(
                "tunnel '{id}' is not owned by this identity"
            )));
        }

        if !entry.mark_closed() {
            return match entry.state() {
                TunnelState::Expired => Err(Error::TunnelExpired(id.to_string())),
                _ => Err(Error::TunnelClosed(id.to_string())),
            };
        }

        entry.release_backend().await;
        debug!(tunnel = %id, "Tunnel closed by owner");
        Ok(entry)
    }

    /// One pass of the background expiry sweep.
    ///
    /// Expires entries past `expires_at` whose lease is free, releases their
    /// backend connections, and drops terminal entries past the retention
    /// window. Returns the entries expired by this pass so the caller can
    /// audit them.
    pub async fn sweep(&self) -> Vec<Arc<TunnelEntry>> {
        let candidates: Vec<Arc<TunnelEntry>> = self
            .entries
            .iter()
            .map(|e| Arc::clone(e.value()))
            .collect();

        let mut newly_expired = Vec::new();
        let mut to_remove = Vec::new();

        for entry in candidates {
            if entry.state().is_terminal() {
                if entry.terminal_longer_than(self.retention) {
                    to_remove.push(entry.id.clone());
                }
                continue;
            }

            if !entry.is_expired() {
                continue;
            }

            // A held lease means an operation is in flight; defer. The
            // post-operation check or the next pass expires it.
            let Ok(_lease) = entry.op_lock.try_lock() else {
                debug!(tunnel = %entry.id, "Expiry deferred, lease held");
                continue;
            };

            if entry.mark_expired() {
                entry.release_backend().await;
                drop(_lease);
                newly_expired.push(entry);
            }
        }

        for id in to_remove {
            self.entries.remove(&id);
        }

        newly_expired
    }

    /// Number of non-terminal tunnels.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| !e.value().state().is_terminal())
            .count()
    }
}
