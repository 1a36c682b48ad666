//! TCP forwarder for connection-oriented backends.
//!
//! The backend connection lives in the tunnel entry and is established
//! lazily on the first operation, then reused until the tunnel closes or
//! expires. The socket is exclusively owned by its tunnel; the per-tunnel
//! lease upstream guarantees one operation on the wire at a time.

use std::io;
use std::time::Duration;

use async_trait::async_trait;
use backon::{ExponentialBuilder, Retryable};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use super::Forwarder;
use crate::config::ForwarderConfig;
use crate::registry::TunnelEntry;
use crate::{Error, Result};

/// Upper bound on one response read.
const READ_BUF_SIZE: usize = 64 * 1024;

/// Forwarder for wire-protocol backends (postgres, mysql, redis).
pub struct TcpForwarder {
    connect_timeout: Duration,
    io_timeout: Duration,
    connect_attempts: usize,
}

impl TcpForwarder {
    /// Build from configuration.
    #[must_use]
    pub fn new(config: &ForwarderConfig) -> Self {
        Self {
            connect_timeout: config.connect_timeout,
            io_timeout: config.io_timeout,
            connect_attempts: config.connect_attempts.max(1),
        }
    }

    /// Establish a backend connection, retrying with exponential backoff.
    ///
    /// Connection establishment is the only retried step: it has no side
    /// effects on the backend, unlike an in-flight operation.
    async fn connect(&self, target: &str) -> Result<TcpStream> {
        let attempt = || async {
            match timeout(self.connect_timeout, TcpStream::connect(target)).await {
                Ok(result) => result,
                Err(_elapsed) => Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "connect timed out",
                )),
            }
        };

        let stream = attempt
            .retry(
                ExponentialBuilder::default()
                    .with_max_times(self.connect_attempts.saturating_sub(1)),
            )
            .notify(|err: &io::Error, dur| {
                debug!(target = %target, error = %err, delay_ms = dur.as_millis(), "Retrying backend connect");
            })
            .await
            .map_err(|e| Error::BackendUnavailable(format!("{target}: {e}")))?;

        stream
            .set_nodelay(true)
            .map_err(|e| Error::BackendError(format!("{target}: {e}")))?;
        debug!(target = %target, "Backend connection established");
        Ok(stream)
    }
}

#[async_trait]
impl Forwarder for TcpForwarder {
    async fn forward(&self, tunnel: &TunnelEntry, payload: &[u8]) -> Result<Vec<u8>> {
        let target = &tunnel.spec.target;
        let mut guard = tunnel.backend_conn.lock().await;

        if guard.is_none() {
            *guard = Some(self.connect(target).await?);
        }
        let Some(stream) = guard.as_mut() else {
            return Err(Error::Internal("backend connection vanished".to_string()));
        };

        // Write the operation. Any failure poisons the pooled connection.
        let write = async {
            stream.write_all(payload).await?;
            stream.flush().await
        };
        match timeout(self.io_timeout, write).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                *guard = None;
                return Err(Error::BackendError(format!("{target}: write: {e}")));
            }
            Err(_elapsed) => {
                *guard = None;
                return Err(Error::BackendTimeout(format!("{target}: write")));
            }
        }

        // Read one response frame.
        let mut buf = vec![0u8; READ_BUF_SIZE];
        match timeout(self.io_timeout, stream.read(&mut buf)).await {
            Ok(Ok(0)) => {
                *guard = None;
                Err(Error::BackendError(format!(
                    "{target}: backend closed the connection"
                )))
            }
            Ok(Ok(n)) => {
                buf.truncate(n);
                Ok(buf)
            }
            Ok(Err(e)) => {
                *guard = None;
                Err(Error::BackendError(format!("{target}: read: {e}")))
            }
            Err(_elapsed) => {
                *guard = None;
                Err(Error::BackendTimeout(format!("{target}: read")))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tokio::net::TcpListener;

    use crate::auth::Identity;
    use crate::config::{BackendKind, Config, ConnectionConfig};
    use crate::generation::Catalog;
    use crate::registry::TunnelRegistry;

    fn forwarder() -> TcpForwarder {
        TcpForwarder::new(&ForwarderConfig {
            connect_timeout: Duration::from_secs(1),
            io_timeout: Duration::from_secs(1),
            connect_attempts: 1,
        })
    }

    fn make_tunnel(target: &str) -> Arc<TunnelEntry> {
        let config = Config {
            connections: HashMap::from([(
                "db".to_string(),
                ConnectionConfig {
                    description: String::new(),
                    backend_type: BackendKind::Redis,
                    target: target.to_string(),
                    allowed_roles: vec!["dba".to_string()],
                    approval_required: false,
                    approval_exempt_roles: Vec::new(),
                    whitelist: Vec::new(),
                    max_duration: Duration::from_secs(3600),
                    default_duration: Duration::from_secs(600),
                },
            )]),
            ..Default::default()
        };
        let spec = Catalog::compile(&config, 1).unwrap().get("db").unwrap();
        let registry = TunnelRegistry::new(Duration::from_secs(300));
        registry.create(
            Identity {
                username: "alice".to_string(),
                email: None,
                roles: vec!["dba".to_string()],
                provider: "local".to_string(),
            },
            spec,
            None,
            false,
        )
    }

    /// Echo server that uppercases what it receives, counting connections.
    async fn spawn_backend() -> (String, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let connections = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&connections);

        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    break;
                };
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(async move {
                    let mut buf = vec![0u8; 1024];
                    while let Ok(n) = socket.read(&mut buf).await {
                        if n == 0 {
                            break;
                        }
                        let reply = buf[..n].to_ascii_uppercase();
                        if socket.write_all(&reply).await.is_err() {
                            break;
                        }
                    }
                });
            }
        });

        (addr, connections)
    }

    #[tokio::test]
    async fn forward_relays_and_returns_response() {
        // GIVEN: a live backend and a tunnel targeting it
        let (addr, _) = spawn_backend().await;
        let tunnel = make_tunnel(&addr);

        // WHEN: forwarding an operation
        let response = forwarder().forward(&tunnel, b"ping").await.unwrap();

        // THEN: the backend's response comes back
        assert_eq!(response, b"PING");
    }

    #[tokio::test]
    async fn backend_connection_is_reused_across_operations() {
        // GIVEN: a backend counting accepted connections
        let (addr, connections) = spawn_backend().await;
        let tunnel = make_tunnel(&addr);
        let fwd = forwarder();

        // WHEN: three operations flow through one tunnel
        for op in [&b"a"[..], b"b", b"c"] {
            fwd.forward(&tunnel, op).await.unwrap();
        }

        // THEN: exactly one backend connection was opened
        assert_eq!(connections.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn release_backend_drops_the_pooled_connection() {
        let (addr, connections) = spawn_backend().await;
        let tunnel = make_tunnel(&addr);
        let fwd = forwarder();

        fwd.forward(&tunnel, b"one").await.unwrap();
        tunnel.release_backend().await;
        fwd.forward(&tunnel, b"two").await.unwrap();

        assert_eq!(connections.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn unreachable_target_is_backend_unavailable() {
        // GIVEN: a port nothing listens on
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);
        let tunnel = make_tunnel(&addr);

        // THEN: forwarding fails with the typed unavailable error
        let err = forwarder().forward(&tunnel, b"ping").await.unwrap_err();
        assert!(matches!(err, Error::BackendUnavailable(_)));
    }
}
