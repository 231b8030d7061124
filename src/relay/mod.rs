//! The tunnel engine.
//!
//! [`Relay`] ties the pieces together:
//!
//! - [`registry::ConnectionRegistry`] - who is connected, under which identity
//! - [`pending::PendingRequestTable`] - which requests are in flight
//! - [`multiplexer::RequestMultiplexer`] - public request → `Request` frame
//! - [`assembler::StreamAssembler`] - queued frames → HTTP response
//! - [`liveness::LivenessMonitor`] / [`janitor::Janitor`] - background cleanup
//!
//! Each control connection runs one read loop ([`Relay::accept`]) that
//! decodes frames and hands request-scoped ones to the pending table, and one
//! writer task that owns the transport's write half.

// Rust guideline compliant 2026-02

pub mod assembler;
pub mod connection;
pub mod janitor;
pub mod liveness;
pub mod multiplexer;
pub mod pending;
pub mod registry;

use std::net::IpAddr;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub use assembler::{AssembledResponse, BodyStream, StreamAssembler};
pub use connection::{Connection, ConnectionStatus};
pub use janitor::Janitor;
pub use liveness::LivenessMonitor;
pub use multiplexer::{RequestMultiplexer, TunnelRequest};
pub use pending::{PendingHandle, PendingRequest, PendingRequestTable, QueueItem, RequestState};
pub use registry::{normalize_identity, ConnectionRegistry};

use crate::config::RelayConfig;
use crate::constants::WRITE_QUEUE_BOUND;
use crate::error::TunnelError;
use crate::protocol::{ConnectionId, Frame};
use crate::transport::{FrameReader, FrameWriter};

/// Shared relay state. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Relay {
    config: Arc<RelayConfig>,
    registry: Arc<ConnectionRegistry>,
    pending: Arc<PendingRequestTable>,
    shutdown: CancellationToken,
}

impl Relay {
    /// Build an engine from `config`. Background tasks are not started; see
    /// [`Relay::spawn_maintenance`].
    pub fn new(config: RelayConfig) -> Self {
        let pending = PendingRequestTable::new(config.queue_capacity, config.chunk_timeout());
        Self {
            config: Arc::new(config),
            registry: Arc::new(ConnectionRegistry::new()),
            pending: Arc::new(pending),
            shutdown: CancellationToken::new(),
        }
    }

    /// Active configuration.
    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// Connection registry.
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Pending request table.
    pub fn pending(&self) -> &Arc<PendingRequestTable> {
        &self.pending
    }

    /// Request dispatcher bound to this relay's pending table.
    pub fn multiplexer(&self) -> RequestMultiplexer {
        RequestMultiplexer::new(Arc::clone(&self.pending))
    }

    /// Response assembler using the configured timeouts.
    pub fn assembler(&self) -> StreamAssembler {
        StreamAssembler::new(self.config.metadata_timeout(), self.config.chunk_timeout())
    }

    /// Serve one control connection until it closes.
    ///
    /// Performs the `Register` handshake, spawns the connection's writer,
    /// then runs the read loop. On return the connection has been removed
    /// and its pending requests failed.
    ///
    /// # Errors
    ///
    /// Returns an error if the handshake fails (timeout, wrong first frame,
    /// channel closed). Errors after registration are logged, not returned.
    pub async fn accept<R, W>(&self, mut reader: R, mut writer: W) -> Result<ConnectionId>
    where
        R: FrameReader,
        W: FrameWriter + 'static,
    {
        let handshake = tokio::time::timeout(self.config.handshake_timeout(), reader.recv()).await;
        let first = match handshake {
            Ok(Some(first)) => first.context("handshake read failed")?,
            Ok(None) => bail!("control connection closed before Register"),
            Err(_) => {
                let _ = writer.close().await;
                bail!(
                    "no Register frame within {:?}",
                    self.config.handshake_timeout()
                );
            }
        };

        let requested = match Frame::decode(&first) {
            Ok(Frame::Register { identity }) => identity,
            Ok(other) => {
                let _ = writer.close().await;
                bail!("expected Register as first frame, got {}", other.kind());
            }
            Err(e) => {
                let _ = writer.close().await;
                bail!("handshake frame rejected: {e}");
            }
        };

        let (frame_tx, frame_rx) = mpsc::channel(WRITE_QUEUE_BOUND);
        let conn = self.registry.register(frame_tx, requested.as_deref());
        connection::spawn_writer(writer, frame_rx, conn.closed_token(), conn.id().clone());

        let registered = Frame::Registered {
            connection_id: conn.id().clone(),
            identity: conn.identity().map(str::to_string),
        };
        if conn.send(&registered).await.is_err() {
            self.close_connection(conn.id(), "handshake reply failed");
            bail!("control connection closed during handshake");
        }

        log::info!(
            "[Relay] Agent {} connected (identity: {})",
            conn.id(),
            conn.identity().unwrap_or("-")
        );

        self.read_loop(&conn, &mut reader).await;
        self.close_connection(conn.id(), "control channel closed");
        Ok(conn.id().clone())
    }

    async fn read_loop<R: FrameReader>(&self, conn: &Arc<Connection>, reader: &mut R) {
        loop {
            let next = tokio::select! {
                biased;
                () = conn.closed() => break,
                next = reader.recv() => next,
            };
            let bytes = match next {
                Some(Ok(bytes)) => bytes,
                Some(Err(e)) => {
                    log::warn!("[Relay] Read from {} failed: {e:#}", conn.id());
                    break;
                }
                None => break,
            };

            conn.touch();

            let frame = match Frame::decode(&bytes) {
                Ok(frame) => frame,
                Err(e) => {
                    log::warn!("[Relay] Dropping frame from {}: {e}", conn.id());
                    continue;
                }
            };

            match frame {
                Frame::Heartbeat => {
                    conn.try_send(&Frame::HeartbeatAck);
                }
                Frame::HeartbeatAck => {}
                frame @ (Frame::Metadata { .. }
                | Frame::Chunk { .. }
                | Frame::End { .. }
                | Frame::Error { .. }) => {
                    self.pending.deliver(conn.id(), frame).await;
                }
                other => {
                    log::warn!(
                        "[Relay] Unexpected {} frame from {}",
                        other.kind(),
                        conn.id()
                    );
                }
            }
        }
    }

    /// Close a connection, remove it from the registry, and fail every
    /// request it owns. Returns `false` if it was already gone.
    pub fn close_connection(&self, id: &ConnectionId, reason: &str) -> bool {
        let Some(conn) = self.registry.remove(id) else {
            return false;
        };
        conn.close();
        let failed = self
            .pending
            .fail_connection(id, TunnelError::AgentDisconnected);
        log::info!("[Relay] Agent {id} disconnected ({reason}); failed {failed} pending request(s)");
        true
    }

    /// Close every connection.
    pub fn close_all(&self, reason: &str) {
        for conn in self.registry.snapshot() {
            self.close_connection(conn.id(), reason);
        }
    }

    /// Pick the connection for a public request.
    ///
    /// With identity routing, the identity comes from `host`; an identity no
    /// agent holds is [`TunnelError::IdentityNotFound`]. Without it, the
    /// newest active agent serves everything.
    pub fn route(&self, host: Option<&str>) -> Result<Arc<Connection>, TunnelError> {
        if !self.config.routing_by_identity {
            return self
                .registry
                .lookup_any()
                .ok_or(TunnelError::AgentUnreachable);
        }

        let host = host.unwrap_or_default();
        let identity = identity_from_host(host, self.config.base_domain.as_deref())
            .ok_or_else(|| TunnelError::IdentityNotFound(host.to_string()))?;
        self.registry
            .lookup(&identity)
            .ok_or(TunnelError::IdentityNotFound(identity))
    }

    /// Start the liveness monitor and janitor.
    pub fn spawn_maintenance(&self) -> Vec<JoinHandle<()>> {
        let monitor = LivenessMonitor::new(self.clone());
        let janitor = Janitor::new(
            Arc::clone(&self.pending),
            self.config.janitor_period(),
            self.config.request_expiry(),
        );
        vec![
            tokio::spawn(monitor.run(self.shutdown.child_token())),
            tokio::spawn(janitor.run(self.shutdown.child_token())),
        ]
    }

    /// Stop taking new requests and stop background tasks. Connections stay
    /// open so in-flight responses can finish; see [`Relay::close_all`].
    pub fn shutdown(&self) {
        for conn in self.registry.snapshot() {
            conn.drain();
        }
        self.shutdown.cancel();
        log::info!("[Relay] Draining {} connection(s)", self.registry.len());
    }

    /// Whether [`Relay::shutdown`] has been called.
    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

/// Routing identity encoded in a `Host` header.
///
/// The port is ignored. With `base_domain`, the label directly in front of
/// it is used (`demo.tunnel.example.com` → `demo`); otherwise the leading
/// label. IP literals carry no identity.
pub fn identity_from_host(host: &str, base_domain: Option<&str>) -> Option<String> {
    if host.starts_with('[') {
        return None;
    }
    let host = host.split(':').next()?.trim_end_matches('.').to_ascii_lowercase();
    if host.is_empty() || host.parse::<IpAddr>().is_ok() {
        return None;
    }

    let label = match base_domain {
        Some(base) => {
            let base = base.trim_matches('.').to_ascii_lowercase();
            let prefix = host.strip_suffix(base.as_str())?.strip_suffix('.')?;
            prefix.rsplit('.').next()?
        }
        None => host.split('.').next()?,
    };
    normalize_identity(label)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_from_leading_label() {
        assert_eq!(identity_from_host("demo.example.com", None), Some("demo".into()));
        assert_eq!(identity_from_host("Demo.example.com:8443", None), Some("demo".into()));
        assert_eq!(identity_from_host("localhost:10000", None), Some("localhost".into()));
    }

    #[test]
    fn test_identity_with_base_domain() {
        let base = Some("tunnel.example.com");
        assert_eq!(
            identity_from_host("media.tunnel.example.com", base),
            Some("media".into())
        );
        assert_eq!(
            identity_from_host("a.media.tunnel.example.com.", base),
            Some("media".into())
        );
        assert_eq!(identity_from_host("tunnel.example.com", base), None);
        assert_eq!(identity_from_host("media.other.com", base), None);
    }

    #[test]
    fn test_ip_hosts_carry_no_identity() {
        assert_eq!(identity_from_host("127.0.0.1:10000", None), None);
        assert_eq!(identity_from_host("[::1]:10000", None), None);
        assert_eq!(identity_from_host("", None), None);
    }

    #[test]
    fn test_route_unknown_identity_is_not_found() {
        let relay = Relay::new(RelayConfig::default());
        assert_eq!(
            relay.route(Some("ghost.example.com")).unwrap_err(),
            TunnelError::IdentityNotFound("ghost".into())
        );
        assert!(relay.pending().is_empty());
    }

    #[test]
    fn test_route_without_identity_routing() {
        let relay = Relay::new(RelayConfig {
            routing_by_identity: false,
            ..RelayConfig::default()
        });
        assert_eq!(
            relay.route(Some("anything")).unwrap_err(),
            TunnelError::AgentUnreachable
        );

        let (tx, _rx) = mpsc::channel(1);
        let conn = relay.registry().register(tx, Some("demo"));
        assert_eq!(relay.route(None).unwrap().id(), conn.id());
    }

    #[test]
    fn test_close_connection_is_idempotent() {
        let relay = Relay::new(RelayConfig::default());
        let (tx, _rx) = mpsc::channel(1);
        let conn = relay.registry().register(tx, None);
        let _pending = relay.pending().create(conn.id().clone());

        assert!(relay.close_connection(conn.id(), "test"));
        assert!(!relay.close_connection(conn.id(), "test"));
        assert!(relay.pending().is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_drains_connections() {
        let relay = Relay::new(RelayConfig::default());
        let (tx, _rx) = mpsc::channel(1);
        let conn = relay.registry().register(tx, Some("demo"));

        relay.shutdown();
        assert!(relay.is_shutting_down());
        assert_eq!(conn.status(), ConnectionStatus::Draining);
        // Still routable; the multiplexer turns it away with a 503.
        assert_eq!(relay.route(Some("demo.example.com")).unwrap().id(), conn.id());
    }
}
