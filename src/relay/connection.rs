//! One agent control session.
//!
//! Outbound frames never touch the transport directly: every sender queues
//! encoded bytes on `frame_tx` and a single writer task drains them, so two
//! dispatches on the same connection can never interleave partial frames.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::TunnelError;
use crate::protocol::{ConnectionId, Frame};
use crate::transport::FrameWriter;

/// Connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionStatus {
    /// Registered and accepting new requests.
    Active = 0,
    /// Relay is shutting down; in-flight requests finish, no new ones.
    Draining = 1,
    /// Channel gone. Terminal.
    Closed = 2,
}

impl From<u8> for ConnectionStatus {
    fn from(value: u8) -> Self {
        match value {
            0 => ConnectionStatus::Active,
            1 => ConnectionStatus::Draining,
            _ => ConnectionStatus::Closed,
        }
    }
}

/// A registered agent control connection.
#[derive(Debug)]
pub struct Connection {
    id: ConnectionId,
    identity: Option<String>,
    frame_tx: mpsc::Sender<Vec<u8>>,
    last_seen: Mutex<Instant>,
    status: AtomicU8,
    registered_seq: u64,
    closed: CancellationToken,
}

impl Connection {
    pub(crate) fn new(
        id: ConnectionId,
        identity: Option<String>,
        frame_tx: mpsc::Sender<Vec<u8>>,
        registered_seq: u64,
    ) -> Self {
        Self {
            id,
            identity,
            frame_tx,
            last_seen: Mutex::new(Instant::now()),
            status: AtomicU8::new(ConnectionStatus::Active as u8),
            registered_seq,
            closed: CancellationToken::new(),
        }
    }

    /// Connection id assigned at registration.
    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    /// Routing identity granted at registration.
    pub fn identity(&self) -> Option<&str> {
        self.identity.as_deref()
    }

    /// Registration order; higher is newer.
    pub fn registered_seq(&self) -> u64 {
        self.registered_seq
    }

    /// Current lifecycle status.
    pub fn status(&self) -> ConnectionStatus {
        ConnectionStatus::from(self.status.load(Ordering::Acquire))
    }

    /// Move an active connection to draining. Closed stays closed.
    pub fn drain(&self) {
        let _ = self.status.compare_exchange(
            ConnectionStatus::Active as u8,
            ConnectionStatus::Draining as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// Mark the connection closed and stop its writer.
    ///
    /// Returns `true` only for the call that performed the transition.
    pub fn close(&self) -> bool {
        let previous = self
            .status
            .swap(ConnectionStatus::Closed as u8, Ordering::AcqRel);
        self.closed.cancel();
        previous != ConnectionStatus::Closed as u8
    }

    /// Resolves once the connection is closed (explicitly or by a write error).
    pub async fn closed(&self) {
        self.closed.cancelled().await;
    }

    pub(crate) fn closed_token(&self) -> CancellationToken {
        self.closed.clone()
    }

    /// Whether the channel has been torn down.
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Record inbound traffic.
    pub fn touch(&self) {
        *self.last_seen.lock().unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    /// Time since the last inbound frame.
    pub fn idle_for(&self) -> Duration {
        self.last_seen
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .elapsed()
    }

    /// Queue a frame for the writer, waiting for room.
    pub async fn send(&self, frame: &Frame) -> Result<(), TunnelError> {
        if self.is_closed() {
            return Err(TunnelError::AgentUnreachable);
        }
        tokio::select! {
            biased;
            () = self.closed.cancelled() => Err(TunnelError::AgentUnreachable),
            sent = self.frame_tx.send(frame.encode()) => {
                sent.map_err(|_| TunnelError::AgentUnreachable)
            }
        }
    }

    /// Queue a frame without waiting. Returns `false` if the writer queue is
    /// full or the connection is closed.
    pub fn try_send(&self, frame: &Frame) -> bool {
        !self.is_closed() && self.frame_tx.try_send(frame.encode()).is_ok()
    }
}

/// Spawn the single writer task for connection `id`.
///
/// The task exits when the connection closes or the transport fails; a write
/// failure closes the connection so its read loop stops too.
pub(crate) fn spawn_writer<W>(
    mut writer: W,
    mut frame_rx: mpsc::Receiver<Vec<u8>>,
    closed: CancellationToken,
    id: ConnectionId,
) -> JoinHandle<()>
where
    W: FrameWriter + 'static,
{
    tokio::spawn(async move {
        loop {
            let frame = tokio::select! {
                biased;
                () = closed.cancelled() => break,
                frame = frame_rx.recv() => frame,
            };
            let Some(frame) = frame else { break };
            if let Err(e) = writer.send(frame).await {
                log::warn!("[Relay] Write to {id} failed: {e:#}");
                closed.cancel();
                break;
            }
        }
        if let Err(e) = writer.close().await {
            log::debug!("[Relay] Closing {id} writer: {e:#}");
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::RequestId;
    use crate::transport::{stream, FrameReader};

    fn connection(capacity: usize) -> (Connection, mpsc::Receiver<Vec<u8>>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Connection::new(ConnectionId::new("c1"), None, tx, 1), rx)
    }

    #[test]
    fn test_status_from_u8() {
        assert_eq!(ConnectionStatus::from(0), ConnectionStatus::Active);
        assert_eq!(ConnectionStatus::from(1), ConnectionStatus::Draining);
        assert_eq!(ConnectionStatus::from(2), ConnectionStatus::Closed);
        assert_eq!(ConnectionStatus::from(99), ConnectionStatus::Closed);
    }

    #[test]
    fn test_close_transitions_once() {
        let (conn, _rx) = connection(4);
        assert!(conn.close());
        assert!(!conn.close());
        assert_eq!(conn.status(), ConnectionStatus::Closed);
    }

    #[test]
    fn test_drain_does_not_reopen_closed() {
        let (conn, _rx) = connection(4);
        conn.drain();
        assert_eq!(conn.status(), ConnectionStatus::Draining);
        conn.close();
        conn.drain();
        assert_eq!(conn.status(), ConnectionStatus::Closed);
    }

    #[tokio::test]
    async fn test_send_after_close_is_unreachable() {
        let (conn, _rx) = connection(4);
        conn.close();
        assert_eq!(
            conn.send(&Frame::Heartbeat).await,
            Err(TunnelError::AgentUnreachable)
        );
        assert!(!conn.try_send(&Frame::Heartbeat));
    }

    #[tokio::test]
    async fn test_try_send_reports_full_queue() {
        let (conn, _rx) = connection(1);
        assert!(conn.try_send(&Frame::Heartbeat));
        assert!(!conn.try_send(&Frame::Heartbeat));
    }

    #[tokio::test]
    async fn test_writer_serializes_concurrent_senders() {
        let (relay_side, agent_side) = tokio::io::duplex(256);
        let (writer, _unused_reader) = stream::split(relay_side, 1 << 20);
        let (_unused_writer, mut reader) = stream::split(agent_side, 1 << 20);

        let (tx, rx) = mpsc::channel(8);
        let conn = std::sync::Arc::new(Connection::new(ConnectionId::new("c1"), None, tx, 1));
        spawn_writer(writer, rx, conn.closed_token(), conn.id().clone());

        let mut senders = Vec::new();
        for i in 0..8u8 {
            let conn = conn.clone();
            senders.push(tokio::spawn(async move {
                let frame = Frame::Chunk {
                    request_id: RequestId::new(format!("r{i}")),
                    data: bytes::Bytes::from(vec![i; 1000]),
                };
                conn.send(&frame).await.unwrap();
            }));
        }
        for s in senders {
            s.await.unwrap();
        }

        for _ in 0..8 {
            let bytes = reader.recv().await.unwrap().unwrap();
            match Frame::decode(&bytes).unwrap() {
                Frame::Chunk { request_id, data } => {
                    let i: u8 = request_id.as_str()[1..].parse().unwrap();
                    assert!(data.iter().all(|b| *b == i));
                }
                other => panic!("unexpected frame {other:?}"),
            }
        }
    }
}
