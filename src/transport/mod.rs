//! Frame transports.
//!
//! The tunnel engine only needs "send one encoded frame" and "receive the
//! next encoded frame". Anything duplex can carry it:
//!
//! - [`ws_server`] - relay side of an axum WebSocket upgrade
//! - [`crate::ws`] - agent side WebSocket client (tokio-tungstenite)
//! - [`stream`] - length-prefixed frames over any `AsyncRead + AsyncWrite`
//!   (raw TCP, in-memory duplex pipes in tests)

// Rust guideline compliant 2026-02

use anyhow::Result;
use async_trait::async_trait;

pub mod stream;
pub mod ws_server;

/// Read half of a control channel.
#[async_trait]
pub trait FrameReader: Send {
    /// Receive the next encoded frame, returning `None` once the peer has
    /// closed the channel.
    async fn recv(&mut self) -> Option<Result<Vec<u8>>>;
}

/// Write half of a control channel.
///
/// Exactly one task owns a `FrameWriter` per connection; everything else
/// queues encoded frames to that task.
#[async_trait]
pub trait FrameWriter: Send {
    /// Send one encoded frame.
    async fn send(&mut self, frame: Vec<u8>) -> Result<()>;

    /// Flush and close the channel.
    async fn close(&mut self) -> Result<()>;
}
