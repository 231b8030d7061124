//! Dispatches public requests onto agent connections.

use std::sync::Arc;

use bytes::Bytes;

use super::connection::{Connection, ConnectionStatus};
use super::pending::{PendingHandle, PendingRequestTable};
use crate::error::TunnelError;
use crate::protocol::{Frame, Headers};

/// A public HTTP request, reduced to what crosses the tunnel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelRequest {
    /// HTTP method.
    pub method: String,
    /// Path and query string.
    pub path: String,
    /// Request headers, `Range` included.
    pub headers: Headers,
    /// Buffered request body.
    pub body: Bytes,
}

/// Turns public requests into `Request` frames plus pending entries.
#[derive(Debug, Clone)]
pub struct RequestMultiplexer {
    pending: Arc<PendingRequestTable>,
}

impl RequestMultiplexer {
    /// Dispatch into `pending`.
    pub fn new(pending: Arc<PendingRequestTable>) -> Self {
        Self { pending }
    }

    /// Register a pending request and send its `Request` frame through the
    /// connection's writer.
    ///
    /// No retries: if the frame cannot be queued the request is removed and
    /// the caller gets [`TunnelError::AgentUnreachable`].
    pub async fn dispatch(
        &self,
        connection: &Connection,
        request: TunnelRequest,
    ) -> Result<PendingHandle, TunnelError> {
        if connection.status() != ConnectionStatus::Active {
            return Err(TunnelError::AgentUnreachable);
        }

        let handle = self.pending.create(connection.id().clone());
        let frame = Frame::Request {
            request_id: handle.id().clone(),
            method: request.method,
            path: request.path,
            headers: request.headers,
            body: request.body,
        };

        // On failure `handle` drops here, which removes the entry.
        connection.send(&frame).await?;

        log::debug!(
            "[Relay] Dispatched {} to {}",
            handle.id(),
            connection.id()
        );
        Ok(handle)
    }
}
