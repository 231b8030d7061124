//! Tunnel error taxonomy.
//!
//! Every failure a tunneled request can hit maps to one variant here, and
//! each variant maps to the HTTP status the public caller sees. Connection
//! plumbing (sockets, config files) uses `anyhow` instead.

use std::time::Duration;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// Errors scoped to one tunneled request or one control connection.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TunnelError {
    /// A frame could not be decoded. The frame is dropped; the read loop continues.
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// The target connection is closed, draining, or its writer is gone.
    #[error("agent unreachable")]
    AgentUnreachable,

    /// No `Metadata` frame arrived within the metadata timeout.
    #[error("no response metadata from agent within {0:?}")]
    MetadataTimeout(Duration),

    /// No body frame arrived within the per-chunk timeout.
    #[error("no response chunk from agent within {0:?}")]
    ChunkTimeout(Duration),

    /// No connection holds the requested routing identity.
    #[error("no agent registered for '{0}'")]
    IdentityNotFound(String),

    /// The owning connection closed or missed its heartbeats.
    #[error("agent disconnected")]
    AgentDisconnected,

    /// The agent answered the request with an `Error` frame.
    #[error("agent error: {0}")]
    AgentFailed(String),

    /// The Janitor expired the request after it went idle.
    #[error("request expired")]
    Expired,

    /// The HTTP consumer stopped draining the response queue.
    #[error("response consumer stalled")]
    ConsumerStalled,
}

impl TunnelError {
    /// HTTP status to answer with when this error happens before the
    /// response head has been sent.
    pub fn http_status(&self) -> StatusCode {
        match self {
            Self::IdentityNotFound(_) => StatusCode::NOT_FOUND,
            Self::AgentUnreachable => StatusCode::SERVICE_UNAVAILABLE,
            Self::MetadataTimeout(_) | Self::ChunkTimeout(_) | Self::Expired => {
                StatusCode::GATEWAY_TIMEOUT
            }
            Self::AgentDisconnected | Self::AgentFailed(_) | Self::MalformedFrame(_) => {
                StatusCode::BAD_GATEWAY
            }
            Self::ConsumerStalled => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for TunnelError {
    fn into_response(self) -> Response {
        (self.http_status(), format!("{self}\n")).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            TunnelError::IdentityNotFound("demo".into()).http_status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            TunnelError::AgentUnreachable.http_status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            TunnelError::MetadataTimeout(Duration::from_secs(1)).http_status(),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            TunnelError::AgentDisconnected.http_status(),
            StatusCode::BAD_GATEWAY
        );
    }

    #[test]
    fn test_into_response_carries_status() {
        let response = TunnelError::AgentUnreachable.into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
