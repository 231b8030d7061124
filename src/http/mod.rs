//! Public HTTP surface.
//!
//! Two routes:
//! - the control path, where agents upgrade to a WebSocket
//! - everything else, which is tunneled to the agent picked by `Host`

use axum::body::{to_bytes, Body};
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Request, State};
use axum::http::header::{HOST, RANGE};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;

use crate::protocol::Headers;
use crate::relay::{Relay, TunnelRequest};
use crate::transport::ws_server;

/// Build the relay's router.
pub fn router(relay: Relay) -> Router {
    let control_path = relay.config().control_path.clone();
    Router::new()
        .route(&control_path, get(control_upgrade))
        .fallback(proxy)
        .with_state(relay)
}

/// Whether a header is hop-by-hop and must not cross the tunnel.
pub fn is_hop_by_hop_header(name: &str) -> bool {
    matches!(
        name.to_ascii_lowercase().as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "proxy-connection"
            | "te"
            | "trailer"
            | "trailers"
            | "transfer-encoding"
            | "upgrade"
    )
}

async fn control_upgrade(State(relay): State<Relay>, ws: WebSocketUpgrade) -> Response {
    let max = relay.config().max_frame_size;
    ws.max_message_size(max)
        .max_frame_size(max)
        .on_upgrade(move |socket| async move {
            let (writer, reader) = ws_server::split(socket);
            match relay.accept(reader, writer).await {
                Ok(id) => log::debug!("[Relay] Control session {id} ended"),
                Err(e) => log::warn!("[Relay] Control connection rejected: {e:#}"),
            }
        })
}

async fn proxy(State(relay): State<Relay>, request: Request) -> Response {
    let (parts, body) = request.into_parts();

    let host = parts
        .headers
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .or_else(|| parts.uri.host());
    let conn = match relay.route(host) {
        Ok(conn) => conn,
        Err(e) => {
            log::debug!("[Relay] No route for host {host:?}: {e}");
            return e.into_response();
        }
    };

    let body = match to_bytes(body, relay.config().max_request_body).await {
        Ok(body) => body,
        Err(e) => {
            log::warn!("[Relay] Rejecting request body: {e}");
            return (StatusCode::PAYLOAD_TOO_LARGE, "request body too large\n").into_response();
        }
    };

    let range = parts
        .headers
        .get(RANGE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let headers: Headers = parts
        .headers
        .iter()
        .filter(|(name, _)| !is_hop_by_hop_header(name.as_str()))
        .map(|(name, value)| {
            (
                name.as_str().to_string(),
                String::from_utf8_lossy(value.as_bytes()).into_owned(),
            )
        })
        .collect();

    let path = parts
        .uri
        .path_and_query()
        .map_or_else(|| parts.uri.path().to_string(), |pq| pq.as_str().to_string());

    log::debug!(
        "[Relay] {} {} -> {}",
        parts.method,
        path,
        conn.identity().unwrap_or(conn.id().as_str())
    );

    let tunnel_request = TunnelRequest {
        method: parts.method.as_str().to_string(),
        path,
        headers,
        body,
    };
    let handle = match relay.multiplexer().dispatch(&conn, tunnel_request).await {
        Ok(handle) => handle,
        Err(e) => return e.into_response(),
    };

    match relay.assembler().open(handle, range.as_deref()).await {
        Ok(assembled) => {
            let mut response = Response::new(Body::from_stream(assembled.body));
            *response.status_mut() = assembled.status;
            *response.headers_mut() = assembled.headers;
            response
        }
        Err(e) => {
            log::info!("[Relay] {} {} failed before headers: {e}", parts.method, parts.uri);
            e.into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_hop_by_hop_header() {
        assert!(is_hop_by_hop_header("Connection"));
        assert!(is_hop_by_hop_header("transfer-encoding"));
        assert!(is_hop_by_hop_header("KEEP-ALIVE"));
        assert!(is_hop_by_hop_header("Trailer"));
        assert!(!is_hop_by_hop_header("Content-Type"));
        assert!(!is_hop_by_hop_header("Content-Length"));
        assert!(!is_hop_by_hop_header("Range"));
    }
}
