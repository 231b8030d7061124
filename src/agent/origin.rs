//! Replays tunneled requests against the local origin.
//!
//! # Architecture
//!
//! ```text
//! Relay ── Request frame ──> OriginProxy ──> origin_url ──> local server
//!                                 │
//!                                 └── Metadata, Chunk×N, End (or Error)
//! ```
//!
//! The response body is streamed, never buffered whole: each origin chunk
//! becomes one or more `Chunk` frames of at most [`CHUNK_SIZE`] bytes.

use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use bytes::Bytes;
use futures_util::StreamExt;
use reqwest::header::{HeaderName, CONTENT_LENGTH, CONTENT_RANGE};
use reqwest::{Client, Method};
use tokio::sync::mpsc;

use crate::constants::CHUNK_SIZE;
use crate::http::is_hop_by_hop_header;
use crate::protocol::{Frame, Headers, RequestId, ResponseMetadata};

/// One request as received from the relay.
#[derive(Debug, Clone)]
pub struct OriginRequest {
    /// Correlation id echoed on every response frame.
    pub request_id: RequestId,
    /// HTTP method.
    pub method: String,
    /// Path and query.
    pub path: String,
    /// Caller headers.
    pub headers: Headers,
    /// Request body.
    pub body: Bytes,
}

/// HTTP client bound to the local origin.
#[derive(Debug)]
pub struct OriginProxy {
    client: Client,
    base_url: String,
    timeout: Duration,
}

impl OriginProxy {
    /// Proxy to `base_url`. `timeout` bounds connecting and waiting for the
    /// response head; bodies stream for as long as the origin produces them.
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(timeout)
            .redirect(reqwest::redirect::Policy::none()) // Redirects go back to the caller
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            timeout,
        })
    }

    /// Origin base URL.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Forward `request` and stream the answer into `out`.
    ///
    /// Origin failures become an `Error` frame. Returns an error only when
    /// `out` is closed (the relay session is gone).
    pub async fn forward(&self, request: OriginRequest, out: &mpsc::Sender<Vec<u8>>) -> Result<()> {
        let request_id = request.request_id.clone();
        match self.stream_response(request, out).await {
            Ok(()) => Ok(()),
            Err(e) if out.is_closed() => Err(e.context("relay session closed")),
            Err(e) => {
                log::warn!("[Agent] Request {request_id} failed: {e:#}");
                let frame = Frame::Error {
                    request_id,
                    message: format!("{e:#}"),
                };
                send(out, &frame).await
            }
        }
    }

    async fn stream_response(&self, request: OriginRequest, out: &mpsc::Sender<Vec<u8>>) -> Result<()> {
        let OriginRequest {
            request_id,
            method,
            path,
            headers,
            body,
        } = request;

        let method = Method::from_bytes(method.as_bytes())
            .map_err(|_| anyhow!("unsupported HTTP method: {method}"))?;
        let url = format!("{}{}", self.base_url, path);

        log::debug!("[Agent] {method} {path} -> {}", self.base_url);

        let mut builder = self.client.request(method, &url);
        for (name, value) in &headers {
            // Host is rewritten by the client; length is recomputed from the body.
            if is_hop_by_hop_header(name)
                || name.eq_ignore_ascii_case("host")
                || name.eq_ignore_ascii_case("content-length")
            {
                continue;
            }
            builder = builder.header(name.as_str(), value.as_str());
        }
        if !body.is_empty() {
            builder = builder.body(body);
        }

        let response = tokio::time::timeout(self.timeout, builder.send())
            .await
            .map_err(|_| anyhow!("origin did not answer within {:?}", self.timeout))?
            .map_err(|e| {
                if e.is_connect() {
                    anyhow!("connection refused (is the origin running at {}?)", self.base_url)
                } else {
                    anyhow::Error::new(e).context("origin request failed")
                }
            })?;

        let header_value = |name: HeaderName| {
            response
                .headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };
        let metadata = ResponseMetadata {
            status_code: response.status().as_u16(),
            headers: response
                .headers()
                .iter()
                .filter(|(name, _)| !is_hop_by_hop_header(name.as_str()))
                .map(|(name, value)| {
                    (
                        name.as_str().to_string(),
                        String::from_utf8_lossy(value.as_bytes()).into_owned(),
                    )
                })
                .collect(),
            content_length: header_value(CONTENT_LENGTH).and_then(|v| v.parse().ok()),
            content_range: header_value(CONTENT_RANGE),
        };
        send(
            out,
            &Frame::Metadata {
                request_id: request_id.clone(),
                metadata,
            },
        )
        .await?;

        let mut sent = 0usize;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.context("origin body read failed")?;
            let mut offset = 0;
            while offset < chunk.len() {
                let end = (offset + CHUNK_SIZE).min(chunk.len());
                send(
                    out,
                    &Frame::Chunk {
                        request_id: request_id.clone(),
                        data: chunk.slice(offset..end),
                    },
                )
                .await?;
                offset = end;
            }
            sent += chunk.len();
        }

        send(out, &Frame::End { request_id: request_id.clone() }).await?;
        log::debug!("[Agent] {request_id} complete ({sent} bytes)");
        Ok(())
    }
}

async fn send(out: &mpsc::Sender<Vec<u8>>, frame: &Frame) -> Result<()> {
    out.send(frame.encode())
        .await
        .map_err(|_| anyhow!("relay writer closed"))
}
