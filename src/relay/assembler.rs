//! Turns a pending request's queue into an HTTP response.
//!
//! [`StreamAssembler::open`] waits for the response head, then hands back a
//! lazy [`BodyStream`] that drains the rest of the queue. The stream owns the
//! [`PendingHandle`], so dropping it (client went away) removes the request.

use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use axum::http::header::{ACCEPT_RANGES, CONTENT_LENGTH, CONTENT_RANGE};
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use bytes::Bytes;
use futures_util::stream::{self, BoxStream, Stream};

use super::pending::{PendingHandle, QueueItem};
use crate::error::TunnelError;
use crate::http::is_hop_by_hop_header;
use crate::protocol::ResponseMetadata;

/// Response head plus body, ready for the HTTP layer.
#[derive(Debug)]
pub struct AssembledResponse {
    /// Status to answer with.
    pub status: StatusCode,
    /// Filtered agent headers plus relay-controlled framing headers.
    pub headers: HeaderMap,
    /// Lazy body.
    pub body: BodyStream,
}

/// Waits for metadata and assembles responses.
#[derive(Debug, Clone, Copy)]
pub struct StreamAssembler {
    metadata_timeout: Duration,
    chunk_timeout: Duration,
}

impl StreamAssembler {
    /// Assembler with the given waits.
    pub fn new(metadata_timeout: Duration, chunk_timeout: Duration) -> Self {
        Self {
            metadata_timeout,
            chunk_timeout,
        }
    }

    /// Wait for the response head of `handle`.
    ///
    /// `range` is the caller's `Range` header, if any. A 206 is only produced
    /// when the caller asked for a range and the agent supplied
    /// `content_range`; the relay never computes ranges itself.
    pub async fn open(
        &self,
        mut handle: PendingHandle,
        range: Option<&str>,
    ) -> Result<AssembledResponse, TunnelError> {
        let first = match tokio::time::timeout(self.metadata_timeout, handle.next_item()).await {
            Ok(Ok(item)) => item,
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                let err = TunnelError::MetadataTimeout(self.metadata_timeout);
                log::warn!("[Relay] {} timed out waiting for metadata", handle.id());
                handle.abort(err.clone());
                return Err(err);
            }
        };

        let mut body = BodyState {
            handle: Some(handle),
            first: None,
            remaining: None,
            chunk_timeout: self.chunk_timeout,
        };
        let metadata = match first {
            QueueItem::Metadata(metadata) => metadata,
            QueueItem::Chunk(data) => {
                body.first = Some(data);
                ResponseMetadata::implicit()
            }
            QueueItem::End => {
                if let Some(handle) = body.handle.take() {
                    handle.complete();
                }
                ResponseMetadata::implicit()
            }
        };
        body.remaining = metadata.content_length;

        let status = response_status(&metadata, range.is_some());
        let headers = response_headers(&metadata, status);
        Ok(AssembledResponse {
            status,
            headers,
            body: BodyStream::new(body),
        })
    }
}

fn response_status(metadata: &ResponseMetadata, range_requested: bool) -> StatusCode {
    // A 416 carries `bytes */len` and must stay a 416.
    let success = (200..300).contains(&metadata.status_code);
    if range_requested && success && metadata.content_range.is_some() {
        return StatusCode::PARTIAL_CONTENT;
    }
    StatusCode::from_u16(metadata.status_code).unwrap_or_else(|_| {
        log::warn!("[Relay] Agent sent invalid status {}", metadata.status_code);
        StatusCode::BAD_GATEWAY
    })
}

/// Agent headers minus hop-by-hop and framing headers, with `Content-Length`
/// and (for 206) `Content-Range` re-set from metadata.
fn response_headers(metadata: &ResponseMetadata, status: StatusCode) -> HeaderMap {
    let mut headers = HeaderMap::with_capacity(metadata.headers.len() + 3);
    for (name, value) in &metadata.headers {
        if is_hop_by_hop_header(name)
            || name.eq_ignore_ascii_case("content-length")
            || name.eq_ignore_ascii_case("content-range")
        {
            continue;
        }
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                headers.append(name, value);
            }
            _ => log::debug!("[Relay] Dropping invalid agent header {name:?}"),
        }
    }

    if let Some(length) = metadata.content_length {
        headers.insert(CONTENT_LENGTH, HeaderValue::from(length));
    }

    if status == StatusCode::PARTIAL_CONTENT {
        if let Some(range) = metadata
            .content_range
            .as_deref()
            .and_then(|r| HeaderValue::from_str(r).ok())
        {
            headers.insert(CONTENT_RANGE, range);
        }
        headers.insert(ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    }

    headers
}

struct BodyState {
    handle: Option<PendingHandle>,
    /// Chunk that arrived before (instead of) metadata.
    first: Option<Bytes>,
    /// Bytes still allowed when the length is known.
    remaining: Option<u64>,
    chunk_timeout: Duration,
}

impl BodyState {
    /// Clamp a chunk to the declared length. `None` means "yield nothing".
    fn clamp(&mut self, mut data: Bytes) -> Option<Bytes> {
        if let Some(remaining) = self.remaining.as_mut() {
            if *remaining == 0 {
                log::debug!("[Relay] Dropping {} bytes past declared length", data.len());
                return None;
            }
            let len = data.len() as u64;
            if len > *remaining {
                data.truncate(usize::try_from(*remaining).unwrap_or(data.len()));
            }
            *remaining -= data.len() as u64;
        }
        (!data.is_empty()).then_some(data)
    }

    async fn next(mut self) -> Option<(Result<Bytes, TunnelError>, Self)> {
        if let Some(data) = self.first.take() {
            if let Some(data) = self.clamp(data) {
                return Some((Ok(data), self));
            }
        }

        loop {
            let handle = self.handle.as_mut()?;
            let next = tokio::time::timeout(self.chunk_timeout, handle.next_item()).await;
            match next {
                Ok(Ok(QueueItem::Chunk(data))) => {
                    if let Some(data) = self.clamp(data) {
                        return Some((Ok(data), self));
                    }
                }
                Ok(Ok(QueueItem::End)) => {
                    if let Some(handle) = self.handle.take() {
                        handle.complete();
                    }
                    return None;
                }
                Ok(Ok(QueueItem::Metadata(_))) => {
                    log::debug!("[Relay] Ignoring late metadata");
                }
                Ok(Err(e)) => {
                    if let Some(handle) = self.handle.take() {
                        log::warn!("[Relay] Truncating response {}: {e}", handle.id());
                    }
                    return Some((Err(e), self));
                }
                Err(_) => {
                    let err = TunnelError::ChunkTimeout(self.chunk_timeout);
                    if let Some(handle) = self.handle.take() {
                        log::warn!("[Relay] Truncating response {}: {err}", handle.id());
                        handle.abort(err.clone());
                    }
                    return Some((Err(err), self));
                }
            }
        }
    }
}

/// Lazy, finite, non-restartable response body.
///
/// Yields an error (and ends) when the agent fails mid-stream, so the HTTP
/// layer aborts the response instead of completing it short.
pub struct BodyStream {
    inner: BoxStream<'static, Result<Bytes, TunnelError>>,
}

impl BodyStream {
    fn new(state: BodyState) -> Self {
        Self {
            inner: Box::pin(stream::unfold(state, BodyState::next)),
        }
    }
}

impl std::fmt::Debug for BodyStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BodyStream").finish_non_exhaustive()
    }
}

impl Stream for BodyStream {
    type Item = Result<Bytes, TunnelError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ConnectionId, Frame, RequestId};
    use crate::relay::pending::PendingRequestTable;
    use futures_util::StreamExt;
    use std::sync::Arc;

    fn conn() -> ConnectionId {
        ConnectionId::new("c1")
    }

    fn table() -> Arc<PendingRequestTable> {
        Arc::new(PendingRequestTable::new(16, Duration::from_secs(5)))
    }

    fn assembler() -> StreamAssembler {
        StreamAssembler::new(Duration::from_secs(30), Duration::from_secs(30))
    }

    fn meta(
        id: &RequestId,
        status: u16,
        length: Option<u64>,
        range: Option<&str>,
    ) -> Frame {
        Frame::Metadata {
            request_id: id.clone(),
            metadata: ResponseMetadata {
                status_code: status,
                headers: vec![
                    ("Content-Type".into(), "video/mp4".into()),
                    ("Transfer-Encoding".into(), "chunked".into()),
                    ("Content-Length".into(), "999999".into()),
                    ("Set-Cookie".into(), "a=1".into()),
                    ("Set-Cookie".into(), "b=2".into()),
                ],
                content_length: length,
                content_range: range.map(str::to_string),
            },
        }
    }

    fn chunk(id: &RequestId, data: Vec<u8>) -> Frame {
        Frame::Chunk {
            request_id: id.clone(),
            data: Bytes::from(data),
        }
    }

    async fn collect(body: BodyStream) -> Result<Vec<u8>, TunnelError> {
        let mut out = Vec::new();
        let mut body = body;
        while let Some(chunk) = body.next().await {
            out.extend_from_slice(&chunk?);
        }
        Ok(out)
    }

    #[tokio::test]
    async fn test_range_response_is_206_with_agent_range() {
        let table = table();
        let handle = table.create(conn());
        let id = handle.id().clone();

        table
            .deliver(&conn(), meta(&id, 206, Some(100), Some("bytes 100-199/1000")))
            .await;
        table.deliver(&conn(), chunk(&id, vec![1; 60])).await;
        table.deliver(&conn(), chunk(&id, vec![2; 40])).await;
        table.deliver(&conn(), Frame::End { request_id: id.clone() }).await;

        let response = assembler().open(handle, Some("bytes=100-199")).await.unwrap();
        assert_eq!(response.status, StatusCode::PARTIAL_CONTENT);
        assert_eq!(response.headers[CONTENT_RANGE], "bytes 100-199/1000");
        assert_eq!(response.headers[CONTENT_LENGTH], "100");
        assert_eq!(response.headers[ACCEPT_RANGES], "bytes");
        assert!(response.headers.get("transfer-encoding").is_none());
        assert_eq!(response.headers.get_all("set-cookie").iter().count(), 2);

        let body = collect(response.body).await.unwrap();
        assert_eq!(body.len(), 100);
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn test_range_without_agent_range_passes_status_through() {
        let table = table();
        let handle = table.create(conn());
        let id = handle.id().clone();

        table.deliver(&conn(), meta(&id, 200, Some(3), None)).await;
        table.deliver(&conn(), chunk(&id, b"abc".to_vec())).await;
        table.deliver(&conn(), Frame::End { request_id: id.clone() }).await;

        let response = assembler().open(handle, Some("bytes=0-1")).await.unwrap();
        assert_eq!(response.status, StatusCode::OK);
        assert!(response.headers.get(CONTENT_RANGE).is_none());
        assert_eq!(collect(response.body).await.unwrap(), b"abc");
    }

    #[tokio::test]
    async fn test_body_clamped_to_content_length() {
        let table = table();
        let handle = table.create(conn());
        let id = handle.id().clone();

        table.deliver(&conn(), meta(&id, 200, Some(4), None)).await;
        table.deliver(&conn(), chunk(&id, b"abcdef".to_vec())).await;
        table.deliver(&conn(), chunk(&id, b"ghi".to_vec())).await;
        table.deliver(&conn(), Frame::End { request_id: id.clone() }).await;

        let response = assembler().open(handle, None).await.unwrap();
        assert_eq!(collect(response.body).await.unwrap(), b"abcd");
    }

    #[tokio::test]
    async fn test_end_before_metadata_gives_empty_200() {
        let table = table();
        let handle = table.create(conn());
        let id = handle.id().clone();

        table.deliver(&conn(), Frame::End { request_id: id.clone() }).await;
        let response = assembler().open(handle, None).await.unwrap();
        assert_eq!(response.status, StatusCode::OK);
        assert!(collect(response.body).await.unwrap().is_empty());
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn test_chunk_before_metadata_is_first_body_chunk() {
        let table = table();
        let handle = table.create(conn());
        let id = handle.id().clone();

        table.deliver(&conn(), chunk(&id, b"hi".to_vec())).await;
        table.deliver(&conn(), Frame::End { request_id: id.clone() }).await;

        let response = assembler().open(handle, None).await.unwrap();
        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(collect(response.body).await.unwrap(), b"hi");
    }

    #[tokio::test(start_paused = true)]
    async fn test_metadata_timeout_removes_request() {
        let table = table();
        let handle = table.create(conn());
        let id = handle.id().clone();

        let err = assembler().open(handle, None).await.unwrap_err();
        assert_eq!(err, TunnelError::MetadataTimeout(Duration::from_secs(30)));
        assert_eq!(err.http_status(), StatusCode::GATEWAY_TIMEOUT);
        assert!(!table.contains(&id));
    }

    #[tokio::test(start_paused = true)]
    async fn test_chunk_timeout_truncates() {
        let table = table();
        let handle = table.create(conn());
        let id = handle.id().clone();

        table.deliver(&conn(), meta(&id, 200, None, None)).await;
        table.deliver(&conn(), chunk(&id, b"partial".to_vec())).await;

        let response = StreamAssembler::new(Duration::from_secs(30), Duration::from_secs(2))
            .open(handle, None)
            .await
            .unwrap();
        let mut body = response.body;
        assert_eq!(body.next().await.unwrap().unwrap(), Bytes::from_static(b"partial"));
        assert_eq!(
            body.next().await.unwrap().unwrap_err(),
            TunnelError::ChunkTimeout(Duration::from_secs(2))
        );
        assert!(body.next().await.is_none());
        assert!(!table.contains(&id));
    }

    #[tokio::test]
    async fn test_agent_error_before_headers() {
        let table = table();
        let handle = table.create(conn());
        let id = handle.id().clone();

        table
            .deliver(
                &conn(),
                Frame::Error {
                    request_id: id.clone(),
                    message: "connection refused".into(),
                },
            )
            .await;

        let err = assembler().open(handle, None).await.unwrap_err();
        assert_eq!(err.http_status(), StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn test_dropping_body_removes_request() {
        let table = table();
        let handle = table.create(conn());
        let id = handle.id().clone();

        table.deliver(&conn(), meta(&id, 200, None, None)).await;
        let response = assembler().open(handle, None).await.unwrap();
        assert!(table.contains(&id));

        drop(response);
        assert!(!table.contains(&id));
        // Late frames for the departed request are dropped quietly.
        table.deliver(&conn(), chunk(&id, b"late".to_vec())).await;
        assert!(table.is_empty());
    }
}
