//! In-flight tunneled requests.
//!
//! Each [`PendingRequest`] owns a bounded FIFO queue that the connection's
//! read loop fills and the HTTP side drains through a [`PendingHandle`].
//!
//! Removal from the table is the single point where a request ends: it
//! happens exactly once, whichever trigger gets there first (end consumed,
//! agent error, connection closed, expiry, consumer gone). Every other
//! trigger then finds the id missing and does nothing.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::TunnelError;
use crate::protocol::{ConnectionId, Frame, RequestId, ResponseMetadata};

/// Request lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    /// Dispatched; no response head yet.
    AwaitingMetadata,
    /// Head received (explicitly or implied by a chunk); body flowing.
    Streaming,
    /// `End` received.
    Complete,
    /// Agent error, disconnect, or stalled consumer.
    Failed,
    /// Swept by the Janitor.
    Expired,
}

impl RequestState {
    /// No further frames are accepted in this state.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Failed | Self::Expired)
    }
}

/// One entry in a request's delivery queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueItem {
    /// Response head.
    Metadata(ResponseMetadata),
    /// Body bytes.
    Chunk(Bytes),
    /// Terminal marker.
    End,
}

#[derive(Debug)]
struct PendingInner {
    state: RequestState,
    last_activity: Instant,
    metadata: Option<ResponseMetadata>,
    failure: Option<TunnelError>,
}

/// Shared state of one in-flight request.
#[derive(Debug)]
pub struct PendingRequest {
    id: RequestId,
    connection_id: ConnectionId,
    created_at: Instant,
    inner: Mutex<PendingInner>,
    queue_tx: mpsc::Sender<QueueItem>,
    cancel: CancellationToken,
}

impl PendingRequest {
    /// Request id.
    pub fn id(&self) -> &RequestId {
        &self.id
    }

    /// Owning connection.
    pub fn connection_id(&self) -> &ConnectionId {
        &self.connection_id
    }

    /// When the request was dispatched.
    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Current state.
    pub fn state(&self) -> RequestState {
        self.lock().state
    }

    /// Response head, once known.
    pub fn metadata(&self) -> Option<ResponseMetadata> {
        self.lock().metadata.clone()
    }

    /// Why the request ended, if it failed or expired.
    pub fn failure(&self) -> Option<TunnelError> {
        self.lock().failure.clone()
    }

    fn lock(&self) -> MutexGuard<'_, PendingInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Consumer side of a pending request. Dropping it removes the request.
#[derive(Debug)]
pub struct PendingHandle {
    request: Arc<PendingRequest>,
    rx: mpsc::Receiver<QueueItem>,
    table: Arc<PendingRequestTable>,
}

impl PendingHandle {
    /// Request id.
    pub fn id(&self) -> &RequestId {
        self.request.id()
    }

    /// Shared request state.
    pub fn request(&self) -> &Arc<PendingRequest> {
        &self.request
    }

    /// Next queued item, in delivery order.
    ///
    /// Items already queued are drained before a failure is reported.
    pub async fn next_item(&mut self) -> Result<QueueItem, TunnelError> {
        let request = &self.request;
        tokio::select! {
            biased;
            item = self.rx.recv() => {
                item.ok_or_else(|| request.failure().unwrap_or(TunnelError::AgentDisconnected))
            }
            () = request.cancel.cancelled() => {
                Err(request.failure().unwrap_or(TunnelError::AgentDisconnected))
            }
        }
    }

    /// The terminal marker was consumed.
    pub fn complete(self) {
        self.table.finish(self.request.id(), |inner| {
            inner.state = RequestState::Complete;
        });
    }

    /// Fail the request from the consumer side (e.g. a timeout).
    pub fn abort(self, error: TunnelError) {
        self.table.finish(self.request.id(), |inner| {
            inner.state = RequestState::Failed;
            inner.failure = Some(error);
        });
    }
}

impl Drop for PendingHandle {
    fn drop(&mut self) {
        if self.table.remove(self.request.id()) {
            log::debug!("[Pending] Consumer for {} went away", self.request.id());
        }
    }
}

/// All in-flight requests of one relay.
#[derive(Debug)]
pub struct PendingRequestTable {
    entries: RwLock<HashMap<RequestId, Arc<PendingRequest>>>,
    queue_capacity: usize,
    delivery_timeout: Duration,
}

impl PendingRequestTable {
    /// `delivery_timeout` bounds how long the read loop waits on one full queue.
    pub fn new(queue_capacity: usize, delivery_timeout: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            queue_capacity: queue_capacity.max(1),
            delivery_timeout,
        }
    }

    /// Create a request owned by `connection_id` in `AwaitingMetadata`.
    pub fn create(self: &Arc<Self>, connection_id: ConnectionId) -> PendingHandle {
        let (queue_tx, rx) = mpsc::channel(self.queue_capacity);
        let now = Instant::now();

        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let mut id = RequestId::generate();
        while entries.contains_key(&id) {
            id = RequestId::generate();
        }
        let request = Arc::new(PendingRequest {
            id: id.clone(),
            connection_id,
            created_at: now,
            inner: Mutex::new(PendingInner {
                state: RequestState::AwaitingMetadata,
                last_activity: now,
                metadata: None,
                failure: None,
            }),
            queue_tx,
            cancel: CancellationToken::new(),
        });
        entries.insert(id, Arc::clone(&request));
        drop(entries);

        PendingHandle {
            request,
            rx,
            table: Arc::clone(self),
        }
    }

    /// Request by id.
    pub fn get(&self, id: &RequestId) -> Option<Arc<PendingRequest>> {
        self.read().get(id).cloned()
    }

    /// Whether `id` is still in flight.
    pub fn contains(&self, id: &RequestId) -> bool {
        self.read().contains_key(id)
    }

    /// Number of in-flight requests.
    pub fn len(&self) -> usize {
        self.read().len()
    }

    /// Whether nothing is in flight.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Route a request-scoped frame that arrived on connection `from`.
    ///
    /// Frames for unknown (already removed) requests, or for requests owned
    /// by another connection, are dropped silently.
    pub async fn deliver(&self, from: &ConnectionId, frame: Frame) {
        let Some(request_id) = frame.request_id().cloned() else {
            log::warn!("[Pending] {} frame has no request id", frame.kind());
            return;
        };
        let Some(request) = self.get(&request_id) else {
            log::debug!(
                "[Pending] Dropping {} for departed request {request_id}",
                frame.kind()
            );
            return;
        };
        if request.connection_id() != from {
            log::warn!(
                "[Pending] Ignoring {} for {request_id} from foreign connection {from}",
                frame.kind()
            );
            return;
        }

        let item = {
            let mut inner = request.lock();
            if inner.state.is_terminal() {
                return;
            }
            inner.last_activity = Instant::now();

            match frame {
                Frame::Metadata { metadata, .. } => {
                    if inner.state != RequestState::AwaitingMetadata {
                        log::warn!("[Pending] Duplicate metadata for {request_id} ignored");
                        return;
                    }
                    inner.state = RequestState::Streaming;
                    inner.metadata = Some(metadata.clone());
                    QueueItem::Metadata(metadata)
                }
                Frame::Chunk { data, .. } => {
                    if inner.state == RequestState::AwaitingMetadata {
                        inner.state = RequestState::Streaming;
                        inner.metadata = Some(ResponseMetadata::implicit());
                    }
                    QueueItem::Chunk(data)
                }
                Frame::End { .. } => {
                    inner.state = RequestState::Complete;
                    QueueItem::End
                }
                Frame::Error { message, .. } => {
                    drop(inner);
                    log::info!("[Pending] Agent failed {request_id}: {message}");
                    self.finish(&request_id, |inner| {
                        inner.state = RequestState::Failed;
                        inner.failure = Some(TunnelError::AgentFailed(message));
                    });
                    return;
                }
                other => {
                    log::warn!("[Pending] Unexpected {} for {request_id}", other.kind());
                    return;
                }
            }
        };

        self.enqueue(&request, item).await;
    }

    /// Push onto the request queue, waiting for room up to the delivery
    /// timeout. Gives up immediately if the request ends meanwhile.
    async fn enqueue(&self, request: &Arc<PendingRequest>, item: QueueItem) {
        let sent = tokio::select! {
            biased;
            () = request.cancel.cancelled() => return,
            sent = tokio::time::timeout(self.delivery_timeout, request.queue_tx.send(item)) => sent,
        };

        match sent {
            Ok(Ok(())) => {}
            Ok(Err(_)) => {
                self.remove(request.id());
            }
            Err(_) => {
                log::warn!(
                    "[Pending] Consumer of {} stalled for {:?}, failing request",
                    request.id(),
                    self.delivery_timeout
                );
                self.finish(request.id(), |inner| {
                    inner.state = RequestState::Failed;
                    inner.failure = Some(TunnelError::ConsumerStalled);
                });
            }
        }
    }

    /// Remove a request without changing its state. Returns `false` if it
    /// was already gone.
    pub fn remove(&self, id: &RequestId) -> bool {
        self.finish(id, |_| {})
    }

    /// Fail and remove every request owned by `connection_id`.
    pub fn fail_connection(&self, connection_id: &ConnectionId, error: TunnelError) -> usize {
        let owned: Vec<RequestId> = self
            .read()
            .values()
            .filter(|r| r.connection_id() == connection_id)
            .map(|r| r.id().clone())
            .collect();

        let mut failed = 0;
        for id in &owned {
            let removed = self.finish(id, |inner| {
                inner.state = RequestState::Failed;
                inner.failure = Some(error.clone());
            });
            failed += usize::from(removed);
        }
        failed
    }

    /// Expire requests still waiting on the agent whose last activity is at
    /// least `threshold` ago.
    pub fn expire_idle(&self, threshold: Duration) -> usize {
        let stale: Vec<RequestId> = self
            .read()
            .values()
            .filter(|r| {
                let inner = r.lock();
                matches!(
                    inner.state,
                    RequestState::AwaitingMetadata | RequestState::Streaming
                ) && inner.last_activity.elapsed() >= threshold
            })
            .map(|r| r.id().clone())
            .collect();

        let mut expired = 0;
        for id in &stale {
            let removed = self.finish(id, |inner| {
                inner.state = RequestState::Expired;
                inner.failure = Some(TunnelError::Expired);
            });
            expired += usize::from(removed);
        }
        expired
    }

    /// The only removal path. The table lock is released before the request
    /// lock is taken.
    fn finish(&self, id: &RequestId, mark: impl FnOnce(&mut PendingInner)) -> bool {
        let removed = self
            .entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);
        let Some(request) = removed else {
            return false;
        };
        mark(&mut request.lock());
        request.cancel.cancel();
        true
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<RequestId, Arc<PendingRequest>>> {
        self.entries.read().unwrap_or_else(PoisonError::into_inner)
    }
}
