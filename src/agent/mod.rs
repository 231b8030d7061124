//! Agent side of the tunnel.
//!
//! The agent runs next to the origin. It dials the relay's control path,
//! registers, and then serves every `Request` frame concurrently through
//! [`origin::OriginProxy`]. When the session drops it reconnects with
//! exponential backoff.
//!
//! Like the relay, all outbound frames go through one writer task.

// Rust guideline compliant 2026-02

pub mod origin;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::AgentConfig;
use crate::constants::{RECONNECT_DELAY_INITIAL, RECONNECT_DELAY_MAX, WRITE_QUEUE_BOUND};
use crate::protocol::{ConnectionId, Frame};
use crate::transport::{FrameReader, FrameWriter};
use crate::ws;

use origin::{OriginProxy, OriginRequest};

/// Result of a successful handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    /// Id the relay assigned.
    pub connection_id: ConnectionId,
    /// Identity the relay granted (may differ from the requested one).
    pub identity: Option<String>,
}

/// Connects an origin to a relay.
#[derive(Debug)]
pub struct Agent {
    config: AgentConfig,
    origin: Arc<OriginProxy>,
}

impl Agent {
    /// Build an agent from validated configuration.
    pub fn new(config: AgentConfig) -> Result<Self> {
        let origin = OriginProxy::new(&config.origin_url, config.origin_timeout())?;
        Ok(Self {
            config,
            origin: Arc::new(origin),
        })
    }

    /// Active configuration.
    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// Keep a session open until `shutdown` fires, reconnecting as needed.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        let url = ws::control_url(&self.config.server_url, &self.config.control_path);
        let mut delay = RECONNECT_DELAY_INITIAL;

        while !shutdown.is_cancelled() {
            log::info!("[Agent] Connecting to {url}");
            match ws::connect(&url, &[]).await {
                Ok((writer, reader)) => {
                    match self.run_session(reader, writer, shutdown.clone()).await {
                        Ok(()) => delay = RECONNECT_DELAY_INITIAL,
                        Err(e) => log::warn!("[Agent] Session failed: {e:#}"),
                    }
                }
                Err(e) => log::warn!("[Agent] Connect failed: {e:#}"),
            }

            if shutdown.is_cancelled() {
                break;
            }
            log::info!("[Agent] Reconnecting in {delay:?}");
            tokio::select! {
                () = shutdown.cancelled() => break,
                () = tokio::time::sleep(delay) => {}
            }
            delay = (delay * 2).min(RECONNECT_DELAY_MAX);
        }

        log::info!("[Agent] Stopped");
        Ok(())
    }

    /// Run one session over an established control channel.
    ///
    /// Returns `Ok` once a registered session ends (relay went away, went
    /// silent, or shutdown). Handshake failures are errors.
    pub async fn run_session<R, W>(
        &self,
        mut reader: R,
        writer: W,
        shutdown: CancellationToken,
    ) -> Result<()>
    where
        R: FrameReader,
        W: FrameWriter + 'static,
    {
        let (out_tx, out_rx) = mpsc::channel(WRITE_QUEUE_BOUND);
        let writer_task = spawn_writer(writer, out_rx);

        let registration = self.handshake(&mut reader, &out_tx).await;
        let registration = match registration {
            Ok(registration) => registration,
            Err(e) => {
                drop(out_tx);
                let _ = writer_task.await;
                return Err(e);
            }
        };
        log::info!(
            "[Agent] Registered as {} (connection {})",
            registration.identity.as_deref().unwrap_or("-"),
            registration.connection_id
        );

        let idle = self.config.idle_timeout();
        let mut deadline = Instant::now() + idle;
        let mut requests = JoinSet::new();

        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                () = tokio::time::sleep_until(deadline) => {
                    log::warn!("[Agent] No traffic from relay for {idle:?}, reconnecting");
                    break;
                }
                Some(joined) = requests.join_next(), if !requests.is_empty() => {
                    match joined {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => log::debug!("[Agent] {e:#}"),
                        Err(e) => log::error!("[Agent] Request task panicked: {e}"),
                    }
                }
                next = reader.recv() => {
                    let bytes = match next {
                        Some(Ok(bytes)) => bytes,
                        Some(Err(e)) => {
                            log::warn!("[Agent] Control read failed: {e:#}");
                            break;
                        }
                        None => {
                            log::info!("[Agent] Relay closed the session");
                            break;
                        }
                    };
                    deadline = Instant::now() + idle;

                    match Frame::decode(&bytes) {
                        Ok(Frame::Heartbeat) => {
                            let _ = out_tx.try_send(Frame::HeartbeatAck.encode());
                        }
                        Ok(Frame::HeartbeatAck) => {}
                        Ok(Frame::Request { request_id, method, path, headers, body }) => {
                            let origin = Arc::clone(&self.origin);
                            let out = out_tx.clone();
                            let request = OriginRequest { request_id, method, path, headers, body };
                            requests.spawn(async move { origin.forward(request, &out).await });
                        }
                        Ok(other) => {
                            log::warn!("[Agent] Unexpected {} frame from relay", other.kind());
                        }
                        Err(e) => log::warn!("[Agent] Dropping frame: {e}"),
                    }
                }
            }
        }

        requests.abort_all();
        drop(out_tx);
        if tokio::time::timeout(Duration::from_secs(1), writer_task).await.is_err() {
            log::debug!("[Agent] Writer did not stop in time");
        }
        Ok(())
    }

    async fn handshake<R: FrameReader>(
        &self,
        reader: &mut R,
        out: &mpsc::Sender<Vec<u8>>,
    ) -> Result<Registration> {
        let register = Frame::Register {
            identity: self.config.identity.clone(),
        };
        out.send(register.encode())
            .await
            .context("control writer closed before Register")?;

        let reply = tokio::time::timeout(self.config.idle_timeout(), reader.recv())
            .await
            .context("timed out waiting for Registered")?;
        let bytes = match reply {
            Some(bytes) => bytes.context("control read failed during handshake")?,
            None => bail!("relay closed the connection during handshake"),
        };

        match Frame::decode(&bytes)? {
            Frame::Registered {
                connection_id,
                identity,
            } => Ok(Registration {
                connection_id,
                identity,
            }),
            other => bail!("expected Registered, got {}", other.kind()),
        }
    }
}

fn spawn_writer<W>(mut writer: W, mut frame_rx: mpsc::Receiver<Vec<u8>>) -> JoinHandle<()>
where
    W: FrameWriter + 'static,
{
    tokio::spawn(async move {
        while let Some(frame) = frame_rx.recv().await {
            if let Err(e) = writer.send(frame).await {
                log::warn!("[Agent] Write to relay failed: {e:#}");
                break;
            }
        }
        if let Err(e) = writer.close().await {
            log::debug!("[Agent] Closing control writer: {e:#}");
        }
    })
}
