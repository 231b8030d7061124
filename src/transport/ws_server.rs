//! Relay side of the control WebSocket.
//!
//! One binary WebSocket message carries exactly one encoded frame. Text
//! messages are a protocol violation and are skipped; ping/pong is answered
//! by axum itself.

use anyhow::{Context, Result};
use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};

use super::{FrameReader, FrameWriter};

/// Read half of an upgraded control connection.
#[derive(Debug)]
pub struct ServerWsReader {
    stream: SplitStream<WebSocket>,
}

/// Write half of an upgraded control connection.
#[derive(Debug)]
pub struct ServerWsWriter {
    sink: SplitSink<WebSocket, Message>,
}

/// Split an upgraded socket into frame halves.
pub fn split(socket: WebSocket) -> (ServerWsWriter, ServerWsReader) {
    let (sink, stream) = socket.split();
    (ServerWsWriter { sink }, ServerWsReader { stream })
}

#[async_trait]
impl FrameReader for ServerWsReader {
    async fn recv(&mut self) -> Option<Result<Vec<u8>>> {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Binary(data))) => return Some(Ok(data.to_vec())),
                Some(Ok(Message::Text(text))) => {
                    log::warn!(
                        "[Relay] Ignoring {}-byte text message on control connection",
                        text.len()
                    );
                }
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
                Some(Ok(Message::Close(_))) | None => return None,
                Some(Err(e)) => {
                    return Some(Err(anyhow::anyhow!("WebSocket read error: {e}")));
                }
            }
        }
    }
}

#[async_trait]
impl FrameWriter for ServerWsWriter {
    async fn send(&mut self, frame: Vec<u8>) -> Result<()> {
        self.sink
            .send(Message::Binary(frame.into()))
            .await
            .context("WebSocket send failed")
    }

    async fn close(&mut self) -> Result<()> {
        self.sink.close().await.context("WebSocket close failed")
    }
}
