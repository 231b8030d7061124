//! Length-prefixed frames over a byte stream.

use std::collections::VecDeque;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};

use super::{FrameReader, FrameWriter};
use crate::protocol::{length_prefixed, FrameDecoder};

/// Read half: reassembles frames from arbitrary read boundaries.
#[derive(Debug)]
pub struct StreamFrameReader<R> {
    reader: R,
    decoder: FrameDecoder,
    ready: VecDeque<Vec<u8>>,
    read_buf: Vec<u8>,
}

/// Write half: prefixes every frame with its length.
#[derive(Debug)]
pub struct StreamFrameWriter<W> {
    writer: W,
}

/// Split a duplex byte stream into frame halves.
pub fn split<S>(
    stream: S,
    max_frame_size: usize,
) -> (StreamFrameWriter<WriteHalf<S>>, StreamFrameReader<ReadHalf<S>>)
where
    S: AsyncRead + AsyncWrite + Send,
{
    let (read_half, write_half) = tokio::io::split(stream);
    (
        StreamFrameWriter::new(write_half),
        StreamFrameReader::new(read_half, max_frame_size),
    )
}

impl<R> StreamFrameReader<R> {
    /// Wrap a reader.
    pub fn new(reader: R, max_frame_size: usize) -> Self {
        Self {
            reader,
            decoder: FrameDecoder::new(max_frame_size),
            ready: VecDeque::new(),
            read_buf: vec![0u8; 64 * 1024], // 64KB read buffer
        }
    }
}

impl<W> StreamFrameWriter<W> {
    /// Wrap a writer.
    pub fn new(writer: W) -> Self {
        Self { writer }
    }
}

#[async_trait]
impl<R> FrameReader for StreamFrameReader<R>
where
    R: AsyncRead + Unpin + Send,
{
    async fn recv(&mut self) -> Option<Result<Vec<u8>>> {
        loop {
            if let Some(frame) = self.ready.pop_front() {
                return Some(Ok(frame));
            }

            match self.reader.read(&mut self.read_buf).await {
                Ok(0) => {
                    if self.decoder.has_partial() {
                        return Some(Err(anyhow::anyhow!("stream closed mid-frame")));
                    }
                    return None;
                }
                Ok(n) => match self.decoder.feed(&self.read_buf[..n]) {
                    Ok(frames) => self.ready.extend(frames),
                    Err(e) => return Some(Err(e)),
                },
                Err(e) => return Some(Err(anyhow::Error::new(e).context("stream read failed"))),
            }
        }
    }
}

#[async_trait]
impl<W> FrameWriter for StreamFrameWriter<W>
where
    W: AsyncWrite + Unpin + Send,
{
    async fn send(&mut self, frame: Vec<u8>) -> Result<()> {
        self.writer
            .write_all(&length_prefixed(&frame))
            .await
            .context("stream write failed")
    }

    async fn close(&mut self) -> Result<()> {
        self.writer.shutdown().await.context("stream shutdown failed")
    }
}
