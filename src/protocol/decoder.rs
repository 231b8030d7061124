//! Outer framing for byte-stream transports.
//!
//! Message-oriented transports (WebSocket) carry one encoded [`Frame`] per
//! message. Byte streams (TCP, pipes) need an outer length prefix so frames
//! can be cut back out of the stream:
//!
//! ```text
//! [u32 BE length] [encoded frame: length bytes]
//! ```
//!
//! [`FrameDecoder`] only reassembles; decoding the frame itself is left to
//! [`Frame::decode`] so a malformed frame never desynchronizes the stream.
//!
//! [`Frame`]: super::Frame
//! [`Frame::decode`]: super::Frame::decode

use anyhow::{bail, Result};
use bytes::{Buf, BytesMut};

/// Wrap an encoded frame with its outer length prefix.
pub fn length_prefixed(frame: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(4 + frame.len());
    buf.extend_from_slice(&(frame.len() as u32).to_be_bytes());
    buf.extend_from_slice(frame);
    buf
}

/// Incremental reassembler that handles partial reads.
///
/// Feed bytes via [`FrameDecoder::feed`] and collect complete encoded frames.
#[derive(Debug)]
pub struct FrameDecoder {
    buf: BytesMut,
    max_frame_size: usize,
}

impl FrameDecoder {
    /// Create a decoder that rejects frames larger than `max_frame_size`.
    pub fn new(max_frame_size: usize) -> Self {
        Self {
            buf: BytesMut::new(),
            max_frame_size,
        }
    }

    /// Feed bytes into the decoder and extract all complete frames.
    ///
    /// Incomplete data is buffered for the next call.
    ///
    /// # Errors
    ///
    /// Returns an error on a zero-length or oversized frame. Either means the
    /// stream can no longer be trusted and the connection should be dropped.
    pub fn feed(&mut self, bytes: &[u8]) -> Result<Vec<Vec<u8>>> {
        self.buf.extend_from_slice(bytes);
        let mut frames = Vec::new();

        loop {
            if self.buf.len() < 4 {
                break;
            }

            let length = u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]])
                as usize;

            if length == 0 {
                bail!("Invalid frame: zero length");
            }
            if length > self.max_frame_size {
                bail!("Frame too large: {length} bytes (max {})", self.max_frame_size);
            }

            if self.buf.len() < 4 + length {
                break; // Incomplete frame, wait for more data
            }

            self.buf.advance(4);
            frames.push(self.buf.split_to(length).to_vec());
        }

        Ok(frames)
    }

    /// Returns true if the decoder has buffered partial data.
    pub fn has_partial(&self) -> bool {
        !self.buf.is_empty()
    }
}
