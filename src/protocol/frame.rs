//! Tunnel frame codec.
//!
//! One frame = one type byte followed by its fields. Request-scoped frames
//! put the request id first. Every variable-size field carries its own
//! length, so a frame is self-delimiting and chunk payloads may contain any
//! byte sequence.
//!
//! ```text
//! [u8 tag] [u32 BE len][request id] [field] [field] ...
//! ```
//!
//! Field encodings:
//! - string / bytes: `[u32 BE len][payload]`
//! - optional value: `[u8 0|1][value if 1]`
//! - headers: `[u32 BE len][JSON array of [name, value] pairs]`
//!
//! Frame types:
//! - `0x01`: Register (agent→relay) `[opt-string identity]`
//! - `0x02`: Registered (relay→agent) `[string connection_id][opt-string identity]`
//! - `0x03`: Request (relay→agent) `[id][string method][string path][headers][bytes body]`
//! - `0x04`: Metadata (agent→relay) `[id][u16 status][headers][opt-u64 length][opt-string range]`
//! - `0x05`: Chunk (agent→relay) `[id][bytes]`
//! - `0x06`: End (agent→relay) `[id]`
//! - `0x07`: Error (agent→relay) `[id][string message]`
//! - `0x08`: Heartbeat (either way) empty
//! - `0x09`: HeartbeatAck (either way) empty

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::ids::{ConnectionId, RequestId};
use crate::error::TunnelError;

/// Frame type constants.
pub mod frame_type {
    /// Agent announces itself, optionally asking for a routing identity.
    pub const REGISTER: u8 = 0x01;
    /// Relay confirms registration with the resolved identity.
    pub const REGISTERED: u8 = 0x02;
    /// Relay forwards a public HTTP request.
    pub const REQUEST: u8 = 0x03;
    /// Agent sends the response head.
    pub const METADATA: u8 = 0x04;
    /// Agent sends a slice of the response body.
    pub const CHUNK: u8 = 0x05;
    /// Agent marks the response body complete.
    pub const END: u8 = 0x06;
    /// Agent failed the request.
    pub const ERROR: u8 = 0x07;
    /// Liveness probe.
    pub const HEARTBEAT: u8 = 0x08;
    /// Liveness probe answer.
    pub const HEARTBEAT_ACK: u8 = 0x09;
}

/// Ordered header list. Repeated names (e.g. `Set-Cookie`) are preserved.
pub type Headers = Vec<(String, String)>;

/// Response head reported by the agent. Populated once per request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseMetadata {
    /// HTTP status code from the origin.
    pub status_code: u16,
    /// Response headers from the origin.
    pub headers: Headers,
    /// Body length, when the origin declared one.
    pub content_length: Option<u64>,
    /// `Content-Range` value for partial responses, passed through verbatim.
    pub content_range: Option<String>,
}

impl ResponseMetadata {
    /// Head assumed when body bytes arrive before any `Metadata` frame.
    pub fn implicit() -> Self {
        Self {
            status_code: 200,
            headers: Vec::new(),
            content_length: None,
            content_range: None,
        }
    }
}

/// A decoded tunnel frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// First frame on every control connection.
    Register {
        /// Requested routing identity (subdomain label).
        identity: Option<String>,
    },

    /// Handshake reply.
    Registered {
        /// Id assigned to the connection.
        connection_id: ConnectionId,
        /// Identity actually granted (may carry a `-N` suffix).
        identity: Option<String>,
    },

    /// Public HTTP request to replay against the origin.
    Request {
        /// Correlation id.
        request_id: RequestId,
        /// HTTP method.
        method: String,
        /// Path and query.
        path: String,
        /// Request headers (Range included verbatim).
        headers: Headers,
        /// Request body.
        body: Bytes,
    },

    /// Response head.
    Metadata {
        /// Correlation id.
        request_id: RequestId,
        /// Status, headers and length information.
        metadata: ResponseMetadata,
    },

    /// Response body bytes.
    Chunk {
        /// Correlation id.
        request_id: RequestId,
        /// Raw body bytes.
        data: Bytes,
    },

    /// Response body complete.
    End {
        /// Correlation id.
        request_id: RequestId,
    },

    /// The agent could not serve the request.
    Error {
        /// Correlation id.
        request_id: RequestId,
        /// Human-readable reason.
        message: String,
    },

    /// Liveness probe.
    Heartbeat,

    /// Liveness probe answer.
    HeartbeatAck,
}

impl Frame {
    /// Request id for request-scoped frames, `None` for control frames.
    pub fn request_id(&self) -> Option<&RequestId> {
        match self {
            Frame::Request { request_id, .. }
            | Frame::Metadata { request_id, .. }
            | Frame::Chunk { request_id, .. }
            | Frame::End { request_id }
            | Frame::Error { request_id, .. } => Some(request_id),
            Frame::Register { .. }
            | Frame::Registered { .. }
            | Frame::Heartbeat
            | Frame::HeartbeatAck => None,
        }
    }

    /// Short name for log lines.
    pub fn kind(&self) -> &'static str {
        match self {
            Frame::Register { .. } => "Register",
            Frame::Registered { .. } => "Registered",
            Frame::Request { .. } => "Request",
            Frame::Metadata { .. } => "Metadata",
            Frame::Chunk { .. } => "Chunk",
            Frame::End { .. } => "End",
            Frame::Error { .. } => "Error",
            Frame::Heartbeat => "Heartbeat",
            Frame::HeartbeatAck => "HeartbeatAck",
        }
    }

    /// Encode this frame into its wire form.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(self.encoded_len_hint());
        match self {
            Frame::Register { identity } => {
                buf.put_u8(frame_type::REGISTER);
                put_opt_str(&mut buf, identity.as_deref());
            }
            Frame::Registered {
                connection_id,
                identity,
            } => {
                buf.put_u8(frame_type::REGISTERED);
                put_str(&mut buf, connection_id.as_str());
                put_opt_str(&mut buf, identity.as_deref());
            }
            Frame::Request {
                request_id,
                method,
                path,
                headers,
                body,
            } => {
                buf.put_u8(frame_type::REQUEST);
                put_str(&mut buf, request_id.as_str());
                put_str(&mut buf, method);
                put_str(&mut buf, path);
                put_headers(&mut buf, headers);
                put_bytes(&mut buf, body);
            }
            Frame::Metadata {
                request_id,
                metadata,
            } => {
                buf.put_u8(frame_type::METADATA);
                put_str(&mut buf, request_id.as_str());
                buf.put_u16(metadata.status_code);
                put_headers(&mut buf, &metadata.headers);
                match metadata.content_length {
                    Some(len) => {
                        buf.put_u8(1);
                        buf.put_u64(len);
                    }
                    None => buf.put_u8(0),
                }
                put_opt_str(&mut buf, metadata.content_range.as_deref());
            }
            Frame::Chunk { request_id, data } => {
                buf.put_u8(frame_type::CHUNK);
                put_str(&mut buf, request_id.as_str());
                put_bytes(&mut buf, data);
            }
            Frame::End { request_id } => {
                buf.put_u8(frame_type::END);
                put_str(&mut buf, request_id.as_str());
            }
            Frame::Error {
                request_id,
                message,
            } => {
                buf.put_u8(frame_type::ERROR);
                put_str(&mut buf, request_id.as_str());
                put_str(&mut buf, message);
            }
            Frame::Heartbeat => buf.put_u8(frame_type::HEARTBEAT),
            Frame::HeartbeatAck => buf.put_u8(frame_type::HEARTBEAT_ACK),
        }
        buf.to_vec()
    }

    /// Decode one complete frame.
    ///
    /// # Errors
    ///
    /// Returns [`TunnelError::MalformedFrame`] on an empty buffer, an unknown
    /// type tag, a truncated length prefix, a declared length running past
    /// the buffer, invalid UTF-8 in a string field, or trailing bytes.
    pub fn decode(buf: &[u8]) -> Result<Frame, TunnelError> {
        let mut reader = FieldReader { buf };
        let tag = reader.u8("type tag")?;

        let frame = match tag {
            frame_type::REGISTER => Frame::Register {
                identity: reader.opt_string("identity")?,
            },
            frame_type::REGISTERED => Frame::Registered {
                connection_id: ConnectionId::new(reader.string("connection id")?),
                identity: reader.opt_string("identity")?,
            },
            frame_type::REQUEST => Frame::Request {
                request_id: reader.request_id()?,
                method: reader.string("method")?,
                path: reader.string("path")?,
                headers: reader.headers()?,
                body: reader.bytes("body")?,
            },
            frame_type::METADATA => {
                let request_id = reader.request_id()?;
                let status_code = reader.u16("status code")?;
                let headers = reader.headers()?;
                let content_length = if reader.flag("content length flag")? {
                    Some(reader.u64("content length")?)
                } else {
                    None
                };
                let content_range = reader.opt_string("content range")?;
                Frame::Metadata {
                    request_id,
                    metadata: ResponseMetadata {
                        status_code,
                        headers,
                        content_length,
                        content_range,
                    },
                }
            }
            frame_type::CHUNK => Frame::Chunk {
                request_id: reader.request_id()?,
                data: reader.bytes("chunk")?,
            },
            frame_type::END => Frame::End {
                request_id: reader.request_id()?,
            },
            frame_type::ERROR => Frame::Error {
                request_id: reader.request_id()?,
                message: reader.string("message")?,
            },
            frame_type::HEARTBEAT => Frame::Heartbeat,
            frame_type::HEARTBEAT_ACK => Frame::HeartbeatAck,
            other => return Err(malformed(format!("unknown frame type 0x{other:02x}"))),
        };

        if !reader.buf.is_empty() {
            return Err(malformed(format!(
                "{} trailing bytes after {} frame",
                reader.buf.len(),
                frame.kind()
            )));
        }
        Ok(frame)
    }

    fn encoded_len_hint(&self) -> usize {
        match self {
            Frame::Request { body, .. } => 256 + body.len(),
            Frame::Chunk { data, .. } => 64 + data.len(),
            _ => 128,
        }
    }
}

fn malformed(reason: impl Into<String>) -> TunnelError {
    TunnelError::MalformedFrame(reason.into())
}

fn put_bytes(buf: &mut BytesMut, data: &[u8]) {
    buf.put_u32(data.len() as u32);
    buf.put_slice(data);
}

fn put_str(buf: &mut BytesMut, s: &str) {
    put_bytes(buf, s.as_bytes());
}

fn put_opt_str(buf: &mut BytesMut, s: Option<&str>) {
    match s {
        Some(s) => {
            buf.put_u8(1);
            put_str(buf, s);
        }
        None => buf.put_u8(0),
    }
}

fn put_headers(buf: &mut BytesMut, headers: &Headers) {
    // String pairs always serialize.
    let json = serde_json::to_vec(headers).unwrap_or_else(|_| b"[]".to_vec());
    put_bytes(buf, &json);
}

/// Bounds-checked field reader over a frame buffer.
struct FieldReader<'a> {
    buf: &'a [u8],
}

impl FieldReader<'_> {
    fn need(&self, n: usize, field: &str) -> Result<(), TunnelError> {
        if self.buf.len() < n {
            return Err(malformed(format!(
                "truncated {field}: need {n} bytes, have {}",
                self.buf.len()
            )));
        }
        Ok(())
    }

    fn u8(&mut self, field: &str) -> Result<u8, TunnelError> {
        self.need(1, field)?;
        Ok(self.buf.get_u8())
    }

    fn u16(&mut self, field: &str) -> Result<u16, TunnelError> {
        self.need(2, field)?;
        Ok(self.buf.get_u16())
    }

    fn u64(&mut self, field: &str) -> Result<u64, TunnelError> {
        self.need(8, field)?;
        Ok(self.buf.get_u64())
    }

    fn flag(&mut self, field: &str) -> Result<bool, TunnelError> {
        match self.u8(field)? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(malformed(format!("invalid {field}: {other}"))),
        }
    }

    fn slice(&mut self, field: &str) -> Result<&[u8], TunnelError> {
        self.need(4, field)?;
        let len = self.buf.get_u32() as usize;
        if len > self.buf.len() {
            return Err(malformed(format!(
                "{field} declares {len} bytes but only {} remain",
                self.buf.len()
            )));
        }
        let (head, tail) = self.buf.split_at(len);
        self.buf = tail;
        Ok(head)
    }

    fn bytes(&mut self, field: &str) -> Result<Bytes, TunnelError> {
        self.slice(field).map(Bytes::copy_from_slice)
    }

    fn string(&mut self, field: &str) -> Result<String, TunnelError> {
        let raw = self.slice(field)?;
        String::from_utf8(raw.to_vec()).map_err(|e| malformed(format!("{field} is not UTF-8: {e}")))
    }

    fn opt_string(&mut self, field: &str) -> Result<Option<String>, TunnelError> {
        if self.flag(field)? {
            self.string(field).map(Some)
        } else {
            Ok(None)
        }
    }

    fn request_id(&mut self) -> Result<RequestId, TunnelError> {
        let id = self.string("request id")?;
        if id.is_empty() {
            return Err(malformed("empty request id"));
        }
        Ok(RequestId::new(id))
    }

    fn headers(&mut self) -> Result<Headers, TunnelError> {
        let raw = self.slice("headers")?;
        serde_json::from_slice(raw).map_err(|e| malformed(format!("invalid header list: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rid(id: &str) -> RequestId {
        RequestId::new(id)
    }

    #[test]
    fn test_request_round_trip_keeps_header_order() {
        let frame = Frame::Request {
            request_id: rid("r1"),
            method: "GET".to_string(),
            path: "/video.mp4?x=1".to_string(),
            headers: vec![
                ("range".to_string(), "bytes=100-199".to_string()),
                ("cookie".to_string(), "a=1".to_string()),
                ("cookie".to_string(), "b=2".to_string()),
            ],
            body: Bytes::new(),
        };
        assert_eq!(Frame::decode(&frame.encode()).unwrap(), frame);
    }

    #[test]
    fn test_metadata_round_trip_with_range() {
        let frame = Frame::Metadata {
            request_id: rid("r2"),
            metadata: ResponseMetadata {
                status_code: 206,
                headers: vec![("content-type".to_string(), "video/mp4".to_string())],
                content_length: Some(100),
                content_range: Some("bytes 100-199/1000".to_string()),
            },
        };
        assert_eq!(Frame::decode(&frame.encode()).unwrap(), frame);
    }

    #[test]
    fn test_chunk_may_contain_end_marker_bytes() {
        // A literal end marker inside binary data must not terminate anything.
        let data = Bytes::from_static(b"abc__END__\x00\xff__END__");
        let frame = Frame::Chunk {
            request_id: rid("r3"),
            data: data.clone(),
        };
        match Frame::decode(&frame.encode()).unwrap() {
            Frame::Chunk { data: decoded, .. } => assert_eq!(decoded, data),
            other => panic!("Expected Chunk, got {other:?}"),
        }
    }

    #[test]
    fn test_control_frames_have_no_request_id() {
        assert!(Frame::Heartbeat.request_id().is_none());
        assert!(Frame::Register { identity: None }.request_id().is_none());
        assert_eq!(Frame::Heartbeat.encode(), vec![frame_type::HEARTBEAT]);
        assert_eq!(Frame::decode(&[frame_type::HEARTBEAT_ACK]).unwrap(), Frame::HeartbeatAck);
    }

    #[test]
    fn test_request_id_is_big_endian_length_prefixed() {
        let encoded = Frame::End { request_id: rid("abc") }.encode();
        assert_eq!(encoded, vec![frame_type::END, 0, 0, 0, 3, b'a', b'b', b'c']);
    }

    #[test]
    fn test_empty_buffer_rejected() {
        assert!(matches!(Frame::decode(&[]), Err(TunnelError::MalformedFrame(_))));
    }

    #[test]
    fn test_unknown_type_rejected() {
        let err = Frame::decode(&[0xEE]).unwrap_err();
        assert!(matches!(err, TunnelError::MalformedFrame(ref m) if m.contains("0xee")));
    }

    #[test]
    fn test_truncated_length_prefix_rejected() {
        let buf = [frame_type::CHUNK, 0, 0];
        assert!(matches!(Frame::decode(&buf), Err(TunnelError::MalformedFrame(_))));
    }

    #[test]
    fn test_declared_length_past_buffer_rejected() {
        let mut buf = vec![frame_type::END, 0, 0, 0, 10];
        buf.extend_from_slice(b"abc");
        let err = Frame::decode(&buf).unwrap_err();
        assert!(matches!(err, TunnelError::MalformedFrame(ref m) if m.contains("declares 10")));
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let mut buf = Frame::HeartbeatAck.encode();
        buf.push(0);
        assert!(matches!(Frame::decode(&buf), Err(TunnelError::MalformedFrame(_))));
    }

    #[test]
    fn test_truncated_metadata_rejected() {
        let frame = Frame::Metadata {
            request_id: rid("r4"),
            metadata: ResponseMetadata::implicit(),
        };
        let encoded = frame.encode();
        for cut in 1..encoded.len() {
            assert!(
                Frame::decode(&encoded[..cut]).is_err(),
                "prefix of {cut} bytes should not decode"
            );
        }
    }

    #[test]
    fn test_invalid_utf8_rejected() {
        let buf = [frame_type::END, 0, 0, 0, 2, 0xC3, 0x28];
        assert!(matches!(Frame::decode(&buf), Err(TunnelError::MalformedFrame(_))));
    }

    #[test]
    fn test_empty_request_id_rejected() {
        let buf = [frame_type::END, 0, 0, 0, 0];
        assert!(Frame::decode(&buf).is_err());
    }
}
