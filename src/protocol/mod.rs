//! Tunnel wire protocol.
//!
//! - [`frame`] - The tagged, length-prefixed frame codec
//! - [`decoder`] - Outer length prefix + reassembly for byte-stream transports
//! - [`ids`] - Request and connection identifiers

pub mod decoder;
pub mod frame;
pub mod ids;

pub use decoder::{length_prefixed, FrameDecoder};
pub use frame::{frame_type, Frame, Headers, ResponseMetadata};
pub use ids::{ConnectionId, RequestId};
