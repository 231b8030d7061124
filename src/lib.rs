//! Burrow - multiplexed reverse HTTP tunnel.
//!
//! A public relay exposes an HTTP origin that sits behind NAT. The agent next
//! to the origin dials out once; every public request is then tunneled over
//! that single control connection, many at a time, and the origin's response
//! streams back to the caller (byte ranges included).
//!
//! # Architecture
//!
//! ```text
//! caller ──HTTP──> http::router ──> Relay ──frames──> agent ──HTTP──> origin
//!                     │               │
//!                     │               ├── ConnectionRegistry (who is connected)
//!                     │               ├── PendingRequestTable (what is in flight)
//!                     │               ├── LivenessMonitor / Janitor
//!                     └── StreamAssembler <── per-request queue
//! ```
//!
//! # Modules
//!
//! - [`protocol`] - Wire frames and stream reassembly
//! - [`relay`] - The tunnel engine (registry, pending table, multiplexer, assembler, liveness)
//! - [`transport`] - Frame transports (WebSocket, length-prefixed byte streams)
//! - [`http`] - Public HTTP surface and control upgrade route
//! - [`agent`] - Agent side: dials the relay and forwards to the local origin
//! - [`config`] - Configuration loading

pub mod agent;
pub mod config;
pub mod constants;
pub mod error;
pub mod http;
pub mod protocol;
pub mod relay;
pub mod server;
pub mod transport;
pub mod ws;

pub use agent::Agent;
pub use config::{AgentConfig, RelayConfig};
pub use error::TunnelError;
pub use protocol::{ConnectionId, Frame, RequestId, ResponseMetadata};
pub use relay::Relay;
