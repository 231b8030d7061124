//! Default values for relay and agent configuration.
//!
//! Every knob in [`crate::config`] falls back to one of these. Grouped by
//! the component that consumes them.

use std::time::Duration;

// ============================================================================
// Relay surface
// ============================================================================

/// Default public listen address. Hosting platforms usually override the
/// port through `PORT`.
pub const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:10000";

/// Path agents upgrade to a WebSocket on.
pub const DEFAULT_CONTROL_PATH: &str = "/_burrow/connect";

/// Largest inbound request body the relay buffers into a `Request` frame.
pub const DEFAULT_MAX_REQUEST_BODY: usize = 8 * 1024 * 1024;

// ============================================================================
// Framing
// ============================================================================

/// Maximum encoded frame size (16 MB).
pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Chunk size the agent slices origin bodies into (64 KB).
pub const CHUNK_SIZE: usize = 64 * 1024;

/// Outbound frames buffered per connection before dispatchers wait on the writer.
pub const WRITE_QUEUE_BOUND: usize = 256;

/// Per-request queue capacity. A slow HTTP consumer throttles the agent
/// once this many frames are waiting.
pub const DEFAULT_QUEUE_CAPACITY: usize = 32;

// ============================================================================
// Timeouts
// ============================================================================

/// How long a dispatched request may wait for its `Metadata` frame.
pub const DEFAULT_METADATA_TIMEOUT_SECS: u64 = 30;

/// How long a streaming response may wait for its next chunk.
pub const DEFAULT_CHUNK_TIMEOUT_SECS: u64 = 30;

/// How long a freshly accepted control connection has to send `Register`.
pub const DEFAULT_HANDSHAKE_TIMEOUT_SECS: u64 = 10;

// ============================================================================
// Liveness & cleanup
// ============================================================================

/// Heartbeat interval on every control connection.
pub const DEFAULT_HEARTBEAT_INTERVAL_SECS: u64 = 15;

/// A connection is dead after this many silent heartbeat intervals.
pub const DEFAULT_HEARTBEAT_MULTIPLIER: u32 = 3;

/// Smallest multiplier that still tolerates one missed beat.
pub const MIN_HEARTBEAT_MULTIPLIER: u32 = 2;

/// Janitor sweep period.
pub const DEFAULT_JANITOR_PERIOD_SECS: u64 = 30;

/// Pending requests idle longer than this are expired by the Janitor.
pub const DEFAULT_REQUEST_EXPIRY_SECS: u64 = 120;

// ============================================================================
// Agent
// ============================================================================

/// Relay URL the agent dials when nothing else is configured.
pub const DEFAULT_SERVER_URL: &str = "ws://127.0.0.1:10000";

/// Local origin the agent forwards to.
pub const DEFAULT_ORIGIN_URL: &str = "http://127.0.0.1:5000";

/// First reconnect delay after the control connection drops.
pub const RECONNECT_DELAY_INITIAL: Duration = Duration::from_millis(500);

/// Reconnect backoff ceiling.
pub const RECONNECT_DELAY_MAX: Duration = Duration::from_secs(30);

/// Timeout for a single request to the local origin (headers only; the body
/// streams for as long as the origin keeps producing).
pub const DEFAULT_ORIGIN_TIMEOUT_SECS: u64 = 30;
