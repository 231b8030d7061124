//! Configuration loading.
//!
//! Both the relay and the agent read an optional JSON file, then apply
//! `BURROW_*` environment overrides, then CLI flags (applied in `main`).
//! Missing keys fall back to [`crate::constants`].

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use std::fs;

use crate::constants::{
    DEFAULT_CHUNK_TIMEOUT_SECS, DEFAULT_CONTROL_PATH, DEFAULT_HANDSHAKE_TIMEOUT_SECS,
    DEFAULT_HEARTBEAT_INTERVAL_SECS, DEFAULT_HEARTBEAT_MULTIPLIER, DEFAULT_JANITOR_PERIOD_SECS,
    DEFAULT_LISTEN_ADDR, DEFAULT_MAX_FRAME_SIZE, DEFAULT_MAX_REQUEST_BODY,
    DEFAULT_METADATA_TIMEOUT_SECS, DEFAULT_ORIGIN_TIMEOUT_SECS, DEFAULT_ORIGIN_URL,
    DEFAULT_QUEUE_CAPACITY, DEFAULT_REQUEST_EXPIRY_SECS, DEFAULT_SERVER_URL,
    MIN_HEARTBEAT_MULTIPLIER,
};

/// Relay (public side) configuration.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct RelayConfig {
    /// Public HTTP listen address.
    pub listen_addr: String,
    /// Path agents upgrade to a WebSocket on.
    pub control_path: String,
    /// Optional raw TCP listener for agents (length-prefixed frames).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tcp_control_addr: Option<String>,
    /// Route requests by the Host header's identity label. When off, every
    /// request goes to the most recently registered agent.
    pub routing_by_identity: bool,
    /// Domain the identity label is stripped from (`demo.<base_domain>`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_domain: Option<String>,
    /// Seconds a request waits for its `Metadata` frame.
    pub metadata_timeout_secs: u64,
    /// Seconds a streaming response waits for its next chunk.
    pub chunk_timeout_secs: u64,
    /// Seconds a new control connection has to send `Register`.
    pub handshake_timeout_secs: u64,
    /// Heartbeat interval in seconds.
    pub heartbeat_interval_secs: u64,
    /// Silent intervals tolerated before a connection is declared dead.
    pub heartbeat_multiplier: u32,
    /// Janitor sweep period in seconds.
    pub janitor_period_secs: u64,
    /// Idle seconds after which the Janitor expires a pending request.
    pub request_expiry_secs: u64,
    /// Frames buffered per pending request before the agent is throttled.
    pub queue_capacity: usize,
    /// Maximum encoded frame size in bytes.
    pub max_frame_size: usize,
    /// Maximum public request body in bytes.
    pub max_request_body: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen_addr: DEFAULT_LISTEN_ADDR.to_string(),
            control_path: DEFAULT_CONTROL_PATH.to_string(),
            tcp_control_addr: None,
            routing_by_identity: true,
            base_domain: None,
            metadata_timeout_secs: DEFAULT_METADATA_TIMEOUT_SECS,
            chunk_timeout_secs: DEFAULT_CHUNK_TIMEOUT_SECS,
            handshake_timeout_secs: DEFAULT_HANDSHAKE_TIMEOUT_SECS,
            heartbeat_interval_secs: DEFAULT_HEARTBEAT_INTERVAL_SECS,
            heartbeat_multiplier: DEFAULT_HEARTBEAT_MULTIPLIER,
            janitor_period_secs: DEFAULT_JANITOR_PERIOD_SECS,
            request_expiry_secs: DEFAULT_REQUEST_EXPIRY_SECS,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            max_request_body: DEFAULT_MAX_REQUEST_BODY,
        }
    }
}

impl RelayConfig {
    /// Loads configuration from `path` (or `<config_dir>/relay.json` when it
    /// exists), applies environment overrides, and validates the result.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config: Self = load_json(path, "relay.json")?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Apply `BURROW_*` environment variables (and `PORT`).
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| std::env::var(key).ok());
    }

    /// Apply overrides from an arbitrary key lookup.
    pub fn apply_overrides_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(port) = lookup("PORT") {
            if let Ok(port) = port.parse::<u16>() {
                self.listen_addr = format!("0.0.0.0:{port}");
            }
        }

        if let Some(addr) = lookup("BURROW_LISTEN_ADDR") {
            self.listen_addr = addr;
        }

        if let Some(path) = lookup("BURROW_CONTROL_PATH") {
            self.control_path = path;
        }

        if let Some(addr) = lookup("BURROW_TCP_CONTROL_ADDR") {
            self.tcp_control_addr = Some(addr).filter(|a| !a.is_empty());
        }

        if let Some(domain) = lookup("BURROW_BASE_DOMAIN") {
            self.base_domain = Some(domain).filter(|d| !d.is_empty());
        }

        if let Some(flag) = lookup("BURROW_ROUTING_BY_IDENTITY") {
            if let Some(on) = parse_bool(&flag) {
                self.routing_by_identity = on;
            }
        }

        override_parsed(&lookup, "BURROW_METADATA_TIMEOUT", &mut self.metadata_timeout_secs);
        override_parsed(&lookup, "BURROW_CHUNK_TIMEOUT", &mut self.chunk_timeout_secs);
        override_parsed(&lookup, "BURROW_HEARTBEAT_INTERVAL", &mut self.heartbeat_interval_secs);
        override_parsed(&lookup, "BURROW_HEARTBEAT_MULTIPLIER", &mut self.heartbeat_multiplier);
        override_parsed(&lookup, "BURROW_REQUEST_EXPIRY", &mut self.request_expiry_secs);
        override_parsed(&lookup, "BURROW_QUEUE_CAPACITY", &mut self.queue_capacity);
    }

    /// Reject configurations the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if !self.control_path.starts_with('/') {
            bail!("control_path must start with '/': {}", self.control_path);
        }
        if self.heartbeat_multiplier < MIN_HEARTBEAT_MULTIPLIER {
            bail!(
                "heartbeat_multiplier must be at least {MIN_HEARTBEAT_MULTIPLIER} (got {})",
                self.heartbeat_multiplier
            );
        }
        for (name, value) in [
            ("metadata_timeout_secs", self.metadata_timeout_secs),
            ("chunk_timeout_secs", self.chunk_timeout_secs),
            ("handshake_timeout_secs", self.handshake_timeout_secs),
            ("heartbeat_interval_secs", self.heartbeat_interval_secs),
            ("janitor_period_secs", self.janitor_period_secs),
            ("request_expiry_secs", self.request_expiry_secs),
        ] {
            if value == 0 {
                bail!("{name} must be greater than zero");
            }
        }
        if self.queue_capacity == 0 {
            bail!("queue_capacity must be greater than zero");
        }
        // A full request queue parks the connection's read loop for up to
        // chunk_timeout; the agent must not look dead meanwhile.
        if self.chunk_timeout() >= self.liveness_timeout() {
            bail!(
                "chunk_timeout_secs ({}) must be shorter than heartbeat_interval_secs x heartbeat_multiplier ({:?})",
                self.chunk_timeout_secs,
                self.liveness_timeout()
            );
        }
        if self.max_request_body >= self.max_frame_size {
            bail!(
                "max_request_body ({}) must be smaller than max_frame_size ({})",
                self.max_request_body,
                self.max_frame_size
            );
        }
        Ok(())
    }

    /// Metadata wait as a `Duration`.
    pub fn metadata_timeout(&self) -> Duration {
        Duration::from_secs(self.metadata_timeout_secs)
    }

    /// Per-chunk wait as a `Duration`.
    pub fn chunk_timeout(&self) -> Duration {
        Duration::from_secs(self.chunk_timeout_secs)
    }

    /// Handshake wait as a `Duration`.
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    /// Heartbeat interval as a `Duration`.
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    /// Silence after which a connection is dead: `multiplier × interval`.
    pub fn liveness_timeout(&self) -> Duration {
        self.heartbeat_interval() * self.heartbeat_multiplier
    }

    /// Janitor period as a `Duration`.
    pub fn janitor_period(&self) -> Duration {
        Duration::from_secs(self.janitor_period_secs)
    }

    /// Idle threshold for the Janitor as a `Duration`.
    pub fn request_expiry(&self) -> Duration {
        Duration::from_secs(self.request_expiry_secs)
    }
}

/// Agent (origin side) configuration.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct AgentConfig {
    /// Relay base URL (`https://`, `wss://`, ...).
    pub server_url: String,
    /// Control path on the relay.
    pub control_path: String,
    /// Requested routing identity.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identity: Option<String>,
    /// Local origin every request is replayed against.
    pub origin_url: String,
    /// Seconds to wait for the origin's response head.
    pub origin_timeout_secs: u64,
    /// Seconds of relay silence after which the agent reconnects.
    pub idle_timeout_secs: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            server_url: DEFAULT_SERVER_URL.to_string(),
            control_path: DEFAULT_CONTROL_PATH.to_string(),
            identity: None,
            origin_url: DEFAULT_ORIGIN_URL.to_string(),
            origin_timeout_secs: DEFAULT_ORIGIN_TIMEOUT_SECS,
            idle_timeout_secs: DEFAULT_HEARTBEAT_INTERVAL_SECS
                * u64::from(DEFAULT_HEARTBEAT_MULTIPLIER),
        }
    }
}

impl AgentConfig {
    /// Loads configuration from `path` (or `<config_dir>/agent.json` when it
    /// exists), applies environment overrides, and validates the result.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config: Self = load_json(path, "agent.json")?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Apply `BURROW_*` environment variables.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| std::env::var(key).ok());
    }

    /// Apply overrides from an arbitrary key lookup.
    pub fn apply_overrides_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup("BURROW_SERVER_URL") {
            self.server_url = url;
        }

        if let Some(path) = lookup("BURROW_CONTROL_PATH") {
            self.control_path = path;
        }

        if let Some(identity) = lookup("BURROW_IDENTITY") {
            self.identity = Some(identity).filter(|i| !i.is_empty());
        }

        if let Some(origin) = lookup("BURROW_ORIGIN_URL") {
            self.origin_url = origin;
        }

        override_parsed(&lookup, "BURROW_ORIGIN_TIMEOUT", &mut self.origin_timeout_secs);
        override_parsed(&lookup, "BURROW_IDLE_TIMEOUT", &mut self.idle_timeout_secs);
    }

    /// Reject configurations the agent cannot run with.
    pub fn validate(&self) -> Result<()> {
        if !self.origin_url.starts_with("http://") && !self.origin_url.starts_with("https://") {
            bail!("origin_url must be an http(s) URL: {}", self.origin_url);
        }
        if self.origin_timeout_secs == 0 || self.idle_timeout_secs == 0 {
            bail!("origin_timeout_secs and idle_timeout_secs must be greater than zero");
        }
        Ok(())
    }

    /// Origin response-head wait as a `Duration`.
    pub fn origin_timeout(&self) -> Duration {
        Duration::from_secs(self.origin_timeout_secs)
    }

    /// Relay silence tolerated before reconnecting.
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

/// Platform config directory for burrow (`~/.config/burrow` on Linux).
///
/// `BURROW_CONFIG_DIR` overrides the location.
pub fn config_dir() -> Option<PathBuf> {
    if let Ok(dir) = std::env::var("BURROW_CONFIG_DIR") {
        return Some(PathBuf::from(dir));
    }
    dirs::config_dir().map(|d| d.join("burrow"))
}

/// Read `path`, or the default file under [`config_dir`] if present, or
/// fall back to defaults.
fn load_json<T>(path: Option<&Path>, default_file: &str) -> Result<T>
where
    T: Default + for<'de> Deserialize<'de>,
{
    let path = match path {
        Some(p) => p.to_path_buf(),
        None => match config_dir().map(|d| d.join(default_file)) {
            Some(p) if p.exists() => p,
            _ => return Ok(T::default()),
        },
    };

    let content = fs::read_to_string(&path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("Invalid config file {}", path.display()))
}

fn override_parsed<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    target: &mut T,
) {
    if let Some(raw) = lookup(key) {
        match raw.parse::<T>() {
            Ok(value) => *target = value,
            Err(_) => log::warn!("Ignoring invalid {key}={raw}"),
        }
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
