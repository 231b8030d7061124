//! Heartbeats and dead-connection detection.

use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::Relay;
use crate::protocol::Frame;

/// Sends a `Heartbeat` to every connection each interval and closes
/// connections that have been silent for `multiplier × interval`.
#[derive(Debug, Clone)]
pub struct LivenessMonitor {
    relay: Relay,
    interval: Duration,
    timeout: Duration,
}

impl LivenessMonitor {
    /// Monitor for `relay` using its configured interval and multiplier.
    pub fn new(relay: Relay) -> Self {
        let interval = relay.config().heartbeat_interval();
        let timeout = relay.config().liveness_timeout();
        Self {
            relay,
            interval,
            timeout,
        }
    }

    /// One monitor cycle. Returns how many connections were closed.
    pub fn check(&self) -> usize {
        let mut closed = 0;
        for conn in self.relay.registry().snapshot() {
            let idle = conn.idle_for();
            if idle >= self.timeout {
                log::warn!(
                    "[Liveness] {} silent for {:?} (limit {:?}), closing",
                    conn.id(),
                    idle,
                    self.timeout
                );
                if self.relay.close_connection(conn.id(), "heartbeat timeout") {
                    closed += 1;
                }
            } else if !conn.try_send(&Frame::Heartbeat) {
                log::debug!("[Liveness] Writer queue full for {}, skipping beat", conn.id());
            }
        }
        closed
    }

    /// Run until `shutdown` fires.
    pub async fn run(self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;

        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    self.check();
                }
            }
        }
        log::debug!("[Liveness] Stopped");
    }
}
