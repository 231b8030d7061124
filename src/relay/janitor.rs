//! Periodic sweep of idle pending requests.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::pending::PendingRequestTable;

/// Expires requests whose agent went quiet without closing the connection.
#[derive(Debug, Clone)]
pub struct Janitor {
    pending: Arc<PendingRequestTable>,
    period: Duration,
    threshold: Duration,
}

impl Janitor {
    /// Sweep `pending` every `period`, expiring entries idle for `threshold`.
    pub fn new(pending: Arc<PendingRequestTable>, period: Duration, threshold: Duration) -> Self {
        Self {
            pending,
            period,
            threshold,
        }
    }

    /// One sweep. Returns how many requests were expired.
    pub fn sweep(&self) -> usize {
        let expired = self.pending.expire_idle(self.threshold);
        if expired > 0 {
            log::info!(
                "[Janitor] Expired {expired} request(s) idle for {:?}",
                self.threshold
            );
        }
        expired
    }

    /// Run until `shutdown` fires.
    pub async fn run(self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    self.sweep();
                }
            }
        }
        log::debug!("[Janitor] Stopped");
    }
}
