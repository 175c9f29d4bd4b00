//! Process lifecycle: warm-up, readiness, graceful drain.

use std::time::{Duration, Instant};

use tokio::sync::watch;

use crate::error::Result;
use crate::pool::Pool;

/// Lifecycle states. `Ready` is the only state in which the gateway
/// serves queries; everything else fails fast with `Unavailable`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Starting,
    Warming,
    Ready,
    Draining,
    Stopped,
}

/// Owns the lifecycle state machine and the pool it gates.
pub struct Supervisor {
    pool: Pool,
    drain_grace: Duration,
    state_tx: watch::Sender<Lifecycle>,
}

impl Supervisor {
    pub fn new(pool: Pool, drain_grace: Duration) -> Self {
        let (state_tx, _) = watch::channel(Lifecycle::Starting);
        Self {
            pool,
            drain_grace,
            state_tx,
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> Lifecycle {
        *self.state_tx.borrow()
    }

    /// Subscribe to lifecycle transitions.
    pub fn subscribe(&self) -> watch::Receiver<Lifecycle> {
        self.state_tx.subscribe()
    }

    /// Warm the pool and transition to Ready. Fails (leaving the process
    /// to exit non-zero) when fewer than `min_warm` connections open.
    pub async fn start(&self, min_warm: usize) -> Result<()> {
        self.transition(Lifecycle::Warming);
        let opened = self.pool.warm(min_warm).await?;
        tracing::info!(
            opened,
            capacity = self.pool.capacity(),
            "backend pool warmed"
        );
        self.transition(Lifecycle::Ready);
        Ok(())
    }

    /// Drain and stop: new requests are already being refused once the
    /// state leaves Ready; in-flight leases get until the grace deadline,
    /// then idle connections are closed. Remaining leases at that point
    /// belong to requests that will fail on their broken connections.
    pub async fn shutdown(&self) {
        self.transition(Lifecycle::Draining);

        let grace_deadline = Instant::now() + self.drain_grace;
        while self.pool.in_flight() > 0 && Instant::now() < grace_deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        let remaining = self.pool.in_flight();
        if remaining > 0 {
            tracing::warn!(remaining, "grace deadline reached with leases in flight");
        }

        self.pool.close_idle().await;
        self.transition(Lifecycle::Stopped);
    }

    fn transition(&self, next: Lifecycle) {
        let prev = *self.state_tx.borrow();
        if prev != next {
            tracing::info!(?prev, ?next, "lifecycle transition");
            self.state_tx.send_replace(next);
        }
    }
}

/// Returns true when the given state admits new query requests.
pub fn admits_requests(state: Lifecycle) -> bool {
    state == Lifecycle::Ready
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackendOpts;

    fn idle_pool() -> Pool {
        Pool::new(BackendOpts::default(), 2, Duration::from_secs(300))
    }

    #[tokio::test]
    async fn shutdown_without_leases_stops_immediately() {
        let supervisor = Supervisor::new(idle_pool(), Duration::from_secs(5));
        assert_eq!(supervisor.state(), Lifecycle::Starting);
        supervisor.shutdown().await;
        assert_eq!(supervisor.state(), Lifecycle::Stopped);
    }

    #[tokio::test]
    async fn only_ready_admits_requests() {
        assert!(admits_requests(Lifecycle::Ready));
        assert!(!admits_requests(Lifecycle::Starting));
        assert!(!admits_requests(Lifecycle::Warming));
        assert!(!admits_requests(Lifecycle::Draining));
        assert!(!admits_requests(Lifecycle::Stopped));
    }

    #[tokio::test]
    async fn watchers_see_transitions() {
        let supervisor = Supervisor::new(idle_pool(), Duration::from_millis(10));
        let mut rx = supervisor.subscribe();
        supervisor.shutdown().await;
        // The receiver observes the latest state even if intermediate
        // transitions were coalesced.
        rx.changed().await.ok();
        assert_eq!(*rx.borrow(), Lifecycle::Stopped);
    }
}
