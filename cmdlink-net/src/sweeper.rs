//! Background expiry of unanswered requests.

use crate::clock::Clock;
use crate::metrics::Metrics;
use crate::pending::PendingConnections;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

/// Periodically resolves expired requests with a timeout error.
pub struct TimeoutSweeper {
    connections: Arc<PendingConnections>,
    clock: Arc<dyn Clock>,
    interval: Duration,
    metrics: Option<Arc<Metrics>>,
    sweeps: AtomicU64,
    expired_total: AtomicU64,
    shutdown: AtomicBool,
    notify: Notify,
}

impl TimeoutSweeper {
    pub fn new(
        connections: Arc<PendingConnections>,
        clock: Arc<dyn Clock>,
        interval: Duration,
        metrics: Option<Arc<Metrics>>,
    ) -> Self {
        Self {
            connections,
            clock,
            interval: interval.max(Duration::from_millis(1)),
            metrics,
            sweeps: AtomicU64::new(0),
            expired_total: AtomicU64::new(0),
            shutdown: AtomicBool::new(false),
            notify: Notify::new(),
        }
    }

    /// Runs one pass over every connection with pending requests.
    pub fn sweep(&self) -> SweepResult {
        let now = self.clock.now_millis();
        let mut result = SweepResult::default();

        for (id, pending) in self.connections.snapshot() {
            result.connections_scanned += 1;

            // Map guards are released by now; resolving may run listeners.
            for promise in pending.expire(now) {
                if promise.set_failure(promise.timeout_error()) {
                    result.expired += 1;
                }
            }

            if self.connections.release_if_idle(id) {
                result.connections_released += 1;
            }
        }

        self.sweeps.fetch_add(1, Ordering::Relaxed);
        self.expired_total.fetch_add(result.expired as u64, Ordering::Relaxed);
        if let Some(metrics) = &self.metrics {
            metrics.timeouts_total.inc_by(result.expired as f64);
            metrics.pending_requests.set(self.connections.pending_requests() as f64);
        }
        result
    }

    /// Runs the sweep loop (call from a background task).
    pub async fn run(&self) {
        tracing::debug!("Timeout sweeper started (interval={:?})", self.interval);

        loop {
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep(self.interval) => {}
            }

            if self.shutdown.load(Ordering::Relaxed) {
                break;
            }

            let result = self.sweep();
            if result.expired > 0 {
                tracing::debug!(
                    "Expired {} requests across {} connections",
                    result.expired,
                    result.connections_scanned
                );
            }
        }

        tracing::debug!("Timeout sweeper stopped");
    }

    /// Signals the sweep loop to stop.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
        self.notify.notify_one();
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn stats(&self) -> SweeperStats {
        SweeperStats {
            sweeps: self.sweeps.load(Ordering::Relaxed),
            expired_total: self.expired_total.load(Ordering::Relaxed),
            tracked_connections: self.connections.len(),
        }
    }
}

/// Result of one sweep.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepResult {
    pub connections_scanned: usize,
    pub expired: usize,
    pub connections_released: usize,
}

/// Sweeper statistics.
#[derive(Debug, Clone, Copy)]
pub struct SweeperStats {
    pub sweeps: u64,
    pub expired_total: u64,
    pub tracked_connections: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::AdmissionController;
    use crate::clock::ManualClock;
    use crate::connection::ConnectionId;
    use crate::error::NetError;
    use crate::executor::InlineExecutor;
    use crate::pending::PendingRequests;
    use crate::promise::ResponsePromise;
    use cmdlink_protocol::{Command, Header, RawCommand};

    struct Fixture {
        clock: Arc<ManualClock>,
        connections: Arc<PendingConnections>,
        sweeper: TimeoutSweeper,
    }

    fn fixture() -> Fixture {
        let clock = Arc::new(ManualClock::new(10_000));
        let connections = Arc::new(PendingConnections::new());
        let sweeper = TimeoutSweeper::new(
            connections.clone(),
            clock.clone(),
            Duration::from_millis(10),
            None,
        );
        Fixture {
            clock,
            connections,
            sweeper,
        }
    }

    fn track(
        fixture: &Fixture,
        id: ConnectionId,
        pending: &Arc<PendingRequests>,
        command_id: u32,
        timeout_ms: u64,
        admission: &AdmissionController,
    ) -> Arc<ResponsePromise> {
        let request: Arc<dyn Command> =
            Arc::new(RawCommand::from_header(Header::request(command_id, 1, 0)));
        let promise = Arc::new(ResponsePromise::new(
            request,
            Duration::from_millis(timeout_ms),
            fixture.clock.now_millis(),
            admission.try_acquire().unwrap(),
            Arc::new(InlineExecutor),
        ));
        promise.mark_sent();
        pending.insert(promise.clone());
        fixture.connections.track(id, pending);
        promise
    }

    #[test]
    fn test_expires_only_past_deadline() {
        let f = fixture();
        let admission = AdmissionController::new(10);
        let id = ConnectionId::new();
        let pending = Arc::new(PendingRequests::new());

        let fast = track(&f, id, &pending, 1, 100, &admission);
        let slow = track(&f, id, &pending, 2, 1_000, &admission);

        f.clock.advance(Duration::from_millis(99));
        assert_eq!(f.sweeper.sweep().expired, 0);

        f.clock.advance(Duration::from_millis(1));
        let result = f.sweeper.sweep();
        assert_eq!(result.expired, 1);
        assert_eq!(result.connections_released, 0);

        match fast.result() {
            Some(Err(NetError::Timeout { command_id, timeout_ms })) => {
                assert_eq!(command_id, 1);
                assert_eq!(timeout_ms, 100);
            }
            other => panic!("expected timeout, got {other:?}"),
        }
        assert!(!slow.is_done());
        assert!(!pending.contains(1));
        assert!(pending.contains(2));
        assert_eq!(admission.available(), Some(9));
    }

    #[test]
    fn test_releases_drained_connections() {
        let f = fixture();
        let admission = AdmissionController::disabled();
        let id = ConnectionId::new();
        let pending = Arc::new(PendingRequests::new());
        track(&f, id, &pending, 1, 50, &admission);

        f.clock.advance(Duration::from_millis(50));
        let result = f.sweeper.sweep();
        assert_eq!(result.expired, 1);
        assert_eq!(result.connections_released, 1);
        assert!(f.connections.is_empty());

        let stats = f.sweeper.stats();
        assert_eq!(stats.sweeps, 1);
        assert_eq!(stats.expired_total, 1);
        assert_eq!(stats.tracked_connections, 0);
    }

    #[test]
    fn test_already_resolved_not_counted() {
        let f = fixture();
        let admission = AdmissionController::disabled();
        let id = ConnectionId::new();
        let pending = Arc::new(PendingRequests::new());
        let promise = track(&f, id, &pending, 1, 5_000, &admission);
        promise.set_failure(NetError::ConnectionClosed);

        let result = f.sweeper.sweep();
        assert_eq!(result.expired, 0);
        assert!(pending.is_empty());
        assert!(matches!(promise.result(), Some(Err(NetError::ConnectionClosed))));
    }

    #[tokio::test]
    async fn test_run_and_shutdown() {
        let f = fixture();
        let sweeper = Arc::new(f.sweeper);
        let task = {
            let sweeper = sweeper.clone();
            tokio::spawn(async move { sweeper.run().await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        sweeper.shutdown();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
        assert!(sweeper.stats().sweeps >= 1);
    }
}
