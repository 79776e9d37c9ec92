//! Shutdown coordination.
//!
//! The listener and every background task watch one root token. Cancelling
//! it stops new upgrades, ends the sweeps, and lets the client manager close
//! the remaining connections. [`ShutdownCoordinator::graceful_shutdown`]
//! then waits for the tasks against a single deadline and aborts whatever
//! is still running.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, timeout_at};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Outcome of a graceful shutdown.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Tasks that finished before the deadline.
    pub drained: usize,
    /// Tasks aborted at the deadline.
    pub aborted: usize,
}

/// Owns the root cancellation token.
#[derive(Default)]
pub struct ShutdownCoordinator {
    token: CancellationToken,
}

impl ShutdownCoordinator {
    /// Create a coordinator in the running state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Clone of the root token, for a task that must stop on shutdown.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Begin shutdown. Idempotent.
    pub fn shutdown(&self) {
        if !self.token.is_cancelled() {
            info!("shutdown requested");
        }
        self.token.cancel();
    }

    /// Whether shutdown has begun.
    pub fn is_shutting_down(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Begin shutdown and wait for `tasks`, all sharing one deadline
    /// (`drain_timeout`, 30s when `None`). Stragglers are aborted.
    pub async fn graceful_shutdown(
        &self,
        tasks: Vec<JoinHandle<()>>,
        drain_timeout: Option<Duration>,
    ) -> DrainReport {
        self.shutdown();
        let deadline = Instant::now() + drain_timeout.unwrap_or(DEFAULT_DRAIN_TIMEOUT);

        let mut report = DrainReport::default();
        for mut task in tasks {
            if timeout_at(deadline, &mut task).await.is_ok() {
                report.drained += 1;
            } else {
                task.abort();
                report.aborted += 1;
            }
        }

        if report.aborted > 0 {
            warn!(drained = report.drained, aborted = report.aborted, "drain deadline passed");
        } else {
            info!(drained = report.drained, "all tasks drained");
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shutdown_cancels_handed_out_tokens() {
        let coord = ShutdownCoordinator::new();
        assert!(!coord.is_shutting_down());
        let child = coord.token().child_token();
        coord.shutdown();
        coord.shutdown();
        assert!(coord.is_shutting_down());
        assert!(child.is_cancelled());
    }

    #[tokio::test]
    async fn cooperative_tasks_drain() {
        let coord = ShutdownCoordinator::new();
        let tasks = (0..3)
            .map(|_| {
                let token = coord.token();
                tokio::spawn(async move { token.cancelled().await })
            })
            .collect();
        let report = coord.graceful_shutdown(tasks, Some(Duration::from_secs(1))).await;
        assert_eq!(report, DrainReport { drained: 3, aborted: 0 });
    }

    #[tokio::test(start_paused = true)]
    async fn stuck_tasks_are_aborted_at_the_deadline() {
        let coord = ShutdownCoordinator::new();
        let token = coord.token();
        let polite = tokio::spawn(async move { token.cancelled().await });
        let stuck = tokio::spawn(tokio::time::sleep(Duration::from_secs(3600)));

        let report = coord
            .graceful_shutdown(vec![stuck, polite], Some(Duration::from_millis(50)))
            .await;
        assert_eq!(report, DrainReport { drained: 1, aborted: 1 });
    }
}
