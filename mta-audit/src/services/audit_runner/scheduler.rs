//! Periodic audit trigger
//!
//! Runs a scheduled pass on every interval tick until cancelled. Errors
//! never escape the task; the latest one is kept for the health endpoint.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::AuditRunner;

pub struct AuditScheduler {
    runner: Arc<AuditRunner>,
    interval: Duration,
    last_error: Arc<RwLock<Option<String>>>,
}

impl AuditScheduler {
    pub fn new(runner: Arc<AuditRunner>, interval: Duration, last_error: Arc<RwLock<Option<String>>>) -> Self {
        Self {
            runner,
            interval: interval.max(Duration::from_secs(1)),
            last_error,
        }
    }

    /// Spawn the scheduler loop
    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(cancel))
    }

    async fn run(self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!(interval_secs = self.interval.as_secs(), "Audit scheduler started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let summary = self.runner.run_scheduled().await;
                    if summary.skipped {
                        continue;
                    }
                    if let Some(error) = summary.errors.last() {
                        *self.last_error.write().await = Some(error.clone());
                    }
                }
            }
        }

        tracing::info!("Audit scheduler stopped");
    }
}
