//! Periodic retention purge for events and notifications.
//!
//! Events carry name snapshots precisely so they can outlive the nodes
//! they reference, but they still expire: rows older than the configured
//! window are deleted wholesale, notifications following through the
//! cascade.

use crate::event_log::EventLog;
use chantier_core::config::EngineConfig;
use chantier_core::environment::Clock;
use chantier_core::error::Result;
use chrono::Duration;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Deletes expired events on a fixed period.
pub struct RetentionJob {
    log: EventLog,
    clock: Arc<dyn Clock>,
    config: EngineConfig,
}

impl RetentionJob {
    /// Create a retention job.
    pub fn new(log: EventLog, clock: Arc<dyn Clock>, config: EngineConfig) -> Self {
        Self { log, clock, config }
    }

    /// One purge pass: delete events older than the retention window.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Database`](chantier_core::EngineError::Database)
    /// on query failure.
    pub async fn run_once(&self) -> Result<u64> {
        let cutoff = self.clock.now() - Duration::days(self.config.retention_days);
        self.log.purge_older_than(cutoff).await
    }

    /// Run the purge on `period` until shut down.
    #[must_use]
    pub fn spawn(self, period: std::time::Duration) -> RetentionHandle {
        let (stop, mut stopped) = watch::channel(false);
        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if let Err(error) = self.run_once().await {
                            tracing::warn!(%error, "retention purge failed");
                        }
                    }
                    changed = stopped.changed() => {
                        if changed.is_err() || *stopped.borrow() {
                            break;
                        }
                    }
                }
            }
        });
        RetentionHandle { stop, task }
    }
}

/// Handle stopping a spawned [`RetentionJob`].
pub struct RetentionHandle {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl RetentionHandle {
    /// Signal the job to stop and wait for it to finish.
    pub async fn shutdown(self) {
        let _ = self.stop.send(true);
        let _ = self.task.await;
    }
}
