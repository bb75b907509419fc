//! Periodic deletion of aged inventory data.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::broadcast;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, error, info};

use crate::storage::{DatabaseError, InventoryRepository, RetentionPolicy, RetentionReport};

/// Applies a [`RetentionPolicy`] every `interval`.
pub struct RetentionSweeper {
    repository: Arc<dyn InventoryRepository>,
    policy: RetentionPolicy,
    interval: Duration,
}

impl RetentionSweeper {
    pub fn new(
        repository: Arc<dyn InventoryRepository>,
        policy: RetentionPolicy,
        interval: Duration,
    ) -> Self {
        Self {
            repository,
            policy,
            interval,
        }
    }

    pub async fn run_once(&self) -> Result<RetentionReport, DatabaseError> {
        let report = self
            .repository
            .apply_retention(&self.policy, Utc::now())
            .await?;

        if report.records + report.diffs + report.alerts > 0 {
            info!(
                records = report.records,
                diffs = report.diffs,
                alerts = report.alerts,
                "Retention sweep removed aged data"
            );
        } else {
            debug!("Retention sweep found nothing to remove");
        }
        Ok(report)
    }

    /// Runs until `shutdown` fires.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        info!(
            interval_secs = self.interval.as_secs(),
            max_age_days = self.policy.max_age.num_days(),
            "Starting retention sweeper"
        );

        let mut ticker = time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("Retention sweeper stopped");
                    return;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.run_once().await {
                        error!(error = %e, "Retention sweep failed");
                    }
                }
            }
        }
    }
}
