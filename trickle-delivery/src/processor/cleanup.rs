//! Queue maintenance
//!
//! Releases claims abandoned by a crashed processor and purges rows that
//! have outlived their retention window.

use chrono::{DateTime, Utc};
use serde::Serialize;
use trickle_common::{SendingConfig, internal};
use trickle_store::{EmailLogStore, QueueStore, RateLimitStore};

use super::QueueProcessor;
use crate::error::DeliveryError;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MaintenanceReport {
    /// Stuck `processing` jobs returned to `pending`
    pub released: u64,
    pub purged_jobs: u64,
    pub purged_logs: u64,
    pub purged_rate_limits: u64,
}

impl QueueProcessor {
    /// Run the maintenance pass
    ///
    /// Skipped entirely while sending is paused. A retention of zero days
    /// disables that purge.
    ///
    /// # Errors
    ///
    /// If the processor was never initialised or a store operation fails.
    #[tracing::instrument(skip(self, config), ret, err, level = "debug")]
    pub async fn maintain(
        &self,
        config: &SendingConfig,
        now: DateTime<Utc>,
    ) -> Result<MaintenanceReport, DeliveryError> {
        let store = self.store()?;
        let mut report = MaintenanceReport::default();

        if config.pause_all_sending {
            return Ok(report);
        }

        report.released = store
            .release_stuck(before(now, config.stuck_timeout()), now)
            .await?;
        if report.released > 0 {
            tracing::warn!(
                released = report.released,
                "Released jobs stuck in processing back to pending, each charged one attempt"
            );
        }

        if let Some(retention) = config.job_retention() {
            report.purged_jobs = store.purge_jobs(before(now, retention)).await?;
        }

        if let Some(retention) = config.log_retention() {
            report.purged_logs = store.purge_logs(before(now, retention)).await?;
        }

        report.purged_rate_limits = store.purge_rate_limits(now).await?;

        if report.purged_jobs + report.purged_logs > 0 {
            internal!(
                level = INFO,
                "Purged {} jobs and {} log entries past retention",
                report.purged_jobs,
                report.purged_logs
            );
        }

        Ok(report)
    }
}

fn before(now: DateTime<Utc>, age: chrono::Duration) -> DateTime<Utc> {
    now.checked_sub_signed(age).unwrap_or(DateTime::<Utc>::MIN_UTC)
}
