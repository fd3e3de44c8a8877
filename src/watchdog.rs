//! Stuck-job watchdog.
//!
//! Jobs sitting in a transient provider-facing state (`fetching_asset`,
//! `assembling`) longer than the threshold get flagged and resynced
//! against the provider's own view of the task. A task that finished
//! while nobody was polling completes the job; a task the provider
//! reports dead fails it with the usual refund.

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::config::WatchdogConfig;
use crate::job::JobStatus;
use crate::orchestrator::Orchestrator;

pub struct Watchdog {
    orchestrator: Orchestrator,
    config: WatchdogConfig,
}

impl Watchdog {
    pub fn new(orchestrator: Orchestrator, config: WatchdogConfig) -> Self {
        Self {
            orchestrator,
            config,
        }
    }

    /// Scan loop; runs until `shutdown` fires.
    pub async fn run(self, shutdown: CancellationToken) {
        let mut ticker =
            tokio::time::interval(std::time::Duration::from_secs(self.config.scan_interval_secs));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tracing::info!(
            stuck_after_secs = self.config.stuck_after_secs,
            scan_interval_secs = self.config.scan_interval_secs,
            "watchdog running"
        );
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("watchdog stopped");
                    return;
                }
                _ = ticker.tick() => self.scan_once().await,
            }
        }
    }

    /// One pass over the watched states.
    pub async fn scan_once(&self) {
        let watched = match self
            .orchestrator
            .jobs()
            .list_with_status(&[JobStatus::FetchingAsset, JobStatus::Assembling])
        {
            Ok(jobs) => jobs,
            Err(e) => {
                tracing::error!(error = %e, "watchdog scan failed to list jobs");
                return;
            }
        };

        let now = Utc::now();
        for mut record in watched {
            let idle_secs = now.signed_duration_since(record.updated_at).num_seconds();
            if idle_secs < self.config.stuck_after_secs as i64 {
                continue;
            }

            if record.stuck_flagged_at.is_none() {
                record.stuck_flagged_at = Some(now);
                // A conflict means the job just moved; it is not stuck.
                if self.orchestrator.jobs().update(&mut record).is_err() {
                    continue;
                }
                self.orchestrator.ledger().audit().event(
                    record.user_id(),
                    record.id,
                    "stuck_flagged",
                    Some(record.status.as_str()),
                );
                tracing::warn!(
                    job_id = %record.id,
                    status = record.status.as_str(),
                    idle_secs,
                    "job flagged as stuck"
                );
            }

            match self.orchestrator.resync(record.id).await {
                Ok(synced) => {
                    tracing::info!(
                        job_id = %record.id,
                        status = synced.status.as_str(),
                        "stuck job resynced"
                    );
                }
                Err(e) => {
                    tracing::error!(job_id = %record.id, error = %e, "resync failed");
                }
            }
        }
    }
}
