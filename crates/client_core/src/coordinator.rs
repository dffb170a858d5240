use std::{sync::Arc, time::Duration};

use anyhow::Result;
use chrono::Utc;
use futures::{future::BoxFuture, FutureExt};
use storage::MutationQueue;
use tokio::sync::Mutex;
use tracing::{debug, error, info};

use crate::{
    scheduler::{Constraints, Job, TaskResult, TaskScheduler},
    worker::{PassOutcome, PassReport, SyncWorker},
};

pub const PERIODIC_SYNC_JOB: &str = "periodic_sync";
pub const IMMEDIATE_SYNC_JOB: &str = "immediate_sync";
pub const RETRY_SYNC_JOB: &str = "sync_retry";
pub const ARCHIVAL_JOB: &str = "queue_archival";

const ARCHIVAL_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Trigger {
    Periodic,
    Immediate,
    Retry,
}

/// Owns the sync schedules and guarantees at most one pass dispatches at a
/// time.
///
/// Periodic and retry passes are skipped while another pass runs; an
/// immediate pass waits for it and then drains whatever is left.
pub struct SyncCoordinator {
    worker: Arc<SyncWorker>,
    queue: Arc<dyn MutationQueue>,
    scheduler: Arc<dyn TaskScheduler>,
    pass_guard: Mutex<()>,
    interval: Duration,
    retention: chrono::Duration,
}

impl SyncCoordinator {
    pub fn new(
        worker: Arc<SyncWorker>,
        queue: Arc<dyn MutationQueue>,
        scheduler: Arc<dyn TaskScheduler>,
        interval: Duration,
        retention: chrono::Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            worker,
            queue,
            scheduler,
            pass_guard: Mutex::new(()),
            interval,
            retention,
        })
    }

    fn sync_job(self: &Arc<Self>, name: &str, trigger: Trigger) -> Job {
        let coordinator = Arc::clone(self);
        Job::new(name, move || Arc::clone(&coordinator).run_triggered(trigger))
    }

    pub fn schedule_periodic_sync(self: &Arc<Self>) -> bool {
        let job = self
            .sync_job(PERIODIC_SYNC_JOB, Trigger::Periodic)
            .with_constraints(Constraints::network());
        self.scheduler.schedule_recurring(job, self.interval)
    }

    pub fn request_immediate_sync(self: &Arc<Self>) {
        let job = self
            .sync_job(IMMEDIATE_SYNC_JOB, Trigger::Immediate)
            .with_constraints(Constraints {
                expedited: true,
                ..Constraints::network()
            });
        self.scheduler.schedule_once(job, true);
    }

    pub fn cancel_periodic_sync(&self) -> bool {
        self.scheduler.cancel(PERIODIC_SYNC_JOB)
    }

    pub fn schedule_archival(self: &Arc<Self>) -> bool {
        let coordinator = Arc::clone(self);
        let job = Job::new(ARCHIVAL_JOB, move || {
            let coordinator = Arc::clone(&coordinator);
            async move {
                match coordinator.archive_now().await {
                    Ok(_) => TaskResult::Success,
                    Err(err) => {
                        error!(error = %err, "sync: archival failed");
                        TaskResult::Retry
                    }
                }
            }
        })
        .with_constraints(Constraints {
            requires_device_idle: true,
            requires_battery_not_low: true,
            ..Constraints::default()
        })
        .with_initial_delay(ARCHIVAL_INTERVAL);
        self.scheduler.schedule_recurring(job, ARCHIVAL_INTERVAL)
    }

    pub fn is_sync_in_progress(&self) -> bool {
        self.pass_guard.try_lock().is_err()
    }

    pub async fn sync_now(&self) -> Result<PassReport> {
        let _pass = self.pass_guard.lock().await;
        let report = self.worker.run_pass().await?;
        Ok(report)
    }

    pub async fn archive_now(&self) -> Result<u64> {
        let purged = self
            .queue
            .purge_terminal(Utc::now() - self.retention)
            .await?;
        if purged > 0 {
            info!(purged, "sync: archived terminal mutations");
        }
        Ok(purged)
    }

    fn schedule_follow_up(self: &Arc<Self>, report: &PassReport) {
        if report.outcome() != PassOutcome::RetryRequested {
            return;
        }
        let Some(delay) = report.next_retry_in else {
            return;
        };
        let job = self
            .sync_job(RETRY_SYNC_JOB, Trigger::Retry)
            .with_constraints(Constraints::network())
            .with_initial_delay(delay);
        self.scheduler.schedule_once(job, true);
        debug!(delay_ms = delay.as_millis() as u64, "sync: follow-up pass scheduled");
    }

    // Boxed so a pass can schedule its own follow-up job.
    fn run_triggered(self: Arc<Self>, trigger: Trigger) -> BoxFuture<'static, TaskResult> {
        async move { self.run_pass_for(trigger).await }.boxed()
    }

    async fn run_pass_for(self: &Arc<Self>, trigger: Trigger) -> TaskResult {
        let _pass = match trigger {
            Trigger::Immediate => self.pass_guard.lock().await,
            Trigger::Periodic | Trigger::Retry => match self.pass_guard.try_lock() {
                Ok(pass) => pass,
                Err(_) => {
                    debug!(?trigger, "sync: pass already running, skipping");
                    return TaskResult::Success;
                }
            },
        };

        match self.worker.run_pass().await {
            Ok(report) => {
                self.schedule_follow_up(&report);
                match report.outcome() {
                    PassOutcome::Success => TaskResult::Success,
                    PassOutcome::RetryRequested => TaskResult::Retry,
                }
            }
            Err(err) => {
                error!(?trigger, error = %err, "sync: pass aborted");
                TaskResult::Retry
            }
        }
    }
}

#[cfg(test)]
#[path = "tests/coordinator_tests.rs"]
mod tests;
