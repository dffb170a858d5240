use std::{
    collections::HashMap,
    future::Future,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, PoisonError,
    },
    time::Duration,
};

use futures::{future::BoxFuture, FutureExt};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const RETRY_BACKOFF_BASE: Duration = Duration::from_secs(10);
const ONE_SHOT_MAX_RETRIES: u32 = 3;
const CONSTRAINT_POLL_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Constraints {
    pub requires_network: bool,
    pub requires_device_idle: bool,
    pub requires_battery_not_low: bool,
    pub expedited: bool,
}

impl Constraints {
    pub fn network() -> Self {
        Self {
            requires_network: true,
            ..Self::default()
        }
    }
}

pub trait ConstraintProbe: Send + Sync {
    fn satisfied(&self, constraints: &Constraints) -> bool;
}

pub struct AssumeSatisfied;

impl ConstraintProbe for AssumeSatisfied {
    fn satisfied(&self, _constraints: &Constraints) -> bool {
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskResult {
    Success,
    Retry,
    Failure,
}

pub type TaskFn = Arc<dyn Fn() -> BoxFuture<'static, TaskResult> + Send + Sync>;

#[derive(Clone)]
pub struct Job {
    pub name: String,
    pub constraints: Constraints,
    pub initial_delay: Duration,
    pub task: TaskFn,
}

impl Job {
    pub fn new<F, Fut>(name: impl Into<String>, task: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = TaskResult> + Send + 'static,
    {
        Self {
            name: name.into(),
            constraints: Constraints::default(),
            initial_delay: Duration::ZERO,
            task: Arc::new(move || task().boxed()),
        }
    }

    pub fn with_constraints(mut self, constraints: Constraints) -> Self {
        self.constraints = constraints;
        self
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }
}

pub trait TaskScheduler: Send + Sync {
    /// Runs `job` every `interval`. Keeps an existing job of the same name
    /// and returns `false` in that case.
    fn schedule_recurring(&self, job: Job, interval: Duration) -> bool;
    /// Runs `job` once. An existing job of the same name is replaced when
    /// `replace_existing` is set, otherwise kept, returning `false`.
    fn schedule_once(&self, job: Job, replace_existing: bool) -> bool;
    fn cancel(&self, name: &str) -> bool;
    fn is_scheduled(&self, name: &str) -> bool;
}

struct JobEntry {
    generation: u64,
    handle: JoinHandle<()>,
}

type JobTable = Arc<Mutex<HashMap<String, JobEntry>>>;

/// [`TaskScheduler`] on the ambient tokio runtime. Must be used from within
/// a runtime.
///
/// One-shot jobs stop counting as scheduled once they start running.
pub struct TokioScheduler {
    jobs: JobTable,
    probe: Arc<dyn ConstraintProbe>,
    constraint_poll: Duration,
    generations: AtomicU64,
}

impl Default for TokioScheduler {
    fn default() -> Self {
        Self::new(Arc::new(AssumeSatisfied))
    }
}

impl TokioScheduler {
    pub fn new(probe: Arc<dyn ConstraintProbe>) -> Self {
        Self {
            jobs: Arc::new(Mutex::new(HashMap::new())),
            probe,
            constraint_poll: CONSTRAINT_POLL_INTERVAL,
            generations: AtomicU64::new(0),
        }
    }

    pub fn with_constraint_poll(mut self, poll: Duration) -> Self {
        self.constraint_poll = poll;
        self
    }

    pub fn shutdown(&self) {
        let mut jobs = self.jobs.lock().unwrap_or_else(PoisonError::into_inner);
        for (name, entry) in jobs.drain() {
            debug!(job = %name, "scheduler: stopping job");
            entry.handle.abort();
        }
    }

    fn next_generation(&self) -> u64 {
        self.generations.fetch_add(1, Ordering::Relaxed) + 1
    }
}

fn retry_backoff(failures: u32, cap: Duration) -> Duration {
    let factor = 1u32.checked_shl(failures).unwrap_or(u32::MAX);
    RETRY_BACKOFF_BASE.saturating_mul(factor).min(cap)
}

async fn wait_for_constraints(
    probe: &dyn ConstraintProbe,
    constraints: &Constraints,
    poll: Duration,
    job: &str,
) {
    let mut logged = false;
    while !probe.satisfied(constraints) {
        if !logged {
            debug!(job, ?constraints, "scheduler: waiting for constraints");
            logged = true;
        }
        tokio::time::sleep(poll).await;
    }
}

fn remove_if_current(jobs: &JobTable, name: &str, generation: u64) {
    let mut jobs = jobs.lock().unwrap_or_else(PoisonError::into_inner);
    if jobs
        .get(name)
        .is_some_and(|entry| entry.generation == generation)
    {
        jobs.remove(name);
    }
}

impl TaskScheduler for TokioScheduler {
    fn schedule_recurring(&self, job: Job, interval: Duration) -> bool {
        let mut jobs = self.jobs.lock().unwrap_or_else(PoisonError::into_inner);
        if jobs
            .get(&job.name)
            .is_some_and(|entry| !entry.handle.is_finished())
        {
            debug!(job = %job.name, "scheduler: keeping existing recurring job");
            return false;
        }

        let generation = self.next_generation();
        let probe = Arc::clone(&self.probe);
        let poll = self.constraint_poll;
        let name = job.name.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(job.initial_delay).await;
            let mut failures = 0u32;
            loop {
                wait_for_constraints(probe.as_ref(), &job.constraints, poll, &job.name).await;
                let delay = match (job.task)().await {
                    TaskResult::Retry => {
                        let delay = retry_backoff(failures, interval);
                        failures = failures.saturating_add(1);
                        debug!(job = %job.name, delay_ms = delay.as_millis() as u64, "scheduler: job asked to retry");
                        delay
                    }
                    TaskResult::Failure => {
                        warn!(job = %job.name, "scheduler: job run failed");
                        failures = 0;
                        interval
                    }
                    TaskResult::Success => {
                        failures = 0;
                        interval
                    }
                };
                tokio::time::sleep(delay).await;
            }
        });
        info!(job = %name, interval_secs = interval.as_secs(), "scheduler: recurring job scheduled");
        jobs.insert(name, JobEntry { generation, handle });
        true
    }

    fn schedule_once(&self, job: Job, replace_existing: bool) -> bool {
        let mut jobs = self.jobs.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = jobs.get(&job.name) {
            if !existing.handle.is_finished() {
                if !replace_existing {
                    debug!(job = %job.name, "scheduler: keeping existing one-shot job");
                    return false;
                }
                debug!(job = %job.name, "scheduler: replacing one-shot job");
                existing.handle.abort();
            }
        }

        let generation = self.next_generation();
        let probe = Arc::clone(&self.probe);
        let poll = self.constraint_poll;
        let table = Arc::clone(&self.jobs);
        let name = job.name.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(job.initial_delay).await;
            wait_for_constraints(probe.as_ref(), &job.constraints, poll, &job.name).await;
            remove_if_current(&table, &job.name, generation);

            let mut retries = 0u32;
            loop {
                match (job.task)().await {
                    TaskResult::Retry if retries < ONE_SHOT_MAX_RETRIES => {
                        let delay = retry_backoff(retries, Duration::MAX);
                        retries += 1;
                        debug!(job = %job.name, retries, "scheduler: one-shot job asked to retry");
                        tokio::time::sleep(delay).await;
                        wait_for_constraints(probe.as_ref(), &job.constraints, poll, &job.name)
                            .await;
                    }
                    TaskResult::Retry => {
                        warn!(job = %job.name, "scheduler: one-shot job out of retries");
                        break;
                    }
                    TaskResult::Failure => {
                        warn!(job = %job.name, "scheduler: one-shot job failed");
                        break;
                    }
                    TaskResult::Success => break,
                }
            }
        });
        jobs.insert(name, JobEntry { generation, handle });
        true
    }

    fn cancel(&self, name: &str) -> bool {
        let removed = self
            .jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name);
        match removed {
            Some(entry) => {
                entry.handle.abort();
                info!(job = name, "scheduler: job cancelled");
                true
            }
            None => false,
        }
    }

    fn is_scheduled(&self, name: &str) -> bool {
        self.jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .is_some_and(|entry| !entry.handle.is_finished())
    }
}

impl Drop for TokioScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
#[path = "tests/scheduler_tests.rs"]
mod tests;
