//! Tick loop and bounded worker pool for scheduled jobs.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock, Semaphore, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{MissedTickBehavior, interval, timeout};
use tracing::{debug, error, info, warn};

use crate::job::{Job, JobStatus, ScheduledJob};
use crate::schedule::{Schedule, ScheduleError};

/// What to do when a job comes due while an earlier run is still in flight
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverlapPolicy {
    /// Skip the new run and count it as skipped
    #[default]
    Skip,
    /// Dispatch anyway; runs of the same job may overlap
    Allow,
}

#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub tick_interval: Duration,
    pub workers: usize,
    pub shutdown_timeout: Duration,
    pub overlap: OverlapPolicy,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(60),
            workers: crate::DEFAULT_WORKERS,
            shutdown_timeout: Duration::from_secs(30),
            overlap: OverlapPolicy::Skip,
        }
    }
}

/// Releases a job's in-flight claim even if the worker panics
struct InFlight(Arc<ScheduledJob>);

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.release();
    }
}

/// Owns the tick loop and the worker pool.
///
/// Each tick dispatches every due job to the pool without waiting for it.
/// At most `workers` jobs execute at once; the rest queue for a slot.
pub struct JobRunner {
    config: RunnerConfig,
    jobs: RwLock<Vec<Arc<ScheduledJob>>>,
    permits: Arc<Semaphore>,
    tasks: Mutex<JoinSet<()>>,
    accepting: AtomicBool,
    stop_tx: watch::Sender<bool>,
    ticker: Mutex<Option<JoinHandle<()>>>,
}

impl JobRunner {
    pub fn new(config: RunnerConfig) -> Arc<Self> {
        let workers = config.workers.max(1);
        let (stop_tx, _) = watch::channel(false);
        Arc::new(Self {
            config,
            jobs: RwLock::new(Vec::new()),
            permits: Arc::new(Semaphore::new(workers)),
            tasks: Mutex::new(JoinSet::new()),
            accepting: AtomicBool::new(true),
            stop_tx,
            ticker: Mutex::new(None),
        })
    }

    /// Register `job` under `descriptor`.
    ///
    /// Malformed descriptors are rejected here. Disabled jobs are not
    /// registered and yield `Ok(None)`.
    pub async fn schedule(
        &self,
        job: Arc<dyn Job>,
        descriptor: &str,
    ) -> Result<Option<Arc<ScheduledJob>>, ScheduleError> {
        self.schedule_at(job, descriptor, Utc::now()).await
    }

    /// Same as [`JobRunner::schedule`], as if registered at `now`
    pub async fn schedule_at(
        &self,
        job: Arc<dyn Job>,
        descriptor: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Arc<ScheduledJob>>, ScheduleError> {
        let schedule = Schedule::parse(descriptor)?;

        if !job.is_enabled() {
            info!(job = job.name(), "Job is disabled, not scheduling");
            return Ok(None);
        }

        let scheduled = Arc::new(ScheduledJob::new(job, schedule, now));
        info!(
            job = scheduled.name(),
            schedule = %scheduled.schedule(),
            next_due = %scheduled.next_due().await,
            "Scheduled job"
        );

        self.jobs.write().await.push(Arc::clone(&scheduled));
        Ok(Some(scheduled))
    }

    /// Start the tick loop. Calling it twice is a no-op.
    pub async fn start(self: &Arc<Self>) {
        let mut ticker = self.ticker.lock().await;
        if ticker.is_some() {
            warn!("Job runner already started");
            return;
        }

        let runner = Arc::clone(self);
        let mut stop_rx = self.stop_tx.subscribe();

        *ticker = Some(tokio::spawn(async move {
            let mut timer = interval(runner.config.tick_interval);
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = timer.tick() => {
                        runner.tick_at(Utc::now()).await;
                    }
                    _ = stop_rx.changed() => break,
                }
            }

            debug!("Tick loop stopped");
        }));

        info!(
            workers = self.config.workers.max(1),
            tick_seconds = self.config.tick_interval.as_secs(),
            "Job runner started"
        );
    }

    /// Evaluate every registered job against `now` and dispatch the due ones.
    /// Returns how many runs were dispatched.
    pub async fn tick_at(&self, now: DateTime<Utc>) -> usize {
        if !self.accepting.load(Ordering::Acquire) {
            return 0;
        }

        let jobs = self.jobs.read().await.clone();
        let mut tasks = self.tasks.lock().await;
        reap_finished(&mut tasks);

        let exclusive = self.config.overlap == OverlapPolicy::Skip;
        let mut dispatched = 0;

        for job in jobs {
            if !job.is_due(now).await {
                continue;
            }

            if !job.claim(exclusive) {
                job.record_skip().await;
                warn!(job = job.name(), "Previous run still in flight, skipping this slot");
                continue;
            }

            self.dispatch(&mut tasks, job);
            dispatched += 1;
        }

        if dispatched > 0 {
            debug!(dispatched, in_flight = tasks.len(), "Tick dispatched jobs");
        }

        dispatched
    }

    fn dispatch(&self, tasks: &mut JoinSet<()>, job: Arc<ScheduledJob>) {
        let permits = Arc::clone(&self.permits);
        let claim = InFlight(Arc::clone(&job));

        tasks.spawn(async move {
            let _claim = claim;
            let Ok(_permit) = permits.acquire_owned().await else {
                debug!(job = job.name(), "Worker pool closed before job started");
                return;
            };
            job.run().await;
        });
    }

    /// Snapshot of every registered job
    pub async fn statuses(&self) -> Vec<JobStatus> {
        let jobs = self.jobs.read().await.clone();
        let mut statuses = Vec::with_capacity(jobs.len());
        for job in jobs {
            statuses.push(job.status().await);
        }
        statuses
    }

    /// Number of dispatched runs that have not been reaped yet
    pub async fn in_flight(&self) -> usize {
        let mut tasks = self.tasks.lock().await;
        reap_finished(&mut tasks);
        tasks.len()
    }

    /// Stop ticking, wait up to the shutdown timeout for running jobs, then
    /// abort whatever is left.
    pub async fn shutdown(&self) {
        if !self.accepting.swap(false, Ordering::AcqRel) {
            return;
        }

        let _ = self.stop_tx.send(true);
        let ticker = self.ticker.lock().await.take();
        if let Some(handle) = ticker {
            if let Err(e) = handle.await {
                error!("Tick loop ended abnormally: {}", e);
            }
        }

        let mut tasks = self.tasks.lock().await;
        info!(in_flight = tasks.len(), "Draining job workers");

        let drained = timeout(self.config.shutdown_timeout, async {
            while let Some(result) = tasks.join_next().await {
                log_join_error(result);
            }
        })
        .await;

        if drained.is_err() {
            warn!(
                remaining = tasks.len(),
                timeout_seconds = self.config.shutdown_timeout.as_secs(),
                "Shutdown timeout elapsed, aborting remaining jobs"
            );
            tasks.shutdown().await;
        }

        self.permits.close();
        info!("Job runner stopped");
    }
}

fn reap_finished(tasks: &mut JoinSet<()>) {
    while let Some(result) = tasks.try_join_next() {
        log_join_error(result);
    }
}

fn log_join_error(result: Result<(), tokio::task::JoinError>) {
    if let Err(e) = result {
        if e.is_panic() {
            error!("Job worker panicked: {}", e);
        }
    }
}
