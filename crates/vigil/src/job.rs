//! Job descriptors and their scheduling bookkeeping.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::schedule::Schedule;

/// A named unit of work the runner can execute
#[async_trait::async_trait]
pub trait Job: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// Only consulted once, when the job is registered
    fn is_enabled(&self) -> bool {
        true
    }

    async fn execute(&self) -> Result<()>;
}

#[derive(Debug, Clone)]
struct JobState {
    next_due: DateTime<Utc>,
    last_run: Option<DateTime<Utc>>,
    execution_count: u64,
    skipped_count: u64,
    last_success: Option<DateTime<Utc>>,
    last_failure: Option<DateTime<Utc>>,
    last_error: Option<String>,
    last_duration: Option<Duration>,
}

/// Point-in-time view of a scheduled job, for status queries
#[derive(Debug, Clone, Serialize)]
pub struct JobStatus {
    pub name: String,
    pub description: String,
    pub schedule: String,
    pub running: bool,
    pub next_due: DateTime<Utc>,
    pub last_run: Option<DateTime<Utc>>,
    pub execution_count: u64,
    pub skipped_count: u64,
    pub last_success: Option<DateTime<Utc>>,
    pub last_failure: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub last_duration_ms: Option<u64>,
}

/// A job bound to its schedule, plus execution bookkeeping.
///
/// Bookkeeping is written by whichever worker ran the job last, so readers
/// only get eventually consistent values.
pub struct ScheduledJob {
    job: Arc<dyn Job>,
    schedule: Schedule,
    state: RwLock<JobState>,
    in_flight: AtomicUsize,
}

impl ScheduledJob {
    /// Bind `job` to `schedule`; the first run is the first slot after `now`
    pub fn new(job: Arc<dyn Job>, schedule: Schedule, now: DateTime<Utc>) -> Self {
        let next_due = schedule.next_due_after(now);
        Self {
            job,
            schedule,
            state: RwLock::new(JobState {
                next_due,
                last_run: None,
                execution_count: 0,
                skipped_count: 0,
                last_success: None,
                last_failure: None,
                last_error: None,
                last_duration: None,
            }),
            in_flight: AtomicUsize::new(0),
        }
    }

    pub fn name(&self) -> &str {
        self.job.name()
    }

    pub fn schedule(&self) -> &Schedule {
        &self.schedule
    }

    pub async fn next_due(&self) -> DateTime<Utc> {
        self.state.read().await.next_due
    }

    pub async fn is_due(&self, now: DateTime<Utc>) -> bool {
        now >= self.state.read().await.next_due
    }

    pub fn is_running(&self) -> bool {
        self.in_flight.load(Ordering::Acquire) > 0
    }

    /// Mark one more run as in flight. An exclusive claim only succeeds when
    /// no earlier run is still queued or executing.
    pub(crate) fn claim(&self, exclusive: bool) -> bool {
        if exclusive {
            self.in_flight.compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire).is_ok()
        } else {
            self.in_flight.fetch_add(1, Ordering::AcqRel);
            true
        }
    }

    pub(crate) fn release(&self) {
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
    }

    pub(crate) async fn record_skip(&self) {
        self.state.write().await.skipped_count += 1;
    }

    /// Execute the job once and record the outcome. Errors stop here.
    pub async fn run(&self) {
        let started_at = Utc::now();
        let start = Instant::now();
        debug!(job = self.name(), "Job started");

        let outcome = self.job.execute().await;
        let elapsed = start.elapsed();
        let finished_at = Utc::now();

        let mut state = self.state.write().await;
        state.last_run = Some(started_at);
        state.execution_count += 1;
        state.last_duration = Some(elapsed);
        state.next_due = self.schedule.next_due_after(finished_at);

        match outcome {
            Ok(()) => {
                state.last_success = Some(finished_at);
                state.last_error = None;
                debug!(
                    job = self.name(),
                    duration_ms = elapsed.as_millis() as u64,
                    next_due = %state.next_due,
                    "Job completed"
                );
            }
            Err(e) => {
                state.last_failure = Some(finished_at);
                state.last_error = Some(format!("{e:#}"));
                warn!(
                    job = self.name(),
                    duration_ms = elapsed.as_millis() as u64,
                    next_due = %state.next_due,
                    "Job failed: {:#}",
                    e
                );
            }
        }
    }

    pub async fn status(&self) -> JobStatus {
        let state = self.state.read().await.clone();
        JobStatus {
            name: self.job.name().to_string(),
            description: self.job.description().to_string(),
            schedule: self.schedule.to_string(),
            running: self.is_running(),
            next_due: state.next_due,
            last_run: state.last_run,
            execution_count: state.execution_count,
            skipped_count: state.skipped_count,
            last_success: state.last_success,
            last_failure: state.last_failure,
            last_error: state.last_error,
            last_duration_ms: state.last_duration.map(|d| d.as_millis() as u64),
        }
    }
}

impl std::fmt::Debug for ScheduledJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScheduledJob")
            .field("name", &self.job.name())
            .field("schedule", &self.schedule.to_string())
            .field("running", &self.is_running())
            .finish()
    }
}
