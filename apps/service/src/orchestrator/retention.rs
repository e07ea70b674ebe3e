//! Automatic retention and cleanup of monitoring data.
//!
//! - Uptime and TLS results: removed after `result_days`
//! - Resolved incidents: removed after `incident_days`
//! - Open incidents: never removed
//!
//! Cleanup runs as a scheduled job on the shared worker pool.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info};
use vigil::Job;

use crate::database::DatabaseImpl;

/// How long each kind of row is kept
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetentionPolicy {
    /// Days to keep uptime and TLS results
    pub result_days: i64,
    /// Days to keep resolved incidents
    pub incident_days: i64,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self { result_days: 30, incident_days: 90 }
    }
}

impl RetentionPolicy {
    fn result_cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now - Duration::days(self.result_days)
    }

    fn incident_cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now - Duration::days(self.incident_days)
    }
}

pub struct RetentionJob {
    database: Arc<DatabaseImpl>,
    policy: RetentionPolicy,
    enabled: bool,
}

impl RetentionJob {
    pub fn new(database: Arc<DatabaseImpl>, policy: RetentionPolicy) -> Self {
        Self { database, policy, enabled: true }
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }
}

#[async_trait::async_trait]
impl Job for RetentionJob {
    fn name(&self) -> &str {
        "retention-cleanup"
    }

    fn description(&self) -> &str {
        "Deletes old probe results and resolved incidents"
    }

    fn is_enabled(&self) -> bool {
        self.enabled
    }

    async fn execute(&self) -> Result<()> {
        let now = Utc::now();
        let result_cutoff = self.policy.result_cutoff(now);
        let incident_cutoff = self.policy.incident_cutoff(now);
        debug!(%result_cutoff, %incident_cutoff, "Starting retention cleanup");

        let counts = self
            .database
            .prune(result_cutoff, incident_cutoff)
            .await
            .context("pruning expired rows")?;

        info!(
            uptime_results = counts.uptime_results,
            tls_results = counts.tls_results,
            incidents = counts.incidents,
            total = counts.total(),
            "Retention cleanup completed"
        );
        Ok(())
    }
}
