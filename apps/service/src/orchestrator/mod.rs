//! Orchestrator module - coordinates all components
//!
//! The orchestrator:
//! - Prepares the database schema and the notification channels
//! - Registers the monitoring and retention jobs with the job runner
//! - Runs until a shutdown signal, then drains in-flight jobs and reports
//!   the final state of every job
pub mod retention;


pub use retention::{RetentionJob, RetentionPolicy};

use std::future::Future;
use std::sync::Arc;

use anyhow::Result;
use tracing::{info, warn};
use vigil::{
    CertificateMonitorJob, IncidentCoordinator, JobRunner, JobStatus, Notifier, ProbeRunner,
    TargetRepository, UptimeMonitorJob,
};

use crate::config::Config;
use crate::database::{DatabaseImpl, initialize_database};
use crate::notify::Dispatcher;
use crate::pool::LibsqlPool;

/// Main orchestrator for the Vigil service
pub struct Orchestrator {
    config: Arc<Config>,
    database: Arc<DatabaseImpl>,
    runner: Arc<JobRunner>,
}

impl Orchestrator {
    /// Create and run an orchestrator until Ctrl-C or SIGTERM
    pub async fn start(config: Config, pool: LibsqlPool) -> Result<()> {
        let orchestrator = Self::new(config, pool).await?;
        orchestrator.run(shutdown_signal()).await?;
        Ok(())
    }

    /// Create a new orchestrator instance
    pub async fn new(config: Config, pool: LibsqlPool) -> Result<Self> {
        let config = Arc::new(config);

        // Get database connection for initialization
        let conn = pool.get().await?;
        info!("Initializing database schema...");
        initialize_database(&conn).await?;
        drop(conn);

        let database = Arc::new(DatabaseImpl::new_from_pool(pool));
        let notifier: Arc<dyn Notifier> = Arc::new(Dispatcher::from_config(&config.notifications)?);
        let probes = Arc::new(ProbeRunner::from_config(&config.probe_config())?);

        Self::with_components(config, database, notifier, probes).await
    }

    /// Assemble an orchestrator around already built parts and register its jobs
    pub async fn with_components(
        config: Arc<Config>,
        database: Arc<DatabaseImpl>,
        notifier: Arc<dyn Notifier>,
        probes: Arc<ProbeRunner>,
    ) -> Result<Self> {
        let runner = JobRunner::new(config.runner_config());
        let incidents = Arc::new(IncidentCoordinator::new(
            database.clone(),
            notifier.clone(),
            config.incident_config(),
        ));

        let uptime =
            UptimeMonitorJob::new(database.clone(), database.clone(), probes.clone(), incidents)
                .with_policy(config.probes.down_policy)
                .enabled(config.jobs.uptime_enabled);
        runner.schedule(Arc::new(uptime), &config.jobs.uptime_schedule).await?;

        let certificates = CertificateMonitorJob::new(
            database.clone(),
            database.clone(),
            probes,
            notifier,
            config.probes.certificate_threshold_days,
        )
        .notify_expiring(config.notifications.notify_certificate_expiry)
        .enabled(config.jobs.certificate_enabled);
        runner.schedule(Arc::new(certificates), &config.jobs.certificate_schedule).await?;

        let retention = RetentionJob::new(database.clone(), config.retention_policy())
            .enabled(config.retention.enabled);
        runner.schedule(Arc::new(retention), &config.retention.schedule).await?;

        Ok(Self { config, database, runner })
    }

    pub fn runner(&self) -> &Arc<JobRunner> {
        &self.runner
    }

    /// Run the orchestrator until `shutdown` resolves.
    ///
    /// Returns the status of every job after in-flight work was drained.
    pub async fn run(&self, shutdown: impl Future<Output = ()>) -> Result<Vec<JobStatus>> {
        let targets = self.database.list_active().await?;
        info!(
            targets = targets.len(),
            workers = self.config.scheduler.workers,
            "Starting Vigil orchestrator..."
        );
        if targets.is_empty() {
            warn!("No active targets, add one with `vigil-service add-target`");
        }

        let runner = self.runner();
        runner.start().await;
        shutdown.await;

        info!("Shutdown requested, draining in-flight jobs");
        runner.shutdown().await;

        let statuses = runner.statuses().await;
        report(&statuses);
        Ok(statuses)
    }
}

fn report(statuses: &[JobStatus]) {
    for status in statuses {
        info!(
            job = %status.name,
            runs = status.execution_count,
            skipped = status.skipped_count,
            last_success = ?status.last_success,
            last_failure = ?status.last_failure,
            last_error = status.last_error.as_deref().unwrap_or("-"),
            "Final job status"
        );
    }
}

/// Resolves on Ctrl-C, or SIGTERM on unix
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
