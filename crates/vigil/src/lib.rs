//! Vigil - scheduled availability and certificate monitoring
//!
//! This library holds the engine: minute-granularity schedules, a job runner
//! with a bounded worker pool, uptime and TLS probes, and the incident state
//! machine. Persistence and notification delivery are supplied by the caller
//! through the traits in [`repository`].

pub mod incident;
pub mod job;
pub mod monitor;
pub mod probe;
pub mod repository;
pub mod runner;
pub mod schedule;
pub mod types;

// Re-export main types
pub use incident::{IncidentConfig, IncidentCoordinator, IncidentOutcome, Transition, decide};
pub use job::{Job, JobStatus, ScheduledJob};
pub use monitor::{CertificateMonitorJob, DownPolicy, UptimeMonitorJob};
pub use probe::{CertificateProbe, HttpProbe, ProbeConfig, ProbeError, ProbeRunner, TlsProbe, UptimeProbe};
pub use repository::{
    IncidentRepository, NotificationEvent, Notifier, TargetRepository, TlsResultRepository,
    UptimeResultRepository,
};
pub use runner::{JobRunner, OverlapPolicy, RunnerConfig};
pub use schedule::{MinuteField, Schedule, ScheduleError};
pub use types::{Incident, IncidentId, ProbeStatus, Target, TargetId, TlsProbeResult, UptimeProbeResult};

/// Default worker pool size
pub const DEFAULT_WORKERS: usize = 5;

/// Default certificate expiry warning threshold, in days
pub const DEFAULT_CERTIFICATE_THRESHOLD_DAYS: i64 = 30;
