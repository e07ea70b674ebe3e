//! Persistence and notification contracts the engine depends on.
//!
//! Implementations live outside this crate; the engine only ever talks to
//! these traits.

use std::collections::HashMap;
use std::fmt;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::types::{IncidentId, ProbeStatus, Target, TargetId, TlsProbeResult, UptimeProbeResult};

#[async_trait]
pub trait TargetRepository: Send + Sync {
    /// All targets that should be probed
    async fn list_active(&self) -> Result<Vec<Target>>;

    /// Record the latest observed status of a target
    async fn update_status(&self, target_id: TargetId, status: ProbeStatus) -> Result<()>;
}

#[async_trait]
pub trait UptimeResultRepository: Send + Sync {
    async fn save(&self, result: &UptimeProbeResult) -> Result<()>;
}

#[async_trait]
pub trait TlsResultRepository: Send + Sync {
    async fn save(&self, result: &TlsProbeResult) -> Result<()>;
}

#[async_trait]
pub trait IncidentRepository: Send + Sync {
    /// The open incident for `target_id`, if any
    async fn find_open(&self, target_id: TargetId) -> Result<Option<IncidentId>>;

    /// Open an incident for `target_id`.
    ///
    /// Must be an atomic check-and-create: when an incident is already open
    /// for the target, return its id instead of creating a second one.
    async fn open(&self, target_id: TargetId, error_message: Option<&str>) -> Result<IncidentId>;

    async fn resolve(&self, incident_id: IncidentId) -> Result<()>;
}

/// Kinds of events handed to notification dispatch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationEvent {
    Down,
    Recovered,
    CertificateExpiring,
}

impl fmt::Display for NotificationEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NotificationEvent::Down => write!(f, "down"),
            NotificationEvent::Recovered => write!(f, "recovered"),
            NotificationEvent::CertificateExpiring => write!(f, "certificate_expiring"),
        }
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(
        &self,
        event: NotificationEvent,
        target_id: TargetId,
        variables: HashMap<String, String>,
    ) -> Result<()>;
}
