use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifier of a monitored target
pub type TargetId = Uuid;

/// Identifier of a persisted incident
pub type IncidentId = i64;

/// A service reachable over the network that Vigil keeps an eye on
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    pub id: TargetId,
    pub name: String,
    pub url: String,
    pub active: bool,
}

impl Target {
    /// Create a new active target with a fresh id
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self { id: Uuid::new_v4(), name: name.into(), url: url.into(), active: true }
    }
}

/// Availability of a target as seen by one uptime probe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeStatus {
    Up,
    Down,
}

impl std::fmt::Display for ProbeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProbeStatus::Up => write!(f, "up"),
            ProbeStatus::Down => write!(f, "down"),
        }
    }
}

impl std::str::FromStr for ProbeStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "up" => Ok(ProbeStatus::Up),
            "down" => Ok(ProbeStatus::Down),
            other => Err(format!("unknown probe status: {other}")),
        }
    }
}

/// Result of an uptime probe
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UptimeProbeResult {
    /// Target that was probed
    pub target_id: TargetId,

    /// When the probe started
    pub timestamp: DateTime<Utc>,

    /// Up when any response arrived within the timeout
    pub status: ProbeStatus,

    /// Response time in milliseconds, only set when up
    pub response_time_ms: Option<u64>,

    /// HTTP status code of the response, if one was received
    pub status_code: Option<u16>,

    /// Why the target could not be reached
    pub error_message: Option<String>,
}

impl UptimeProbeResult {
    /// Target answered within the timeout
    pub fn up(target_id: TargetId, response_time_ms: u64, status_code: u16) -> Self {
        Self {
            target_id,
            timestamp: Utc::now(),
            status: ProbeStatus::Up,
            response_time_ms: Some(response_time_ms),
            status_code: Some(status_code),
            error_message: None,
        }
    }

    /// Target could not be reached
    pub fn down(target_id: TargetId, error: impl Into<String>) -> Self {
        Self {
            target_id,
            timestamp: Utc::now(),
            status: ProbeStatus::Down,
            response_time_ms: None,
            status_code: None,
            error_message: Some(error.into()),
        }
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn is_up(&self) -> bool {
        self.status == ProbeStatus::Up
    }
}

/// Result of a TLS certificate probe
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsProbeResult {
    pub target_id: TargetId,
    pub timestamp: DateTime<Utc>,

    /// Whole days until the leaf certificate expires, negative once expired
    pub days_remaining: Option<i64>,

    /// Expiry instant of the leaf certificate
    pub expires_at: Option<DateTime<Utc>>,

    /// Handshake or parse failure
    pub error: Option<String>,
}

impl TlsProbeResult {
    pub fn expiring(target_id: TargetId, expires_at: DateTime<Utc>, now: DateTime<Utc>) -> Self {
        Self {
            target_id,
            timestamp: now,
            days_remaining: Some(days_until(expires_at, now)),
            expires_at: Some(expires_at),
            error: None,
        }
    }

    pub fn failed(target_id: TargetId, error: impl Into<String>) -> Self {
        Self {
            target_id,
            timestamp: Utc::now(),
            days_remaining: None,
            expires_at: None,
            error: Some(error.into()),
        }
    }

    /// Soft expiry signal: the certificate is still valid but expires within
    /// `threshold_days`. Expired certificates and failed probes never match.
    pub fn within_threshold(&self, threshold_days: i64) -> bool {
        self.days_remaining.is_some_and(|days| days >= 0 && days < threshold_days)
    }
}

/// Whole days between `now` and `expires_at`, truncated toward zero
pub fn days_until(expires_at: DateTime<Utc>, now: DateTime<Utc>) -> i64 {
    (expires_at - now).num_days()
}

/// A continuous period during which a target was observed down
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Incident {
    pub id: IncidentId,
    pub target_id: TargetId,
    pub opened_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl Incident {
    pub fn is_open(&self) -> bool {
        self.resolved_at.is_none()
    }
}
