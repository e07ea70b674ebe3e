use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use vigil::{IncidentId, ProbeStatus, Target};

/// A stored target together with what the monitors last saw of it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetRecord {
    pub target: Target,
    pub status: Option<ProbeStatus>,
    pub last_checked_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub open_incident: Option<IncidentId>,
}

/// Rows removed by one retention pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PruneCounts {
    pub uptime_results: u64,
    pub tls_results: u64,
    pub incidents: u64,
}

impl PruneCounts {
    pub fn total(&self) -> u64 {
        self.uptime_results + self.tls_results + self.incidents
    }
}

/// Convert a timestamp to Unix seconds
pub fn timestamp_to_i64(time: DateTime<Utc>) -> i64 {
    time.timestamp()
}

/// Convert Unix seconds to a timestamp, clamping values chrono cannot represent
pub fn i64_to_timestamp(timestamp: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(timestamp, 0).unwrap_or(DateTime::UNIX_EPOCH)
}
