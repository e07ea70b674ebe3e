use anyhow::{Result, anyhow};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Row, TransactionBehavior, params};
use uuid::Uuid;
use vigil::{
    Incident, IncidentId, IncidentRepository, ProbeStatus, Target, TargetId, TargetRepository,
    TlsProbeResult, TlsResultRepository, UptimeProbeResult, UptimeResultRepository,
};

use super::models::{PruneCounts, TargetRecord, i64_to_timestamp, timestamp_to_i64};
use crate::pool::{LibsqlManager, LibsqlPool};

/// LibSQL database implementation
pub struct DatabaseImpl {
    pool: LibsqlPool,
}

impl DatabaseImpl {
    /// Create a new database instance from a pool
    pub fn new_from_pool(pool: LibsqlPool) -> Self {
        Self { pool }
    }

    /// Get a connection from the pool
    async fn get_conn(&self) -> Result<deadpool::managed::Object<LibsqlManager>> {
        Ok(self.pool.get().await?)
    }

    pub async fn add_target(&self, target: &Target) -> Result<()> {
        let conn = self.get_conn().await?;
        conn.execute(
            "INSERT INTO targets (id, name, url, active, created_at) VALUES (?, ?, ?, ?, ?)",
            params![
                target.id.to_string(),
                target.name.clone(),
                target.url.clone(),
                if target.active { 1 } else { 0 },
                timestamp_to_i64(Utc::now())
            ],
        )
        .await?;
        Ok(())
    }

    /// Every target with its last status and open incident, oldest first
    pub async fn list_targets(&self) -> Result<Vec<TargetRecord>> {
        let conn = self.get_conn().await?;
        let mut rows = conn
            .query(
                "SELECT t.id, t.name, t.url, t.active, t.status, t.last_checked_at, t.created_at, i.id
                 FROM targets t
                 LEFT JOIN incidents i ON i.target_id = t.id AND i.resolved_at IS NULL
                 ORDER BY t.created_at, t.name",
                (),
            )
            .await?;

        let mut records = Vec::new();
        while let Some(row) = rows.next().await? {
            let status = match row.get::<Option<String>>(4)? {
                Some(raw) => Some(raw.parse::<ProbeStatus>().map_err(|e| anyhow!(e))?),
                None => None,
            };

            records.push(TargetRecord {
                target: target_from_row(&row)?,
                status,
                last_checked_at: row.get::<Option<i64>>(5)?.map(i64_to_timestamp),
                created_at: i64_to_timestamp(row.get(6)?),
                open_incident: row.get(7)?,
            });
        }

        Ok(records)
    }

    /// Returns false when no target has that id
    pub async fn set_active(&self, target_id: TargetId, active: bool) -> Result<bool> {
        let conn = self.get_conn().await?;
        let changed = conn
            .execute(
                "UPDATE targets SET active = ? WHERE id = ?",
                params![if active { 1 } else { 0 }, target_id.to_string()],
            )
            .await?;
        Ok(changed > 0)
    }

    /// Delete a target; its results and incidents go with it via ON DELETE CASCADE
    pub async fn remove_target(&self, target_id: TargetId) -> Result<bool> {
        let conn = self.get_conn().await?;
        let changed =
            conn.execute("DELETE FROM targets WHERE id = ?", params![target_id.to_string()]).await?;
        Ok(changed > 0)
    }

    pub async fn incidents_for(&self, target_id: TargetId, limit: usize) -> Result<Vec<Incident>> {
        let conn = self.get_conn().await?;
        let mut rows = conn
            .query(
                "SELECT id, target_id, opened_at, resolved_at, last_error FROM incidents
                 WHERE target_id = ? ORDER BY opened_at DESC, id DESC LIMIT ?",
                params![target_id.to_string(), limit as i64],
            )
            .await?;

        let mut incidents = Vec::new();
        while let Some(row) = rows.next().await? {
            let target_id: String = row.get(1)?;
            incidents.push(Incident {
                id: row.get(0)?,
                target_id: Uuid::parse_str(&target_id)?,
                opened_at: i64_to_timestamp(row.get(2)?),
                resolved_at: row.get::<Option<i64>>(3)?.map(i64_to_timestamp),
                last_error: row.get(4)?,
            });
        }

        Ok(incidents)
    }

    pub async fn recent_uptime_results(
        &self,
        target_id: TargetId,
        limit: usize,
    ) -> Result<Vec<UptimeProbeResult>> {
        let conn = self.get_conn().await?;
        let mut rows = conn
            .query(
                "SELECT timestamp, status, response_time_ms, status_code, error_message FROM uptime_results
                 WHERE target_id = ? ORDER BY timestamp DESC, id DESC LIMIT ?",
                params![target_id.to_string(), limit as i64],
            )
            .await?;

        let mut results = Vec::new();
        while let Some(row) = rows.next().await? {
            let status: String = row.get(1)?;
            results.push(UptimeProbeResult {
                target_id,
                timestamp: i64_to_timestamp(row.get(0)?),
                status: status.parse().map_err(|e: String| anyhow!(e))?,
                response_time_ms: row.get::<Option<i64>>(2)?.map(|v| v as u64),
                status_code: row.get::<Option<i64>>(3)?.map(|v| v as u16),
                error_message: row.get(4)?,
            });
        }

        Ok(results)
    }

    pub async fn recent_tls_results(
        &self,
        target_id: TargetId,
        limit: usize,
    ) -> Result<Vec<TlsProbeResult>> {
        let conn = self.get_conn().await?;
        let mut rows = conn
            .query(
                "SELECT timestamp, days_remaining, expires_at, error FROM tls_results
                 WHERE target_id = ? ORDER BY timestamp DESC, id DESC LIMIT ?",
                params![target_id.to_string(), limit as i64],
            )
            .await?;

        let mut results = Vec::new();
        while let Some(row) = rows.next().await? {
            results.push(TlsProbeResult {
                target_id,
                timestamp: i64_to_timestamp(row.get(0)?),
                days_remaining: row.get(1)?,
                expires_at: row.get::<Option<i64>>(2)?.map(i64_to_timestamp),
                error: row.get(3)?,
            });
        }

        Ok(results)
    }

    /// Delete results recorded before `results_before` and incidents resolved
    /// before `incidents_before`. Open incidents are kept regardless of age.
    pub async fn prune(
        &self,
        results_before: DateTime<Utc>,
        incidents_before: DateTime<Utc>,
    ) -> Result<PruneCounts> {
        let conn = self.get_conn().await?;
        let results_cutoff = timestamp_to_i64(results_before);

        let uptime_results = conn
            .execute("DELETE FROM uptime_results WHERE timestamp < ?", params![results_cutoff])
            .await?;
        let tls_results = conn
            .execute("DELETE FROM tls_results WHERE timestamp < ?", params![results_cutoff])
            .await?;
        let incidents = conn
            .execute(
                "DELETE FROM incidents WHERE resolved_at IS NOT NULL AND resolved_at < ?",
                params![timestamp_to_i64(incidents_before)],
            )
            .await?;

        Ok(PruneCounts { uptime_results, tls_results, incidents })
    }
}

fn target_from_row(row: &Row) -> Result<Target> {
    let id: String = row.get(0)?;
    Ok(Target {
        id: Uuid::parse_str(&id)?,
        name: row.get(1)?,
        url: row.get(2)?,
        active: row.get::<i64>(3)? != 0,
    })
}

async fn find_open_incident(conn: &Connection, target_id: TargetId) -> Result<Option<IncidentId>> {
    let mut rows = conn
        .query(
            "SELECT id FROM incidents WHERE target_id = ? AND resolved_at IS NULL LIMIT 1",
            params![target_id.to_string()],
        )
        .await?;

    match rows.next().await? {
        Some(row) => Ok(Some(row.get(0)?)),
        None => Ok(None),
    }
}

#[async_trait]
impl TargetRepository for DatabaseImpl {
    async fn list_active(&self) -> Result<Vec<Target>> {
        let conn = self.get_conn().await?;
        let mut rows = conn
            .query(
                "SELECT id, name, url, active FROM targets WHERE active = 1 ORDER BY created_at, name",
                (),
            )
            .await?;

        let mut targets = Vec::new();
        while let Some(row) = rows.next().await? {
            targets.push(target_from_row(&row)?);
        }

        Ok(targets)
    }

    async fn update_status(&self, target_id: TargetId, status: ProbeStatus) -> Result<()> {
        let conn = self.get_conn().await?;
        conn.execute(
            "UPDATE targets SET status = ?, last_checked_at = ? WHERE id = ?",
            params![status.to_string(), timestamp_to_i64(Utc::now()), target_id.to_string()],
        )
        .await?;
        Ok(())
    }
}

#[async_trait]
impl UptimeResultRepository for DatabaseImpl {
    async fn save(&self, result: &UptimeProbeResult) -> Result<()> {
        let conn = self.get_conn().await?;
        conn.execute(
            "INSERT INTO uptime_results (target_id, timestamp, status, response_time_ms, status_code, error_message) VALUES (?, ?, ?, ?, ?, ?)",
            params![
                result.target_id.to_string(),
                timestamp_to_i64(result.timestamp),
                result.status.to_string(),
                result.response_time_ms.map(|v| v as i64),
                result.status_code.map(|v| v as i64),
                result.error_message.clone()
            ],
        )
        .await?;
        Ok(())
    }
}

#[async_trait]
impl TlsResultRepository for DatabaseImpl {
    async fn save(&self, result: &TlsProbeResult) -> Result<()> {
        let conn = self.get_conn().await?;
        conn.execute(
            "INSERT INTO tls_results (target_id, timestamp, days_remaining, expires_at, error) VALUES (?, ?, ?, ?, ?)",
            params![
                result.target_id.to_string(),
                timestamp_to_i64(result.timestamp),
                result.days_remaining,
                result.expires_at.map(timestamp_to_i64),
                result.error.clone()
            ],
        )
        .await?;
        Ok(())
    }
}

#[async_trait]
impl IncidentRepository for DatabaseImpl {
    async fn find_open(&self, target_id: TargetId) -> Result<Option<IncidentId>> {
        let conn = self.get_conn().await?;
        find_open_incident(&conn, target_id).await
    }

    async fn open(&self, target_id: TargetId, error_message: Option<&str>) -> Result<IncidentId> {
        let conn = self.get_conn().await?;

        // IMMEDIATE takes the write lock up front, making lookup and insert one step
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate).await?;
        if let Some(existing) = find_open_incident(&tx, target_id).await? {
            tx.commit().await?;
            return Ok(existing);
        }

        tx.execute(
            "INSERT INTO incidents (target_id, opened_at, last_error) VALUES (?, ?, ?)",
            params![
                target_id.to_string(),
                timestamp_to_i64(Utc::now()),
                error_message.map(str::to_string)
            ],
        )
        .await?;
        let incident_id = tx.last_insert_rowid();
        tx.commit().await?;

        Ok(incident_id)
    }

    async fn resolve(&self, incident_id: IncidentId) -> Result<()> {
        let conn = self.get_conn().await?;
        conn.execute(
            "UPDATE incidents SET resolved_at = ? WHERE id = ? AND resolved_at IS NULL",
            params![timestamp_to_i64(Utc::now()), incident_id],
        )
        .await?;
        Ok(())
    }
}
