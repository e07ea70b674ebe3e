//! The jobs that actually monitor targets.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::incident::{IncidentCoordinator, IncidentOutcome};
use crate::job::Job;
use crate::probe::ProbeRunner;
use crate::repository::{
    NotificationEvent, Notifier, TargetRepository, TlsResultRepository, UptimeResultRepository,
};
use crate::types::{ProbeStatus, Target, UptimeProbeResult};

/// How an uptime result is turned into up or down for incident tracking
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownPolicy {
    /// Down only when no response was received
    #[default]
    Unreachable,
    /// Also down when the response status is 5xx
    ServerErrors,
}

impl DownPolicy {
    pub fn interpret(&self, result: &UptimeProbeResult) -> UptimeProbeResult {
        match (self, result.status_code) {
            (DownPolicy::ServerErrors, Some(code)) if (500..600).contains(&code) => {
                UptimeProbeResult {
                    status: ProbeStatus::Down,
                    error_message: Some(format!("server responded with status {code}")),
                    ..result.clone()
                }
            }
            _ => result.clone(),
        }
    }
}

/// Probes every active target and feeds the results to incident tracking
pub struct UptimeMonitorJob {
    targets: Arc<dyn TargetRepository>,
    results: Arc<dyn UptimeResultRepository>,
    probes: Arc<ProbeRunner>,
    incidents: Arc<IncidentCoordinator>,
    policy: DownPolicy,
    enabled: bool,
}

impl UptimeMonitorJob {
    pub fn new(
        targets: Arc<dyn TargetRepository>,
        results: Arc<dyn UptimeResultRepository>,
        probes: Arc<ProbeRunner>,
        incidents: Arc<IncidentCoordinator>,
    ) -> Self {
        Self { targets, results, probes, incidents, policy: DownPolicy::default(), enabled: true }
    }

    pub fn with_policy(mut self, policy: DownPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    async fn record(&self, target: &Target, raw: &UptimeProbeResult) -> Option<IncidentOutcome> {
        if let Err(e) = self.results.save(raw).await {
            warn!(target_id = %target.id, "Failed to save uptime result: {:#}", e);
        }

        let observed = self.policy.interpret(raw);
        if let Err(e) = self.targets.update_status(target.id, observed.status).await {
            warn!(target_id = %target.id, "Failed to update target status: {:#}", e);
        }

        match self.incidents.observe(target, &observed).await {
            Ok(outcome) => Some(outcome),
            Err(e) => {
                warn!(target_id = %target.id, "Incident evaluation failed: {:#}", e);
                None
            }
        }
    }
}

#[async_trait::async_trait]
impl Job for UptimeMonitorJob {
    fn name(&self) -> &str {
        "uptime-monitor"
    }

    fn description(&self) -> &str {
        "Checks that every active target answers over HTTP"
    }

    fn is_enabled(&self) -> bool {
        self.enabled
    }

    async fn execute(&self) -> Result<()> {
        let targets = self.targets.list_active().await.context("listing active targets")?;
        let results = self.probes.check_uptime_all(&targets).await;

        let mut up = 0;
        let mut opened = 0;
        let mut resolved = 0;

        for (target, result) in targets.iter().zip(&results) {
            if result.is_up() {
                up += 1;
            }
            match self.record(target, result).await {
                Some(IncidentOutcome::Opened(_)) => opened += 1,
                Some(IncidentOutcome::Resolved(_)) => resolved += 1,
                _ => {}
            }
        }

        info!(
            targets = targets.len(),
            up,
            down = targets.len() - up,
            incidents_opened = opened,
            incidents_resolved = resolved,
            "Uptime cycle finished"
        );
        Ok(())
    }
}

/// Checks certificate expiry of every active https target
pub struct CertificateMonitorJob {
    targets: Arc<dyn TargetRepository>,
    results: Arc<dyn TlsResultRepository>,
    probes: Arc<ProbeRunner>,
    notifier: Arc<dyn Notifier>,
    threshold_days: i64,
    notify_expiring: bool,
    enabled: bool,
}

impl CertificateMonitorJob {
    pub fn new(
        targets: Arc<dyn TargetRepository>,
        results: Arc<dyn TlsResultRepository>,
        probes: Arc<ProbeRunner>,
        notifier: Arc<dyn Notifier>,
        threshold_days: i64,
    ) -> Self {
        Self {
            targets,
            results,
            probes,
            notifier,
            threshold_days,
            notify_expiring: false,
            enabled: true,
        }
    }

    pub fn notify_expiring(mut self, notify: bool) -> Self {
        self.notify_expiring = notify;
        self
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }
}

#[async_trait::async_trait]
impl Job for CertificateMonitorJob {
    fn name(&self) -> &str {
        "certificate-monitor"
    }

    fn description(&self) -> &str {
        "Reports TLS certificates that are close to expiry"
    }

    fn is_enabled(&self) -> bool {
        self.enabled
    }

    async fn execute(&self) -> Result<()> {
        let targets = self.targets.list_active().await.context("listing active targets")?;
        let results = self.probes.check_certificates_all(&targets).await;
        let by_id: HashMap<_, _> = targets.iter().map(|target| (target.id, target)).collect();

        let mut expiring = 0;
        let mut failed = 0;

        for result in &results {
            if let Err(e) = self.results.save(result).await {
                warn!(target_id = %result.target_id, "Failed to save TLS result: {:#}", e);
            }

            if let Some(error) = &result.error {
                failed += 1;
                warn!(target_id = %result.target_id, "Certificate check failed: {}", error);
                continue;
            }

            if !result.within_threshold(self.threshold_days) {
                continue;
            }

            expiring += 1;
            let days = result.days_remaining.unwrap_or_default();
            warn!(
                target_id = %result.target_id,
                days_remaining = days,
                threshold_days = self.threshold_days,
                "Certificate expires soon"
            );

            if self.notify_expiring {
                let mut variables = HashMap::from([
                    ("target_id".to_string(), result.target_id.to_string()),
                    ("days_remaining".to_string(), days.to_string()),
                ]);
                if let Some(target) = by_id.get(&result.target_id) {
                    variables.insert("target_name".into(), target.name.clone());
                    variables.insert("url".into(), target.url.clone());
                }
                if let Some(expires_at) = result.expires_at {
                    variables.insert("expires_at".into(), expires_at.to_rfc3339());
                }

                if let Err(e) = self
                    .notifier
                    .notify(NotificationEvent::CertificateExpiring, result.target_id, variables)
                    .await
                {
                    warn!(target_id = %result.target_id, "Failed to dispatch notification: {:#}", e);
                }
            }
        }

        info!(checked = results.len(), expiring, failed, "Certificate cycle finished");
        Ok(())
    }
}
