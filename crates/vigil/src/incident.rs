//! Turns probe observations into incident transitions.
//!
//! A target has at most one open incident at a time. A down observation opens
//! one only if none is open; an up observation resolves the open one. Every
//! other combination leaves state untouched, so a sustained outage alerts
//! once.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::repository::{IncidentRepository, NotificationEvent, Notifier};
use crate::types::{IncidentId, ProbeStatus, Target, TargetId, UptimeProbeResult};

/// What should happen to a target's incident state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Down with nothing open: open an incident and notify
    Open,
    /// Down while already open: nothing to do
    StillOpen(IncidentId),
    /// Up while open: resolve it
    Resolve(IncidentId),
    /// Up with nothing open
    NoOp,
}

/// Decide the transition for one observation
pub fn decide(status: ProbeStatus, open_incident: Option<IncidentId>) -> Transition {
    match (status, open_incident) {
        (ProbeStatus::Down, None) => Transition::Open,
        (ProbeStatus::Down, Some(id)) => Transition::StillOpen(id),
        (ProbeStatus::Up, Some(id)) => Transition::Resolve(id),
        (ProbeStatus::Up, None) => Transition::NoOp,
    }
}

/// Outcome of applying one observation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IncidentOutcome {
    Opened(IncidentId),
    Unchanged,
    Resolved(IncidentId),
}

#[derive(Debug, Clone)]
pub struct IncidentConfig {
    pub notify_on_recovery: bool,
}

impl Default for IncidentConfig {
    fn default() -> Self {
        Self { notify_on_recovery: true }
    }
}

pub struct IncidentCoordinator {
    incidents: Arc<dyn IncidentRepository>,
    notifier: Arc<dyn Notifier>,
    config: IncidentConfig,
    /// Serializes lookup-then-open per target across concurrent cycles.
    /// Entries live only while an observation for the target is in progress.
    locks: Mutex<HashMap<TargetId, Arc<Mutex<()>>>>,
}

impl IncidentCoordinator {
    pub fn new(
        incidents: Arc<dyn IncidentRepository>,
        notifier: Arc<dyn Notifier>,
        config: IncidentConfig,
    ) -> Self {
        Self { incidents, notifier, config, locks: Mutex::new(HashMap::new()) }
    }

    async fn target_lock(&self, target_id: TargetId) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        Arc::clone(locks.entry(target_id).or_default())
    }

    /// Drop the target's entry once no other observation holds or awaits it
    async fn release_lock(&self, target_id: TargetId, lock: Arc<Mutex<()>>) {
        let mut locks = self.locks.lock().await;
        if Arc::strong_count(&lock) == 2 {
            locks.remove(&target_id);
        }
    }

    /// Number of targets with an observation in progress
    pub async fn tracked_targets(&self) -> usize {
        self.locks.lock().await.len()
    }

    /// Apply one probe observation for `target`.
    ///
    /// Notification failures are logged and do not undo the transition.
    pub async fn observe(
        &self,
        target: &Target,
        result: &UptimeProbeResult,
    ) -> Result<IncidentOutcome> {
        let lock = self.target_lock(target.id).await;
        let outcome = {
            let _guard = lock.lock().await;
            self.apply(target, result).await
        };
        self.release_lock(target.id, lock).await;
        outcome
    }

    async fn apply(&self, target: &Target, result: &UptimeProbeResult) -> Result<IncidentOutcome> {
        let open = self.incidents.find_open(target.id).await?;
        match decide(result.status, open) {
            Transition::Open => {
                let error = result.error_message.as_deref();
                let incident_id = self.incidents.open(target.id, error).await?;
                warn!(
                    target_id = %target.id,
                    incident = incident_id,
                    "Target is down, opened incident: {}",
                    error.unwrap_or("no error message")
                );

                let mut variables = base_variables(target, incident_id);
                variables.insert("error".into(), error.unwrap_or_default().to_string());
                variables.insert("opened_at".into(), result.timestamp.to_rfc3339());
                self.send(NotificationEvent::Down, target, variables).await;

                Ok(IncidentOutcome::Opened(incident_id))
            }
            Transition::Resolve(incident_id) => {
                self.incidents.resolve(incident_id).await?;
                info!(target_id = %target.id, incident = incident_id, "Target recovered, resolved incident");

                if self.config.notify_on_recovery {
                    let mut variables = base_variables(target, incident_id);
                    variables.insert("resolved_at".into(), Utc::now().to_rfc3339());
                    if let Some(code) = result.status_code {
                        variables.insert("status_code".into(), code.to_string());
                    }
                    self.send(NotificationEvent::Recovered, target, variables).await;
                }

                Ok(IncidentOutcome::Resolved(incident_id))
            }
            Transition::StillOpen(_) | Transition::NoOp => Ok(IncidentOutcome::Unchanged),
        }
    }

    async fn send(
        &self,
        event: NotificationEvent,
        target: &Target,
        variables: HashMap<String, String>,
    ) {
        if let Err(e) = self.notifier.notify(event, target.id, variables).await {
            warn!(target_id = %target.id, %event, "Failed to dispatch notification: {:#}", e);
        }
    }
}

fn base_variables(target: &Target, incident_id: IncidentId) -> HashMap<String, String> {
    HashMap::from([
        ("target_id".to_string(), target.id.to_string()),
        ("target_name".to_string(), target.name.clone()),
        ("url".to_string(), target.url.clone()),
        ("incident_id".to_string(), incident_id.to_string()),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct MemoryIncidents {
        next_id: StdMutex<IncidentId>,
        open: StdMutex<HashMap<TargetId, IncidentId>>,
        log: StdMutex<Vec<String>>,
    }

    #[async_trait]
    impl IncidentRepository for MemoryIncidents {
        async fn find_open(&self, target_id: TargetId) -> Result<Option<IncidentId>> {
            Ok(self.open.lock().unwrap().get(&target_id).copied())
        }

        async fn open(&self, target_id: TargetId, _error: Option<&str>) -> Result<IncidentId> {
            let mut open = self.open.lock().unwrap();
            if let Some(id) = open.get(&target_id) {
                return Ok(*id);
            }
            let mut next_id = self.next_id.lock().unwrap();
            *next_id += 1;
            open.insert(target_id, *next_id);
            self.log.lock().unwrap().push(format!("open {next_id}"));
            Ok(*next_id)
        }

        async fn resolve(&self, incident_id: IncidentId) -> Result<()> {
            self.open.lock().unwrap().retain(|_, id| *id != incident_id);
            self.log.lock().unwrap().push(format!("resolve {incident_id}"));
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingNotifier {
        fail: bool,
        events: StdMutex<Vec<(NotificationEvent, TargetId)>>,
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn notify(
            &self,
            event: NotificationEvent,
            target_id: TargetId,
            _variables: HashMap<String, String>,
        ) -> Result<()> {
            self.events.lock().unwrap().push((event, target_id));
            if self.fail { Err(anyhow!("smtp unavailable")) } else { Ok(()) }
        }
    }

    fn coordinator(
        notifier: Arc<RecordingNotifier>,
    ) -> (IncidentCoordinator, Arc<MemoryIncidents>) {
        let incidents = Arc::new(MemoryIncidents::default());
        let coordinator =
            IncidentCoordinator::new(incidents.clone(), notifier, IncidentConfig::default());
        (coordinator, incidents)
    }

    #[test]
    fn test_decide_table() {
        assert_eq!(decide(ProbeStatus::Down, None), Transition::Open);
        assert_eq!(decide(ProbeStatus::Down, Some(4)), Transition::StillOpen(4));
        assert_eq!(decide(ProbeStatus::Up, Some(4)), Transition::Resolve(4));
        assert_eq!(decide(ProbeStatus::Up, None), Transition::NoOp);
    }

    #[tokio::test]
    async fn test_sustained_outage_opens_one_incident() {
        let notifier = Arc::new(RecordingNotifier::default());
        let (coordinator, incidents) = coordinator(notifier.clone());
        let target = Target::new("api", "https://api.example.com");

        for _ in 0..5 {
            let down = UptimeProbeResult::down(target.id, "connection refused");
            coordinator.observe(&target, &down).await.unwrap();
        }

        assert_eq!(*incidents.log.lock().unwrap(), vec!["open 1".to_string()]);
        assert_eq!(*notifier.events.lock().unwrap(), vec![(NotificationEvent::Down, target.id)]);
    }

    #[tokio::test]
    async fn test_down_then_up_opens_then_resolves() {
        let notifier = Arc::new(RecordingNotifier::default());
        let (coordinator, incidents) = coordinator(notifier.clone());
        let target = Target::new("api", "https://api.example.com");

        let opened = coordinator
            .observe(&target, &UptimeProbeResult::down(target.id, "timeout"))
            .await
            .unwrap();
        let resolved =
            coordinator.observe(&target, &UptimeProbeResult::up(target.id, 12, 200)).await.unwrap();
        let after = coordinator
            .observe(&target, &UptimeProbeResult::up(target.id, 10, 200))
            .await
            .unwrap();

        assert_eq!(opened, IncidentOutcome::Opened(1));
        assert_eq!(resolved, IncidentOutcome::Resolved(1));
        assert_eq!(after, IncidentOutcome::Unchanged);
        assert_eq!(
            *incidents.log.lock().unwrap(),
            vec!["open 1".to_string(), "resolve 1".to_string()]
        );
        assert_eq!(
            *notifier.events.lock().unwrap(),
            vec![(NotificationEvent::Down, target.id), (NotificationEvent::Recovered, target.id)]
        );
    }

    #[tokio::test]
    async fn test_recovery_notification_can_be_disabled() {
        let notifier = Arc::new(RecordingNotifier::default());
        let incidents = Arc::new(MemoryIncidents::default());
        let coordinator = IncidentCoordinator::new(
            incidents,
            notifier.clone(),
            IncidentConfig { notify_on_recovery: false },
        );
        let target = Target::new("web", "http://web.example.com");

        coordinator.observe(&target, &UptimeProbeResult::down(target.id, "dns")).await.unwrap();
        coordinator.observe(&target, &UptimeProbeResult::up(target.id, 5, 200)).await.unwrap();

        assert_eq!(*notifier.events.lock().unwrap(), vec![(NotificationEvent::Down, target.id)]);
    }

    #[tokio::test]
    async fn test_notifier_failure_keeps_incident_open() {
        let notifier = Arc::new(RecordingNotifier { fail: true, ..Default::default() });
        let (coordinator, incidents) = coordinator(notifier);
        let target = Target::new("api", "https://api.example.com");

        let outcome = coordinator
            .observe(&target, &UptimeProbeResult::down(target.id, "timeout"))
            .await
            .unwrap();

        assert_eq!(outcome, IncidentOutcome::Opened(1));
        assert_eq!(incidents.find_open(target.id).await.unwrap(), Some(1));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_down_observations_open_once() {
        let notifier = Arc::new(RecordingNotifier::default());
        let (coordinator, incidents) = coordinator(notifier.clone());
        let coordinator = Arc::new(coordinator);
        let target = Target::new("api", "https://api.example.com");

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let coordinator = Arc::clone(&coordinator);
                let target = target.clone();
                tokio::spawn(async move {
                    let down = UptimeProbeResult::down(target.id, "timeout");
                    coordinator.observe(&target, &down).await.unwrap()
                })
            })
            .collect();

        let mut opened = 0;
        for handle in handles {
            if matches!(handle.await.unwrap(), IncidentOutcome::Opened(_)) {
                opened += 1;
            }
        }

        assert_eq!(opened, 1);
        assert_eq!(incidents.log.lock().unwrap().len(), 1);
        assert_eq!(notifier.events.lock().unwrap().len(), 1);
        assert_eq!(coordinator.tracked_targets().await, 0);
    }

    #[tokio::test]
    async fn test_lock_entries_do_not_outlive_observations() {
        let notifier = Arc::new(RecordingNotifier::default());
        let (coordinator, _incidents) = coordinator(notifier);

        for i in 0..20 {
            let target = Target::new(format!("svc-{i}"), "https://svc.example.com");
            let down = UptimeProbeResult::down(target.id, "timeout");
            coordinator.observe(&target, &down).await.unwrap();
        }

        assert_eq!(coordinator.tracked_targets().await, 0);
    }
}
