//! Shared fixtures: in-memory repositories and throwaway HTTP servers
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use chrono::{DateTime, Datelike, NaiveTime, Utc};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use rustls::ServerConfig;
use rustls::crypto::ring;
use rustls::pki_types::{PrivateKeyDer, PrivatePkcs8KeyDer};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use vigil::{
    HttpProbe, Incident, IncidentId, IncidentRepository, NotificationEvent, Notifier, ProbeRunner,
    ProbeStatus, Target, TargetId, TargetRepository, TlsProbe, TlsProbeResult,
    TlsResultRepository, UptimeProbeResult, UptimeResultRepository,
};

#[derive(Default)]
pub struct MemoryStore {
    pub targets: Mutex<Vec<Target>>,
    pub statuses: Mutex<HashMap<TargetId, ProbeStatus>>,
    pub uptime_results: Mutex<Vec<UptimeProbeResult>>,
    pub tls_results: Mutex<Vec<TlsProbeResult>>,
    pub incidents: Mutex<Vec<Incident>>,
    pub fail_saves: AtomicBool,
}

impl MemoryStore {
    pub fn with_targets(targets: Vec<Target>) -> Arc<Self> {
        Arc::new(Self { targets: Mutex::new(targets), ..Default::default() })
    }

    pub fn incidents_for(&self, target_id: TargetId) -> Vec<Incident> {
        self.incidents.lock().unwrap().iter().filter(|i| i.target_id == target_id).cloned().collect()
    }

    pub fn set_url(&self, target_id: TargetId, url: &str) {
        for target in self.targets.lock().unwrap().iter_mut() {
            if target.id == target_id {
                target.url = url.to_string();
            }
        }
    }
}

#[async_trait]
impl TargetRepository for MemoryStore {
    async fn list_active(&self) -> Result<Vec<Target>> {
        Ok(self.targets.lock().unwrap().iter().filter(|t| t.active).cloned().collect())
    }

    async fn update_status(&self, target_id: TargetId, status: ProbeStatus) -> Result<()> {
        self.statuses.lock().unwrap().insert(target_id, status);
        Ok(())
    }
}

#[async_trait]
impl UptimeResultRepository for MemoryStore {
    async fn save(&self, result: &UptimeProbeResult) -> Result<()> {
        if self.fail_saves.load(Ordering::SeqCst) {
            return Err(anyhow!("database is locked"));
        }
        self.uptime_results.lock().unwrap().push(result.clone());
        Ok(())
    }
}

#[async_trait]
impl TlsResultRepository for MemoryStore {
    async fn save(&self, result: &TlsProbeResult) -> Result<()> {
        if self.fail_saves.load(Ordering::SeqCst) {
            return Err(anyhow!("database is locked"));
        }
        self.tls_results.lock().unwrap().push(result.clone());
        Ok(())
    }
}

#[async_trait]
impl IncidentRepository for MemoryStore {
    async fn find_open(&self, target_id: TargetId) -> Result<Option<IncidentId>> {
        let incidents = self.incidents.lock().unwrap();
        Ok(incidents.iter().find(|i| i.target_id == target_id && i.is_open()).map(|i| i.id))
    }

    async fn open(&self, target_id: TargetId, error_message: Option<&str>) -> Result<IncidentId> {
        let mut incidents = self.incidents.lock().unwrap();
        if let Some(open) = incidents.iter().find(|i| i.target_id == target_id && i.is_open()) {
            return Ok(open.id);
        }

        let id = incidents.len() as IncidentId + 1;
        incidents.push(Incident {
            id,
            target_id,
            opened_at: Utc::now(),
            resolved_at: None,
            last_error: error_message.map(str::to_string),
        });
        Ok(id)
    }

    async fn resolve(&self, incident_id: IncidentId) -> Result<()> {
        let mut incidents = self.incidents.lock().unwrap();
        let incident = incidents
            .iter_mut()
            .find(|i| i.id == incident_id)
            .ok_or_else(|| anyhow!("no incident {incident_id}"))?;
        incident.resolved_at = Some(Utc::now());
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    pub events: Mutex<Vec<(NotificationEvent, TargetId, HashMap<String, String>)>>,
}

impl RecordingNotifier {
    pub fn events_for(&self, target_id: TargetId) -> Vec<NotificationEvent> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, id, _)| *id == target_id)
            .map(|(event, _, _)| *event)
            .collect()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(
        &self,
        event: NotificationEvent,
        target_id: TargetId,
        variables: HashMap<String, String>,
    ) -> Result<()> {
        self.events.lock().unwrap().push((event, target_id, variables));
        Ok(())
    }
}

pub const PROBE_TIMEOUT: Duration = Duration::from_millis(300);

/// Probe runner that talks to local stubs directly, whatever the proxy env says
pub fn local_probe_runner() -> Arc<ProbeRunner> {
    let client = reqwest::Client::builder()
        .timeout(PROBE_TIMEOUT)
        .redirect(reqwest::redirect::Policy::none())
        .no_proxy()
        .build()
        .unwrap();
    Arc::new(ProbeRunner::new(
        Arc::new(HttpProbe::with_client(client)),
        Arc::new(TlsProbe::new(PROBE_TIMEOUT).unwrap()),
    ))
}

/// Server answering every request with `status`; returns its base URL
pub async fn serve_status(status: u16) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = [0u8; 2048];
                let _ = socket.read(&mut buf).await;
                let response = format!(
                    "HTTP/1.1 {status} Stub\r\ncontent-length: 0\r\nconnection: close\r\n\r\n"
                );
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            });
        }
    });

    format!("http://{addr}/")
}

/// Server answering every request with `302 Found` to `location`
pub async fn serve_redirect(location: String) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            let location = location.clone();
            tokio::spawn(async move {
                let mut buf = [0u8; 2048];
                let _ = socket.read(&mut buf).await;
                let response = format!(
                    "HTTP/1.1 302 Found\r\nlocation: {location}\r\ncontent-length: 0\r\nconnection: close\r\n\r\n"
                );
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            });
        }
    });

    format!("http://{addr}/")
}

/// Server that accepts connections and never answers
pub async fn serve_silence() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(30)).await;
                drop(socket);
            });
        }
    });

    format!("http://{addr}/")
}

/// URL of a local port nothing listens on
pub async fn refused_url() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("http://{addr}/")
}

/// TLS server presenting a self-signed certificate that expires at midnight
/// UTC on the date of `not_after`. Returns its https URL and the exact expiry.
pub async fn serve_certificate(not_after: DateTime<Utc>) -> (String, DateTime<Utc>) {
    let date = not_after.date_naive();
    let expires_at = date.and_time(NaiveTime::MIN).and_utc();

    let mut params = rcgen::CertificateParams::new(vec!["localhost".to_string()]).unwrap();
    let today = Utc::now().date_naive();
    params.not_before = rcgen::date_time_ymd(today.year() - 1, 1, 1);
    params.not_after = rcgen::date_time_ymd(date.year(), date.month() as u8, date.day() as u8);
    let key_pair = rcgen::KeyPair::generate().unwrap();
    let certificate = params.self_signed(&key_pair).unwrap();

    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_pair.serialize_der()));
    let config = ServerConfig::builder_with_provider(Arc::new(ring::default_provider()))
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_no_client_auth()
        .with_single_cert(vec![certificate.der().clone()], key)
        .unwrap();
    let acceptor = TlsAcceptor::from(Arc::new(config));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            let acceptor = acceptor.clone();
            tokio::spawn(async move {
                if let Ok(mut stream) = acceptor.accept(socket).await {
                    let _ = stream.shutdown().await;
                }
            });
        }
    });

    (format!("https://{addr}/"), expires_at)
}
