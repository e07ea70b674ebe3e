//! Uptime and TLS certificate probes.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{CryptoProvider, ring, verify_tls12_signature, verify_tls13_signature};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, SignatureScheme};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tracing::debug;
use url::{Host, Url};

use crate::types::{Target, TlsProbeResult, UptimeProbeResult};

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("invalid target url: {0}")]
    InvalidUrl(#[from] url::ParseError),
    #[error("target url has no host")]
    MissingHost,
    #[error("invalid server name: {0}")]
    ServerName(String),
    #[error("connection failed: {0}")]
    Connect(#[source] std::io::Error),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("TLS handshake failed: {0}")]
    Handshake(#[source] std::io::Error),
    #[error("server presented no certificate")]
    NoCertificate,
    #[error("certificate could not be parsed: {0}")]
    Certificate(String),
    #[error("TLS client setup failed: {0}")]
    Tls(#[from] rustls::Error),
    #[error("HTTP client setup failed: {0}")]
    Client(#[from] reqwest::Error),
}

#[derive(Debug, Clone)]
pub struct ProbeConfig {
    pub http_timeout: Duration,
    pub tls_timeout: Duration,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self { http_timeout: Duration::from_secs(10), tls_timeout: Duration::from_secs(10) }
    }
}

/// Checks whether a target answers at all
#[async_trait]
pub trait UptimeProbe: Send + Sync {
    /// Never fails: unreachability is reported as a down result
    async fn check(&self, target: &Target) -> UptimeProbeResult;
}

/// Reads the expiry of a target's TLS certificate
#[async_trait]
pub trait CertificateProbe: Send + Sync {
    /// `None` when the target is not served over https
    async fn check(&self, target: &Target) -> Option<TlsProbeResult>;
}

/// HTTP GET liveness probe.
///
/// Any response inside the timeout counts as up, whatever its status code.
/// Only failing to get a response at all is down. Redirects are not followed,
/// so a 3xx is recorded as the target's own answer.
pub struct HttpProbe {
    client: reqwest::Client,
}

impl HttpProbe {
    pub fn new(timeout: Duration) -> Result<Self, ProbeError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        Ok(Self { client })
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl UptimeProbe for HttpProbe {
    async fn check(&self, target: &Target) -> UptimeProbeResult {
        let timestamp = Utc::now();
        let start = Instant::now();

        match self.client.get(&target.url).send().await {
            Ok(response) => {
                let latency = start.elapsed().as_millis() as u64;
                let status_code = response.status().as_u16();
                debug!(target_id = %target.id, status_code, latency_ms = latency, "Target answered");
                UptimeProbeResult::up(target.id, latency, status_code).at(timestamp)
            }
            Err(e) => {
                let error = describe_request_error(&e);
                debug!(target_id = %target.id, "Target unreachable: {}", error);
                UptimeProbeResult::down(target.id, error).at(timestamp)
            }
        }
    }
}

fn describe_request_error(error: &reqwest::Error) -> String {
    let kind = if error.is_timeout() {
        "request timed out"
    } else if error.is_connect() {
        "connection failed"
    } else {
        "request failed"
    };

    let mut message = format!("{kind}: {error}");
    let mut source = std::error::Error::source(error);
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

/// TLS certificate expiry probe.
///
/// The chain is deliberately not validated against any trust store so that
/// expired and soon-to-expire certificates can still be measured; handshake
/// signatures are still checked.
pub struct TlsProbe {
    connector: TlsConnector,
    timeout: Duration,
}

impl TlsProbe {
    pub fn new(timeout: Duration) -> Result<Self, ProbeError> {
        let provider = Arc::new(ring::default_provider());
        let config = ClientConfig::builder_with_provider(Arc::clone(&provider))
            .with_safe_default_protocol_versions()?
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(ExpiryOnlyVerifier { provider }))
            .with_no_client_auth();

        Ok(Self { connector: TlsConnector::from(Arc::new(config)), timeout })
    }

    /// Handshake with the host of `url` and return its leaf certificate expiry
    pub async fn certificate_expiry(&self, url: &Url) -> Result<DateTime<Utc>, ProbeError> {
        let (host, server_name) = match url.host() {
            Some(Host::Domain(domain)) => (
                domain.to_string(),
                ServerName::try_from(domain.to_string())
                    .map_err(|e| ProbeError::ServerName(e.to_string()))?,
            ),
            Some(Host::Ipv4(ip)) => (ip.to_string(), ServerName::from(IpAddr::V4(ip))),
            Some(Host::Ipv6(ip)) => (ip.to_string(), ServerName::from(IpAddr::V6(ip))),
            None => return Err(ProbeError::MissingHost),
        };
        let port = url.port_or_known_default().unwrap_or(443);

        let handshake = async {
            let tcp = TcpStream::connect((host.as_str(), port)).await.map_err(ProbeError::Connect)?;
            self.connector.connect(server_name, tcp).await.map_err(ProbeError::Handshake)
        };

        let stream =
            timeout(self.timeout, handshake).await.map_err(|_| ProbeError::Timeout(self.timeout))??;

        let (_, session) = stream.get_ref();
        let leaf = session
            .peer_certificates()
            .and_then(|chain| chain.first())
            .ok_or(ProbeError::NoCertificate)?;

        leaf_expiry(leaf.as_ref())
    }
}

#[async_trait]
impl CertificateProbe for TlsProbe {
    async fn check(&self, target: &Target) -> Option<TlsProbeResult> {
        let url = match Url::parse(&target.url) {
            Ok(url) => url,
            Err(e) => return Some(TlsProbeResult::failed(target.id, ProbeError::from(e).to_string())),
        };

        if url.scheme() != "https" {
            debug!(target_id = %target.id, scheme = url.scheme(), "Not served over TLS, skipping");
            return None;
        }

        let result = match self.certificate_expiry(&url).await {
            Ok(expires_at) => TlsProbeResult::expiring(target.id, expires_at, Utc::now()),
            Err(e) => {
                debug!(target_id = %target.id, "Certificate probe failed: {}", e);
                TlsProbeResult::failed(target.id, e.to_string())
            }
        };
        Some(result)
    }
}

/// Expiry (`notAfter`) of a DER encoded certificate
pub fn leaf_expiry(der: &[u8]) -> Result<DateTime<Utc>, ProbeError> {
    let (_, certificate) = x509_parser::parse_x509_certificate(der)
        .map_err(|e| ProbeError::Certificate(e.to_string()))?;

    let not_after = certificate.validity().not_after.timestamp();
    DateTime::from_timestamp(not_after, 0)
        .ok_or_else(|| ProbeError::Certificate(format!("expiry out of range: {not_after}")))
}

/// Accepts any certificate chain but still verifies handshake signatures
#[derive(Debug)]
struct ExpiryOnlyVerifier {
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for ExpiryOnlyVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider.signature_verification_algorithms.supported_schemes()
    }
}

/// Runs probes over a batch of targets, one task per target
pub struct ProbeRunner {
    uptime: Arc<dyn UptimeProbe>,
    certificates: Arc<dyn CertificateProbe>,
}

impl ProbeRunner {
    pub fn new(uptime: Arc<dyn UptimeProbe>, certificates: Arc<dyn CertificateProbe>) -> Self {
        Self { uptime, certificates }
    }

    pub fn from_config(config: &ProbeConfig) -> Result<Self, ProbeError> {
        Ok(Self::new(
            Arc::new(HttpProbe::new(config.http_timeout)?),
            Arc::new(TlsProbe::new(config.tls_timeout)?),
        ))
    }

    /// Uptime results for every target, in input order. A probe that panics
    /// is reported as down for its own target only.
    pub async fn check_uptime_all(&self, targets: &[Target]) -> Vec<UptimeProbeResult> {
        let probes = targets.iter().map(|target| {
            let probe = Arc::clone(&self.uptime);
            let target = target.clone();
            let target_id = target.id;
            let handle = tokio::spawn(async move { probe.check(&target).await });

            async move {
                handle.await.unwrap_or_else(|e| {
                    UptimeProbeResult::down(target_id, format!("probe task failed: {e}"))
                })
            }
        });

        join_all(probes).await
    }

    /// Certificate results for every https target; other targets are skipped
    pub async fn check_certificates_all(&self, targets: &[Target]) -> Vec<TlsProbeResult> {
        let probes = targets.iter().map(|target| {
            let probe = Arc::clone(&self.certificates);
            let target = target.clone();
            let target_id = target.id;
            let handle = tokio::spawn(async move { probe.check(&target).await });

            async move {
                handle.await.unwrap_or_else(|e| {
                    Some(TlsProbeResult::failed(target_id, format!("probe task failed: {e}")))
                })
            }
        });

        join_all(probes).await.into_iter().flatten().collect()
    }
}
