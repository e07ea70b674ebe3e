//! Notification channels for incident and certificate events.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};
use vigil::{NotificationEvent, Notifier, TargetId};

use crate::config::Notifications;

const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("webhook returned {status}: {body}")]
    Rejected { status: reqwest::StatusCode, body: String },
    #[error("{failed} of {total} notification channels failed: {errors}")]
    Partial { failed: usize, total: usize, errors: String },
}

/// JSON body posted to webhooks
#[derive(Debug, Serialize)]
pub struct WebhookPayload<'a> {
    pub event: NotificationEvent,
    pub target_id: TargetId,
    pub variables: &'a HashMap<String, String>,
    pub sent_at: DateTime<Utc>,
}

/// Writes every notification to the log
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(
        &self,
        event: NotificationEvent,
        target_id: TargetId,
        variables: HashMap<String, String>,
    ) -> Result<()> {
        let name = variables.get("target_name").map(String::as_str).unwrap_or("unknown");
        match event {
            NotificationEvent::Down => warn!(
                %target_id,
                target_name = name,
                error = variables.get("error").map(String::as_str).unwrap_or_default(),
                "NOTIFY target down"
            ),
            NotificationEvent::Recovered => {
                info!(%target_id, target_name = name, "NOTIFY target recovered")
            }
            NotificationEvent::CertificateExpiring => warn!(
                %target_id,
                target_name = name,
                days_remaining = variables.get("days_remaining").map(String::as_str).unwrap_or_default(),
                "NOTIFY certificate expiring"
            ),
        }
        Ok(())
    }
}

/// Delivers notifications as JSON over HTTP POST
pub struct WebhookNotifier {
    url: String,
    client: reqwest::Client,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>) -> Result<Self, NotifyError> {
        let client = reqwest::Client::builder().timeout(WEBHOOK_TIMEOUT).build()?;
        Ok(Self::with_client(url, client))
    }

    pub fn with_client(url: impl Into<String>, client: reqwest::Client) -> Self {
        Self { url: url.into(), client }
    }

    async fn post(
        &self,
        event: NotificationEvent,
        target_id: TargetId,
        variables: &HashMap<String, String>,
    ) -> Result<(), NotifyError> {
        let payload = WebhookPayload { event, target_id, variables, sent_at: Utc::now() };
        let response = self.client.post(&self.url).json(&payload).send().await?;
        let status = response.status();

        if !status.is_success() {
            let body = response.text().await.unwrap_or_else(|_| "<unreadable body>".to_string());
            return Err(NotifyError::Rejected { status, body });
        }

        debug!(url = %self.url, %event, %status, "Webhook notification delivered");
        Ok(())
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(
        &self,
        event: NotificationEvent,
        target_id: TargetId,
        variables: HashMap<String, String>,
    ) -> Result<()> {
        Ok(self.post(event, target_id, &variables).await?)
    }
}

/// Fans a notification out to every channel.
///
/// All channels are tried even when one fails; the failures are reported
/// together afterwards.
pub struct Dispatcher {
    channels: Vec<Arc<dyn Notifier>>,
}

impl Dispatcher {
    pub fn new(channels: Vec<Arc<dyn Notifier>>) -> Self {
        Self { channels }
    }

    /// Log channel always, webhook channel when a URL is configured
    pub fn from_config(config: &Notifications) -> Result<Self, NotifyError> {
        let mut channels: Vec<Arc<dyn Notifier>> = vec![Arc::new(LogNotifier)];
        if let Some(url) = &config.webhook_url {
            info!(url = %url, "Webhook notifications enabled");
            channels.push(Arc::new(WebhookNotifier::new(url.clone())?));
        }
        let dispatcher = Self::new(channels);
        debug!(channels = dispatcher.channel_count(), "Notification dispatcher ready");
        Ok(dispatcher)
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }
}

#[async_trait]
impl Notifier for Dispatcher {
    async fn notify(
        &self,
        event: NotificationEvent,
        target_id: TargetId,
        variables: HashMap<String, String>,
    ) -> Result<()> {
        let mut errors = Vec::new();
        for channel in &self.channels {
            if let Err(e) = channel.notify(event, target_id, variables.clone()).await {
                errors.push(format!("{e:#}"));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(NotifyError::Partial {
                failed: errors.len(),
                total: self.channels.len(),
                errors: errors.join("; "),
            }
            .into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::sync::oneshot;
    use uuid::Uuid;

    /// Accept one HTTP request, answer with `status` and hand back its body
    async fn capture_one(status: u16) -> (String, oneshot::Receiver<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/hook", listener.local_addr().unwrap());
        let (tx, rx) = oneshot::channel();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = Vec::new();
            let mut chunk = [0u8; 1024];
            let body = loop {
                let n = socket.read(&mut chunk).await.unwrap();
                buf.extend_from_slice(&chunk[..n]);
                let text = String::from_utf8_lossy(&buf).to_string();
                if let Some((head, body)) = text.split_once("\r\n\r\n") {
                    let length = head
                        .lines()
                        .find_map(|line| {
                            let (name, value) = line.split_once(':')?;
                            name.eq_ignore_ascii_case("content-length")
                                .then(|| value.trim().parse::<usize>().ok())?
                        })
                        .unwrap_or(0);
                    if body.len() >= length {
                        break body.to_string();
                    }
                }
                if n == 0 {
                    break String::new();
                }
            };

            let response =
                format!("HTTP/1.1 {status} Status\r\ncontent-length: 4\r\nconnection: close\r\n\r\nnope");
            socket.write_all(response.as_bytes()).await.unwrap();
            let _ = tx.send(body);
        });

        (url, rx)
    }

    fn local_client() -> reqwest::Client {
        reqwest::Client::builder().no_proxy().build().unwrap()
    }

    #[tokio::test]
    async fn test_webhook_posts_event_json() {
        let (url, body) = capture_one(200).await;
        let notifier = WebhookNotifier::with_client(url, local_client());
        let target_id = Uuid::new_v4();
        let variables = HashMap::from([("target_name".to_string(), "api".to_string())]);

        notifier.notify(NotificationEvent::Down, target_id, variables).await.unwrap();

        let json: serde_json::Value = serde_json::from_str(&body.await.unwrap()).unwrap();
        assert_eq!(json["event"], "down");
        assert_eq!(json["target_id"], target_id.to_string());
        assert_eq!(json["variables"]["target_name"], "api");
        assert!(json["sent_at"].is_string());
    }

    #[tokio::test]
    async fn test_webhook_non_success_is_an_error() {
        let (url, _body) = capture_one(500).await;
        let notifier = WebhookNotifier::with_client(url, local_client());

        let err = notifier
            .notify(NotificationEvent::Recovered, Uuid::new_v4(), HashMap::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("500"));
    }

    #[tokio::test]
    async fn test_dispatcher_tries_every_channel() {
        let (url, body) = capture_one(200).await;
        let failing: Arc<dyn Notifier> =
            Arc::new(WebhookNotifier::with_client("http://127.0.0.1:1/hook", local_client()));
        let working: Arc<dyn Notifier> = Arc::new(WebhookNotifier::with_client(url, local_client()));
        let dispatcher = Dispatcher::new(vec![Arc::new(LogNotifier), failing, working]);

        let err = dispatcher
            .notify(NotificationEvent::CertificateExpiring, Uuid::new_v4(), HashMap::new())
            .await
            .unwrap_err();

        assert!(err.to_string().starts_with("1 of 3 notification channels failed"));
        let json: serde_json::Value = serde_json::from_str(&body.await.unwrap()).unwrap();
        assert_eq!(json["event"], "certificate_expiring");
    }

    #[test]
    fn test_from_config_adds_webhook_only_when_configured() {
        let dispatcher = Dispatcher::from_config(&Notifications::default()).unwrap();
        assert_eq!(dispatcher.channel_count(), 1);

        let config = Notifications {
            webhook_url: Some("https://hooks.example.com/vigil".into()),
            ..Default::default()
        };
        assert_eq!(Dispatcher::from_config(&config).unwrap().channel_count(), 2);
    }
}
