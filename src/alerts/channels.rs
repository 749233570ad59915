//! Notification channels
//!
//! Every channel delivers one `AlertNotification` at a time. Retries and
//! failure bookkeeping live in the engine, so a channel only reports whether a
//! single attempt succeeded.

use super::rules::{ChannelKind, Severity};
use super::AlertNotification;
use crate::config::MonitorConfig;
use crate::error::{MonitorError, Result};
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;

#[async_trait]
pub trait NotificationChannel: Send + Sync {
    fn kind(&self) -> ChannelKind;

    async fn deliver(&self, alert: &AlertNotification) -> Result<()>;
}

/// Writes alerts to the process log
pub struct ConsoleChannel;

#[async_trait]
impl NotificationChannel for ConsoleChannel {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Console
    }

    async fn deliver(&self, alert: &AlertNotification) -> Result<()> {
        match alert.severity {
            Severity::Critical => tracing::error!(
                rule = %alert.rule_name,
                dedup_key = %alert.dedup_key,
                value = alert.value,
                threshold = alert.threshold,
                "ALERT: {}",
                alert.message
            ),
            Severity::Warning => tracing::warn!(
                rule = %alert.rule_name,
                dedup_key = %alert.dedup_key,
                value = alert.value,
                threshold = alert.threshold,
                "ALERT: {}",
                alert.message
            ),
            Severity::Info => tracing::info!(
                rule = %alert.rule_name,
                dedup_key = %alert.dedup_key,
                value = alert.value,
                threshold = alert.threshold,
                "ALERT: {}",
                alert.message
            ),
        }
        Ok(())
    }
}

/// Appends alerts as JSON lines to a file
pub struct FileChannel {
    path: PathBuf,
}

impl FileChannel {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl NotificationChannel for FileChannel {
    fn kind(&self) -> ChannelKind {
        ChannelKind::File
    }

    async fn deliver(&self, alert: &AlertNotification) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut line = serde_json::to_vec(alert)?;
        line.push(b'\n');

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }
}

/// POSTs alerts as JSON to an HTTP endpoint
///
/// The dedup key travels in the body and in an `Idempotency-Key` header, so a
/// receiver can drop deliveries repeated by retries.
pub struct WebhookChannel {
    client: reqwest::Client,
    url: String,
}

impl WebhookChannel {
    pub fn new(url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(Duration::from_secs(10)).build()?;
        Ok(Self { client, url: url.into() })
    }
}

#[async_trait]
impl NotificationChannel for WebhookChannel {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Webhook
    }

    async fn deliver(&self, alert: &AlertNotification) -> Result<()> {
        let response = self
            .client
            .post(&self.url)
            .header("Idempotency-Key", alert.dedup_key.as_str())
            .json(alert)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(MonitorError::ChannelDelivery {
                channel: ChannelKind::Webhook.as_str().to_string(),
                message: format!("webhook responded with {}", status),
            });
        }
        Ok(())
    }
}

/// Build the channel for `kind` from the active configuration
pub fn build_channel(kind: ChannelKind, cfg: &MonitorConfig) -> Result<Arc<dyn NotificationChannel>> {
    match kind {
        ChannelKind::Console => Ok(Arc::new(ConsoleChannel)),
        ChannelKind::File => Ok(Arc::new(FileChannel::new(cfg.alert_log_path()))),
        ChannelKind::Webhook => {
            let url = cfg.webhook_url.clone().ok_or_else(|| MonitorError::ChannelDelivery {
                channel: kind.as_str().to_string(),
                message: "no webhookUrl configured".to_string(),
            })?;
            Ok(Arc::new(WebhookChannel::new(url)?))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use httpmock::prelude::*;

    fn notification() -> AlertNotification {
        AlertNotification {
            dedup_key: "5f0c6c1e-0000-4000-8000-000000000001".to_string(),
            rule_name: "fetch_failure".to_string(),
            severity: Severity::Critical,
            message: "count(function.failed) >= 1 within 2m (value 1)".to_string(),
            value: 1.0,
            threshold: 1.0,
            function_name: Some("analyzer::fetch_trending".to_string()),
            session_id: Some("batch-1".to_string()),
            triggered_at: Utc::now(),
            channels: vec![ChannelKind::File],
        }
    }

    #[tokio::test]
    async fn test_file_channel_appends_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("alerts.log");
        let channel = FileChannel::new(&path);

        channel.deliver(&notification()).await.unwrap();
        channel.deliver(&notification()).await.unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().count(), 2);
        let parsed: AlertNotification = serde_json::from_str(content.lines().next().unwrap()).unwrap();
        assert_eq!(parsed.rule_name, "fetch_failure");
    }

    #[tokio::test]
    async fn test_webhook_sends_dedup_key() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/alerts")
                    .header("idempotency-key", "5f0c6c1e-0000-4000-8000-000000000001");
                then.status(200);
            })
            .await;

        let channel = WebhookChannel::new(server.url("/alerts")).unwrap();
        channel.deliver(&notification()).await.unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_webhook_error_status_fails_delivery() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/alerts");
                then.status(503);
            })
            .await;

        let channel = WebhookChannel::new(server.url("/alerts")).unwrap();
        let err = channel.deliver(&notification()).await.unwrap_err();
        assert_eq!(err.kind(), "channel_delivery_failure");
    }
}
