//! Alert delivery
//!
//! [`AlertChannel`]s deliver a [`ContainerAlert`] somewhere; a [`NotifierSet`]
//! fans each alert out to every configured channel and implements [`Notifier`].

use crate::{AlertError, ContainerAlert};
use async_trait::async_trait;
use dw_config::MonitorConfig;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Outcome of one notifier call
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Delivery {
    pub success: bool,
    pub error: Option<String>,
}

impl Delivery {
    #[must_use]
    pub fn ok() -> Self {
        Self {
            success: true,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
        }
    }
}

/// Sends the three alert kinds
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send_down_alert(&self, alert: &ContainerAlert) -> Delivery;
    async fn send_up_alert(&self, alert: &ContainerAlert) -> Delivery;
    async fn send_no_auto_restart_alert(&self, alert: &ContainerAlert) -> Delivery;
}

/// Alert delivery channel trait
#[async_trait]
pub trait AlertChannel: Send + Sync {
    fn name(&self) -> &str;
    async fn deliver(&self, alert: &ContainerAlert) -> Result<(), AlertError>;
}

/// Webhook channel - sends alerts via HTTP POST
pub struct WebhookChannel {
    url: String,
    client: reqwest::Client,
}

impl WebhookChannel {
    /// Create a new webhook channel
    pub fn new(url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Self::with_client(url, client)
    }

    /// Create with a custom client
    pub fn with_client(url: impl Into<String>, client: reqwest::Client) -> Self {
        Self {
            url: url.into(),
            client,
        }
    }
}

#[derive(Serialize)]
struct WebhookPayload<'a> {
    #[serde(flatten)]
    alert: &'a ContainerAlert,
    message: String,
}

#[async_trait]
impl AlertChannel for WebhookChannel {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn deliver(&self, alert: &ContainerAlert) -> Result<(), AlertError> {
        let payload = WebhookPayload {
            alert,
            message: alert.message(),
        };
        let response = self
            .client
            .post(&self.url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| AlertError::DeliveryFailed(format!("Webhook request failed: {e}")))?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(AlertError::DeliveryFailed(format!(
                "Webhook returned error status: {}",
                response.status()
            )))
        }
    }
}

/// Log channel - writes alerts to tracing logs
#[derive(Debug, Default, Clone, Copy)]
pub struct LogChannel;

#[async_trait]
impl AlertChannel for LogChannel {
    fn name(&self) -> &str {
        "log"
    }

    async fn deliver(&self, alert: &ContainerAlert) -> Result<(), AlertError> {
        tracing::warn!(
            kind = alert.kind.as_str(),
            owner = %alert.owner,
            recipient = %alert.recipient,
            host_id = %alert.host_id,
            container = %alert.container,
            message = %alert.message(),
            "Container alert"
        );
        Ok(())
    }
}

/// In-memory channel for testing - stores alerts in a Vec
#[derive(Default, Clone)]
pub struct MemoryChannel {
    alerts: Arc<Mutex<Vec<ContainerAlert>>>,
}

impl MemoryChannel {
    /// Create a new memory channel
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<ContainerAlert>> {
        self.alerts.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Get all alerts that have been delivered
    #[must_use]
    pub fn alerts(&self) -> Vec<ContainerAlert> {
        self.lock().clone()
    }

    /// Clear all stored alerts
    pub fn clear(&self) {
        self.lock().clear();
    }

    /// Get count of stored alerts
    #[must_use]
    pub fn count(&self) -> usize {
        self.lock().len()
    }
}

#[async_trait]
impl AlertChannel for MemoryChannel {
    fn name(&self) -> &str {
        "memory"
    }

    async fn deliver(&self, alert: &ContainerAlert) -> Result<(), AlertError> {
        self.lock().push(alert.clone());
        Ok(())
    }
}

/// Result of a single channel delivery attempt
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryResult {
    pub channel: String,
    pub success: bool,
    pub error: Option<String>,
}

/// Fans alerts out to every registered channel
#[derive(Default)]
pub struct NotifierSet {
    channels: Vec<Box<dyn AlertChannel>>,
}

impl NotifierSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_channel(&mut self, channel: Box<dyn AlertChannel>) {
        self.channels.push(channel);
    }

    #[must_use]
    pub fn with_channel(mut self, channel: Box<dyn AlertChannel>) -> Self {
        self.add_channel(channel);
        self
    }

    /// Number of registered channels
    #[must_use]
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Deliver an alert to all registered channels
    pub async fn deliver_all(&self, alert: &ContainerAlert) -> Vec<DeliveryResult> {
        let mut results = Vec::with_capacity(self.channels.len());

        for channel in &self.channels {
            let result = channel.deliver(alert).await;
            results.push(DeliveryResult {
                channel: channel.name().to_string(),
                success: result.is_ok(),
                error: result.err().map(|e| e.to_string()),
            });
        }

        results
    }

    async fn send(&self, alert: &ContainerAlert) -> Delivery {
        let failures: Vec<String> = self
            .deliver_all(alert)
            .await
            .into_iter()
            .filter(|r| !r.success)
            .map(|r| format!("{}: {}", r.channel, r.error.unwrap_or_default()))
            .collect();

        if failures.is_empty() {
            Delivery::ok()
        } else {
            Delivery::failed(failures.join("; "))
        }
    }
}

#[async_trait]
impl Notifier for NotifierSet {
    async fn send_down_alert(&self, alert: &ContainerAlert) -> Delivery {
        self.send(alert).await
    }

    async fn send_up_alert(&self, alert: &ContainerAlert) -> Delivery {
        self.send(alert).await
    }

    async fn send_no_auto_restart_alert(&self, alert: &ContainerAlert) -> Delivery {
        self.send(alert).await
    }
}

/// Build the configured channels. `None` when no channel is configured, which disables alerting.
#[must_use]
pub fn notifier_from_config(config: &MonitorConfig) -> Option<NotifierSet> {
    let mut set = NotifierSet::new();
    if config.log_alerts {
        set.add_channel(Box::new(LogChannel));
    }
    if let Some(url) = config.webhook_url.as_deref().filter(|u| !u.trim().is_empty()) {
        set.add_channel(Box::new(WebhookChannel::new(url)));
    }
    (set.channel_count() > 0).then_some(set)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::AlertKind;
    use chrono::Utc;
    use mockall::mock;

    mock! {
        Channel {}

        #[async_trait]
        impl AlertChannel for Channel {
            fn name(&self) -> &str;
            async fn deliver(&self, alert: &ContainerAlert) -> Result<(), AlertError>;
        }
    }

    fn alert() -> ContainerAlert {
        ContainerAlert {
            kind: AlertKind::Down,
            owner: "ops".to_string(),
            recipient: "ops@example.com".to_string(),
            host_id: "web-1".to_string(),
            host_name: "web-1".to_string(),
            container: "api".to_string(),
            image: "api:2".to_string(),
            status: "exited".to_string(),
            at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_memory_channel() {
        let channel = MemoryChannel::new();
        channel.deliver(&alert()).await.unwrap();
        assert_eq!(channel.count(), 1);
        assert_eq!(channel.alerts()[0].container, "api");
        channel.clear();
        assert_eq!(channel.count(), 0);
    }

    #[tokio::test]
    async fn test_log_channel_deliver() {
        assert!(LogChannel.deliver(&alert()).await.is_ok());
    }

    #[tokio::test]
    async fn test_set_reports_partial_failure() {
        let mut failing = MockChannel::new();
        failing
            .expect_name()
            .return_const("failing-channel".to_string());
        failing
            .expect_deliver()
            .returning(|_| Err(AlertError::DeliveryFailed("connection refused".to_string())));

        let memory = MemoryChannel::new();
        let set = NotifierSet::new()
            .with_channel(Box::new(memory.clone()))
            .with_channel(Box::new(failing));

        let results = set.deliver_all(&alert()).await;
        assert_eq!(results.len(), 2);
        assert!(results[0].success);
        assert!(!results[1].success);

        let delivery = set.send_down_alert(&alert()).await;
        assert!(!delivery.success);
        assert!(delivery.error.unwrap().contains("failing-channel"));
        assert_eq!(memory.count(), 2);
    }

    #[tokio::test]
    async fn test_set_success() {
        let memory = MemoryChannel::new();
        let set = NotifierSet::new().with_channel(Box::new(memory.clone()));
        assert_eq!(set.send_up_alert(&alert()).await, Delivery::ok());
        assert_eq!(set.send_no_auto_restart_alert(&alert()).await, Delivery::ok());
        assert_eq!(memory.count(), 2);
    }

    #[tokio::test]
    async fn test_webhook_unreachable_fails() {
        let channel = WebhookChannel::new("http://127.0.0.1:1/alerts");
        let err = channel.deliver(&alert()).await.unwrap_err();
        assert!(matches!(err, AlertError::DeliveryFailed(_)));
    }

    #[test]
    fn test_notifier_from_config() {
        let mut config = MonitorConfig::default();
        assert_eq!(notifier_from_config(&config).unwrap().channel_count(), 1);

        config.webhook_url = Some("https://hooks.example.com/dw".to_string());
        assert_eq!(notifier_from_config(&config).unwrap().channel_count(), 2);

        config.log_alerts = false;
        config.webhook_url = None;
        assert!(notifier_from_config(&config).is_none());
    }

    #[test]
    fn test_webhook_payload_includes_message() {
        let alert = alert();
        let payload = WebhookPayload {
            alert: &alert,
            message: alert.message(),
        };
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["kind"], "down");
        assert_eq!(json["container"], "api");
        assert!(json["message"].as_str().unwrap().contains("is down"));
    }
}
