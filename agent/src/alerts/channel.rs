//! Notification channels.

use async_trait::async_trait;
use reqwest::Client;
use sentinel_engine::{Notification, Severity};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChannelError {
    /// Worth retrying
    #[error("channel unavailable: {0}")]
    Unavailable(String),

    /// The channel refused this notification; retrying will not help
    #[error("channel rejected notification: {0}")]
    Rejected(String),
}

/// Where notifications go.
#[async_trait]
pub trait NotificationChannel: Send + Sync {
    async fn deliver(&self, notification: &Notification) -> Result<(), ChannelError>;
}

/// POSTs each notification as JSON to a webhook.
pub struct WebhookChannel {
    client: Client,
    url: String,
}

impl WebhookChannel {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, ChannelError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ChannelError::Unavailable(e.to_string()))?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl NotificationChannel for WebhookChannel {
    async fn deliver(&self, notification: &Notification) -> Result<(), ChannelError> {
        let response = self
            .client
            .post(&self.url)
            .json(notification)
            .send()
            .await
            .map_err(|e| ChannelError::Unavailable(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else if status.is_client_error() && status.as_u16() != 429 {
            Err(ChannelError::Rejected(status.to_string()))
        } else {
            Err(ChannelError::Unavailable(status.to_string()))
        }
    }
}

/// Writes notifications to the log. Used when no webhook is configured.
#[derive(Debug, Default)]
pub struct LogChannel;

#[async_trait]
impl NotificationChannel for LogChannel {
    async fn deliver(&self, notification: &Notification) -> Result<(), ChannelError> {
        match notification.severity {
            Severity::Critical => tracing::error!(
                title = %notification.title,
                body = %notification.body,
                "Critical alert"
            ),
            Severity::Warning => tracing::warn!(
                title = %notification.title,
                body = %notification.body,
                "Alert"
            ),
            Severity::Info => tracing::info!(
                title = %notification.title,
                body = %notification.body,
                "Alert"
            ),
        }
        Ok(())
    }
}
