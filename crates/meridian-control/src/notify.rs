//! Operator notifications.
//!
//! Controllers never wait on delivery. [`Notifier::notify`] hands the message
//! to a background task and logs delivery failures there.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::Client;
use serde::Serialize;
use tokio::sync::Notify;

use crate::config::{NotificationBackend, NotificationConfig};
use crate::error::{ControlError, ControlResult};

/// A message for humans.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notification {
    pub subject: String,
    pub message: String,
    pub recipients: Vec<String>,
    pub room: Option<String>,
}

impl Notification {
    #[must_use]
    pub fn new(subject: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            message: message.into(),
            recipients: Vec::new(),
            room: None,
        }
    }

    #[must_use]
    pub fn to(mut self, recipients: &[String]) -> Self {
        self.recipients = recipients.to_vec();
        self
    }

    #[must_use]
    pub fn in_room(mut self, room: Option<&str>) -> Self {
        self.room = room.map(ToOwned::to_owned);
        self
    }
}

/// Delivery channel for notifications.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn send(&self, notification: &Notification) -> ControlResult<()>;
}

/// Writes notifications to the log.
#[derive(Debug, Default)]
pub struct LogSink;

#[async_trait]
impl NotificationSink for LogSink {
    async fn send(&self, notification: &Notification) -> ControlResult<()> {
        tracing::info!(
            subject = %notification.subject,
            recipients = ?notification.recipients,
            room = ?notification.room,
            "{}",
            notification.message
        );
        Ok(())
    }
}

/// Posts notifications as JSON to a webhook.
#[derive(Debug, Clone)]
pub struct WebhookSink {
    client: Client,
    url: String,
}

impl WebhookSink {
    pub fn new(url: impl Into<String>, timeout: Duration) -> ControlResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(ControlError::Http)?;

        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl NotificationSink for WebhookSink {
    async fn send(&self, notification: &Notification) -> ControlResult<()> {
        let response = self
            .client
            .post(&self.url)
            .json(notification)
            .send()
            .await
            .map_err(ControlError::Http)?;

        if !response.status().is_success() {
            return Err(ControlError::Notification(format!(
                "webhook returned {}",
                response.status()
            )));
        }
        Ok(())
    }
}

/// Keeps every notification it receives.
#[derive(Debug, Default)]
pub struct RecordingSink {
    sent: Mutex<Vec<Notification>>,
    arrived: Notify,
}

impl RecordingSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn sent(&self) -> Vec<Notification> {
        self.sent.lock().clone()
    }

    /// Wait until at least `count` notifications arrived, or `timeout` passes.
    pub async fn wait_for(&self, count: usize, timeout: Duration) -> Vec<Notification> {
        let wait = async {
            loop {
                let arrived = self.arrived.notified();
                if self.sent.lock().len() >= count {
                    return;
                }
                arrived.await;
            }
        };
        let _ = tokio::time::timeout(timeout, wait).await;
        self.sent()
    }
}

#[async_trait]
impl NotificationSink for RecordingSink {
    async fn send(&self, notification: &Notification) -> ControlResult<()> {
        self.sent.lock().push(notification.clone());
        self.arrived.notify_waiters();
        Ok(())
    }
}

/// Create a notification sink from configuration.
pub fn create_sink(config: &NotificationConfig) -> ControlResult<Arc<dyn NotificationSink>> {
    match config.backend {
        NotificationBackend::Log => Ok(Arc::new(LogSink)),
        NotificationBackend::Webhook => {
            let url = config.webhook_url.as_deref().ok_or_else(|| {
                ControlError::Config("notifications.webhook_url is required".into())
            })?;
            let sink = WebhookSink::new(url, Duration::from_secs(config.timeout_secs))?;
            Ok(Arc::new(sink))
        }
    }
}

/// Fire-and-forget front for a [`NotificationSink`].
#[derive(Clone)]
pub struct Notifier {
    sink: Arc<dyn NotificationSink>,
}

impl Notifier {
    #[must_use]
    pub fn new(sink: Arc<dyn NotificationSink>) -> Self {
        Self { sink }
    }

    /// Deliver `notification` in the background.
    pub fn notify(&self, notification: Notification) {
        if notification.recipients.is_empty() && notification.room.is_none() {
            tracing::debug!(subject = %notification.subject, "no recipients, dropping notification");
            return;
        }

        let sink = Arc::clone(&self.sink);
        tokio::spawn(async move {
            if let Err(e) = sink.send(&notification).await {
                tracing::warn!(
                    subject = %notification.subject,
                    error = %e,
                    "failed to deliver notification"
                );
            }
        });
    }
}

impl std::fmt::Debug for Notifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Notifier").finish_non_exhaustive()
    }
}
