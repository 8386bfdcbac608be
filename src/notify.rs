//! Catalogue change notifications
//!
//! After an item document is rewritten, downstream indexers are told via a
//! change message POSTed to the configured broker endpoint. Publishing is
//! strictly best-effort: a failed or slow publish is logged and never
//! affects the order outcome.

use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

use crate::config::NotificationConfig;
use crate::error::{Error, Result};
use crate::types::ChangeNotification;

/// Publishes catalogue change messages
#[async_trait]
pub trait NotificationPublisher: Send + Sync {
    /// Publish one change message. Errors are for the caller to log, not
    /// to act on.
    async fn publish(&self, notification: &ChangeNotification) -> Result<()>;
}

/// Publisher POSTing JSON change messages to a broker endpoint
pub struct HttpPublisher {
    http: reqwest::Client,
    endpoint: Url,
    timeout: Duration,
}

impl HttpPublisher {
    /// Create a publisher for the given endpoint
    pub fn new(http: reqwest::Client, endpoint: Url, timeout: Duration) -> Self {
        Self { http, endpoint, timeout }
    }

    /// Build the publisher selected by the configuration; `None` endpoint
    /// means notifications are disabled
    pub fn from_config(http: reqwest::Client, config: &NotificationConfig) -> Option<Self> {
        config
            .endpoint
            .clone()
            .map(|endpoint| Self::new(http, endpoint, config.timeout))
    }
}

#[async_trait]
impl NotificationPublisher for HttpPublisher {
    async fn publish(&self, notification: &ChangeNotification) -> Result<()> {
        let response = self
            .http
            .post(self.endpoint.clone())
            .timeout(self.timeout)
            .json(notification)
            .send()
            .await
            .map_err(|e| Error::Notification(format!("publish to {}: {e}", self.endpoint)))?;

        if !response.status().is_success() {
            return Err(Error::Notification(format!(
                "broker answered {} for {}",
                response.status(),
                notification.id
            )));
        }
        debug!(id = %notification.id, "change notification published");
        Ok(())
    }
}

/// Publisher that drops every message, used when no endpoint is configured
pub struct NoopPublisher;

#[async_trait]
impl NotificationPublisher for NoopPublisher {
    async fn publish(&self, notification: &ChangeNotification) -> Result<()> {
        debug!(id = %notification.id, "notifications disabled, dropping change message");
        Ok(())
    }
}

/// Publish and log, swallowing any failure
pub async fn publish_best_effort(
    publisher: &dyn NotificationPublisher,
    notification: &ChangeNotification,
) {
    if let Err(e) = publisher.publish(notification).await {
        warn!(id = %notification.id, error = %e, "change notification failed, continuing");
    }
}
