//! Failure / recovery notifiers. Log-only by default, webhook when configured.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;

use taskclaw_core::config::NotifyConfig;
use taskclaw_core::error::{Result, TaskClawError};
use taskclaw_core::traits::{FailureAlert, NotificationService};

/// Writes alerts to the tracing log.
pub struct LogNotifier;

#[async_trait]
impl NotificationService for LogNotifier {
    fn name(&self) -> &str {
        "log"
    }

    async fn send_failure(&self, alert: &FailureAlert) -> Result<()> {
        tracing::warn!(
            "🚨 {} '{}' failed {} time(s) in a row: {}",
            alert.task_type,
            alert.task_name,
            alert.consecutive_failures,
            alert.error.as_deref().unwrap_or("unknown error")
        );
        Ok(())
    }

    async fn send_recovery(&self, alert: &FailureAlert) -> Result<()> {
        tracing::info!("✅ {} '{}' recovered", alert.task_type, alert.task_name);
        Ok(())
    }
}

/// POSTs alerts as JSON to a webhook.
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
    headers: BTreeMap<String, String>,
}

impl WebhookNotifier {
    pub fn new(url: &str, headers: BTreeMap<String, String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.to_string(),
            headers,
        }
    }

    async fn post(&self, event: &str, alert: &FailureAlert) -> Result<()> {
        let mut req = self
            .client
            .post(&self.url)
            .json(&serde_json::json!({
                "event": event,
                "workspace_id": alert.workspace_id,
                "task_name": alert.task_name,
                "task_type": alert.task_type,
                "error": alert.error,
                "consecutive_failures": alert.consecutive_failures,
                "timestamp": chrono::Utc::now().to_rfc3339(),
            }))
            .timeout(std::time::Duration::from_secs(10));

        for (key, value) in &self.headers {
            req = req.header(key.as_str(), value.as_str());
        }

        let resp = req
            .send()
            .await
            .map_err(|e| TaskClawError::Http(format!("Webhook error: {e}")))?;

        if resp.status().is_success() {
            tracing::info!("✅ Webhook notification sent ({event})");
            Ok(())
        } else {
            Err(TaskClawError::Http(format!("Webhook returned {}", resp.status())))
        }
    }
}

#[async_trait]
impl NotificationService for WebhookNotifier {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn send_failure(&self, alert: &FailureAlert) -> Result<()> {
        self.post("failure", alert).await
    }

    async fn send_recovery(&self, alert: &FailureAlert) -> Result<()> {
        self.post("recovery", alert).await
    }
}

pub fn notifier_from_config(config: &NotifyConfig) -> Arc<dyn NotificationService> {
    if config.webhook_url.trim().is_empty() {
        Arc::new(LogNotifier)
    } else {
        Arc::new(WebhookNotifier::new(&config.webhook_url, config.webhook_headers.clone()))
    }
}
