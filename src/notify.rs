//! Chat-webhook notifications.
//!
//! `Notifier::send` never blocks and never fails. Each webhook URL gets its
//! own delivery task that posts messages in submission order, so a stalled
//! endpoint only delays its own messages. Delivery problems are logged and
//! otherwise ignored.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Serialize;
use tokio::runtime::Handle;
use tokio::sync::mpsc;

use crate::config::{Project, SlackConfig};

/// Body posted to a Slack-compatible incoming webhook.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notification {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub icon_emoji: Option<String>,
    pub text: String,
}

impl Notification {
    pub fn new(slack: &SlackConfig, text: impl Into<String>) -> Self {
        Self {
            channel: slack.channel.clone(),
            username: slack.username.clone(),
            icon_emoji: slack.icon.clone(),
            text: text.into(),
        }
    }
}

/// Delivery mechanism for a single notification.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn deliver(&self, webhook_url: &str, notification: &Notification) -> Result<()>;
}

/// Upper bound on one webhook POST, connect through response body.
pub const DELIVERY_TIMEOUT: Duration = Duration::from_secs(10);

/// Posts notifications as `payload=<json>` form bodies; the endpoint must
/// answer with the literal body `ok`.
pub struct WebhookTransport {
    client: reqwest::Client,
}

impl WebhookTransport {
    pub fn new() -> Self {
        Self::with_timeout(DELIVERY_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!("falling back to default HTTP client: {}", e);
                reqwest::Client::default()
            });
        Self { client }
    }
}

impl Default for WebhookTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for WebhookTransport {
    async fn deliver(&self, webhook_url: &str, notification: &Notification) -> Result<()> {
        let payload =
            serde_json::to_string(notification).context("Failed to serialize notification")?;
        let body = self
            .client
            .post(webhook_url)
            .form(&[("payload", payload.as_str())])
            .send()
            .await
            .context("Failed to send notification")?
            .text()
            .await
            .context("Failed to read notification response")?;

        if body != "ok" {
            anyhow::bail!("webhook answered '{}'", body);
        }
        Ok(())
    }
}

struct Outgoing {
    project: String,
    webhook_url: String,
    notification: Notification,
}

/// Resolves the webhook for a project and hands messages to the delivery
/// task for that webhook.
#[derive(Clone)]
pub struct Notifier {
    default: Option<SlackConfig>,
    transport: Arc<dyn Transport>,
    workers: Arc<Mutex<HashMap<String, mpsc::UnboundedSender<Outgoing>>>>,
    runtime: Handle,
}

impl Notifier {
    /// Create a notifier bound to the current runtime. Delivery tasks are
    /// spawned on first use of each webhook URL.
    pub fn new(default: Option<SlackConfig>, transport: Arc<dyn Transport>) -> Self {
        Self {
            default,
            transport,
            workers: Arc::new(Mutex::new(HashMap::new())),
            runtime: Handle::current(),
        }
    }

    fn spawn_worker(&self, webhook_url: &str) -> mpsc::UnboundedSender<Outgoing> {
        let (tx, mut rx) = mpsc::unbounded_channel::<Outgoing>();
        let transport = self.transport.clone();
        tracing::debug!(webhook = %webhook_url, "starting notification worker");

        self.runtime.spawn(async move {
            while let Some(out) = rx.recv().await {
                match transport.deliver(&out.webhook_url, &out.notification).await {
                    Ok(()) => tracing::info!(project = %out.project, "notification sent"),
                    Err(e) => {
                        tracing::warn!(project = %out.project, "error sending notification: {:#}", e)
                    }
                }
            }
        });
        tx
    }

    fn dispatch(&self, out: Outgoing) {
        let mut workers = self.workers.lock().unwrap_or_else(|e| e.into_inner());
        let tx = match workers.get(&out.webhook_url) {
            Some(tx) if !tx.is_closed() => tx.clone(),
            _ => {
                let tx = self.spawn_worker(&out.webhook_url);
                workers.insert(out.webhook_url.clone(), tx.clone());
                tx
            }
        };
        if let Err(mpsc::error::SendError(out)) = tx.send(out) {
            tracing::warn!(project = %out.project, "notification task has stopped; message dropped");
        }
    }

    /// Webhook used for `project`: its own override, else the global default.
    pub fn resolve<'a>(&'a self, project: &'a Project) -> Option<&'a SlackConfig> {
        project.slack.as_ref().or(self.default.as_ref())
    }

    /// Queue `text` for delivery. A no-op when no webhook is configured.
    pub fn send(&self, project: &Project, text: impl Into<String>) {
        let Some(slack) = self.resolve(project) else {
            return;
        };
        tracing::debug!(project = %project.key, "queueing notification");
        let out = Outgoing {
            project: project.key.clone(),
            webhook_url: slack.webhook_url.clone(),
            notification: Notification::new(slack, text),
        };
        self.dispatch(out);
    }
}
