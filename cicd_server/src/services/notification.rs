//! Notification dispatcher — fans lifecycle events out to subscribers.
//!
//! Enabled configs are cached in memory and refreshed on every CRUD call.
//! Delivery runs on background tasks: failures are logged and counted, never
//! retried, and never reach the run or build that produced the event.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use chrono::Utc;
use reqwest::header::{HeaderName, HeaderValue, CONTENT_TYPE};
use serde::Deserialize;
use serde_json::json;
use tokio_util::task::TaskTracker;

use crate::error::{CicdError, Result};
use crate::events::lifecycle::LifecycleEvent;
use crate::models::notification::{ChannelType, NotificationConfig, NotificationEvent};
use crate::services::signature::{self, SIGNATURE_HEADER};
use crate::storage::{Bucket, KvStore, KvStoreExt};

const DELIVERY_TIMEOUT: Duration = Duration::from_secs(10);

/// Create/update payload for a notification config.
#[derive(Debug, Clone, Deserialize)]
pub struct NotificationInput {
    pub name: String,
    pub channel: ChannelType,
    #[serde(default = "crate::models::pipeline::enabled_by_default")]
    pub enabled: bool,
    pub events: BTreeSet<NotificationEvent>,
    pub url: String,
    #[serde(default)]
    pub secret: Option<String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub job_ids: Vec<String>,
    #[serde(default)]
    pub pipeline_ids: Vec<String>,
}

impl NotificationInput {
    fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(CicdError::Validation("name is required".to_string()));
        }
        if self.events.is_empty() {
            return Err(CicdError::Validation(
                "at least one event is required".to_string(),
            ));
        }
        let url = url::Url::parse(&self.url)
            .map_err(|e| CicdError::Validation(format!("invalid url '{}': {e}", self.url)))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(CicdError::Validation(format!(
                "url scheme must be http or https, got '{}'",
                url.scheme()
            )));
        }
        for (name, value) in &self.headers {
            if HeaderName::from_bytes(name.as_bytes()).is_err()
                || HeaderValue::from_str(value).is_err()
            {
                return Err(CicdError::Validation(format!("invalid header '{name}'")));
            }
        }
        Ok(())
    }
}

pub struct NotificationDispatcher {
    store: Arc<dyn KvStore>,
    http: reqwest::Client,
    cache: RwLock<Vec<NotificationConfig>>,
    tracker: TaskTracker,
}

impl NotificationDispatcher {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(DELIVERY_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            store,
            http,
            cache: RwLock::new(Vec::new()),
            tracker: TaskTracker::new(),
        }
    }

    /// Reload the enabled-config cache from storage.
    pub async fn load(&self) -> Result<usize> {
        let configs: Vec<NotificationConfig> = self.store.list_json(Bucket::Notifications).await?;
        let enabled: Vec<_> = configs.into_iter().filter(|c| c.enabled).collect();
        let count = enabled.len();
        *self.cache.write().unwrap_or_else(PoisonError::into_inner) = enabled;
        tracing::debug!(count, "Notification configs loaded");
        Ok(count)
    }

    pub async fn create(&self, input: NotificationInput) -> Result<NotificationConfig> {
        input.validate()?;
        let now = Utc::now();
        let config = NotificationConfig {
            id: uuid::Uuid::new_v4().to_string(),
            name: input.name,
            channel: input.channel,
            enabled: input.enabled,
            events: input.events,
            url: input.url,
            secret: input.secret.filter(|s| !s.is_empty()),
            headers: input.headers,
            job_ids: input.job_ids,
            pipeline_ids: input.pipeline_ids,
            created_at: now,
            updated_at: now,
        };
        self.store
            .put_json(Bucket::Notifications, &config.id, &config)
            .await?;
        self.load().await?;
        tracing::info!(notification_id = %config.id, name = %config.name, "Notification config created");
        Ok(config)
    }

    pub async fn update(&self, id: &str, input: NotificationInput) -> Result<NotificationConfig> {
        input.validate()?;
        let mut config = self.get(id).await?;
        config.name = input.name;
        config.channel = input.channel;
        config.enabled = input.enabled;
        config.events = input.events;
        config.url = input.url;
        config.secret = input.secret.filter(|s| !s.is_empty());
        config.headers = input.headers;
        config.job_ids = input.job_ids;
        config.pipeline_ids = input.pipeline_ids;
        config.updated_at = Utc::now();
        self.store
            .put_json(Bucket::Notifications, &config.id, &config)
            .await?;
        self.load().await?;
        Ok(config)
    }

    pub async fn delete(&self, id: &str) -> Result<()> {
        self.get(id).await?;
        self.store.delete(Bucket::Notifications, id).await?;
        self.load().await?;
        tracing::info!(notification_id = %id, "Notification config deleted");
        Ok(())
    }

    pub async fn get(&self, id: &str) -> Result<NotificationConfig> {
        self.store
            .get_json(Bucket::Notifications, id)
            .await?
            .ok_or_else(|| CicdError::NotFound(format!("notification config {id}")))
    }

    pub async fn list(&self) -> Result<Vec<NotificationConfig>> {
        let mut configs: Vec<NotificationConfig> =
            self.store.list_json(Bucket::Notifications).await?;
        configs.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(configs)
    }

    /// Configs that would receive `event`.
    pub fn subscribers(&self, event: &LifecycleEvent) -> Vec<NotificationConfig> {
        let subject = event.subject_id();
        self.cache
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|c| c.wants(event.event, subject))
            .cloned()
            .collect()
    }

    /// Fan out without waiting for delivery.
    pub fn dispatch(&self, event: LifecycleEvent) {
        let targets = self.subscribers(&event);
        if targets.is_empty() {
            return;
        }
        tracing::debug!(
            event = event.event.as_str(),
            subscribers = targets.len(),
            "Dispatching notification"
        );
        let event = Arc::new(event);
        for config in targets {
            let http = self.http.clone();
            let event = event.clone();
            self.tracker.spawn(async move {
                match deliver(&http, &config, &event).await {
                    Ok(()) => {
                        crate::metrics::notification_delivered("ok");
                        tracing::debug!(
                            notification_id = %config.id,
                            event = event.event.as_str(),
                            "Notification delivered"
                        );
                    }
                    Err(e) => {
                        crate::metrics::notification_delivered("failed");
                        tracing::warn!(
                            notification_id = %config.id,
                            event = event.event.as_str(),
                            "Notification delivery failed: {e}"
                        );
                    }
                }
            });
        }
    }

    /// Wait for every in-flight delivery to finish.
    pub async fn flush(&self) {
        self.tracker.close();
        self.tracker.wait().await;
        self.tracker.reopen();
    }
}

/// Serialize the body for the channel, sign it, and POST it.
pub async fn deliver(
    http: &reqwest::Client,
    config: &NotificationConfig,
    event: &LifecycleEvent,
) -> Result<()> {
    let body = render_body(config.channel, event)?;

    let mut req = http
        .post(&config.url)
        .header(CONTENT_TYPE, "application/json");
    for (name, value) in &config.headers {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(n), Ok(v)) => req = req.header(n, v),
            _ => tracing::warn!(header = %name, "Skipping invalid notification header"),
        }
    }
    if let Some(secret) = config.secret.as_deref().filter(|s| !s.is_empty()) {
        req = req.header(SIGNATURE_HEADER, signature::sign(secret, &body));
    }

    let resp = req.body(body).send().await?;
    if !resp.status().is_success() {
        return Err(CicdError::Internal(format!(
            "subscriber responded {}",
            resp.status()
        )));
    }
    Ok(())
}

pub fn render_body(channel: ChannelType, event: &LifecycleEvent) -> Result<Vec<u8>> {
    let bytes = match channel {
        ChannelType::Webhook => serde_json::to_vec(event)?,
        ChannelType::Slack => serde_json::to_vec(&json!({ "text": event.summary() }))?,
    };
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;

    fn input(events: &[NotificationEvent]) -> NotificationInput {
        NotificationInput {
            name: "ops".into(),
            channel: ChannelType::Webhook,
            enabled: true,
            events: events.iter().copied().collect(),
            url: "http://127.0.0.1:1/hook".into(),
            secret: None,
            headers: BTreeMap::new(),
            job_ids: vec![],
            pipeline_ids: vec![],
        }
    }

    #[tokio::test]
    async fn test_crud_refreshes_cache() {
        let d = NotificationDispatcher::new(Arc::new(MemoryStore::new()));
        let cfg = d.create(input(&[NotificationEvent::RunFailed])).await.unwrap();
        assert_eq!(d.cache.read().unwrap().len(), 1);

        let mut disabled = input(&[NotificationEvent::RunFailed]);
        disabled.enabled = false;
        d.update(&cfg.id, disabled).await.unwrap();
        assert!(d.cache.read().unwrap().is_empty());
        assert_eq!(d.list().await.unwrap().len(), 1);

        d.delete(&cfg.id).await.unwrap();
        assert!(d.list().await.unwrap().is_empty());
        assert!(matches!(d.get(&cfg.id).await, Err(CicdError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_input_validation() {
        let d = NotificationDispatcher::new(Arc::new(MemoryStore::new()));
        let mut bad = input(&[NotificationEvent::RunFailed]);
        bad.url = "ftp://example.com".into();
        assert!(matches!(d.create(bad).await, Err(CicdError::Validation(_))));
        assert!(matches!(
            d.create(input(&[])).await,
            Err(CicdError::Validation(_))
        ));
    }

    #[test]
    fn test_slack_body_is_text_summary() {
        let event = LifecycleEvent {
            event: NotificationEvent::RunStarted,
            timestamp: Utc::now(),
            build: None,
            pipeline_run: None,
        };
        let body = render_body(ChannelType::Slack, &event).unwrap();
        let v: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(v["text"], "run_started");
    }
}
