//! Notification subscriber configuration.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle events a subscriber can listen to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationEvent {
    BuildStarted,
    BuildSucceeded,
    BuildFailed,
    BuildCancelled,
    RunStarted,
    RunSucceeded,
    RunFailed,
    RunCancelled,
}

impl NotificationEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationEvent::BuildStarted => "build_started",
            NotificationEvent::BuildSucceeded => "build_succeeded",
            NotificationEvent::BuildFailed => "build_failed",
            NotificationEvent::BuildCancelled => "build_cancelled",
            NotificationEvent::RunStarted => "run_started",
            NotificationEvent::RunSucceeded => "run_succeeded",
            NotificationEvent::RunFailed => "run_failed",
            NotificationEvent::RunCancelled => "run_cancelled",
        }
    }

    /// Freestyle build event (as opposed to a pipeline run event).
    pub fn is_build_event(&self) -> bool {
        matches!(
            self,
            NotificationEvent::BuildStarted
                | NotificationEvent::BuildSucceeded
                | NotificationEvent::BuildFailed
                | NotificationEvent::BuildCancelled
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelType {
    Webhook,
    Slack,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationConfig {
    pub id: String,
    pub name: String,
    pub channel: ChannelType,
    pub enabled: bool,
    pub events: BTreeSet<NotificationEvent>,
    pub url: String,
    #[serde(default)]
    pub secret: Option<String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Freestyle job allow-list; empty means every job.
    #[serde(default)]
    pub job_ids: Vec<String>,
    /// Pipeline allow-list; empty means every pipeline.
    #[serde(default)]
    pub pipeline_ids: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl NotificationConfig {
    /// Whether this subscriber wants `event` for the job or pipeline `subject_id`.
    pub fn wants(&self, event: NotificationEvent, subject_id: &str) -> bool {
        if !self.enabled || !self.events.contains(&event) {
            return false;
        }
        let allow = if event.is_build_event() {
            &self.job_ids
        } else {
            &self.pipeline_ids
        };
        allow.is_empty() || allow.iter().any(|id| id == subject_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(events: &[NotificationEvent], job_ids: &[&str]) -> NotificationConfig {
        NotificationConfig {
            id: "n1".into(),
            name: "ops".into(),
            channel: ChannelType::Webhook,
            enabled: true,
            events: events.iter().copied().collect(),
            url: "http://localhost/hook".into(),
            secret: None,
            headers: BTreeMap::new(),
            job_ids: job_ids.iter().map(|s| s.to_string()).collect(),
            pipeline_ids: Vec::new(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_failed_only_subscriber_ignores_success() {
        let cfg = config(&[NotificationEvent::BuildFailed], &[]);
        assert!(cfg.wants(NotificationEvent::BuildFailed, "job-1"));
        assert!(!cfg.wants(NotificationEvent::BuildSucceeded, "job-1"));
    }

    #[test]
    fn test_job_allow_list_filters_subjects() {
        let cfg = config(&[NotificationEvent::BuildFailed], &["job-1"]);
        assert!(cfg.wants(NotificationEvent::BuildFailed, "job-1"));
        assert!(!cfg.wants(NotificationEvent::BuildFailed, "job-2"));
    }

    #[test]
    fn test_job_allow_list_does_not_gate_pipeline_events() {
        let cfg = config(&[NotificationEvent::RunFailed], &["job-1"]);
        assert!(cfg.wants(NotificationEvent::RunFailed, "pipeline-9"));
    }

    #[test]
    fn test_disabled_config_never_matches() {
        let mut cfg = config(&[NotificationEvent::RunStarted], &[]);
        cfg.enabled = false;
        assert!(!cfg.wants(NotificationEvent::RunStarted, "p"));
    }
}
