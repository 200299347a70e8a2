//! Trigger source attached to every run and build.

use serde::{Deserialize, Serialize};

/// What started a run or build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerKind {
    Manual,
    Cron,
    Webhook,
}

impl TriggerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerKind::Manual => "manual",
            TriggerKind::Cron => "cron",
            TriggerKind::Webhook => "webhook",
        }
    }
}

impl std::fmt::Display for TriggerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Trigger type plus a free-form reference (`cron:<schedule>@<time>`, a git ref, a user).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerInfo {
    #[serde(rename = "type")]
    pub kind: TriggerKind,
    #[serde(default)]
    pub reference: String,
}

impl TriggerInfo {
    pub fn manual(reference: impl Into<String>) -> Self {
        Self {
            kind: TriggerKind::Manual,
            reference: reference.into(),
        }
    }

    pub fn cron(schedule: &str, fired_at: chrono::DateTime<chrono::Utc>) -> Self {
        Self {
            kind: TriggerKind::Cron,
            reference: format!("cron:{}@{}", schedule, fired_at.to_rfc3339()),
        }
    }

    pub fn webhook(reference: impl Into<String>) -> Self {
        Self {
            kind: TriggerKind::Webhook,
            reference: reference.into(),
        }
    }
}
