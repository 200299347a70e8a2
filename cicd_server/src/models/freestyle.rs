//! Freestyle jobs: ordered command steps run locally or over remote sessions.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::pipeline::enabled_by_default;
use super::status::{JobStatus, RunStatus};
use super::trigger::TriggerInfo;

/// Host id that runs a step inside the orchestrator process.
pub const LOCAL_HOST: &str = "local";

/// Default per-step timeout.
pub const DEFAULT_STEP_TIMEOUT_SECS: u64 = 600;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FreestyleJob {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
    #[serde(default)]
    pub scm: Option<ScmConfig>,
    #[serde(default)]
    pub parameters: Vec<JobParameter>,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    pub steps: Vec<BuildStep>,
    #[serde(default)]
    pub triggers: Vec<FreestyleTrigger>,
    #[serde(default)]
    pub status: FreestyleJobStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl FreestyleJob {
    /// Steps sorted by their `order` field.
    pub fn ordered_steps(&self) -> Vec<BuildStep> {
        let mut steps = self.steps.clone();
        steps.sort_by_key(|s| s.order);
        steps
    }

    pub fn cron_schedules(&self) -> Vec<&str> {
        self.triggers
            .iter()
            .filter_map(|t| match t {
                FreestyleTrigger::Cron {
                    schedule,
                    enabled: true,
                } => Some(schedule.as_str()),
                _ => None,
            })
            .collect()
    }

    pub fn webhook_enabled(&self) -> bool {
        self.triggers
            .iter()
            .any(|t| matches!(t, FreestyleTrigger::Webhook { enabled: true }))
    }
}

/// Source checkout configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScmConfig {
    pub repositories: Vec<ScmRepository>,
    /// `*/main`, `refs/heads/main`, `origin/main` or `main`.
    #[serde(default)]
    pub branch: String,
    #[serde(default)]
    pub depth: Option<u32>,
    #[serde(default)]
    pub submodules: bool,
    #[serde(default)]
    pub clean_before: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScmRepository {
    pub url: String,
    #[serde(default)]
    pub credential_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParameterKind {
    String,
    Bool,
    Choice,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobParameter {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ParameterKind,
    #[serde(default)]
    pub default: Option<String>,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub choices: Vec<String>,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildStep {
    pub id: String,
    pub name: String,
    pub order: u32,
    /// Empty or `local` runs inside the orchestrator process.
    #[serde(default)]
    pub host_id: String,
    #[serde(flatten)]
    pub action: StepAction,
    #[serde(default = "default_step_timeout")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub continue_on_error: bool,
}

impl BuildStep {
    pub fn is_local(&self) -> bool {
        self.host_id.is_empty() || self.host_id == LOCAL_HOST
    }
}

fn default_step_timeout() -> u64 {
    DEFAULT_STEP_TIMEOUT_SECS
}

/// What a step does. Closed set, validated when the job is saved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepAction {
    Shell {
        command: String,
    },
    Script {
        script: String,
    },
    ScpPush {
        local_path: String,
        remote_path: String,
    },
    ScpPull {
        remote_path: String,
        local_path: String,
    },
}

impl StepAction {
    pub fn kind(&self) -> &'static str {
        match self {
            StepAction::Shell { .. } => "shell",
            StepAction::Script { .. } => "script",
            StepAction::ScpPush { .. } => "scp_push",
            StepAction::ScpPull { .. } => "scp_pull",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum FreestyleTrigger {
    Cron {
        schedule: String,
        #[serde(default = "enabled_by_default")]
        enabled: bool,
    },
    Webhook {
        #[serde(default = "enabled_by_default")]
        enabled: bool,
    },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FreestyleJobStatus {
    #[serde(default)]
    pub webhook_token: Option<String>,
    #[serde(default)]
    pub webhook_secret: Option<String>,
    #[serde(default)]
    pub last_build_id: Option<String>,
    #[serde(default)]
    pub last_build_number: u64,
    #[serde(default)]
    pub last_build_status: Option<RunStatus>,
    #[serde(default)]
    pub total_builds: u64,
}

/// One execution of a freestyle job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FreestyleBuild {
    pub id: String,
    pub job_id: String,
    pub job_name: String,
    pub number: u64,
    pub status: RunStatus,
    pub trigger: TriggerInfo,
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    pub steps: Vec<FreestyleBuildStep>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub duration_ms: Option<u64>,
    #[serde(default)]
    pub error: Option<String>,
}

impl FreestyleBuild {
    pub fn set_status(&mut self, next: RunStatus) -> bool {
        if !self.status.can_transition_to(next) {
            return false;
        }
        let now = Utc::now();
        if next == RunStatus::Running {
            self.started_at = Some(now);
        }
        if next.is_terminal() {
            self.finished_at = Some(now);
            let start = self.started_at.unwrap_or(self.created_at);
            self.duration_ms = Some((now - start).num_milliseconds().max(0) as u64);
        }
        self.status = next;
        true
    }

    /// Persisted step outputs joined in step order.
    pub fn combined_output(&self) -> String {
        let mut out = String::new();
        for step in &self.steps {
            if step.output.is_empty() {
                continue;
            }
            out.push_str(&format!("==> [{}] {}\n", step.step.order, step.step.name));
            out.push_str(&step.output);
            if !step.output.ends_with('\n') {
                out.push('\n');
            }
        }
        out
    }
}

/// Snapshot of a step plus its outcome within one build.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FreestyleBuildStep {
    pub step: BuildStep,
    pub status: JobStatus,
    #[serde(default)]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub output: String,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub duration_ms: Option<u64>,
}

impl FreestyleBuildStep {
    pub fn pending(step: BuildStep) -> Self {
        Self {
            step,
            status: JobStatus::Pending,
            exit_code: None,
            output: String::new(),
            error: None,
            started_at: None,
            finished_at: None,
            duration_ms: None,
        }
    }

    pub fn set_status(&mut self, next: JobStatus) -> bool {
        if !self.status.can_transition_to(next) {
            return false;
        }
        let now = Utc::now();
        if next == JobStatus::Running {
            self.started_at = Some(now);
        }
        if next.is_terminal() {
            self.finished_at = Some(now);
            if let Some(start) = self.started_at {
                self.duration_ms = Some((now - start).num_milliseconds().max(0) as u64);
            }
        }
        self.status = next;
        true
    }
}
