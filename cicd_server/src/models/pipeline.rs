//! Pipeline definitions and pipeline runs.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::status::{JobStatus, RunStatus};
use super::trigger::TriggerInfo;

/// Default per-job timeout when the document leaves it out.
pub const DEFAULT_JOB_TIMEOUT_SECS: u64 = 600;

/// Longest per-job timeout a document may ask for (7 days).
pub const MAX_JOB_TIMEOUT_SECS: u64 = 7 * 24 * 3600;

/// A parsed, validated pipeline definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pipeline {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    pub spec: PipelineSpec,
    #[serde(default)]
    pub status: PipelineStatus,
    /// Raw YAML document the pipeline was parsed from.
    pub source: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Pipeline {
    /// First enabled webhook trigger, if any.
    pub fn webhook_trigger(&self) -> Option<&PipelineTrigger> {
        self.spec
            .triggers
            .iter()
            .find(|t| matches!(t, PipelineTrigger::Webhook { enabled: true, .. }))
    }

    /// Schedules of all enabled cron triggers.
    pub fn cron_schedules(&self) -> Vec<&str> {
        self.spec
            .triggers
            .iter()
            .filter_map(|t| match t {
                PipelineTrigger::Cron {
                    schedule,
                    enabled: true,
                } => Some(schedule.as_str()),
                _ => None,
            })
            .collect()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineSpec {
    #[serde(default)]
    pub variables: BTreeMap<String, String>,
    pub jobs: Vec<JobSpec>,
    #[serde(default)]
    pub artifacts: Vec<ArtifactSpec>,
    #[serde(default)]
    pub triggers: Vec<PipelineTrigger>,
}

/// One containerized job of a pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSpec {
    pub name: String,
    pub image: String,
    pub script: String,
    #[serde(default)]
    pub workdir: Option<String>,
    pub timeout_secs: u64,
    #[serde(default)]
    pub privileged: bool,
    #[serde(default)]
    pub resources: ResourceSpec,
    #[serde(default)]
    pub env: Vec<EnvVar>,
    #[serde(default)]
    pub secrets: Vec<SecretMount>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Variable name; a truthy value skips the job.
    #[serde(default)]
    pub skip_if: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceSpec {
    #[serde(default)]
    pub limits: ResourceQuantities,
    #[serde(default)]
    pub requests: ResourceQuantities,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceQuantities {
    #[serde(default)]
    pub cpu: Option<String>,
    #[serde(default)]
    pub memory: Option<String>,
}

impl ResourceQuantities {
    pub fn is_empty(&self) -> bool {
        self.cpu.is_none() && self.memory.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvVar {
    pub name: String,
    #[serde(default)]
    pub value: String,
}

/// A cluster secret mounted read-only into the job container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecretMount {
    pub name: String,
    pub mount_path: String,
    #[serde(default)]
    pub key: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactSpec {
    pub name: String,
    pub path: String,
    #[serde(default)]
    pub job: Option<String>,
}

/// Trigger declared in the pipeline document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum PipelineTrigger {
    Webhook {
        #[serde(default = "enabled_by_default")]
        enabled: bool,
        #[serde(default)]
        secret: Option<String>,
    },
    Cron {
        schedule: String,
        #[serde(default = "enabled_by_default")]
        enabled: bool,
    },
}

pub(crate) fn enabled_by_default() -> bool {
    true
}

/// Mutable runtime bookkeeping kept next to the definition.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineStatus {
    #[serde(default)]
    pub webhook_token: Option<String>,
    #[serde(default)]
    pub webhook_url: Option<String>,
    #[serde(default)]
    pub last_run_id: Option<String>,
    #[serde(default)]
    pub last_run_number: u64,
    #[serde(default)]
    pub last_run_status: Option<RunStatus>,
    #[serde(default)]
    pub total_runs: u64,
}

/// One execution of a pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineRun {
    pub id: String,
    pub pipeline_id: String,
    pub pipeline_name: String,
    pub number: u64,
    pub status: RunStatus,
    pub trigger: TriggerInfo,
    #[serde(default)]
    pub variables: BTreeMap<String, String>,
    /// Mirrors `PipelineSpec::jobs` order; never reordered after creation.
    pub jobs: Vec<JobRun>,
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

impl PipelineRun {
    /// Move the run forward. Regressions are refused.
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

    pub fn job(&self, name: &str) -> Option<&JobRun> {
        self.jobs.iter().find(|j| j.name == name)
    }
}

/// State of one job inside a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRun {
    pub name: String,
    pub status: JobStatus,
    #[serde(default)]
    pub cluster_job: Option<String>,
    #[serde(default)]
    pub pod: Option<String>,
    #[serde(default)]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub logs: String,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
}

impl JobRun {
    pub fn pending(name: &str) -> Self {
        Self {
            name: name.to_string(),
            status: JobStatus::Pending,
            cluster_job: None,
            pod: None,
            exit_code: None,
            error: None,
            logs: String::new(),
            started_at: None,
            finished_at: None,
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
        }
        self.status = next;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::trigger::TriggerInfo;

    fn run() -> PipelineRun {
        PipelineRun {
            id: "r1".into(),
            pipeline_id: "p1".into(),
            pipeline_name: "demo".into(),
            number: 1,
            status: RunStatus::Pending,
            trigger: TriggerInfo::manual("tester"),
            variables: BTreeMap::new(),
            jobs: vec![JobRun::pending("build")],
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            duration_ms: None,
            error: None,
        }
    }

    #[test]
    fn test_run_records_duration_on_terminal_status() {
        let mut run = run();
        assert!(run.set_status(RunStatus::Running));
        assert!(run.started_at.is_some());
        assert!(run.set_status(RunStatus::Succeeded));
        assert!(run.finished_at.is_some());
        assert!(run.duration_ms.is_some());
        assert!(!run.set_status(RunStatus::Running));
        assert_eq!(run.status, RunStatus::Succeeded);
    }

    #[test]
    fn test_job_run_refuses_regression() {
        let mut job = JobRun::pending("build");
        assert!(job.set_status(JobStatus::Running));
        assert!(job.set_status(JobStatus::Failed));
        assert!(!job.set_status(JobStatus::Pending));
        assert_eq!(job.status, JobStatus::Failed);
    }
}
