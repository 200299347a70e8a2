//! Lifecycle events emitted by the executors and fanned out to subscribers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::freestyle::FreestyleBuild;
use crate::models::notification::NotificationEvent;
use crate::models::pipeline::PipelineRun;
use crate::models::RunStatus;

/// Summary of a freestyle build carried in notification payloads.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BuildSummary {
    pub id: String,
    pub job_id: String,
    pub job_name: String,
    pub number: u64,
    pub status: RunStatus,
    pub trigger_type: String,
    pub duration_ms: Option<u64>,
    pub error: Option<String>,
}

/// Summary of a pipeline run carried in notification payloads.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunSummary {
    pub id: String,
    pub pipeline_id: String,
    pub pipeline_name: String,
    pub number: u64,
    pub status: RunStatus,
    pub trigger_type: String,
    pub duration_ms: Option<u64>,
    pub error: Option<String>,
}

/// Outbound notification body: `{event, timestamp, build | pipeline_run}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LifecycleEvent {
    pub event: NotificationEvent,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build: Option<BuildSummary>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pipeline_run: Option<RunSummary>,
}

impl LifecycleEvent {
    /// Event matching the build's current status. `None` while still pending.
    pub fn for_build(build: &FreestyleBuild) -> Option<Self> {
        let event = match build.status {
            RunStatus::Pending => return None,
            RunStatus::Running => NotificationEvent::BuildStarted,
            RunStatus::Succeeded => NotificationEvent::BuildSucceeded,
            RunStatus::Failed => NotificationEvent::BuildFailed,
            RunStatus::Cancelled => NotificationEvent::BuildCancelled,
        };
        Some(Self {
            event,
            timestamp: Utc::now(),
            build: Some(BuildSummary {
                id: build.id.clone(),
                job_id: build.job_id.clone(),
                job_name: build.job_name.clone(),
                number: build.number,
                status: build.status,
                trigger_type: build.trigger.kind.as_str().to_string(),
                duration_ms: build.duration_ms,
                error: build.error.clone(),
            }),
            pipeline_run: None,
        })
    }

    pub fn for_run(run: &PipelineRun) -> Option<Self> {
        let event = match run.status {
            RunStatus::Pending => return None,
            RunStatus::Running => NotificationEvent::RunStarted,
            RunStatus::Succeeded => NotificationEvent::RunSucceeded,
            RunStatus::Failed => NotificationEvent::RunFailed,
            RunStatus::Cancelled => NotificationEvent::RunCancelled,
        };
        Some(Self {
            event,
            timestamp: Utc::now(),
            build: None,
            pipeline_run: Some(RunSummary {
                id: run.id.clone(),
                pipeline_id: run.pipeline_id.clone(),
                pipeline_name: run.pipeline_name.clone(),
                number: run.number,
                status: run.status,
                trigger_type: run.trigger.kind.as_str().to_string(),
                duration_ms: run.duration_ms,
                error: run.error.clone(),
            }),
        })
    }

    /// Job id for build events, pipeline id for run events.
    pub fn subject_id(&self) -> &str {
        if let Some(b) = &self.build {
            return &b.job_id;
        }
        self.pipeline_run
            .as_ref()
            .map(|r| r.pipeline_id.as_str())
            .unwrap_or_default()
    }

    /// One-line human summary, used for chat channels.
    pub fn summary(&self) -> String {
        let (what, number, status, duration, error) = match (&self.build, &self.pipeline_run) {
            (Some(b), _) => (
                format!("Build {}", b.job_name),
                b.number,
                b.status,
                b.duration_ms,
                b.error.as_deref(),
            ),
            (None, Some(r)) => (
                format!("Pipeline {}", r.pipeline_name),
                r.number,
                r.status,
                r.duration_ms,
                r.error.as_deref(),
            ),
            (None, None) => return self.event.as_str().to_string(),
        };
        let mut text = format!("{what} #{number} {status}");
        if let Some(ms) = duration {
            text.push_str(&format!(" in {:.1}s", ms as f64 / 1000.0));
        }
        if let Some(err) = error {
            text.push_str(&format!(": {err}"));
        }
        text
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TriggerInfo;

    fn run(status: RunStatus) -> PipelineRun {
        PipelineRun {
            id: "run-1".into(),
            pipeline_id: "pipe-1".into(),
            pipeline_name: "web".into(),
            number: 7,
            status,
            trigger: TriggerInfo::manual("alice"),
            variables: Default::default(),
            jobs: vec![],
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            duration_ms: Some(1500),
            error: None,
        }
    }

    #[test]
    fn test_run_event_mapping() {
        assert!(LifecycleEvent::for_run(&run(RunStatus::Pending)).is_none());
        let ev = LifecycleEvent::for_run(&run(RunStatus::Failed)).unwrap();
        assert_eq!(ev.event, NotificationEvent::RunFailed);
        assert_eq!(ev.subject_id(), "pipe-1");
    }

    #[test]
    fn test_payload_shape() {
        let ev = LifecycleEvent::for_run(&run(RunStatus::Succeeded)).unwrap();
        let v = serde_json::to_value(&ev).unwrap();
        assert_eq!(v["event"], "run_succeeded");
        assert_eq!(v["pipeline_run"]["trigger_type"], "manual");
        assert_eq!(v["pipeline_run"]["duration_ms"], 1500);
        assert!(v.get("build").is_none());
    }

    #[test]
    fn test_summary_text() {
        let ev = LifecycleEvent::for_run(&run(RunStatus::Succeeded)).unwrap();
        assert_eq!(ev.summary(), "Pipeline web #7 succeeded in 1.5s");
    }
}
