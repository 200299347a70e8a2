//! Freestyle job CRUD and build history.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use serde::Deserialize;

use crate::error::{CicdError, Result};
use crate::models::freestyle::{
    BuildStep, FreestyleBuild, FreestyleJob, FreestyleJobStatus, FreestyleTrigger, JobParameter,
    ParameterKind, ScmConfig, StepAction, DEFAULT_STEP_TIMEOUT_SECS,
};
use crate::services::cron::parse_schedule;
use crate::services::parser::generate_token;
use crate::services::scheduler::Scheduler;
use crate::services::trigger_gateway::{resolve_parameters, TriggerGateway};
use crate::storage::{Bucket, KvStore, KvStoreExt, RecordLock};

fn enabled() -> bool {
    true
}

fn default_timeout() -> u64 {
    DEFAULT_STEP_TIMEOUT_SECS
}

/// Step as submitted; id and order are filled in when missing.
#[derive(Debug, Clone, Deserialize)]
pub struct StepInput {
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub order: Option<u32>,
    #[serde(default)]
    pub host_id: String,
    #[serde(flatten)]
    pub action: StepAction,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub continue_on_error: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FreestyleJobInput {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default = "enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub scm: Option<ScmConfig>,
    #[serde(default)]
    pub parameters: Vec<JobParameter>,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    pub steps: Vec<StepInput>,
    #[serde(default)]
    pub triggers: Vec<FreestyleTrigger>,
    /// HMAC secret for inbound webhooks. `None` keeps the stored one, empty clears it.
    #[serde(default)]
    pub webhook_secret: Option<String>,
}

pub struct FreestyleService {
    store: Arc<dyn KvStore>,
    scheduler: Arc<Scheduler>,
    gateway: Arc<TriggerGateway>,
    public_url: String,
    records: RecordLock,
}

impl FreestyleService {
    pub fn new(
        store: Arc<dyn KvStore>,
        scheduler: Arc<Scheduler>,
        gateway: Arc<TriggerGateway>,
        public_url: impl Into<String>,
        records: RecordLock,
    ) -> Self {
        Self {
            store,
            scheduler,
            gateway,
            public_url: public_url.into().trim_end_matches('/').to_string(),
            records,
        }
    }

    pub fn webhook_url(&self, token: &str) -> String {
        format!("{}/cicd/freestyle/webhook/{}", self.public_url, token)
    }

    pub async fn create(&self, input: FreestyleJobInput) -> Result<FreestyleJob> {
        let _guard = self.records.acquire().await;
        self.validate(&input, None).await?;
        let now = Utc::now();
        let mut job = FreestyleJob {
            id: uuid::Uuid::new_v4().to_string(),
            name: input.name.trim().to_string(),
            description: input.description,
            enabled: input.enabled,
            scm: input.scm,
            parameters: input.parameters,
            environment: input.environment,
            steps: build_steps(input.steps),
            triggers: input.triggers,
            status: FreestyleJobStatus::default(),
            created_at: now,
            updated_at: now,
        };
        apply_webhook(&mut job, input.webhook_secret);

        self.store.put_json(Bucket::FreestyleJobs, &job.id, &job).await?;
        self.scheduler.register_freestyle(&job);
        tracing::info!(job_id = %job.id, name = %job.name, "Freestyle job created");
        Ok(job)
    }

    /// Replace a job's definition. Counters and an existing webhook token are kept.
    pub async fn update(&self, id: &str, input: FreestyleJobInput) -> Result<FreestyleJob> {
        let _guard = self.records.acquire().await;
        let existing = self.get(id).await?;
        self.validate(&input, Some(id)).await?;
        let mut job = FreestyleJob {
            id: existing.id.clone(),
            name: input.name.trim().to_string(),
            description: input.description,
            enabled: input.enabled,
            scm: input.scm,
            parameters: input.parameters,
            environment: input.environment,
            steps: build_steps(input.steps),
            triggers: input.triggers,
            status: existing.status,
            created_at: existing.created_at,
            updated_at: Utc::now(),
        };
        apply_webhook(&mut job, input.webhook_secret);

        self.store.put_json(Bucket::FreestyleJobs, &job.id, &job).await?;
        self.scheduler.register_freestyle(&job);
        tracing::info!(job_id = %job.id, name = %job.name, "Freestyle job updated");
        Ok(job)
    }

    async fn validate(&self, input: &FreestyleJobInput, except: Option<&str>) -> Result<()> {
        let name = input.name.trim();
        if name.is_empty() {
            return Err(CicdError::Validation("name is required".to_string()));
        }
        let taken = self
            .list()
            .await?
            .iter()
            .any(|j| j.name == name && Some(j.id.as_str()) != except);
        if taken {
            return Err(CicdError::Validation(format!(
                "a freestyle job named '{name}' already exists"
            )));
        }

        if input.steps.is_empty() {
            return Err(CicdError::Validation(
                "at least one step is required".to_string(),
            ));
        }
        for step in &input.steps {
            validate_step(step)?;
            let host = step.host_id.trim();
            if !host.is_empty()
                && host != crate::models::freestyle::LOCAL_HOST
                && self.store.get(Bucket::SshHosts, host).await?.is_none()
            {
                return Err(CicdError::Validation(format!(
                    "step '{}': unknown host {host}",
                    step.name
                )));
            }
        }

        if let Some(scm) = &input.scm {
            if scm.repositories.is_empty() {
                return Err(CicdError::Validation(
                    "scm needs at least one repository".to_string(),
                ));
            }
            for repo in &scm.repositories {
                if repo.url.trim().is_empty() {
                    return Err(CicdError::Validation(
                        "scm repository url is required".to_string(),
                    ));
                }
                if let Some(cred) = repo.credential_id.as_deref().filter(|c| !c.is_empty()) {
                    if self.store.get(Bucket::GitCredentials, cred).await?.is_none() {
                        return Err(CicdError::Validation(format!(
                            "unknown git credential {cred}"
                        )));
                    }
                }
            }
        }

        validate_parameters(&input.parameters)?;

        for trigger in &input.triggers {
            if let FreestyleTrigger::Cron { schedule, .. } = trigger {
                parse_schedule(schedule)?;
            }
        }
        Ok(())
    }

    pub async fn get(&self, id: &str) -> Result<FreestyleJob> {
        self.store
            .get_json(Bucket::FreestyleJobs, id)
            .await?
            .ok_or_else(|| CicdError::NotFound(format!("freestyle job {id}")))
    }

    pub async fn list(&self) -> Result<Vec<FreestyleJob>> {
        let mut jobs: Vec<FreestyleJob> = self.store.list_json(Bucket::FreestyleJobs).await?;
        jobs.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(jobs)
    }

    /// Delete a job and its builds. Unfinished builds are cancelled first.
    pub async fn delete(&self, id: &str) -> Result<()> {
        let _guard = self.records.acquire().await;
        let job = self.get(id).await?;
        self.scheduler.unregister_freestyle(id);
        for build in self.list_builds(id).await? {
            if !build.status.is_terminal() {
                if let Err(e) = self.gateway.cancel_build(&build.id).await {
                    tracing::warn!(build_id = %build.id, "Cancel before delete failed: {e}");
                }
            }
            self.store.delete(Bucket::FreestyleBuilds, &build.id).await?;
        }
        self.store.delete(Bucket::FreestyleJobs, id).await?;
        tracing::info!(job_id = %id, name = %job.name, "Freestyle job deleted");
        Ok(())
    }

    /// Builds of one job, newest first.
    pub async fn list_builds(&self, job_id: &str) -> Result<Vec<FreestyleBuild>> {
        let mut builds: Vec<FreestyleBuild> = self
            .store
            .list_json::<FreestyleBuild>(Bucket::FreestyleBuilds)
            .await?
            .into_iter()
            .filter(|b| b.job_id == job_id)
            .collect();
        builds.sort_by(|a, b| b.number.cmp(&a.number));
        Ok(builds)
    }

    pub async fn get_build(&self, build_id: &str) -> Result<FreestyleBuild> {
        self.store
            .get_json(Bucket::FreestyleBuilds, build_id)
            .await?
            .ok_or_else(|| CicdError::NotFound(format!("freestyle build {build_id}")))
    }

    pub async fn delete_build(&self, build_id: &str) -> Result<()> {
        let build = self.get_build(build_id).await?;
        if !build.status.is_terminal() {
            return Err(CicdError::InvalidState(format!(
                "build {build_id} is {}; cancel it first",
                build.status
            )));
        }
        self.store.delete(Bucket::FreestyleBuilds, build_id).await
    }

    /// Persisted step output of a build, in step order.
    pub async fn build_logs(&self, build_id: &str) -> Result<String> {
        Ok(self.get_build(build_id).await?.combined_output())
    }
}

fn build_steps(inputs: Vec<StepInput>) -> Vec<BuildStep> {
    let mut steps: Vec<BuildStep> = inputs
        .into_iter()
        .enumerate()
        .map(|(i, s)| BuildStep {
            id: s
                .id
                .filter(|id| !id.is_empty())
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            name: s.name.trim().to_string(),
            order: s.order.unwrap_or(i as u32 + 1),
            host_id: s.host_id.trim().to_string(),
            action: s.action,
            timeout_secs: s.timeout_secs,
            continue_on_error: s.continue_on_error,
        })
        .collect();
    steps.sort_by_key(|s| s.order);
    steps
}

/// Mint a token when a webhook trigger is present, drop it otherwise.
fn apply_webhook(job: &mut FreestyleJob, secret: Option<String>) {
    let wants_webhook = job
        .triggers
        .iter()
        .any(|t| matches!(t, FreestyleTrigger::Webhook { .. }));
    if wants_webhook {
        if job.status.webhook_token.is_none() {
            job.status.webhook_token = Some(generate_token());
        }
    } else {
        job.status.webhook_token = None;
    }
    if let Some(secret) = secret {
        job.status.webhook_secret = Some(secret).filter(|s| !s.is_empty());
    }
}

fn validate_step(step: &StepInput) -> Result<()> {
    let fail = |msg: &str| Err(CicdError::Validation(format!("step '{}': {msg}", step.name)));
    if step.name.trim().is_empty() {
        return Err(CicdError::Validation("step name is required".to_string()));
    }
    if step.timeout_secs == 0 {
        return fail("timeout must be positive");
    }
    match &step.action {
        StepAction::Shell { command } if command.trim().is_empty() => fail("command is required"),
        StepAction::Script { script } if script.trim().is_empty() => fail("script is required"),
        StepAction::ScpPush {
            local_path,
            remote_path,
        }
        | StepAction::ScpPull {
            remote_path,
            local_path,
        } if local_path.trim().is_empty() || remote_path.trim().is_empty() => {
            fail("local_path and remote_path are required")
        }
        _ => Ok(()),
    }
}

fn validate_parameters(params: &[JobParameter]) -> Result<()> {
    let mut seen = HashSet::new();
    for param in params {
        if param.name.trim().is_empty() {
            return Err(CicdError::Validation("parameter name is required".to_string()));
        }
        if !seen.insert(param.name.as_str()) {
            return Err(CicdError::Validation(format!(
                "duplicate parameter '{}'",
                param.name
            )));
        }
        if param.kind == ParameterKind::Choice && param.choices.is_empty() {
            return Err(CicdError::Validation(format!(
                "choice parameter '{}' needs choices",
                param.name
            )));
        }
        if param.default.as_deref().is_some_and(|d| !d.is_empty()) {
            let probe = JobParameter {
                required: false,
                ..param.clone()
            };
            resolve_parameters(&[probe], &BTreeMap::new()).map_err(|_| {
                CicdError::Validation(format!(
                    "parameter '{}': default is not a valid value",
                    param.name
                ))
            })?;
        }
    }
    Ok(())
}
