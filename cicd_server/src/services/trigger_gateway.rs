//! Trigger gateway — manual, cron and webhook triggers start runs here.
//!
//! Numbering happens under the shared [`RecordLock`] so concurrent triggers
//! (and concurrent edits of the same record) never share a run/build number.
//! Each accepted trigger gets its own task and its own cancellation token,
//! registered before the run/build is first stored and until the executor
//! returns.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::Utc;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::error::{CicdError, Result};
use crate::events::lifecycle::LifecycleEvent;
use crate::models::freestyle::{
    FreestyleBuild, FreestyleBuildStep, FreestyleJob, JobParameter, ParameterKind,
};
use crate::models::pipeline::{JobRun, Pipeline, PipelineRun, PipelineTrigger};
use crate::models::{JobStatus, RunStatus, TriggerInfo};
use crate::services::freestyle_executor::FreestyleExecutor;
use crate::services::notification::NotificationDispatcher;
use crate::services::pipeline_executor::PipelineExecutor;
use crate::services::signature;
use crate::storage::{Bucket, KvStore, KvStoreExt, RecordLock};

/// Inbound pipeline webhook body.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PipelineWebhookPayload {
    #[serde(default, rename = "ref")]
    pub git_ref: Option<String>,
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default)]
    pub commit: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub variables: BTreeMap<String, String>,
}

impl PipelineWebhookPayload {
    /// Branch as given, or derived from a `refs/heads/` ref.
    pub fn branch_name(&self) -> Option<String> {
        self.branch.clone().filter(|b| !b.is_empty()).or_else(|| {
            self.git_ref
                .as_deref()
                .and_then(|r| r.strip_prefix("refs/heads/"))
                .map(str::to_string)
        })
    }

    /// Payload variables plus the `WEBHOOK_*` convenience set.
    pub fn variables(&self) -> BTreeMap<String, String> {
        let mut vars = self.variables.clone();
        let fields = [
            ("WEBHOOK_REF", self.git_ref.clone()),
            ("WEBHOOK_BRANCH", self.branch_name()),
            ("WEBHOOK_COMMIT", self.commit.clone()),
            ("WEBHOOK_MESSAGE", self.message.clone()),
            ("WEBHOOK_AUTHOR", self.author.clone()),
        ];
        for (name, value) in fields {
            if let Some(v) = value.filter(|v| !v.is_empty()) {
                vars.insert(name.to_string(), v);
            }
        }
        vars
    }

    fn reference(&self) -> String {
        self.git_ref
            .clone()
            .or_else(|| self.branch.clone())
            .filter(|r| !r.is_empty())
            .unwrap_or_else(|| "webhook".to_string())
    }
}

/// Inbound freestyle webhook body. Non-string values are stringified.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FreestyleWebhookPayload {
    #[serde(default)]
    pub parameters: BTreeMap<String, serde_json::Value>,
}

impl FreestyleWebhookPayload {
    pub fn parameters(&self) -> BTreeMap<String, String> {
        self.parameters
            .iter()
            .map(|(k, v)| {
                let value = match v {
                    serde_json::Value::String(s) => s.clone(),
                    serde_json::Value::Null => String::new(),
                    other => other.to_string(),
                };
                (k.clone(), value)
            })
            .collect()
    }
}

fn parse_body<T: for<'de> Deserialize<'de> + Default>(body: &[u8]) -> Result<T> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(body)
        .map_err(|e| CicdError::Validation(format!("invalid webhook payload: {e}")))
}

/// Resolve typed parameters against declared defaults, required flags and choices.
///
/// Values for undeclared names pass through untouched.
pub fn resolve_parameters(
    declared: &[JobParameter],
    provided: &BTreeMap<String, String>,
) -> Result<BTreeMap<String, String>> {
    let mut resolved = provided.clone();
    for param in declared {
        let value = provided
            .get(&param.name)
            .filter(|v| !v.is_empty())
            .cloned()
            .or_else(|| param.default.clone().filter(|v| !v.is_empty()));

        let value = match (param.kind, value) {
            (_, None) if param.required => {
                return Err(CicdError::Validation(format!(
                    "parameter '{}' is required",
                    param.name
                )));
            }
            (ParameterKind::Bool, None) => "false".to_string(),
            (ParameterKind::Choice, None) => param.choices.first().cloned().unwrap_or_default(),
            (ParameterKind::String, None) => String::new(),
            (ParameterKind::Bool, Some(v)) => match v.trim().to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" | "on" => "true".to_string(),
                "false" | "0" | "no" | "off" => "false".to_string(),
                _ => {
                    return Err(CicdError::Validation(format!(
                        "parameter '{}' must be a boolean, got '{v}'",
                        param.name
                    )));
                }
            },
            (ParameterKind::Choice, Some(v)) => {
                if !param.choices.iter().any(|c| c == &v) {
                    return Err(CicdError::Validation(format!(
                        "parameter '{}' must be one of [{}], got '{v}'",
                        param.name,
                        param.choices.join(", ")
                    )));
                }
                v
            }
            (ParameterKind::String, Some(v)) => v,
        };
        resolved.insert(param.name.clone(), value);
    }
    Ok(resolved)
}

type ActiveRegistry = Arc<Mutex<HashMap<String, CancellationToken>>>;

pub struct TriggerGateway {
    store: Arc<dyn KvStore>,
    pipelines: Arc<PipelineExecutor>,
    freestyle: Arc<FreestyleExecutor>,
    notifier: Arc<NotificationDispatcher>,
    records: RecordLock,
    active: ActiveRegistry,
    tracker: TaskTracker,
}

impl TriggerGateway {
    pub fn new(
        store: Arc<dyn KvStore>,
        pipelines: Arc<PipelineExecutor>,
        freestyle: Arc<FreestyleExecutor>,
        notifier: Arc<NotificationDispatcher>,
        records: RecordLock,
    ) -> Self {
        Self {
            store,
            pipelines,
            freestyle,
            notifier,
            records,
            active: Arc::new(Mutex::new(HashMap::new())),
            tracker: TaskTracker::new(),
        }
    }

    /// Number of runs/builds currently executing.
    pub fn active_count(&self) -> usize {
        self.active.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_active(&self, id: &str) -> bool {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(id)
    }

    fn register(&self, id: &str) -> CancellationToken {
        let token = CancellationToken::new();
        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        active.insert(id.to_string(), token.clone());
        crate::metrics::active_runs(active.len());
        token
    }

    fn unregister(active: &ActiveRegistry, id: &str) {
        let mut active = active.lock().unwrap_or_else(PoisonError::into_inner);
        active.remove(id);
        crate::metrics::active_runs(active.len());
    }

    fn token_for(&self, id: &str) -> Option<CancellationToken> {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    // ── Pipelines ──

    /// Create the next run of a pipeline and start executing it.
    pub async fn trigger_pipeline(
        &self,
        pipeline_id: &str,
        trigger: TriggerInfo,
        variables: BTreeMap<String, String>,
    ) -> Result<PipelineRun> {
        let id = uuid::Uuid::new_v4().to_string();
        let token = self.register(&id);
        let queued = self.queue_run(&id, pipeline_id, trigger, variables).await;
        let (pipeline, run) = match queued {
            Ok(queued) => queued,
            Err(e) => {
                Self::unregister(&self.active, &id);
                return Err(e);
            }
        };

        tracing::info!(
            run_id = %run.id,
            pipeline = %pipeline.name,
            number = run.number,
            trigger = run.trigger.kind.as_str(),
            "Pipeline run queued"
        );

        let executor = self.pipelines.clone();
        let active = self.active.clone();
        let run_id = run.id.clone();
        self.tracker.spawn(async move {
            if let Err(e) = executor.execute(&pipeline, &run_id, token).await {
                tracing::error!(run_id = %run_id, "Pipeline run aborted: {e}");
            }
            Self::unregister(&active, &run_id);
        });
        Ok(run)
    }

    /// Number and store a pending run, and bump the pipeline's counters.
    async fn queue_run(
        &self,
        id: &str,
        pipeline_id: &str,
        trigger: TriggerInfo,
        variables: BTreeMap<String, String>,
    ) -> Result<(Pipeline, PipelineRun)> {
        let _guard = self.records.acquire().await;
        let mut pipeline: Pipeline = self
            .store
            .get_json(Bucket::Pipelines, pipeline_id)
            .await?
            .ok_or_else(|| CicdError::NotFound(format!("pipeline {pipeline_id}")))?;

        let number = pipeline.status.last_run_number + 1;
        let mut merged = pipeline.spec.variables.clone();
        merged.extend(variables);
        let run = PipelineRun {
            id: id.to_string(),
            pipeline_id: pipeline.id.clone(),
            pipeline_name: pipeline.name.clone(),
            number,
            status: RunStatus::Pending,
            trigger,
            variables: merged,
            jobs: pipeline.spec.jobs.iter().map(|j| JobRun::pending(&j.name)).collect(),
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            duration_ms: None,
            error: None,
        };
        self.store.put_json(Bucket::PipelineRuns, &run.id, &run).await?;

        pipeline.status.last_run_number = number;
        pipeline.status.total_runs += 1;
        pipeline.status.last_run_id = Some(run.id.clone());
        pipeline.status.last_run_status = Some(RunStatus::Pending);
        self.store
            .put_json(Bucket::Pipelines, &pipeline.id, &pipeline)
            .await?;
        Ok((pipeline, run))
    }

    /// Cancel a run. An executing run is signalled; a run nobody is executing
    /// is cancelled in place and its cluster Jobs are removed.
    pub async fn cancel_run(&self, run_id: &str) -> Result<PipelineRun> {
        let mut run: PipelineRun = self
            .store
            .get_json(Bucket::PipelineRuns, run_id)
            .await?
            .ok_or_else(|| CicdError::NotFound(format!("pipeline run {run_id}")))?;
        if run.status.is_terminal() {
            return Err(CicdError::InvalidState(format!(
                "run {run_id} already {}",
                run.status
            )));
        }

        if let Some(token) = self.token_for(run_id) {
            token.cancel();
            tracing::info!(run_id = %run_id, "Pipeline run cancellation requested");
            return Ok(run);
        }

        for job in run.jobs.iter_mut() {
            if !job.status.is_terminal() {
                job.set_status(JobStatus::Cancelled);
            }
        }
        run.error = Some("run cancelled".to_string());
        run.set_status(RunStatus::Cancelled);
        self.store.put_json(Bucket::PipelineRuns, &run.id, &run).await?;
        self.pipelines.cancel_cluster_jobs(run_id).await;
        if let Some(event) = LifecycleEvent::for_run(&run) {
            self.notifier.dispatch(event);
        }
        crate::metrics::run_status_changed("pipeline", "cancelled");
        tracing::info!(run_id = %run_id, "Detached pipeline run cancelled");
        Ok(run)
    }

    /// `POST /cicd/webhooks/{pipeline_id}/{token}`.
    pub async fn pipeline_webhook(
        &self,
        pipeline_id: &str,
        token: &str,
        signature_header: Option<&str>,
        body: &[u8],
    ) -> Result<PipelineRun> {
        let result = self
            .accept_pipeline_webhook(pipeline_id, token, signature_header, body)
            .await;
        crate::metrics::webhook_received("pipeline", result.is_ok());
        let payload = result?;
        self.trigger_pipeline(
            pipeline_id,
            TriggerInfo::webhook(payload.reference()),
            payload.variables(),
        )
        .await
    }

    async fn accept_pipeline_webhook(
        &self,
        pipeline_id: &str,
        token: &str,
        signature_header: Option<&str>,
        body: &[u8],
    ) -> Result<PipelineWebhookPayload> {
        let pipeline: Pipeline = self
            .store
            .get_json(Bucket::Pipelines, pipeline_id)
            .await?
            .ok_or_else(|| CicdError::NotFound(format!("pipeline {pipeline_id}")))?;

        let expected = pipeline.status.webhook_token.as_deref().unwrap_or_default();
        if expected.is_empty() || !signature::tokens_match(expected, token) {
            tracing::warn!(pipeline_id = %pipeline_id, "Webhook rejected: bad token");
            return Err(CicdError::Unauthorized("invalid webhook token".to_string()));
        }
        let Some(PipelineTrigger::Webhook { secret, .. }) = pipeline.webhook_trigger() else {
            return Err(CicdError::Unauthorized(
                "webhook trigger is disabled".to_string(),
            ));
        };
        if let Some(secret) = secret.as_deref().filter(|s| !s.is_empty()) {
            verify_signature(secret, body, signature_header)?;
        }
        parse_body(body)
    }

    // ── Freestyle ──

    /// Create the next build of a freestyle job and start executing it.
    pub async fn trigger_freestyle(
        &self,
        job_id: &str,
        trigger: TriggerInfo,
        parameters: BTreeMap<String, String>,
    ) -> Result<FreestyleBuild> {
        let id = uuid::Uuid::new_v4().to_string();
        let token = self.register(&id);
        let queued = self.queue_build(&id, job_id, trigger, parameters).await;
        let (job, build) = match queued {
            Ok(queued) => queued,
            Err(e) => {
                Self::unregister(&self.active, &id);
                return Err(e);
            }
        };

        tracing::info!(
            build_id = %build.id,
            job = %job.name,
            number = build.number,
            trigger = build.trigger.kind.as_str(),
            "Freestyle build queued"
        );

        let executor = self.freestyle.clone();
        let active = self.active.clone();
        let build_id = build.id.clone();
        self.tracker.spawn(async move {
            if let Err(e) = executor.execute(&job, &build_id, token).await {
                tracing::error!(build_id = %build_id, "Freestyle build aborted: {e}");
            }
            Self::unregister(&active, &build_id);
        });
        Ok(build)
    }

    async fn queue_build(
        &self,
        id: &str,
        job_id: &str,
        trigger: TriggerInfo,
        parameters: BTreeMap<String, String>,
    ) -> Result<(FreestyleJob, FreestyleBuild)> {
        let _guard = self.records.acquire().await;
        let mut job: FreestyleJob = self
            .store
            .get_json(Bucket::FreestyleJobs, job_id)
            .await?
            .ok_or_else(|| CicdError::NotFound(format!("freestyle job {job_id}")))?;
        if !job.enabled {
            return Err(CicdError::InvalidState(format!(
                "freestyle job {} is disabled",
                job.name
            )));
        }
        let parameters = resolve_parameters(&job.parameters, &parameters)?;

        let number = job.status.last_build_number + 1;
        let build = FreestyleBuild {
            id: id.to_string(),
            job_id: job.id.clone(),
            job_name: job.name.clone(),
            number,
            status: RunStatus::Pending,
            trigger,
            parameters,
            environment: job.environment.clone(),
            steps: job
                .ordered_steps()
                .into_iter()
                .map(FreestyleBuildStep::pending)
                .collect(),
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            duration_ms: None,
            error: None,
        };
        self.store
            .put_json(Bucket::FreestyleBuilds, &build.id, &build)
            .await?;

        job.status.last_build_number = number;
        job.status.total_builds += 1;
        job.status.last_build_id = Some(build.id.clone());
        job.status.last_build_status = Some(RunStatus::Pending);
        self.store.put_json(Bucket::FreestyleJobs, &job.id, &job).await?;
        Ok((job, build))
    }

    pub async fn cancel_build(&self, build_id: &str) -> Result<FreestyleBuild> {
        let mut build: FreestyleBuild = self
            .store
            .get_json(Bucket::FreestyleBuilds, build_id)
            .await?
            .ok_or_else(|| CicdError::NotFound(format!("freestyle build {build_id}")))?;
        if build.status.is_terminal() {
            return Err(CicdError::InvalidState(format!(
                "build {build_id} already {}",
                build.status
            )));
        }

        if let Some(token) = self.token_for(build_id) {
            token.cancel();
            tracing::info!(build_id = %build_id, "Freestyle build cancellation requested");
            return Ok(build);
        }

        for step in build.steps.iter_mut() {
            if !step.status.is_terminal() {
                step.set_status(JobStatus::Cancelled);
            }
        }
        build.error = Some("build cancelled".to_string());
        build.set_status(RunStatus::Cancelled);
        self.store
            .put_json(Bucket::FreestyleBuilds, &build.id, &build)
            .await?;
        if let Some(event) = LifecycleEvent::for_build(&build) {
            self.notifier.dispatch(event);
        }
        crate::metrics::run_status_changed("freestyle", "cancelled");
        tracing::info!(build_id = %build_id, "Detached freestyle build cancelled");
        Ok(build)
    }

    /// `POST /cicd/freestyle/webhook/{token}`.
    pub async fn freestyle_webhook(
        &self,
        token: &str,
        signature_header: Option<&str>,
        body: &[u8],
    ) -> Result<FreestyleBuild> {
        let result = self
            .accept_freestyle_webhook(token, signature_header, body)
            .await;
        crate::metrics::webhook_received("freestyle", result.is_ok());
        let (job_id, payload) = result?;
        self.trigger_freestyle(&job_id, TriggerInfo::webhook("webhook"), payload.parameters())
            .await
    }

    async fn accept_freestyle_webhook(
        &self,
        token: &str,
        signature_header: Option<&str>,
        body: &[u8],
    ) -> Result<(String, FreestyleWebhookPayload)> {
        let jobs: Vec<FreestyleJob> = self.store.list_json(Bucket::FreestyleJobs).await?;
        let mut matched = None;
        for job in jobs {
            let hit = job
                .status
                .webhook_token
                .as_deref()
                .is_some_and(|t| !t.is_empty() && signature::tokens_match(t, token));
            if hit && matched.is_none() {
                matched = Some(job);
            }
        }
        let Some(job) = matched else {
            tracing::warn!("Freestyle webhook rejected: unknown token");
            return Err(CicdError::Unauthorized("invalid webhook token".to_string()));
        };
        if !job.webhook_enabled() {
            return Err(CicdError::Unauthorized(
                "webhook trigger is disabled".to_string(),
            ));
        }
        if let Some(secret) = job.status.webhook_secret.as_deref().filter(|s| !s.is_empty()) {
            verify_signature(secret, body, signature_header)?;
        }
        Ok((job.id, parse_body(body)?))
    }

    // ── Lifecycle ──

    /// Cancel everything in flight and wait for the executors to return.
    pub async fn shutdown(&self) {
        let tokens: Vec<CancellationToken> = self
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        if !tokens.is_empty() {
            tracing::info!(count = tokens.len(), "Cancelling in-flight runs and builds");
        }
        for token in tokens {
            token.cancel();
        }
        self.tracker.close();
        self.tracker.wait().await;
    }

    /// Wait for every spawned run/build task to finish without cancelling.
    pub async fn wait_idle(&self) {
        self.tracker.close();
        self.tracker.wait().await;
        self.tracker.reopen();
    }
}

fn verify_signature(secret: &str, body: &[u8], header: Option<&str>) -> Result<()> {
    match header {
        Some(sig) if signature::verify(secret, body, sig) => Ok(()),
        Some(_) => {
            tracing::warn!("Webhook rejected: signature mismatch");
            Err(CicdError::Unauthorized("invalid webhook signature".to_string()))
        }
        None => Err(CicdError::Unauthorized(format!(
            "missing {} header",
            signature::SIGNATURE_HEADER
        ))),
    }
}
