//! Pipeline CRUD, run history and historical logs.

use std::sync::Arc;

use crate::error::{CicdError, Result};
use crate::models::pipeline::{JobRun, Pipeline, PipelineRun};
use crate::services::artifact_service::ArtifactStore;
use crate::services::cluster::{ClusterApi, CONTAINER_NAME};
use crate::services::parser::PipelineParser;
use crate::services::scheduler::Scheduler;
use crate::services::trigger_gateway::TriggerGateway;
use crate::storage::{Bucket, KvStore, KvStoreExt, RecordLock};

pub struct PipelineService {
    store: Arc<dyn KvStore>,
    parser: PipelineParser,
    scheduler: Arc<Scheduler>,
    gateway: Arc<TriggerGateway>,
    artifacts: Arc<ArtifactStore>,
    cluster: Arc<dyn ClusterApi>,
    records: RecordLock,
}

impl PipelineService {
    pub fn new(
        store: Arc<dyn KvStore>,
        parser: PipelineParser,
        scheduler: Arc<Scheduler>,
        gateway: Arc<TriggerGateway>,
        artifacts: Arc<ArtifactStore>,
        cluster: Arc<dyn ClusterApi>,
        records: RecordLock,
    ) -> Self {
        Self {
            store,
            parser,
            scheduler,
            gateway,
            artifacts,
            cluster,
            records,
        }
    }

    /// Parse, validate and store a new pipeline document.
    pub async fn create(&self, source: &str) -> Result<Pipeline> {
        let pipeline = self.parser.parse(source)?;
        let _guard = self.records.acquire().await;
        self.ensure_unique_name(&pipeline.name, None).await?;
        self.store
            .put_json(Bucket::Pipelines, &pipeline.id, &pipeline)
            .await?;
        self.scheduler.register_pipeline(&pipeline);
        tracing::info!(pipeline_id = %pipeline.id, name = %pipeline.name, "Pipeline created");
        Ok(pipeline)
    }

    /// Replace a pipeline's document, keeping id, counters and webhook token.
    pub async fn update(&self, id: &str, source: &str) -> Result<Pipeline> {
        let _guard = self.records.acquire().await;
        let existing = self.get(id).await?;
        let pipeline = self.parser.reparse(&existing, source)?;
        self.ensure_unique_name(&pipeline.name, Some(id)).await?;
        self.store
            .put_json(Bucket::Pipelines, &pipeline.id, &pipeline)
            .await?;
        self.scheduler.register_pipeline(&pipeline);
        tracing::info!(pipeline_id = %pipeline.id, name = %pipeline.name, "Pipeline updated");
        Ok(pipeline)
    }

    async fn ensure_unique_name(&self, name: &str, except: Option<&str>) -> Result<()> {
        let taken = self
            .list()
            .await?
            .iter()
            .any(|p| p.name == name && Some(p.id.as_str()) != except);
        if taken {
            return Err(CicdError::Validation(format!(
                "a pipeline named '{name}' already exists"
            )));
        }
        Ok(())
    }

    pub async fn get(&self, id: &str) -> Result<Pipeline> {
        self.store
            .get_json(Bucket::Pipelines, id)
            .await?
            .ok_or_else(|| CicdError::NotFound(format!("pipeline {id}")))
    }

    /// All pipelines, by name.
    pub async fn list(&self) -> Result<Vec<Pipeline>> {
        let mut pipelines: Vec<Pipeline> = self.store.list_json(Bucket::Pipelines).await?;
        pipelines.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(pipelines)
    }

    /// Delete a pipeline with its runs and their artifacts. Unfinished runs are cancelled first.
    pub async fn delete(&self, id: &str) -> Result<()> {
        let _guard = self.records.acquire().await;
        let pipeline = self.get(id).await?;
        self.scheduler.unregister_pipeline(id);

        for run in self.list_runs(id).await? {
            if !run.status.is_terminal() {
                if let Err(e) = self.gateway.cancel_run(&run.id).await {
                    tracing::warn!(run_id = %run.id, "Cancel before delete failed: {e}");
                }
            }
            self.purge_run(&run.id).await?;
        }

        self.store.delete(Bucket::Pipelines, id).await?;
        tracing::info!(pipeline_id = %id, name = %pipeline.name, "Pipeline deleted");
        Ok(())
    }

    /// Runs of one pipeline, newest first.
    pub async fn list_runs(&self, pipeline_id: &str) -> Result<Vec<PipelineRun>> {
        let mut runs: Vec<PipelineRun> = self
            .store
            .list_json::<PipelineRun>(Bucket::PipelineRuns)
            .await?
            .into_iter()
            .filter(|r| r.pipeline_id == pipeline_id)
            .collect();
        runs.sort_by(|a, b| b.number.cmp(&a.number));
        Ok(runs)
    }

    pub async fn get_run(&self, run_id: &str) -> Result<PipelineRun> {
        self.store
            .get_json(Bucket::PipelineRuns, run_id)
            .await?
            .ok_or_else(|| CicdError::NotFound(format!("pipeline run {run_id}")))
    }

    /// Delete one finished run and its artifacts.
    pub async fn delete_run(&self, run_id: &str) -> Result<()> {
        let run = self.get_run(run_id).await?;
        if !run.status.is_terminal() {
            return Err(CicdError::InvalidState(format!(
                "run {run_id} is {}; cancel it first",
                run.status
            )));
        }
        self.purge_run(run_id).await
    }

    async fn purge_run(&self, run_id: &str) -> Result<()> {
        match self.artifacts.purge_run(run_id).await {
            Ok(0) => {}
            Ok(n) => tracing::debug!(run_id = %run_id, artifacts = n, "Run artifacts purged"),
            Err(e) => tracing::warn!(run_id = %run_id, "Artifact purge failed: {e}"),
        }
        self.store.delete(Bucket::PipelineRuns, run_id).await
    }

    /// Stored logs for a run, one section per job in declared order.
    pub async fn run_logs(&self, run_id: &str) -> Result<String> {
        let run = self.get_run(run_id).await?;
        let mut out = String::new();
        for job in &run.jobs {
            let logs = self.logs_for(job).await;
            if logs.is_empty() {
                continue;
            }
            out.push_str(&format!("==> [{}] {}\n", job.name, job.status));
            out.push_str(&logs);
            if !logs.ends_with('\n') {
                out.push('\n');
            }
        }
        Ok(out)
    }

    /// Stored logs for one job of a run.
    pub async fn job_logs(&self, run_id: &str, job_name: &str) -> Result<String> {
        let run = self.get_run(run_id).await?;
        let job = run
            .job(job_name)
            .ok_or_else(|| CicdError::NotFound(format!("job {job_name} in run {run_id}")))?;
        Ok(self.logs_for(job).await)
    }

    /// Persisted logs, or the Pod's logs when nothing was persisted yet.
    async fn logs_for(&self, job: &JobRun) -> String {
        if !job.logs.is_empty() {
            return job.logs.clone();
        }
        let Some(pod) = job.pod.as_deref() else {
            return String::new();
        };
        match self.cluster.pod_logs(pod, CONTAINER_NAME).await {
            Ok(logs) => logs,
            Err(e) => {
                tracing::debug!(pod = %pod, "Pod logs unavailable: {e}");
                String::new()
            }
        }
    }
}
