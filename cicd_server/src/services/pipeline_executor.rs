//! Pipeline executor — drives one run through its jobs as cluster Jobs.
//!
//! Jobs run strictly one at a time in document order. A job may only depend
//! on jobs declared before it; a dependency that has not succeeded (or been
//! skipped) cancels the job and fails the run. After the first failure every
//! job still pending is cancelled.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt;
use tokio::time::sleep_until;
use tokio_util::sync::CancellationToken;

use crate::error::{CicdError, Result};
use crate::events::lifecycle::LifecycleEvent;
use crate::models::pipeline::{JobSpec, Pipeline, PipelineRun};
use crate::models::{JobStatus, RunStatus};
use crate::services::cluster::{
    cluster_job_name, label_value, ClusterApi, JobManifest, JobPhase, Propagation,
    CONTAINER_NAME, LABEL_JOB_NAME, LABEL_PIPELINE_ID, LABEL_RUN_ID,
};
use crate::services::notification::NotificationDispatcher;
use crate::services::output_stream::{
    truncate_output, OutputSink, OutputStream, OutputStreams, TeeSink,
};
use crate::storage::{Bucket, KvStore, KvStoreExt, RecordLock};

/// Persisted per-job log cap.
pub const MAX_LOG_BYTES: usize = 64 * 1024;

/// How long to let the log follower drain after the Job finishes.
const LOG_DRAIN_GRACE: Duration = Duration::from_secs(5);

/// Deadline used when `now + timeout` is not representable.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

#[derive(Debug, Clone)]
pub struct PipelineExecutorSettings {
    /// Base URL injected as the artifact upload target.
    pub public_url: String,
    pub poll_interval: Duration,
}

/// Result of one job attempt.
#[derive(Debug)]
struct JobOutcome {
    status: JobStatus,
    pod: Option<String>,
    exit_code: Option<i32>,
    error: Option<String>,
    logs: Vec<u8>,
}

impl JobOutcome {
    fn failed(error: impl Into<String>) -> Self {
        Self {
            status: JobStatus::Failed,
            pod: None,
            exit_code: None,
            error: Some(error.into()),
            logs: Vec::new(),
        }
    }
}

pub struct PipelineExecutor {
    store: Arc<dyn KvStore>,
    cluster: Arc<dyn ClusterApi>,
    streams: Arc<OutputStreams>,
    notifier: Arc<NotificationDispatcher>,
    records: RecordLock,
    settings: PipelineExecutorSettings,
}

impl PipelineExecutor {
    pub fn new(
        store: Arc<dyn KvStore>,
        cluster: Arc<dyn ClusterApi>,
        streams: Arc<OutputStreams>,
        notifier: Arc<NotificationDispatcher>,
        records: RecordLock,
        settings: PipelineExecutorSettings,
    ) -> Self {
        Self {
            store,
            cluster,
            streams,
            notifier,
            records,
            settings,
        }
    }

    /// Label selector matching every cluster Job of a run.
    pub fn run_selector(run_id: &str) -> String {
        format!("{LABEL_RUN_ID}={run_id}")
    }

    /// Execute a stored pending run to completion and return its final record.
    ///
    /// If the run cannot be driven to the end (storage failure), it is marked
    /// failed on a best-effort basis and its output stream is closed.
    pub async fn execute(
        &self,
        pipeline: &Pipeline,
        run_id: &str,
        cancel: CancellationToken,
    ) -> Result<PipelineRun> {
        match self.drive(pipeline, run_id, cancel).await {
            Ok(run) => Ok(run),
            Err(e) => {
                self.abort(run_id, &e).await;
                Err(e)
            }
        }
    }

    async fn drive(
        &self,
        pipeline: &Pipeline,
        run_id: &str,
        cancel: CancellationToken,
    ) -> Result<PipelineRun> {
        let mut run: PipelineRun = self
            .store
            .get_json(Bucket::PipelineRuns, run_id)
            .await?
            .ok_or_else(|| CicdError::NotFound(format!("pipeline run {run_id}")))?;

        if run.status.is_terminal() {
            return Ok(run);
        }
        let stream = self.streams.open(&run.id);
        let started = Instant::now();

        if cancel.is_cancelled() || !run.set_status(RunStatus::Running) {
            self.finish(&mut run, &stream, RunStatus::Cancelled, None).await?;
            return Ok(run);
        }
        self.save(&run).await?;
        self.emit(&run);
        crate::metrics::run_status_changed("pipeline", "running");
        tracing::info!(
            run_id = %run.id,
            pipeline = %pipeline.name,
            number = run.number,
            "Pipeline run started"
        );
        stream.write(
            format!("==> Pipeline {} run #{}\n", pipeline.name, run.number).as_bytes(),
        );

        let mut failure: Option<String> = None;
        for (index, spec) in pipeline.spec.jobs.iter().enumerate() {
            if cancel.is_cancelled() || failure.is_some() {
                break;
            }

            if let Some(reason) = unsatisfied_dependency(&run, index, spec) {
                stream.write(format!("==> Job {} cancelled: {reason}\n", spec.name).as_bytes());
                tracing::warn!(run_id = %run.id, job = %spec.name, "{reason}");
                let job = &mut run.jobs[index];
                job.set_status(JobStatus::Cancelled);
                job.error = Some(reason.clone());
                failure = Some(format!("job '{}': {reason}", spec.name));
                self.save(&run).await?;
                break;
            }

            if let Some(var) = spec.skip_if.as_deref() {
                if is_truthy(run.variables.get(var).map(String::as_str)) {
                    stream.write(format!("==> Job {} skipped ({var} is set)\n", spec.name).as_bytes());
                    tracing::info!(run_id = %run.id, job = %spec.name, "Job skipped");
                    run.jobs[index].set_status(JobStatus::Skipped);
                    self.save(&run).await?;
                    continue;
                }
            }

            let cluster_job = cluster_job_name(&run.id, &spec.name);
            {
                let job = &mut run.jobs[index];
                job.set_status(JobStatus::Running);
                job.cluster_job = Some(cluster_job.clone());
            }
            self.save(&run).await?;
            stream.write(format!("==> Job {} ({})\n", spec.name, spec.image).as_bytes());

            let job_started = Instant::now();
            let outcome = self
                .run_job(pipeline, &run, spec, &cluster_job, &stream, &cancel)
                .await;
            crate::metrics::job_duration(&spec.name, job_started.elapsed().as_millis() as u64);

            let job = &mut run.jobs[index];
            job.pod = outcome.pod;
            job.exit_code = outcome.exit_code;
            job.error = outcome.error.clone();
            job.logs = truncate_output(&outcome.logs, MAX_LOG_BYTES);
            job.set_status(outcome.status);

            match outcome.status {
                JobStatus::Succeeded => {
                    tracing::info!(run_id = %run.id, job = %spec.name, "Job succeeded");
                }
                JobStatus::Cancelled => {
                    tracing::info!(run_id = %run.id, job = %spec.name, "Job cancelled");
                }
                _ => {
                    let err = outcome.error.unwrap_or_else(|| "job failed".to_string());
                    tracing::warn!(run_id = %run.id, job = %spec.name, "Job failed: {err}");
                    stream.write(format!("==> Job {} failed: {err}\n", spec.name).as_bytes());
                    failure = Some(format!("job '{}' failed: {err}", spec.name));
                }
            }
            self.save(&run).await?;
        }

        for job in run.jobs.iter_mut() {
            if job.status == JobStatus::Pending {
                job.set_status(JobStatus::Cancelled);
            }
        }

        let (status, error) = if cancel.is_cancelled() {
            (RunStatus::Cancelled, Some("run cancelled".to_string()))
        } else if let Some(err) = failure {
            (RunStatus::Failed, Some(err))
        } else {
            (RunStatus::Succeeded, None)
        };
        self.finish(&mut run, &stream, status, error).await?;
        crate::metrics::run_duration("pipeline", started.elapsed().as_millis() as u64);
        Ok(run)
    }

    async fn finish(
        &self,
        run: &mut PipelineRun,
        stream: &Arc<OutputStream>,
        status: RunStatus,
        error: Option<String>,
    ) -> Result<()> {
        for job in run.jobs.iter_mut() {
            if !job.status.is_terminal() {
                job.set_status(JobStatus::Cancelled);
            }
        }
        run.error = error;
        run.set_status(status);
        self.save(run).await?;
        self.record_last_status(run).await;
        self.emit(run);
        crate::metrics::run_status_changed("pipeline", status.as_str());
        stream.write(format!("==> Run finished: {status}\n").as_bytes());
        self.streams.finish(&run.id);
        tracing::info!(
            run_id = %run.id,
            status = status.as_str(),
            duration_ms = run.duration_ms.unwrap_or_default(),
            "Pipeline run finished"
        );
        Ok(())
    }

    /// Close out a run whose execution stopped on an error.
    async fn abort(&self, run_id: &str, err: &CicdError) {
        self.cancel_cluster_jobs(run_id).await;
        let stored = self
            .store
            .get_json::<PipelineRun>(Bucket::PipelineRuns, run_id)
            .await;
        match stored {
            Ok(Some(mut run)) if !run.status.is_terminal() => {
                for job in run.jobs.iter_mut() {
                    if !job.status.is_terminal() {
                        job.set_status(JobStatus::Cancelled);
                    }
                }
                run.error = Some(format!("run aborted: {err}"));
                run.set_status(RunStatus::Failed);
                match self.save(&run).await {
                    Ok(()) => {
                        self.record_last_status(&run).await;
                        self.emit(&run);
                        crate::metrics::run_status_changed("pipeline", "failed");
                    }
                    Err(e) => {
                        tracing::error!(run_id = %run_id, "Failed to record aborted run: {e}")
                    }
                }
            }
            Ok(_) => {}
            Err(e) => tracing::error!(run_id = %run_id, "Failed to load aborted run: {e}"),
        }
        if let Some(stream) = self.streams.get(run_id) {
            stream.write(format!("==> Run aborted: {err}\n").as_bytes());
        }
        self.streams.finish(run_id);
    }

    async fn save(&self, run: &PipelineRun) -> Result<()> {
        self.store.put_json(Bucket::PipelineRuns, &run.id, run).await
    }

    fn emit(&self, run: &PipelineRun) {
        if let Some(event) = LifecycleEvent::for_run(run) {
            self.notifier.dispatch(event);
        }
    }

    async fn record_last_status(&self, run: &PipelineRun) {
        let result: Result<()> = async {
            let _guard = self.records.acquire().await;
            let Some(mut pipeline) = self
                .store
                .get_json::<Pipeline>(Bucket::Pipelines, &run.pipeline_id)
                .await?
            else {
                return Ok(());
            };
            if pipeline.status.last_run_id.as_deref() == Some(run.id.as_str()) {
                pipeline.status.last_run_status = Some(run.status);
                self.store
                    .put_json(Bucket::Pipelines, &pipeline.id, &pipeline)
                    .await?;
            }
            Ok(())
        }
        .await;
        if let Err(e) = result {
            tracing::warn!(run_id = %run.id, "Failed to update pipeline status: {e}");
        }
    }

    fn manifest(&self, pipeline: &Pipeline, run: &PipelineRun, spec: &JobSpec, name: &str) -> JobManifest {
        let mut env = BTreeMap::new();
        env.insert("PIPELINE_ID".to_string(), pipeline.id.clone());
        env.insert("PIPELINE_NAME".to_string(), pipeline.name.clone());
        env.insert("RUN_ID".to_string(), run.id.clone());
        env.insert("RUN_NUMBER".to_string(), run.number.to_string());
        env.insert("JOB_NAME".to_string(), spec.name.clone());
        env.insert("TRIGGER_TYPE".to_string(), run.trigger.kind.as_str().to_string());
        env.insert(
            "OPSDECK_ARTIFACT_URL".to_string(),
            format!(
                "{}/cicd/runs/{}/artifacts",
                self.settings.public_url.trim_end_matches('/'),
                run.id
            ),
        );
        env.extend(run.variables.clone());
        for var in &spec.env {
            env.insert(var.name.clone(), var.value.clone());
        }

        let labels = BTreeMap::from([
            (LABEL_RUN_ID.to_string(), run.id.clone()),
            (LABEL_PIPELINE_ID.to_string(), pipeline.id.clone()),
            (LABEL_JOB_NAME.to_string(), label_value(&spec.name)),
        ]);

        JobManifest {
            name: name.to_string(),
            labels,
            image: spec.image.clone(),
            script: spec.script.clone(),
            workdir: spec.workdir.clone(),
            env: env.into_iter().collect(),
            resources: spec.resources.clone(),
            secrets: spec.secrets.clone(),
            privileged: spec.privileged,
            deadline_secs: spec.timeout_secs,
        }
    }

    async fn run_job(
        &self,
        pipeline: &Pipeline,
        run: &PipelineRun,
        spec: &JobSpec,
        name: &str,
        stream: &Arc<OutputStream>,
        cancel: &CancellationToken,
    ) -> JobOutcome {
        let manifest = self.manifest(pipeline, run, spec, name);
        if let Err(e) = self.cluster.create_job(&manifest).await {
            return JobOutcome::failed(format!("failed to create cluster job: {e}"));
        }
        tracing::debug!(run_id = %run.id, job = %spec.name, cluster_job = %name, "Cluster job created");

        let timeout = Duration::from_secs(spec.timeout_secs);
        let deadline = deadline_after(timeout);

        // Wait for the backing Pod to show up.
        let pod = loop {
            match self.cluster.list_pods(name).await {
                Ok(pods) if !pods.is_empty() => break pods[0].name.clone(),
                Ok(_) => {}
                Err(e) => tracing::debug!(cluster_job = %name, "Pod lookup failed: {e}"),
            }
            tokio::select! {
                _ = cancel.cancelled() => {
                    self.cancel_cluster_jobs(&run.id).await;
                    return interrupted(JobStatus::Cancelled, None, "cancelled", Vec::new());
                }
                _ = sleep_until(deadline) => {
                    self.delete(name, Propagation::Background).await;
                    return interrupted(
                        JobStatus::Failed,
                        None,
                        &format!("timed out after {}s waiting for pod", timeout.as_secs()),
                        Vec::new(),
                    );
                }
                _ = tokio::time::sleep(self.settings.poll_interval) => {}
            }
        };

        let sink = Arc::new(TeeSink::new(stream.clone()));
        let follow_stop = cancel.child_token();
        let follower = tokio::spawn(follow_logs(
            self.cluster.clone(),
            pod.clone(),
            sink.clone(),
            follow_stop.clone(),
            self.settings.poll_interval,
        ));

        let verdict = self.watch_until_done(name, &run.id, deadline, timeout, cancel).await;

        // Let the log stream drain, then stop following.
        let _ = tokio::time::timeout(LOG_DRAIN_GRACE, async {
            follow_stop.cancelled().await;
        })
        .await;
        follow_stop.cancel();
        let _ = follower.await;
        let mut logs = sink.take();
        if logs.is_empty() && verdict.is_ok() {
            if let Ok(text) = self.cluster.pod_logs(&pod, CONTAINER_NAME).await {
                stream.write(text.as_bytes());
                logs = text.into_bytes();
            }
        }

        match verdict {
            Ok((phase, message)) => {
                let exit_code = self.pod_exit_code(name).await;
                self.delete(name, Propagation::Orphan).await;
                match phase {
                    JobPhase::Complete => JobOutcome {
                        status: JobStatus::Succeeded,
                        pod: Some(pod),
                        exit_code: exit_code.or(Some(0)),
                        error: None,
                        logs,
                    },
                    _ => JobOutcome {
                        status: JobStatus::Failed,
                        pod: Some(pod),
                        exit_code,
                        error: Some(match (message, exit_code) {
                            (Some(m), _) => m,
                            (None, Some(code)) => format!("exit code {code}"),
                            (None, None) => "job failed".to_string(),
                        }),
                        logs,
                    },
                }
            }
            Err(WatchEnd::Cancelled) => {
                interrupted(JobStatus::Cancelled, Some(pod), "cancelled", logs)
            }
            Err(WatchEnd::Failed(err)) => interrupted(JobStatus::Failed, Some(pod), &err, logs),
        }
    }

    /// Watch the Job until it reaches a terminal condition. Timeouts and watch
    /// failures delete the Job (background); cancellation deletes every Job of
    /// the run.
    async fn watch_until_done(
        &self,
        name: &str,
        run_id: &str,
        deadline: tokio::time::Instant,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> std::result::Result<(JobPhase, Option<String>), WatchEnd> {
        let mut events = match self.cluster.watch_job(name).await {
            Ok(events) => events,
            Err(e) => {
                self.delete(name, Propagation::Background).await;
                return Err(WatchEnd::Failed(format!("watch failed: {e}")));
            }
        };
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    self.cancel_cluster_jobs(run_id).await;
                    return Err(WatchEnd::Cancelled);
                }
                _ = sleep_until(deadline) => {
                    self.delete(name, Propagation::Background).await;
                    return Err(WatchEnd::Failed(format!("timed out after {}s", timeout.as_secs())));
                }
                event = events.next() => match event {
                    Some(Ok(state)) => match state.phase {
                        JobPhase::Active => {}
                        phase => return Ok((phase, state.message)),
                    },
                    Some(Err(e)) => {
                        self.delete(name, Propagation::Background).await;
                        return Err(WatchEnd::Failed(format!("watch failed: {e}")));
                    }
                    None => {
                        // Server closed the watch; check once and re-open.
                        match self.cluster.get_job(name).await {
                            Ok(Some(state)) if state.phase != JobPhase::Active => {
                                return Ok((state.phase, state.message));
                            }
                            Ok(Some(_)) => {}
                            Ok(None) => {
                                return Err(WatchEnd::Failed("cluster job disappeared".to_string()));
                            }
                            Err(e) => {
                                self.delete(name, Propagation::Background).await;
                                return Err(WatchEnd::Failed(format!("watch failed: {e}")));
                            }
                        }
                        match self.cluster.watch_job(name).await {
                            Ok(next) => events = next,
                            Err(e) => {
                                self.delete(name, Propagation::Background).await;
                                return Err(WatchEnd::Failed(format!("watch failed: {e}")));
                            }
                        }
                    }
                },
            }
        }
    }

    async fn pod_exit_code(&self, job_name: &str) -> Option<i32> {
        self.cluster
            .list_pods(job_name)
            .await
            .ok()?
            .into_iter()
            .find_map(|p| p.exit_code)
    }

    async fn delete(&self, name: &str, propagation: Propagation) {
        if let Err(e) = self.cluster.delete_job(name, propagation).await {
            tracing::warn!(cluster_job = %name, "Failed to delete cluster job: {e}");
        }
    }

    /// Delete every cluster Job labeled with the run id.
    pub async fn cancel_cluster_jobs(&self, run_id: &str) {
        if let Err(e) = self
            .cluster
            .delete_jobs_by_label(&Self::run_selector(run_id), Propagation::Background)
            .await
        {
            tracing::warn!(run_id = %run_id, "Failed to delete run jobs: {e}");
        }
    }
}

enum WatchEnd {
    Cancelled,
    Failed(String),
}

fn interrupted(status: JobStatus, pod: Option<String>, error: &str, logs: Vec<u8>) -> JobOutcome {
    JobOutcome {
        status,
        pod,
        exit_code: None,
        error: Some(error.to_string()),
        logs,
    }
}

/// Follow the Pod's log stream into `sink`, retrying while the container is
/// still starting, until the stream ends or `stop` fires.
async fn follow_logs(
    cluster: Arc<dyn ClusterApi>,
    pod: String,
    sink: Arc<TeeSink>,
    stop: CancellationToken,
    retry: Duration,
) {
    loop {
        let opened = tokio::select! {
            _ = stop.cancelled() => return,
            r = cluster.follow_pod_logs(&pod, CONTAINER_NAME) => r,
        };
        match opened {
            Ok(mut chunks) => {
                loop {
                    tokio::select! {
                        _ = stop.cancelled() => return,
                        chunk = chunks.next() => match chunk {
                            Some(Ok(bytes)) => sink.write(&bytes),
                            Some(Err(e)) => {
                                tracing::debug!(pod = %pod, "Log stream error: {e}");
                                break;
                            }
                            None => {
                                stop.cancel();
                                return;
                            }
                        },
                    }
                }
            }
            Err(e) => tracing::debug!(pod = %pod, "Log stream not ready: {e}"),
        }
        tokio::select! {
            _ = stop.cancelled() => return,
            _ = tokio::time::sleep(retry) => {}
        }
    }
}

/// `None` when every dependency of job `index` is declared earlier and has
/// succeeded or been skipped; otherwise the reason it cannot run.
fn unsatisfied_dependency(run: &PipelineRun, index: usize, spec: &JobSpec) -> Option<String> {
    for dep in &spec.depends_on {
        match run.jobs.iter().position(|j| &j.name == dep) {
            Some(pos) if pos < index => {
                let status = run.jobs[pos].status;
                if !status.satisfies_dependency() {
                    return Some(format!("dependency '{dep}' is {status}"));
                }
            }
            Some(_) => {
                return Some(format!("dependency '{dep}' is declared after this job"));
            }
            None => return Some(format!("dependency '{dep}' does not exist")),
        }
    }
    None
}

/// `now + timeout`, or a far-future instant when that overflows.
fn deadline_after(timeout: Duration) -> tokio::time::Instant {
    let now = tokio::time::Instant::now();
    now.checked_add(timeout)
        .or_else(|| now.checked_add(FAR_FUTURE))
        .unwrap_or(now)
}

/// `true`, `1` or `yes`, case-insensitively.
pub fn is_truthy(value: Option<&str>) -> bool {
    value.is_some_and(|v| {
        let v = v.trim();
        v.eq_ignore_ascii_case("true") || v == "1" || v.eq_ignore_ascii_case("yes")
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::pipeline::JobRun;
    use crate::models::TriggerInfo;

    fn spec(name: &str, deps: &[&str]) -> JobSpec {
        JobSpec {
            name: name.into(),
            image: "alpine".into(),
            script: "true".into(),
            workdir: None,
            timeout_secs: 60,
            privileged: false,
            resources: Default::default(),
            env: vec![],
            secrets: vec![],
            depends_on: deps.iter().map(|d| d.to_string()).collect(),
            skip_if: None,
        }
    }

    fn run_with(statuses: &[(&str, JobStatus)]) -> PipelineRun {
        PipelineRun {
            id: "r".into(),
            pipeline_id: "p".into(),
            pipeline_name: "p".into(),
            number: 1,
            status: RunStatus::Running,
            trigger: TriggerInfo::manual(""),
            variables: BTreeMap::new(),
            jobs: statuses
                .iter()
                .map(|(n, s)| {
                    let mut j = JobRun::pending(n);
                    j.status = *s;
                    j
                })
                .collect(),
            created_at: chrono::Utc::now(),
            started_at: None,
            finished_at: None,
            duration_ms: None,
            error: None,
        }
    }

    #[test]
    fn test_truthy_values() {
        for v in ["true", "TRUE", "1", "yes", "Yes"] {
            assert!(is_truthy(Some(v)), "{v}");
        }
        for v in ["false", "0", "no", "", "y"] {
            assert!(!is_truthy(Some(v)), "{v}");
        }
        assert!(!is_truthy(None));
    }

    #[test]
    fn test_dependency_checks() {
        let run = run_with(&[
            ("build", JobStatus::Succeeded),
            ("lint", JobStatus::Skipped),
            ("test", JobStatus::Pending),
        ]);
        assert!(unsatisfied_dependency(&run, 2, &spec("test", &["build", "lint"])).is_none());

        let run = run_with(&[("build", JobStatus::Failed), ("test", JobStatus::Pending)]);
        let reason = unsatisfied_dependency(&run, 1, &spec("test", &["build"])).unwrap();
        assert!(reason.contains("failed"));
    }

    #[test]
    fn test_deadline_saturates_on_huge_timeouts() {
        let now = tokio::time::Instant::now();
        assert!(deadline_after(Duration::from_secs(u64::MAX)) >= now);
        let soon = deadline_after(Duration::from_secs(60));
        assert!(soon >= now + Duration::from_secs(60));
        assert!(soon <= now + Duration::from_secs(120));
    }

    #[test]
    fn test_dependency_declared_later_is_unsatisfied() {
        let run = run_with(&[("test", JobStatus::Pending), ("build", JobStatus::Pending)]);
        let reason = unsatisfied_dependency(&run, 0, &spec("test", &["build"])).unwrap();
        assert!(reason.contains("declared after"));
    }
}
