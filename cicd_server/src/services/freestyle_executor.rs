//! Runs a freestyle build's steps in order, locally or over SSH.
//!
//! A step that fails stops the build unless it is marked
//! `continue_on_error`; steps after a hard failure are recorded `skipped`.
//! Cancellation is checked before every step and raced by every command, so
//! an interrupted step ends `cancelled` and so does everything after it.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use crate::error::{CicdError, Result};
use crate::events::lifecycle::LifecycleEvent;
use crate::models::freestyle::{BuildStep, FreestyleBuild, FreestyleJob, StepAction, LOCAL_HOST};
use crate::models::{JobStatus, RunStatus};
use crate::services::host_service::HostService;
use crate::services::notification::NotificationDispatcher;
use crate::services::output_stream::{
    truncate_output, OutputSink, OutputStream, OutputStreams, TeeSink,
};
use crate::services::remote_session::{shell_quote, CommandSpec, LocalSession, RemoteSession};
use crate::services::scm_checkout::{self, CheckoutRequest};
use crate::services::variables::VariableScope;
use crate::storage::{Bucket, KvStore, KvStoreExt, RecordLock};

/// Persisted per-step output cap.
pub const MAX_STEP_OUTPUT: usize = 64 * 1024;

#[derive(Debug, Clone)]
pub struct FreestyleExecutorSettings {
    /// Parent directory of per-build checkout workspaces.
    pub workspace_root: String,
}

#[derive(Debug)]
struct StepOutcome {
    status: JobStatus,
    exit_code: Option<i32>,
    error: Option<String>,
}

impl StepOutcome {
    fn from_error(e: CicdError) -> Self {
        let status = match e {
            CicdError::Cancelled => JobStatus::Cancelled,
            _ => JobStatus::Failed,
        };
        Self {
            status,
            exit_code: None,
            error: Some(e.to_string()),
        }
    }

    fn exited(code: i32) -> Self {
        if code == 0 {
            Self {
                status: JobStatus::Succeeded,
                exit_code: Some(0),
                error: None,
            }
        } else {
            Self {
                status: JobStatus::Failed,
                exit_code: Some(code),
                error: Some(format!("exit code {code}")),
            }
        }
    }
}

/// Normalized host id a step runs on.
fn step_host(step: &BuildStep) -> &str {
    if step.is_local() {
        LOCAL_HOST
    } else {
        &step.host_id
    }
}

pub struct FreestyleExecutor {
    store: Arc<dyn KvStore>,
    hosts: Arc<HostService>,
    streams: Arc<OutputStreams>,
    notifier: Arc<NotificationDispatcher>,
    records: RecordLock,
    settings: FreestyleExecutorSettings,
    local: LocalSession,
}

impl FreestyleExecutor {
    pub fn new(
        store: Arc<dyn KvStore>,
        hosts: Arc<HostService>,
        streams: Arc<OutputStreams>,
        notifier: Arc<NotificationDispatcher>,
        records: RecordLock,
        settings: FreestyleExecutorSettings,
    ) -> Self {
        Self {
            store,
            hosts,
            streams,
            notifier,
            records,
            settings,
            local: LocalSession::new(),
        }
    }

    /// Execute a stored pending build to completion and return its final record.
    pub async fn execute(
        &self,
        job: &FreestyleJob,
        build_id: &str,
        cancel: CancellationToken,
    ) -> Result<FreestyleBuild> {
        match self.drive(job, build_id, cancel).await {
            Ok(build) => Ok(build),
            Err(e) => {
                self.abort(build_id, &e).await;
                Err(e)
            }
        }
    }

    async fn drive(
        &self,
        job: &FreestyleJob,
        build_id: &str,
        cancel: CancellationToken,
    ) -> Result<FreestyleBuild> {
        let mut build: FreestyleBuild = self
            .store
            .get_json(Bucket::FreestyleBuilds, build_id)
            .await?
            .ok_or_else(|| CicdError::NotFound(format!("freestyle build {build_id}")))?;

        if build.status.is_terminal() {
            return Ok(build);
        }
        let stream = self.streams.open(&build.id);
        let started = Instant::now();

        if cancel.is_cancelled() || !build.set_status(RunStatus::Running) {
            self.finish(&mut build, &stream, RunStatus::Cancelled, Some("build cancelled".into()))
                .await?;
            return Ok(build);
        }
        self.save(&build).await?;
        self.emit(&build);
        crate::metrics::run_status_changed("freestyle", "running");
        tracing::info!(
            build_id = %build.id,
            job = %build.job_name,
            number = build.number,
            "Freestyle build started"
        );
        stream.write(format!("==> Build {} #{}\n", build.job_name, build.number).as_bytes());

        let mut scope = VariableScope {
            parameters: build.parameters.clone(),
            environment: build.environment.clone(),
            builtins: BTreeMap::from([
                ("BUILD_ID".to_string(), build.id.clone()),
                ("BUILD_NUMBER".to_string(), build.number.to_string()),
                ("JOB_ID".to_string(), build.job_id.clone()),
                ("JOB_NAME".to_string(), build.job_name.clone()),
                ("TRIGGER_TYPE".to_string(), build.trigger.kind.as_str().to_string()),
            ]),
        };

        let mut failure: Option<String> = None;
        let mut workspace: Option<(String, String)> = None;

        if let Some(scm) = job.scm.as_ref().filter(|s| !s.repositories.is_empty()) {
            let host = build
                .steps
                .first()
                .map(|s| step_host(&s.step).to_string())
                .unwrap_or_else(|| LOCAL_HOST.to_string());
            match self.checkout(job, &build, scm, &host, &stream, &cancel).await {
                Ok(result) => {
                    scope.builtins.insert("WORKSPACE".into(), result.workspace.clone());
                    scope.builtins.insert("GIT_COMMIT".into(), result.commit.clone());
                    scope.builtins.insert("GIT_BRANCH".into(), result.branch.clone());
                    build.environment.insert("WORKSPACE".into(), result.workspace.clone());
                    build.environment.insert("GIT_COMMIT".into(), result.commit);
                    build.environment.insert("GIT_BRANCH".into(), result.branch);
                    workspace = Some((host, result.workspace));
                    self.save(&build).await?;
                }
                Err(CicdError::Cancelled) => {}
                Err(e) => {
                    tracing::warn!(build_id = %build.id, "Checkout failed: {e}");
                    stream.write(format!("==> Checkout failed: {e}\n").as_bytes());
                    failure = Some(format!("checkout failed: {e}"));
                }
            }
        }

        for index in 0..build.steps.len() {
            if cancel.is_cancelled() {
                break;
            }
            if failure.is_some() {
                build.steps[index].set_status(JobStatus::Skipped);
                continue;
            }

            let step = build.steps[index].step.clone();
            build.steps[index].set_status(JobStatus::Running);
            self.save(&build).await?;
            stream.write(
                format!("==> [{}] {} ({})\n", step.order, step.name, step_host(&step)).as_bytes(),
            );

            let workdir = workspace
                .as_ref()
                .filter(|(host, _)| host == step_host(&step))
                .map(|(_, dir)| dir.clone());
            let sink = TeeSink::new(stream.clone());
            let step_started = Instant::now();
            let outcome = self
                .run_step(&build, &step, &scope, workdir, &sink, &cancel)
                .await;
            crate::metrics::step_duration(&step.name, step_started.elapsed().as_millis() as u64);

            let record = &mut build.steps[index];
            record.exit_code = outcome.exit_code;
            record.error = outcome.error.clone();
            record.output = truncate_output(&sink.take(), MAX_STEP_OUTPUT);
            record.set_status(outcome.status);

            match outcome.status {
                JobStatus::Succeeded => {
                    tracing::info!(build_id = %build.id, step = %step.name, "Step succeeded");
                }
                JobStatus::Cancelled => {
                    tracing::info!(build_id = %build.id, step = %step.name, "Step cancelled");
                    stream.write(format!("==> Step {} cancelled\n", step.name).as_bytes());
                }
                _ => {
                    let err = outcome.error.unwrap_or_else(|| "step failed".to_string());
                    stream.write(format!("==> Step {} failed: {err}\n", step.name).as_bytes());
                    if step.continue_on_error {
                        tracing::warn!(
                            build_id = %build.id,
                            step = %step.name,
                            "Step failed, continuing: {err}"
                        );
                    } else {
                        tracing::warn!(build_id = %build.id, step = %step.name, "Step failed: {err}");
                        failure = Some(format!("step '{}' failed: {err}", step.name));
                    }
                }
            }
            self.save(&build).await?;
        }

        let (status, error) = if cancel.is_cancelled() {
            (RunStatus::Cancelled, Some("build cancelled".to_string()))
        } else if let Some(err) = failure {
            (RunStatus::Failed, Some(err))
        } else {
            (RunStatus::Succeeded, None)
        };
        self.finish(&mut build, &stream, status, error).await?;
        crate::metrics::run_duration("freestyle", started.elapsed().as_millis() as u64);
        Ok(build)
    }

    async fn checkout(
        &self,
        job: &FreestyleJob,
        build: &FreestyleBuild,
        scm: &crate::models::freestyle::ScmConfig,
        host: &str,
        stream: &Arc<OutputStream>,
        cancel: &CancellationToken,
    ) -> Result<scm_checkout::CheckoutResult> {
        let mut credentials = Vec::with_capacity(scm.repositories.len());
        for repo in &scm.repositories {
            let auth = match repo.credential_id.as_deref().filter(|c| !c.is_empty()) {
                Some(id) => Some(self.hosts.git_auth(id).await?),
                None => None,
            };
            credentials.push(auth);
        }

        let session = self.open_session(host).await?;
        let request = CheckoutRequest {
            job_name: &job.name,
            build_number: build.number,
            scm,
            credentials,
            workspace_root: &self.settings.workspace_root,
        };
        let result = scm_checkout::checkout(session.as_ref(), &request, &**stream, cancel).await;
        if let Err(e) = session.close().await {
            tracing::debug!(host = %host, "Session close failed: {e}");
        }
        result
    }

    async fn open_session(&self, host: &str) -> Result<Box<dyn RemoteSession>> {
        if host == LOCAL_HOST {
            return Ok(Box::new(self.local.clone()));
        }
        self.hosts
            .connect(host)
            .await
            .map_err(|e| CicdError::Session(format!("connect to host {host}: {e}")))
    }

    async fn run_step(
        &self,
        build: &FreestyleBuild,
        step: &BuildStep,
        scope: &VariableScope,
        workdir: Option<String>,
        sink: &TeeSink,
        cancel: &CancellationToken,
    ) -> StepOutcome {
        if cancel.is_cancelled() {
            return StepOutcome::from_error(CicdError::Cancelled);
        }
        let session = match self.open_session(step_host(step)).await {
            Ok(s) => s,
            Err(e) => return StepOutcome::from_error(e),
        };
        let result = self
            .dispatch(build, step, scope, workdir, session.as_ref(), sink, cancel)
            .await;
        if let Err(e) = session.close().await {
            tracing::debug!(step = %step.name, "Session close failed: {e}");
        }
        match result {
            Ok(outcome) => outcome,
            Err(e) => {
                sink.write(format!("{e}\n").as_bytes());
                StepOutcome::from_error(e)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn dispatch(
        &self,
        build: &FreestyleBuild,
        step: &BuildStep,
        scope: &VariableScope,
        workdir: Option<String>,
        session: &dyn RemoteSession,
        sink: &TeeSink,
        cancel: &CancellationToken,
    ) -> Result<StepOutcome> {
        let timeout = Duration::from_secs(step.timeout_secs.max(1));
        let command_spec = |command: String| CommandSpec {
            command,
            env: scope.process_env(),
            workdir: workdir.clone(),
            timeout,
        };

        match &step.action {
            StepAction::Shell { command } => {
                let spec = command_spec(scope.expand(command));
                let code = session.run_streaming(&spec, sink, cancel).await?;
                Ok(StepOutcome::exited(code))
            }
            StepAction::Script { script } => {
                let path = format!("/tmp/opsdeck-{}-{}.sh", build.id, step.id);
                session
                    .push(&path, scope.expand(script).as_bytes(), cancel)
                    .await?;
                let q = shell_quote(&path);
                let spec = command_spec(format!("sh -e {q}; rc=$?; rm -f {q}; exit $rc"));
                let code = session.run_streaming(&spec, sink, cancel).await?;
                Ok(StepOutcome::exited(code))
            }
            StepAction::ScpPush {
                local_path,
                remote_path,
            } => {
                let local_path = scope.expand(local_path);
                let remote_path = scope.expand(remote_path);
                let bytes = tokio::fs::read(&local_path)
                    .await
                    .map_err(|e| CicdError::Session(format!("read {local_path}: {e}")))?;
                with_deadline(timeout, session.push(&remote_path, &bytes, cancel)).await?;
                sink.write(
                    format!("copied {} bytes {local_path} -> {remote_path}\n", bytes.len())
                        .as_bytes(),
                );
                Ok(StepOutcome::exited(0))
            }
            StepAction::ScpPull {
                remote_path,
                local_path,
            } => {
                let local_path = scope.expand(local_path);
                let remote_path = scope.expand(remote_path);
                let bytes = with_deadline(timeout, session.pull(&remote_path, cancel)).await?;
                if let Some(parent) = Path::new(&local_path).parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
                tokio::fs::write(&local_path, &bytes)
                    .await
                    .map_err(|e| CicdError::Session(format!("write {local_path}: {e}")))?;
                sink.write(
                    format!("copied {} bytes {remote_path} -> {local_path}\n", bytes.len())
                        .as_bytes(),
                );
                Ok(StepOutcome::exited(0))
            }
        }
    }

    async fn finish(
        &self,
        build: &mut FreestyleBuild,
        stream: &Arc<OutputStream>,
        status: RunStatus,
        error: Option<String>,
    ) -> Result<()> {
        for step in build.steps.iter_mut() {
            if !step.status.is_terminal() {
                step.set_status(JobStatus::Cancelled);
            }
        }
        build.error = error;
        build.set_status(status);
        self.save(build).await?;
        self.record_last_status(build).await;
        self.emit(build);
        crate::metrics::run_status_changed("freestyle", status.as_str());
        stream.write(format!("==> Build finished: {status}\n").as_bytes());
        self.streams.finish(&build.id);
        tracing::info!(
            build_id = %build.id,
            status = status.as_str(),
            duration_ms = build.duration_ms.unwrap_or_default(),
            "Freestyle build finished"
        );
        Ok(())
    }

    /// Best-effort close-out of a build whose execution stopped on an error.
    async fn abort(&self, build_id: &str, err: &CicdError) {
        let stored = self
            .store
            .get_json::<FreestyleBuild>(Bucket::FreestyleBuilds, build_id)
            .await;
        match stored {
            Ok(Some(mut build)) if !build.status.is_terminal() => {
                for step in build.steps.iter_mut() {
                    if !step.status.is_terminal() {
                        step.set_status(JobStatus::Cancelled);
                    }
                }
                build.error = Some(format!("build aborted: {err}"));
                build.set_status(RunStatus::Failed);
                match self.save(&build).await {
                    Ok(()) => {
                        self.record_last_status(&build).await;
                        self.emit(&build);
                        crate::metrics::run_status_changed("freestyle", "failed");
                    }
                    Err(e) => tracing::error!(
                        build_id = %build_id,
                        "Failed to record aborted build: {e}"
                    ),
                }
            }
            Ok(_) => {}
            Err(e) => tracing::error!(build_id = %build_id, "Failed to load aborted build: {e}"),
        }
        if let Some(stream) = self.streams.get(build_id) {
            stream.write(format!("==> Build aborted: {err}\n").as_bytes());
        }
        self.streams.finish(build_id);
    }

    async fn save(&self, build: &FreestyleBuild) -> Result<()> {
        self.store
            .put_json(Bucket::FreestyleBuilds, &build.id, build)
            .await
    }

    fn emit(&self, build: &FreestyleBuild) {
        if let Some(event) = LifecycleEvent::for_build(build) {
            self.notifier.dispatch(event);
        }
    }

    async fn record_last_status(&self, build: &FreestyleBuild) {
        let result: Result<()> = async {
            let _guard = self.records.acquire().await;
            let Some(mut job) = self
                .store
                .get_json::<FreestyleJob>(Bucket::FreestyleJobs, &build.job_id)
                .await?
            else {
                return Ok(());
            };
            if job.status.last_build_id.as_deref() == Some(build.id.as_str()) {
                job.status.last_build_status = Some(build.status);
                self.store
                    .put_json(Bucket::FreestyleJobs, &job.id, &job)
                    .await?;
            }
            Ok(())
        }
        .await;
        if let Err(e) = result {
            tracing::warn!(build_id = %build.id, "Failed to update job status: {e}");
        }
    }
}

/// Bound a file transfer by the step timeout.
async fn with_deadline<T>(
    timeout: Duration,
    fut: impl std::future::Future<Output = Result<T>>,
) -> Result<T> {
    match tokio::time::timeout(timeout, fut).await {
        Ok(r) => r,
        Err(_) => Err(CicdError::Timeout(format!(
            "transfer timed out after {}s",
            timeout.as_secs()
        ))),
    }
}
