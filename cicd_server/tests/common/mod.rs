//! Shared fakes for engine integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use tokio_util::sync::CancellationToken;

use opsdeck_cicd::config::CicdConfig;
use opsdeck_cicd::error::{CicdError, Result};
use opsdeck_cicd::models::freestyle::FreestyleBuild;
use opsdeck_cicd::models::pipeline::PipelineRun;
use opsdeck_cicd::orchestrator::Orchestrator;
use opsdeck_cicd::services::cluster::{
    ClusterApi, JobManifest, JobPhase, JobState, PodInfo, Propagation, LABEL_JOB_NAME,
};
use opsdeck_cicd::services::output_stream::OutputSink;
use opsdeck_cicd::services::remote_session::{
    CommandOutput, CommandSpec, RemoteSession, SessionConnector, SessionTarget,
};
use opsdeck_cicd::storage::{Bucket, KvStore, MemoryStore};

/// How a fake cluster Job ends.
#[derive(Debug, Clone)]
pub enum FakeOutcome {
    Succeed { logs: String },
    Fail { exit_code: i32, logs: String },
    /// Never finishes; only cancellation or the job timeout ends it.
    Hang,
}

/// In-memory cluster keyed by pipeline job name.
#[derive(Default)]
pub struct FakeCluster {
    outcomes: Mutex<HashMap<String, FakeOutcome>>,
    /// Cluster job name -> pipeline job name.
    jobs: Mutex<HashMap<String, String>>,
    pub created: Mutex<Vec<JobManifest>>,
    pub deleted: Mutex<Vec<(String, Propagation)>>,
    pub deleted_by_label: Mutex<Vec<String>>,
}

impl FakeCluster {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_outcome(&self, job: &str, outcome: FakeOutcome) {
        self.outcomes.lock().unwrap().insert(job.to_string(), outcome);
    }

    pub fn created_jobs(&self) -> Vec<String> {
        self.created
            .lock()
            .unwrap()
            .iter()
            .map(|m| m.labels[LABEL_JOB_NAME].clone())
            .collect()
    }

    fn outcome_of(&self, cluster_job: &str) -> Option<FakeOutcome> {
        let job = self.jobs.lock().unwrap().get(cluster_job).cloned()?;
        Some(
            self.outcomes
                .lock()
                .unwrap()
                .get(&job)
                .cloned()
                .unwrap_or(FakeOutcome::Succeed {
                    logs: format!("{job} ok\n"),
                }),
        )
    }

    fn state_of(&self, cluster_job: &str) -> Option<JobState> {
        let (phase, message) = match self.outcome_of(cluster_job)? {
            FakeOutcome::Succeed { .. } => (JobPhase::Complete, None),
            FakeOutcome::Fail { .. } => (JobPhase::Failed, Some("BackoffLimitExceeded".into())),
            FakeOutcome::Hang => (JobPhase::Active, None),
        };
        Some(JobState {
            name: cluster_job.to_string(),
            phase,
            message,
        })
    }

    fn pod_name(cluster_job: &str) -> String {
        format!("{cluster_job}-pod")
    }

    fn job_of_pod(pod: &str) -> &str {
        pod.strip_suffix("-pod").unwrap_or(pod)
    }
}

#[async_trait]
impl ClusterApi for FakeCluster {
    async fn create_job(&self, manifest: &JobManifest) -> Result<()> {
        let job = manifest.labels[LABEL_JOB_NAME].clone();
        self.jobs.lock().unwrap().insert(manifest.name.clone(), job);
        self.created.lock().unwrap().push(manifest.clone());
        Ok(())
    }

    async fn get_job(&self, name: &str) -> Result<Option<JobState>> {
        Ok(self.state_of(name))
    }

    async fn watch_job(&self, name: &str) -> Result<BoxStream<'static, Result<JobState>>> {
        let state = self
            .state_of(name)
            .ok_or_else(|| CicdError::Cluster(format!("job {name} not found")))?;
        if state.phase == JobPhase::Active {
            return Ok(stream::once(async move { Ok(state) })
                .chain(stream::pending())
                .boxed());
        }
        Ok(stream::iter(vec![Ok(state)]).boxed())
    }

    async fn delete_job(&self, name: &str, propagation: Propagation) -> Result<()> {
        self.deleted.lock().unwrap().push((name.to_string(), propagation));
        Ok(())
    }

    async fn delete_jobs_by_label(&self, selector: &str, _propagation: Propagation) -> Result<()> {
        self.deleted_by_label.lock().unwrap().push(selector.to_string());
        Ok(())
    }

    async fn list_pods(&self, job_name: &str) -> Result<Vec<PodInfo>> {
        let Some(outcome) = self.outcome_of(job_name) else {
            return Ok(Vec::new());
        };
        let (phase, exit_code) = match outcome {
            FakeOutcome::Succeed { .. } => ("Succeeded", Some(0)),
            FakeOutcome::Fail { exit_code, .. } => ("Failed", Some(exit_code)),
            FakeOutcome::Hang => ("Running", None),
        };
        Ok(vec![PodInfo {
            name: Self::pod_name(job_name),
            phase: phase.to_string(),
            exit_code,
        }])
    }

    async fn pod_logs(&self, pod: &str, _container: &str) -> Result<String> {
        match self.outcome_of(Self::job_of_pod(pod)) {
            Some(FakeOutcome::Succeed { logs }) | Some(FakeOutcome::Fail { logs, .. }) => Ok(logs),
            _ => Ok(String::new()),
        }
    }

    async fn follow_pod_logs(
        &self,
        pod: &str,
        _container: &str,
    ) -> Result<BoxStream<'static, Result<Vec<u8>>>> {
        match self.outcome_of(Self::job_of_pod(pod)) {
            Some(FakeOutcome::Succeed { logs }) | Some(FakeOutcome::Fail { logs, .. }) => {
                Ok(stream::iter(vec![Ok(logs.into_bytes())]).boxed())
            }
            _ => Ok(stream::pending().boxed()),
        }
    }
}

/// Session that records every command and answers with exit 0.
#[derive(Default)]
pub struct RecordingSession {
    pub commands: Arc<Mutex<Vec<CommandSpec>>>,
}

#[async_trait]
impl RemoteSession for RecordingSession {
    async fn run(&self, spec: &CommandSpec, _cancel: &CancellationToken) -> Result<CommandOutput> {
        self.commands.lock().unwrap().push(spec.clone());
        Ok(CommandOutput {
            stdout: b"ok\n".to_vec(),
            ..Default::default()
        })
    }

    async fn run_streaming(
        &self,
        spec: &CommandSpec,
        sink: &dyn OutputSink,
        _cancel: &CancellationToken,
    ) -> Result<i32> {
        self.commands.lock().unwrap().push(spec.clone());
        sink.write(format!("remote: {}\n", spec.command).as_bytes());
        Ok(0)
    }

    async fn push(&self, _path: &str, _bytes: &[u8], _cancel: &CancellationToken) -> Result<()> {
        Ok(())
    }

    async fn pull(&self, _path: &str, _cancel: &CancellationToken) -> Result<Vec<u8>> {
        Ok(Vec::new())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Connector that records targets and hands out [`RecordingSession`]s.
#[derive(Default)]
pub struct RecordingConnector {
    pub targets: Mutex<Vec<SessionTarget>>,
    pub commands: Arc<Mutex<Vec<CommandSpec>>>,
}

impl RecordingConnector {
    pub fn commands(&self) -> Vec<String> {
        self.commands
            .lock()
            .unwrap()
            .iter()
            .map(|c| c.command.clone())
            .collect()
    }
}

#[async_trait]
impl SessionConnector for RecordingConnector {
    async fn connect(&self, target: &SessionTarget) -> Result<Box<dyn RemoteSession>> {
        self.targets.lock().unwrap().push(target.clone());
        Ok(Box::new(RecordingSession {
            commands: self.commands.clone(),
        }))
    }
}

/// [`MemoryStore`] that can be told to stall calls or fail one write.
#[derive(Default)]
pub struct GatedStore {
    inner: MemoryStore,
    slow_list: Mutex<Option<(Bucket, Duration)>>,
    slow_put: Mutex<Option<(Bucket, Duration)>>,
    /// Bucket, and how many more writes to it succeed before one fails.
    failing_put: Mutex<Option<(Bucket, usize)>>,
}

impl GatedStore {
    /// Every `list` of `bucket` sleeps first.
    pub fn slow_list(&self, bucket: Bucket, delay: Duration) {
        *self.slow_list.lock().unwrap() = Some((bucket, delay));
    }

    /// Every write to `bucket` sleeps first.
    pub fn slow_put(&self, bucket: Bucket, delay: Duration) {
        *self.slow_put.lock().unwrap() = Some((bucket, delay));
    }

    /// The `nth` (1-based) write to `bucket` from now on fails; later ones succeed.
    pub fn fail_nth_put(&self, bucket: Bucket, nth: usize) {
        *self.failing_put.lock().unwrap() = Some((bucket, nth - 1));
    }

    fn should_fail(&self, bucket: Bucket) -> bool {
        let mut slot = self.failing_put.lock().unwrap();
        match slot.as_mut() {
            Some((b, 0)) if *b == bucket => {
                *slot = None;
                true
            }
            Some((b, remaining)) if *b == bucket => {
                *remaining -= 1;
                false
            }
            _ => false,
        }
    }
}

#[async_trait]
impl KvStore for GatedStore {
    async fn set(&self, bucket: Bucket, key: &str, value: Vec<u8>) -> Result<()> {
        let delay = match *self.slow_put.lock().unwrap() {
            Some((b, delay)) if b == bucket => Some(delay),
            _ => None,
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.should_fail(bucket) {
            return Err(CicdError::Storage("disk full".into()));
        }
        self.inner.set(bucket, key, value).await
    }

    async fn get(&self, bucket: Bucket, key: &str) -> Result<Option<Vec<u8>>> {
        self.inner.get(bucket, key).await
    }

    async fn delete(&self, bucket: Bucket, key: &str) -> Result<()> {
        self.inner.delete(bucket, key).await
    }

    async fn list(&self, bucket: Bucket) -> Result<Vec<(String, Vec<u8>)>> {
        let delay = match *self.slow_list.lock().unwrap() {
            Some((b, delay)) if b == bucket => Some(delay),
            _ => None,
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.inner.list(bucket).await
    }
}

pub struct TestEngine {
    pub engine: Arc<Orchestrator>,
    pub cluster: Arc<FakeCluster>,
    pub connector: Arc<RecordingConnector>,
    pub store: Arc<GatedStore>,
    _dir: tempfile::TempDir,
}

pub fn test_config(dir: &std::path::Path) -> CicdConfig {
    CicdConfig {
        artifact_dir: dir.join("artifacts").display().to_string(),
        storage_path: dir.join("store").display().to_string(),
        workspace_root: dir.join("work").display().to_string(),
        public_url: "http://ci.test".to_string(),
        vault_key: Some("integration-test-key".to_string()),
        job_poll_interval: Duration::from_millis(10),
        ..CicdConfig::default()
    }
}

pub async fn engine() -> TestEngine {
    engine_with(|_| {}).await
}

pub async fn engine_with(tweak: impl FnOnce(&mut CicdConfig)) -> TestEngine {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path());
    tweak(&mut config);
    let cluster = FakeCluster::new();
    let connector = Arc::new(RecordingConnector::default());
    let store = Arc::new(GatedStore::default());
    let engine = Orchestrator::with_backends(
        config,
        store.clone() as Arc<dyn KvStore>,
        cluster.clone(),
        connector.clone(),
    )
    .await
    .unwrap();
    TestEngine {
        engine: Arc::new(engine),
        cluster,
        connector,
        store,
        _dir: dir,
    }
}

/// Poll until the run is terminal.
pub async fn wait_for_run(engine: &Orchestrator, run_id: &str) -> PipelineRun {
    for _ in 0..500 {
        let run = engine.pipelines.get_run(run_id).await.unwrap();
        if run.status.is_terminal() {
            return run;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("run {run_id} did not finish");
}

pub async fn wait_for_build(engine: &Orchestrator, build_id: &str) -> FreestyleBuild {
    for _ in 0..500 {
        let build = engine.freestyle.get_build(build_id).await.unwrap();
        if build.status.is_terminal() {
            return build;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("build {build_id} did not finish");
}

/// Minimal pipeline document with the given jobs block.
pub fn pipeline_doc(name: &str, extra_spec: &str, jobs: &str) -> String {
    format!(
        "apiVersion: opsdeck/v1\nkind: Pipeline\nmetadata:\n  name: {name}\nspec:\n{extra_spec}  jobs:\n{jobs}"
    )
}

pub const BUILD_TEST_DEPLOY: &str = "    - name: build
      image: rust:1.84
      script: cargo build
    - name: test
      image: rust:1.84
      script: cargo test
      dependsOn: [build]
    - name: deploy
      image: alpine:3
      script: ./deploy.sh
      dependsOn: [test]
";
