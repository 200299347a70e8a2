//! Orchestrator — owns every engine service and their lifecycle.
//!
//! `init` builds the object graph, `start` loads schedules and spawns the
//! cron loop, `stop` stops the loop, cancels in-flight work and waits for it.

use std::sync::{Arc, Mutex, PoisonError};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::CicdConfig;
use crate::error::Result;
use crate::services::artifact_service::ArtifactStore;
use crate::services::cluster::{ClusterApi, KubeRestClient};
use crate::services::freestyle_executor::{FreestyleExecutor, FreestyleExecutorSettings};
use crate::services::freestyle_service::FreestyleService;
use crate::services::host_service::HostService;
use crate::services::notification::NotificationDispatcher;
use crate::services::output_stream::OutputStreams;
use crate::services::parser::PipelineParser;
use crate::services::pipeline_executor::{PipelineExecutor, PipelineExecutorSettings};
use crate::services::pipeline_service::PipelineService;
use crate::services::remote_session::{OpenSshConnector, SessionConnector};
use crate::services::retention::RetentionService;
use crate::services::scheduler::Scheduler;
use crate::services::trigger_gateway::TriggerGateway;
use crate::services::vault::{CredentialVault, KeySource};
use crate::storage::{FileStore, KvStore, RecordLock};

pub struct Orchestrator {
    pub config: CicdConfig,
    pub store: Arc<dyn KvStore>,
    pub streams: Arc<OutputStreams>,
    pub notifier: Arc<NotificationDispatcher>,
    pub artifacts: Arc<ArtifactStore>,
    pub hosts: Arc<HostService>,
    pub gateway: Arc<TriggerGateway>,
    pub scheduler: Arc<Scheduler>,
    pub retention: Arc<RetentionService>,
    pub pipelines: Arc<PipelineService>,
    pub freestyle: Arc<FreestyleService>,
    cron_cancel: CancellationToken,
    cron_task: Mutex<Option<JoinHandle<()>>>,
}

impl Orchestrator {
    /// Production wiring: file store, in-cluster REST client and system ssh.
    pub async fn init(config: CicdConfig) -> Result<Self> {
        let store: Arc<dyn KvStore> = Arc::new(FileStore::open(&config.storage_path).await?);
        let cluster: Arc<dyn ClusterApi> = Arc::new(KubeRestClient::new(config.kube.clone())?);
        let connector: Arc<dyn SessionConnector> = Arc::new(OpenSshConnector::default());
        Self::with_backends(config, store, cluster, connector).await
    }

    /// Wire the engine over the given collaborators.
    pub async fn with_backends(
        config: CicdConfig,
        store: Arc<dyn KvStore>,
        cluster: Arc<dyn ClusterApi>,
        connector: Arc<dyn SessionConnector>,
    ) -> Result<Self> {
        let vault = Arc::new(CredentialVault::new(&KeySource {
            explicit_key: config.vault_key.clone(),
            namespace_identity: config.deployment_id.clone(),
            storage_path: Some(config.storage_path.clone()),
        }));

        let records = RecordLock::default();
        let streams = Arc::new(OutputStreams::new());
        let notifier = Arc::new(NotificationDispatcher::new(store.clone()));
        let loaded = notifier.load().await?;

        let artifacts = Arc::new(ArtifactStore::new(
            &config.artifact_dir,
            store.clone(),
            config.artifact_retention_days,
        ));
        let hosts = Arc::new(HostService::new(store.clone(), vault, connector));

        let pipeline_exec = Arc::new(PipelineExecutor::new(
            store.clone(),
            cluster.clone(),
            streams.clone(),
            notifier.clone(),
            records.clone(),
            PipelineExecutorSettings {
                public_url: config.public_url.clone(),
                poll_interval: config.job_poll_interval,
            },
        ));
        let freestyle_exec = Arc::new(FreestyleExecutor::new(
            store.clone(),
            hosts.clone(),
            streams.clone(),
            notifier.clone(),
            records.clone(),
            FreestyleExecutorSettings {
                workspace_root: config.workspace_root.clone(),
            },
        ));

        let gateway = Arc::new(TriggerGateway::new(
            store.clone(),
            pipeline_exec,
            freestyle_exec,
            notifier.clone(),
            records.clone(),
        ));
        let retention = Arc::new(RetentionService::new(
            store.clone(),
            artifacts.clone(),
            config.retention,
        ));
        let scheduler = Arc::new(Scheduler::new(
            store.clone(),
            gateway.clone(),
            retention.clone(),
            config.retention_schedule.clone(),
        ));

        let pipelines = Arc::new(PipelineService::new(
            store.clone(),
            PipelineParser::new(config.public_url.clone()),
            scheduler.clone(),
            gateway.clone(),
            artifacts.clone(),
            cluster,
            records.clone(),
        ));
        let freestyle = Arc::new(FreestyleService::new(
            store.clone(),
            scheduler.clone(),
            gateway.clone(),
            config.public_url.clone(),
            records,
        ));

        tracing::info!(
            namespace = %config.namespace,
            notifications = loaded,
            "CI/CD engine initialised"
        );

        Ok(Self {
            config,
            store,
            streams,
            notifier,
            artifacts,
            hosts,
            gateway,
            scheduler,
            retention,
            pipelines,
            freestyle,
            cron_cancel: CancellationToken::new(),
            cron_task: Mutex::new(None),
        })
    }

    /// Register stored schedules and spawn the cron dispatch loop.
    pub async fn start(&self) -> Result<()> {
        self.scheduler.load().await?;
        let mut task = self.cron_task.lock().unwrap_or_else(PoisonError::into_inner);
        if task.is_none() {
            let scheduler = self.scheduler.clone();
            let cancel = self.cron_cancel.clone();
            *task = Some(tokio::spawn(async move { scheduler.run(cancel).await }));
        }
        Ok(())
    }

    /// Stop firing schedules, cancel in-flight runs/builds and drain.
    pub async fn stop(&self) {
        self.cron_cancel.cancel();
        let task = self
            .cron_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                tracing::warn!("Cron loop ended abnormally: {e}");
            }
        }
        self.gateway.shutdown().await;
        self.notifier.flush().await;
        tracing::info!("CI/CD engine stopped");
    }
}
