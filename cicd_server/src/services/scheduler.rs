//! Keeps cron entries in step with stored pipelines and jobs.
//!
//! Callbacks carry only ids; the definition is re-read through the gateway
//! at fire time so edits made after registration are honored.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use tokio_util::sync::CancellationToken;

use crate::error::{CicdError, Result};
use crate::models::freestyle::FreestyleJob;
use crate::models::pipeline::Pipeline;
use crate::models::TriggerInfo;
use crate::services::cron::{self, CronEngine, EntryId};
use crate::services::retention::RetentionService;
use crate::services::trigger_gateway::TriggerGateway;
use crate::storage::{Bucket, KvStore, KvStoreExt};

type Registrations = RwLock<HashMap<String, Vec<EntryId>>>;

pub struct Scheduler {
    engine: Arc<CronEngine>,
    store: Arc<dyn KvStore>,
    gateway: Arc<TriggerGateway>,
    retention: Arc<RetentionService>,
    retention_schedule: String,
    pipelines: Registrations,
    jobs: Registrations,
    retention_entry: Mutex<Option<EntryId>>,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn KvStore>,
        gateway: Arc<TriggerGateway>,
        retention: Arc<RetentionService>,
        retention_schedule: impl Into<String>,
    ) -> Self {
        Self {
            engine: Arc::new(CronEngine::new()),
            store,
            gateway,
            retention,
            retention_schedule: retention_schedule.into(),
            pipelines: RwLock::new(HashMap::new()),
            jobs: RwLock::new(HashMap::new()),
            retention_entry: Mutex::new(None),
        }
    }

    pub fn engine(&self) -> &CronEngine {
        &self.engine
    }

    /// Entries currently registered for a pipeline.
    pub fn pipeline_entries(&self, pipeline_id: &str) -> usize {
        read(&self.pipelines).get(pipeline_id).map_or(0, Vec::len)
    }

    pub fn freestyle_entries(&self, job_id: &str) -> usize {
        read(&self.jobs).get(job_id).map_or(0, Vec::len)
    }

    /// Expression of the registered retention sweep, if loaded.
    pub fn retention_entry(&self) -> Option<String> {
        let id = (*self
            .retention_entry
            .lock()
            .unwrap_or_else(PoisonError::into_inner))?;
        self.engine.expression(id)
    }

    /// Register the retention sweep plus every stored schedule.
    pub async fn load(&self) -> Result<()> {
        self.register_retention()?;
        let pipelines = self.refresh_pipelines().await?;
        let jobs = self.refresh_freestyle_jobs().await?;
        tracing::info!(pipelines, jobs, entries = self.engine.len(), "Schedules loaded");
        Ok(())
    }

    fn register_retention(&self) -> Result<()> {
        let mut slot = self
            .retention_entry
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(id) = slot.take() {
            self.engine.remove(id);
        }
        let retention = self.retention.clone();
        let id = self.engine.add(
            &self.retention_schedule,
            cron::callback(move |at| {
                let retention = retention.clone();
                async move {
                    if let Err(e) = retention.sweep(at).await {
                        tracing::error!("Retention sweep failed: {e}");
                    }
                }
            }),
        )?;
        *slot = Some(id);
        Ok(())
    }

    /// Re-register every pipeline's cron triggers. Returns how many pipelines have entries.
    pub async fn refresh_pipelines(&self) -> Result<usize> {
        let pipelines: Vec<Pipeline> = self.store.list_json(Bucket::Pipelines).await?;
        let stale: Vec<String> = read(&self.pipelines).keys().cloned().collect();
        for id in stale {
            self.unregister_pipeline(&id);
        }
        let mut registered = 0;
        for pipeline in &pipelines {
            if self.register_pipeline(pipeline) > 0 {
                registered += 1;
            }
        }
        Ok(registered)
    }

    pub async fn refresh_freestyle_jobs(&self) -> Result<usize> {
        let jobs: Vec<FreestyleJob> = self.store.list_json(Bucket::FreestyleJobs).await?;
        let stale: Vec<String> = read(&self.jobs).keys().cloned().collect();
        for id in stale {
            self.unregister_freestyle(&id);
        }
        let mut registered = 0;
        for job in &jobs {
            if self.register_freestyle(job) > 0 {
                registered += 1;
            }
        }
        Ok(registered)
    }

    /// Replace a pipeline's entries with its current enabled cron triggers.
    /// Invalid expressions are logged and skipped.
    pub fn register_pipeline(&self, pipeline: &Pipeline) -> usize {
        self.unregister_pipeline(&pipeline.id);
        let mut ids = Vec::new();
        for schedule in pipeline.cron_schedules() {
            let gateway = self.gateway.clone();
            let pipeline_id = pipeline.id.clone();
            let expr = schedule.to_string();
            let cb = cron::callback(move |at| {
                let gateway = gateway.clone();
                let pipeline_id = pipeline_id.clone();
                let expr = expr.clone();
                async move {
                    let trigger = TriggerInfo::cron(&expr, at);
                    match gateway
                        .trigger_pipeline(&pipeline_id, trigger, BTreeMap::new())
                        .await
                    {
                        Ok(run) => tracing::info!(
                            pipeline_id = %pipeline_id,
                            run_id = %run.id,
                            schedule = %expr,
                            "Cron trigger fired"
                        ),
                        Err(e) => tracing::warn!(
                            pipeline_id = %pipeline_id,
                            schedule = %expr,
                            "Cron trigger failed: {e}"
                        ),
                    }
                }
            });
            match self.engine.add(schedule, cb) {
                Ok(id) => ids.push(id),
                Err(e) => {
                    tracing::warn!(pipeline = %pipeline.name, "Skipping cron trigger: {e}")
                }
            }
        }
        let count = ids.len();
        if count > 0 {
            write(&self.pipelines).insert(pipeline.id.clone(), ids);
        }
        count
    }

    pub fn unregister_pipeline(&self, pipeline_id: &str) {
        if let Some(ids) = write(&self.pipelines).remove(pipeline_id) {
            for id in ids {
                self.engine.remove(id);
            }
        }
    }

    /// Replace a job's entries. Disabled jobs get none.
    pub fn register_freestyle(&self, job: &FreestyleJob) -> usize {
        self.unregister_freestyle(&job.id);
        if !job.enabled {
            return 0;
        }
        let mut ids = Vec::new();
        for schedule in job.cron_schedules() {
            let gateway = self.gateway.clone();
            let job_id = job.id.clone();
            let expr = schedule.to_string();
            let cb = cron::callback(move |at| {
                let gateway = gateway.clone();
                let job_id = job_id.clone();
                let expr = expr.clone();
                async move {
                    let trigger = TriggerInfo::cron(&expr, at);
                    match gateway.trigger_freestyle(&job_id, trigger, BTreeMap::new()).await {
                        Ok(build) => tracing::info!(
                            job_id = %job_id,
                            build_id = %build.id,
                            schedule = %expr,
                            "Cron trigger fired"
                        ),
                        Err(CicdError::InvalidState(reason)) => {
                            tracing::debug!(job_id = %job_id, "Cron trigger ignored: {reason}")
                        }
                        Err(e) => tracing::warn!(
                            job_id = %job_id,
                            schedule = %expr,
                            "Cron trigger failed: {e}"
                        ),
                    }
                }
            });
            match self.engine.add(schedule, cb) {
                Ok(id) => ids.push(id),
                Err(e) => tracing::warn!(job = %job.name, "Skipping cron trigger: {e}"),
            }
        }
        let count = ids.len();
        if count > 0 {
            write(&self.jobs).insert(job.id.clone(), ids);
        }
        count
    }

    pub fn unregister_freestyle(&self, job_id: &str) {
        if let Some(ids) = write(&self.jobs).remove(job_id) {
            for id in ids {
                self.engine.remove(id);
            }
        }
    }

    /// Drive the cron engine until `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) {
        self.engine.run(cancel).await;
    }
}

fn read(lock: &Registrations) -> std::sync::RwLockReadGuard<'_, HashMap<String, Vec<EntryId>>> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write(lock: &Registrations) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Vec<EntryId>>> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}
