//! Key-value storage backend used for every persisted record.
//!
//! The backend is an external collaborator: it only has to provide
//! `set/get/delete/list` over named buckets and be safe to share between
//! tasks. Callers serialize conflicting writes by read-modify-writing whole
//! records.

pub mod file;
pub mod memory;

use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::Result;

pub use file::FileStore;
pub use memory::MemoryStore;

/// Guards read-modify-write of pipeline and freestyle job records.
///
/// Those records carry the run/build counters, so any writer that copies a
/// record back must hold this for the whole read-modify-write.
#[derive(Debug, Clone, Default)]
pub struct RecordLock(Arc<tokio::sync::Mutex<()>>);

impl RecordLock {
    pub async fn acquire(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.0.lock().await
    }
}

/// Named buckets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Bucket {
    Pipelines,
    PipelineRuns,
    Artifacts,
    SshHosts,
    FreestyleJobs,
    FreestyleBuilds,
    Notifications,
    GitCredentials,
}

impl Bucket {
    pub fn as_str(&self) -> &'static str {
        match self {
            Bucket::Pipelines => "pipelines",
            Bucket::PipelineRuns => "pipeline_runs",
            Bucket::Artifacts => "artifacts",
            Bucket::SshHosts => "ssh_hosts",
            Bucket::FreestyleJobs => "freestyle_jobs",
            Bucket::FreestyleBuilds => "freestyle_builds",
            Bucket::Notifications => "notifications",
            Bucket::GitCredentials => "git_credentials",
        }
    }
}

#[async_trait]
pub trait KvStore: Send + Sync {
    async fn set(&self, bucket: Bucket, key: &str, value: Vec<u8>) -> Result<()>;

    async fn get(&self, bucket: Bucket, key: &str) -> Result<Option<Vec<u8>>>;

    /// Deleting a missing key is not an error.
    async fn delete(&self, bucket: Bucket, key: &str) -> Result<()>;

    async fn list(&self, bucket: Bucket) -> Result<Vec<(String, Vec<u8>)>>;
}

/// JSON convenience layer over any [`KvStore`].
#[async_trait]
pub trait KvStoreExt: KvStore {
    async fn put_json<T: Serialize + Sync>(&self, bucket: Bucket, key: &str, value: &T) -> Result<()> {
        let bytes = serde_json::to_vec(value)?;
        self.set(bucket, key, bytes).await
    }

    async fn get_json<T: DeserializeOwned + Send>(&self, bucket: Bucket, key: &str) -> Result<Option<T>> {
        match self.get(bucket, key).await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Every record in the bucket. Records that fail to decode are skipped with a warning.
    async fn list_json<T: DeserializeOwned + Send>(&self, bucket: Bucket) -> Result<Vec<T>> {
        let entries = self.list(bucket).await?;
        let mut out = Vec::with_capacity(entries.len());
        for (key, bytes) in entries {
            match serde_json::from_slice(&bytes) {
                Ok(v) => out.push(v),
                Err(e) => {
                    tracing::warn!(bucket = bucket.as_str(), key = %key, "Skipping undecodable record: {e}");
                }
            }
        }
        Ok(out)
    }
}

impl<S: KvStore + ?Sized> KvStoreExt for S {}

/// Reject keys that could escape a bucket directory.
pub(crate) fn validate_key(key: &str) -> Result<()> {
    if key.is_empty()
        || key.contains('/')
        || key.contains('\\')
        || key.starts_with('.')
        || key.contains('\0')
    {
        return Err(crate::error::CicdError::Storage(format!(
            "invalid storage key: {key:?}"
        )));
    }
    Ok(())
}
