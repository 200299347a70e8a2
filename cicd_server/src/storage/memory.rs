//! In-memory storage backend.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{validate_key, Bucket, KvStore};
use crate::error::Result;

#[derive(Default)]
pub struct MemoryStore {
    buckets: RwLock<HashMap<Bucket, BTreeMap<String, Vec<u8>>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn set(&self, bucket: Bucket, key: &str, value: Vec<u8>) -> Result<()> {
        validate_key(key)?;
        self.buckets
            .write()
            .await
            .entry(bucket)
            .or_default()
            .insert(key.to_string(), value);
        Ok(())
    }

    async fn get(&self, bucket: Bucket, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self
            .buckets
            .read()
            .await
            .get(&bucket)
            .and_then(|b| b.get(key).cloned()))
    }

    async fn delete(&self, bucket: Bucket, key: &str) -> Result<()> {
        if let Some(b) = self.buckets.write().await.get_mut(&bucket) {
            b.remove(key);
        }
        Ok(())
    }

    async fn list(&self, bucket: Bucket) -> Result<Vec<(String, Vec<u8>)>> {
        Ok(self
            .buckets
            .read()
            .await
            .get(&bucket)
            .map(|b| b.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::KvStoreExt;

    #[tokio::test]
    async fn test_buckets_are_isolated() {
        let store = MemoryStore::new();
        store.set(Bucket::Pipelines, "a", b"1".to_vec()).await.unwrap();
        assert!(store.get(Bucket::PipelineRuns, "a").await.unwrap().is_none());
        assert_eq!(store.list(Bucket::Pipelines).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_json_helpers() {
        let store = MemoryStore::new();
        store
            .put_json(Bucket::Notifications, "n1", &serde_json::json!({"x": 1}))
            .await
            .unwrap();
        let v: Option<serde_json::Value> = store.get_json(Bucket::Notifications, "n1").await.unwrap();
        assert_eq!(v.unwrap()["x"], 1);
        store.delete(Bucket::Notifications, "n1").await.unwrap();
        store.delete(Bucket::Notifications, "n1").await.unwrap();
        assert!(store.list(Bucket::Notifications).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rejects_path_like_keys() {
        let store = MemoryStore::new();
        assert!(store.set(Bucket::Pipelines, "../x", vec![]).await.is_err());
    }
}
