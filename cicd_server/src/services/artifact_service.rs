//! Run artifact storage and retrieval.
//!
//! Files live under `<root>/<run_id>/`; metadata lives in the artifacts
//! bucket keyed by artifact id. The checksum is computed while the upload is
//! written, never by re-reading the file.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use futures::{Stream, StreamExt};
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;

use crate::error::{CicdError, Result};
use crate::models::artifact::{ArtifactFilter, ArtifactMetadata};
use crate::storage::{validate_key, Bucket, KvStore, KvStoreExt};

/// Describes an upload before its bytes arrive.
#[derive(Debug, Clone)]
pub struct ArtifactUpload {
    pub run_id: String,
    pub pipeline_id: String,
    /// Display name; defaults to the filename.
    pub name: Option<String>,
    pub filename: String,
}

pub struct ArtifactStore {
    root: PathBuf,
    store: Arc<dyn KvStore>,
    retention_days: u32,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>, store: Arc<dyn KvStore>, retention_days: u32) -> Self {
        Self {
            root: root.into(),
            store,
            retention_days,
        }
    }

    /// Stream an upload to disk, hashing it on the way through.
    pub async fn save<S, B>(&self, upload: ArtifactUpload, mut body: S) -> Result<ArtifactMetadata>
    where
        S: Stream<Item = std::io::Result<B>> + Unpin + Send,
        B: AsRef<[u8]> + Send,
    {
        validate_key(&upload.run_id)?;
        let filename = sanitize_filename(&upload.filename)?;
        let id = uuid::Uuid::new_v4().to_string();

        let dir = self.root.join(&upload.run_id);
        tokio::fs::create_dir_all(&dir).await?;
        let path = dir.join(format!("{id}-{filename}"));

        let mut file = tokio::fs::File::create(&path).await?;
        let mut hasher = Sha256::new();
        let mut size: u64 = 0;
        let written: Result<()> = async {
            while let Some(chunk) = body.next().await {
                let chunk = chunk?;
                let bytes = chunk.as_ref();
                hasher.update(bytes);
                file.write_all(bytes).await?;
                size += bytes.len() as u64;
            }
            file.flush().await?;
            Ok(())
        }
        .await;
        drop(file);
        if let Err(e) = written {
            remove_file_quietly(&path).await;
            return Err(e);
        }

        let created_at = Utc::now();
        let meta = ArtifactMetadata {
            id: id.clone(),
            run_id: upload.run_id,
            pipeline_id: upload.pipeline_id,
            name: upload
                .name
                .filter(|n| !n.trim().is_empty())
                .unwrap_or_else(|| filename.clone()),
            mime_type: mime_for(&filename).to_string(),
            filename,
            path: path.display().to_string(),
            size,
            checksum: hex::encode(hasher.finalize()),
            created_at,
            expires_at: self.expiry(created_at),
        };
        if let Err(e) = self.store.put_json(Bucket::Artifacts, &id, &meta).await {
            remove_file_quietly(&path).await;
            return Err(e);
        }
        crate::metrics::artifact_stored(size);
        tracing::info!(
            artifact_id = %meta.id,
            run_id = %meta.run_id,
            size,
            "Artifact stored"
        );
        Ok(meta)
    }

    /// Convenience wrapper around [`save`](Self::save) for in-memory bodies.
    pub async fn save_bytes(&self, upload: ArtifactUpload, bytes: &[u8]) -> Result<ArtifactMetadata> {
        let body = futures::stream::iter(std::iter::once(Ok::<_, std::io::Error>(bytes)));
        self.save(upload, body).await
    }

    fn expiry(&self, created_at: DateTime<Utc>) -> Option<DateTime<Utc>> {
        (self.retention_days > 0)
            .then(|| created_at + ChronoDuration::days(i64::from(self.retention_days)))
    }

    pub async fn get(&self, id: &str) -> Result<ArtifactMetadata> {
        self.store
            .get_json(Bucket::Artifacts, id)
            .await?
            .ok_or_else(|| CicdError::NotFound(format!("artifact {id}")))
    }

    /// Metadata plus file contents.
    pub async fn read(&self, id: &str) -> Result<(ArtifactMetadata, Vec<u8>)> {
        let meta = self.get(id).await?;
        let bytes = tokio::fs::read(&meta.path).await.map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => CicdError::NotFound(format!("artifact file {id}")),
            _ => CicdError::Io(e),
        })?;
        Ok((meta, bytes))
    }

    /// Newest first.
    pub async fn list(&self, filter: &ArtifactFilter) -> Result<Vec<ArtifactMetadata>> {
        let mut all: Vec<ArtifactMetadata> = self.store.list_json(Bucket::Artifacts).await?;
        all.retain(|m| filter.matches(m));
        all.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(all)
    }

    /// Remove the file, then the metadata. A file that is already gone is fine.
    pub async fn delete(&self, id: &str) -> Result<()> {
        let meta = self.get(id).await?;
        match tokio::fs::remove_file(&meta.path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(artifact_id = %id, "Artifact file already missing");
            }
            Err(e) => return Err(e.into()),
        }
        self.store.delete(Bucket::Artifacts, id).await?;
        tracing::info!(artifact_id = %id, "Artifact deleted");
        Ok(())
    }

    /// Delete every artifact whose `expires_at` has passed.
    pub async fn cleanup_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        let all: Vec<ArtifactMetadata> = self.store.list_json(Bucket::Artifacts).await?;
        let mut removed = 0;
        for meta in all.iter().filter(|m| m.is_expired(now)) {
            match self.delete(&meta.id).await {
                Ok(()) => removed += 1,
                Err(e) => tracing::warn!(artifact_id = %meta.id, "Expired artifact cleanup failed: {e}"),
            }
        }
        Ok(removed)
    }

    /// Delete every artifact of one run and its directory.
    pub async fn purge_run(&self, run_id: &str) -> Result<usize> {
        validate_key(run_id)?;
        let filter = ArtifactFilter {
            run_id: Some(run_id.to_string()),
            pipeline_id: None,
        };
        let mut removed = 0;
        for meta in self.list(&filter).await? {
            match self.delete(&meta.id).await {
                Ok(()) => removed += 1,
                Err(e) => tracing::warn!(artifact_id = %meta.id, "Artifact purge failed: {e}"),
            }
        }
        match tokio::fs::remove_dir_all(self.root.join(run_id)).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(run_id = %run_id, "Failed to remove artifact dir: {e}"),
        }
        Ok(removed)
    }
}

async fn remove_file_quietly(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        tracing::debug!(path = %path.display(), "Partial artifact cleanup failed: {e}");
    }
}

/// Base name only, with anything outside `[A-Za-z0-9._-]` replaced.
fn sanitize_filename(name: &str) -> Result<String> {
    let base = name.rsplit(['/', '\\']).next().unwrap_or_default().trim();
    let cleaned: String = base
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || "._-".contains(c) { c } else { '_' })
        .collect();
    if cleaned.is_empty() || cleaned.chars().all(|c| c == '.') {
        return Err(CicdError::Validation(format!("invalid artifact filename '{name}'")));
    }
    Ok(cleaned)
}

/// MIME type by file extension.
pub fn mime_for(filename: &str) -> &'static str {
    let lower = filename.to_ascii_lowercase();
    if lower.ends_with(".tar.gz") {
        return "application/gzip";
    }
    let ext = lower.rsplit_once('.').map(|(_, e)| e).unwrap_or_default();
    match ext {
        "txt" | "log" => "text/plain",
        "md" => "text/markdown",
        "csv" => "text/csv",
        "html" | "htm" => "text/html",
        "json" => "application/json",
        "xml" => "application/xml",
        "yaml" | "yml" => "application/yaml",
        "zip" => "application/zip",
        "gz" | "tgz" => "application/gzip",
        "tar" => "application/x-tar",
        "pdf" => "application/pdf",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "svg" => "image/svg+xml",
        "wasm" => "application/wasm",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;

    fn store(dir: &Path, days: u32) -> ArtifactStore {
        ArtifactStore::new(dir, Arc::new(MemoryStore::new()), days)
    }

    fn upload(run: &str, filename: &str) -> ArtifactUpload {
        ArtifactUpload {
            run_id: run.into(),
            pipeline_id: "p1".into(),
            name: None,
            filename: filename.into(),
        }
    }

    #[test]
    fn test_mime_detection() {
        assert_eq!(mime_for("report.JSON"), "application/json");
        assert_eq!(mime_for("dist.tar.gz"), "application/gzip");
        assert_eq!(mime_for("binary"), "application/octet-stream");
    }

    #[test]
    fn test_filename_sanitizing() {
        assert_eq!(sanitize_filename("../../etc/passwd").unwrap(), "passwd");
        assert_eq!(sanitize_filename("my report.txt").unwrap(), "my_report.txt");
        assert!(sanitize_filename("..").is_err());
    }

    #[tokio::test]
    async fn test_chunked_upload_checksum_and_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let artifacts = store(dir.path(), 7);
        let chunks: Vec<std::io::Result<Vec<u8>>> =
            vec![Ok(b"hello ".to_vec()), Ok(b"world".to_vec())];
        let meta = artifacts
            .save(upload("run-1", "out.txt"), futures::stream::iter(chunks))
            .await
            .unwrap();

        assert_eq!(meta.size, 11);
        assert_eq!(meta.mime_type, "text/plain");
        assert_eq!(meta.name, "out.txt");
        assert_eq!(meta.checksum, hex::encode(Sha256::digest(b"hello world")));
        let expires = meta.expires_at.unwrap();
        assert_eq!((expires - meta.created_at).num_days(), 7);

        let (read_meta, bytes) = artifacts.read(&meta.id).await.unwrap();
        assert_eq!(read_meta.id, meta.id);
        assert_eq!(hex::encode(Sha256::digest(&bytes)), meta.checksum);
    }

    #[tokio::test]
    async fn test_failed_upload_leaves_nothing_behind() {
        let dir = tempfile::tempdir().unwrap();
        let artifacts = store(dir.path(), 0);
        let chunks: Vec<std::io::Result<Vec<u8>>> = vec![
            Ok(b"partial".to_vec()),
            Err(std::io::Error::other("client went away")),
        ];
        let result = artifacts
            .save(upload("run-1", "a.bin"), futures::stream::iter(chunks))
            .await;
        assert!(result.is_err());
        assert!(artifacts.list(&ArtifactFilter::default()).await.unwrap().is_empty());
        let leftover = std::fs::read_dir(dir.path().join("run-1")).unwrap().count();
        assert_eq!(leftover, 0);
    }

    #[tokio::test]
    async fn test_delete_tolerates_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let artifacts = store(dir.path(), 0);
        let meta = artifacts.save_bytes(upload("run-1", "a.log"), b"x").await.unwrap();
        assert!(meta.expires_at.is_none());
        std::fs::remove_file(&meta.path).unwrap();
        artifacts.delete(&meta.id).await.unwrap();
        assert!(matches!(artifacts.get(&meta.id).await, Err(CicdError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_filters_purge_and_expiry() {
        let dir = tempfile::tempdir().unwrap();
        let artifacts = store(dir.path(), 1);
        artifacts.save_bytes(upload("run-1", "a"), b"1").await.unwrap();
        artifacts.save_bytes(upload("run-1", "b"), b"2").await.unwrap();
        artifacts.save_bytes(upload("run-2", "c"), b"3").await.unwrap();

        let run1 = ArtifactFilter {
            run_id: Some("run-1".into()),
            pipeline_id: None,
        };
        assert_eq!(artifacts.list(&run1).await.unwrap().len(), 2);

        assert_eq!(artifacts.purge_run("run-1").await.unwrap(), 2);
        assert!(!dir.path().join("run-1").exists());
        assert_eq!(artifacts.list(&ArtifactFilter::default()).await.unwrap().len(), 1);

        assert_eq!(artifacts.cleanup_expired(Utc::now()).await.unwrap(), 0);
        let later = Utc::now() + ChronoDuration::days(2);
        assert_eq!(artifacts.cleanup_expired(later).await.unwrap(), 1);
    }
}
