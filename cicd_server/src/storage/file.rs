//! Filesystem storage backend: one file per key under `<root>/<bucket>/`.

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use super::{validate_key, Bucket, KvStore};
use crate::error::Result;

pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub async fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&root).await?;
        tracing::info!(path = %root.display(), "File store opened");
        Ok(Self { root })
    }

    fn path(&self, bucket: Bucket, key: &str) -> PathBuf {
        self.root.join(bucket.as_str()).join(format!("{key}.json"))
    }
}

#[async_trait]
impl KvStore for FileStore {
    async fn set(&self, bucket: Bucket, key: &str, value: Vec<u8>) -> Result<()> {
        validate_key(key)?;
        let path = self.path(bucket, key);
        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }
        // Write-then-rename so readers never see a torn record.
        let tmp = path.with_extension(format!("json.{}.tmp", uuid::Uuid::new_v4().simple()));
        tokio::fs::write(&tmp, &value).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn get(&self, bucket: Bucket, key: &str) -> Result<Option<Vec<u8>>> {
        validate_key(key)?;
        match tokio::fs::read(self.path(bucket, key)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, bucket: Bucket, key: &str) -> Result<()> {
        validate_key(key)?;
        match tokio::fs::remove_file(self.path(bucket, key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self, bucket: Bucket) -> Result<Vec<(String, Vec<u8>)>> {
        let dir = self.root.join(bucket.as_str());
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut out = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            let Some(key) = name.strip_suffix(".json") else {
                continue;
            };
            match tokio::fs::read(entry.path()).await {
                Ok(bytes) => out.push((key.to_string(), bytes)),
                // Deleted between read_dir and read.
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        out.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(out)
    }
}
