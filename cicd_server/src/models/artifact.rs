//! Artifact metadata for files produced by runs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactMetadata {
    pub id: String,
    pub run_id: String,
    pub pipeline_id: String,
    pub name: String,
    pub filename: String,
    /// Absolute path of the stored file.
    pub path: String,
    pub size: u64,
    pub mime_type: String,
    /// Lowercase hex SHA-256 of the stored bytes.
    pub checksum: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

impl ArtifactMetadata {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// Filter for listing artifacts. Empty fields match everything.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ArtifactFilter {
    #[serde(default)]
    pub run_id: Option<String>,
    #[serde(default)]
    pub pipeline_id: Option<String>,
}

impl ArtifactFilter {
    pub fn matches(&self, meta: &ArtifactMetadata) -> bool {
        self.run_id.as_ref().is_none_or(|r| r == &meta.run_id)
            && self
                .pipeline_id
                .as_ref()
                .is_none_or(|p| p == &meta.pipeline_id)
    }
}
