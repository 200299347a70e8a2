//! Purges old runs, builds and expired artifacts.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};

use crate::error::Result;
use crate::models::freestyle::FreestyleBuild;
use crate::models::pipeline::PipelineRun;
use crate::models::RunStatus;
use crate::services::artifact_service::ArtifactStore;
use crate::storage::{Bucket, KvStore, KvStoreExt};

/// Count- and age-based retention. A zero disables that rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    /// Finished runs/builds kept per pipeline or job.
    pub per_job: usize,
    pub max_days: u32,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            per_job: 20,
            max_days: 30,
        }
    }
}

/// The fields retention looks at.
#[derive(Debug, Clone)]
pub struct HistoryEntry {
    pub id: String,
    pub number: u64,
    pub status: RunStatus,
    pub created_at: DateTime<Utc>,
}

impl From<&PipelineRun> for HistoryEntry {
    fn from(r: &PipelineRun) -> Self {
        Self {
            id: r.id.clone(),
            number: r.number,
            status: r.status,
            created_at: r.created_at,
        }
    }
}

impl From<&FreestyleBuild> for HistoryEntry {
    fn from(b: &FreestyleBuild) -> Self {
        Self {
            id: b.id.clone(),
            number: b.number,
            status: b.status,
            created_at: b.created_at,
        }
    }
}

/// Ids to purge from one pipeline's or job's history.
///
/// Only finished entries are candidates and only finished entries count
/// toward `per_job`; anything pending or running is always kept.
pub fn select_for_purge(
    entries: &[HistoryEntry],
    policy: &RetentionPolicy,
    now: DateTime<Utc>,
) -> Vec<String> {
    let mut finished: Vec<&HistoryEntry> =
        entries.iter().filter(|e| e.status.is_terminal()).collect();
    finished.sort_by(|a, b| b.number.cmp(&a.number));

    let cutoff = (policy.max_days > 0).then(|| now - ChronoDuration::days(i64::from(policy.max_days)));
    finished
        .into_iter()
        .enumerate()
        .filter(|(rank, e)| {
            let over_count = policy.per_job > 0 && *rank >= policy.per_job;
            let too_old = cutoff.is_some_and(|c| e.created_at < c);
            over_count || too_old
        })
        .map(|(_, e)| e.id.clone())
        .collect()
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetentionReport {
    pub runs: usize,
    pub builds: usize,
    pub artifacts: usize,
}

pub struct RetentionService {
    store: Arc<dyn KvStore>,
    artifacts: Arc<ArtifactStore>,
    policy: RetentionPolicy,
}

impl RetentionService {
    pub fn new(store: Arc<dyn KvStore>, artifacts: Arc<ArtifactStore>, policy: RetentionPolicy) -> Self {
        Self {
            store,
            artifacts,
            policy,
        }
    }

    pub fn policy(&self) -> RetentionPolicy {
        self.policy
    }

    /// One full sweep. Per-record failures are logged and skipped.
    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<RetentionReport> {
        let mut report = RetentionReport::default();

        let runs: Vec<PipelineRun> = self.store.list_json(Bucket::PipelineRuns).await?;
        for ids in grouped(runs.iter().map(|r| (r.pipeline_id.clone(), HistoryEntry::from(r))))
            .values()
            .map(|entries| select_for_purge(entries, &self.policy, now))
        {
            for id in ids {
                if let Err(e) = self.artifacts.purge_run(&id).await {
                    tracing::warn!(run_id = %id, "Artifact purge failed: {e}");
                }
                match self.store.delete(Bucket::PipelineRuns, &id).await {
                    Ok(()) => report.runs += 1,
                    Err(e) => tracing::warn!(run_id = %id, "Run purge failed: {e}"),
                }
            }
        }

        let builds: Vec<FreestyleBuild> = self.store.list_json(Bucket::FreestyleBuilds).await?;
        for ids in grouped(builds.iter().map(|b| (b.job_id.clone(), HistoryEntry::from(b))))
            .values()
            .map(|entries| select_for_purge(entries, &self.policy, now))
        {
            for id in ids {
                match self.store.delete(Bucket::FreestyleBuilds, &id).await {
                    Ok(()) => report.builds += 1,
                    Err(e) => tracing::warn!(build_id = %id, "Build purge failed: {e}"),
                }
            }
        }

        report.artifacts = match self.artifacts.cleanup_expired(now).await {
            Ok(n) => n,
            Err(e) => {
                tracing::warn!("Expired artifact sweep failed: {e}");
                0
            }
        };

        crate::metrics::retention_purged("pipeline_run", report.runs);
        crate::metrics::retention_purged("freestyle_build", report.builds);
        crate::metrics::retention_purged("artifact", report.artifacts);
        tracing::info!(
            runs = report.runs,
            builds = report.builds,
            artifacts = report.artifacts,
            "Retention sweep finished"
        );
        Ok(report)
    }
}

fn grouped(items: impl Iterator<Item = (String, HistoryEntry)>) -> BTreeMap<String, Vec<HistoryEntry>> {
    let mut groups: BTreeMap<String, Vec<HistoryEntry>> = BTreeMap::new();
    for (parent, entry) in items {
        groups.entry(parent).or_default().push(entry);
    }
    groups
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(number: u64, status: RunStatus, age_days: i64) -> HistoryEntry {
        HistoryEntry {
            id: format!("b{number}"),
            number,
            status,
            created_at: Utc::now() - ChronoDuration::days(age_days),
        }
    }

    #[test]
    fn test_keeps_newest_n_regardless_of_age() {
        let entries: Vec<_> = (1..=5).map(|n| entry(n, RunStatus::Succeeded, 1)).collect();
        let policy = RetentionPolicy {
            per_job: 2,
            max_days: 30,
        };
        let mut purged = select_for_purge(&entries, &policy, Utc::now());
        purged.sort();
        assert_eq!(purged, vec!["b1", "b2", "b3"]);
    }

    #[test]
    fn test_age_rule_applies_inside_the_kept_window() {
        let entries = vec![
            entry(1, RunStatus::Failed, 90),
            entry(2, RunStatus::Succeeded, 45),
            entry(3, RunStatus::Succeeded, 1),
        ];
        let policy = RetentionPolicy {
            per_job: 5,
            max_days: 30,
        };
        let mut purged = select_for_purge(&entries, &policy, Utc::now());
        purged.sort();
        assert_eq!(purged, vec!["b1", "b2"]);
    }

    #[test]
    fn test_unfinished_entries_are_never_purged() {
        let entries = vec![
            entry(1, RunStatus::Running, 90),
            entry(2, RunStatus::Pending, 90),
            entry(3, RunStatus::Succeeded, 90),
        ];
        let policy = RetentionPolicy {
            per_job: 1,
            max_days: 30,
        };
        assert_eq!(select_for_purge(&entries, &policy, Utc::now()), vec!["b3"]);
    }

    #[test]
    fn test_zero_disables_rules() {
        let entries: Vec<_> = (1..=4).map(|n| entry(n, RunStatus::Succeeded, 400)).collect();
        let off = RetentionPolicy {
            per_job: 0,
            max_days: 0,
        };
        assert!(select_for_purge(&entries, &off, Utc::now()).is_empty());
    }
}
