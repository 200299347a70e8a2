//! CI/CD engine configuration, loaded from environment variables.

use std::time::Duration;

use crate::services::cluster::KubeSettings;
use crate::services::retention::RetentionPolicy;

const SA_DIR: &str = "/var/run/secrets/kubernetes.io/serviceaccount";

#[derive(Clone, Debug)]
pub struct CicdConfig {
    /// Namespace pipeline jobs are created in.
    pub namespace: String,
    /// Root directory for stored artifacts.
    pub artifact_dir: String,
    /// Externally reachable base URL for webhook and artifact callbacks.
    pub public_url: String,
    /// Storage root, also a fallback identity for the credential vault.
    pub storage_path: String,
    pub vault_key: Option<String>,
    pub deployment_id: Option<String>,
    pub kube: KubeSettings,
    /// Interval for polling a new Job's Pod into existence.
    pub job_poll_interval: Duration,
    pub retention: RetentionPolicy,
    /// Cron expression for the nightly retention sweep.
    pub retention_schedule: String,
    pub artifact_retention_days: u32,
    /// Parent directory for per-build checkout workspaces.
    pub workspace_root: String,
}

impl Default for CicdConfig {
    fn default() -> Self {
        Self {
            namespace: "opsdeck-cicd".to_string(),
            artifact_dir: "./data/artifacts".to_string(),
            public_url: "http://localhost:9090".to_string(),
            storage_path: "./data/store".to_string(),
            vault_key: None,
            deployment_id: None,
            kube: KubeSettings {
                api_url: "https://kubernetes.default.svc".to_string(),
                namespace: "opsdeck-cicd".to_string(),
                token_path: format!("{SA_DIR}/token"),
                ca_path: format!("{SA_DIR}/ca.crt"),
                insecure: false,
            },
            job_poll_interval: Duration::from_millis(2000),
            retention: RetentionPolicy::default(),
            retention_schedule: "0 0 3 * * *".to_string(),
            artifact_retention_days: 30,
            workspace_root: "/tmp".to_string(),
        }
    }
}

impl CicdConfig {
    pub fn from_env(storage_path: &str) -> Self {
        let defaults = Self::default();

        let namespace = env_string("CICD_NAMESPACE").unwrap_or(defaults.namespace);
        let artifact_dir = env_string("CICD_ARTIFACT_DIR").unwrap_or(defaults.artifact_dir);
        let public_url = env_string("CICD_PUBLIC_URL").unwrap_or(defaults.public_url);
        let vault_key = env_string("CICD_VAULT_KEY");
        // Orchestrators usually expose the pod namespace; prefer an explicit id.
        let deployment_id = env_string("CICD_DEPLOYMENT_ID").or_else(|| env_string("POD_NAMESPACE"));

        let kube = KubeSettings {
            api_url: env_string("CICD_KUBE_API_URL").unwrap_or(defaults.kube.api_url),
            namespace: namespace.clone(),
            token_path: env_string("CICD_KUBE_TOKEN_PATH").unwrap_or(defaults.kube.token_path),
            ca_path: env_string("CICD_KUBE_CA_PATH").unwrap_or(defaults.kube.ca_path),
            insecure: env_parse("CICD_KUBE_INSECURE", false),
        };

        let job_poll_interval = Duration::from_millis(env_parse("CICD_JOB_POLL_MS", 2000));
        let retention = RetentionPolicy {
            per_job: env_parse("CICD_RETENTION_PER_JOB", defaults.retention.per_job),
            max_days: env_parse("CICD_RETENTION_MAX_DAYS", defaults.retention.max_days),
        };
        let retention_schedule =
            env_string("CICD_RETENTION_SCHEDULE").unwrap_or(defaults.retention_schedule);
        let artifact_retention_days =
            env_parse("CICD_ARTIFACT_RETENTION_DAYS", defaults.artifact_retention_days);
        let workspace_root = env_string("CICD_WORKSPACE_ROOT").unwrap_or(defaults.workspace_root);

        if vault_key.is_none() && deployment_id.is_none() {
            tracing::warn!(
                "CICD_VAULT_KEY and CICD_DEPLOYMENT_ID not set -- vault key derived from storage path"
            );
        }
        if kube.insecure {
            tracing::warn!("CICD_KUBE_INSECURE set -- cluster TLS verification disabled");
        }

        Self {
            namespace,
            artifact_dir,
            public_url,
            storage_path: storage_path.to_string(),
            vault_key,
            deployment_id,
            kube,
            job_poll_interval,
            retention,
            retention_schedule,
            artifact_retention_days,
            workspace_root,
        }
    }
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}
