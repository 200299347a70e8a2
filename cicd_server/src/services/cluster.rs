//! Cluster API: namespaced batch Jobs, their Pods and Pod logs.
//!
//! The pipeline executor only talks to [`ClusterApi`]. [`KubeRestClient`] is
//! the production implementation and speaks the Kubernetes REST API directly
//! over `reqwest`, authenticated with the in-cluster service-account token.

use std::collections::BTreeMap;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use reqwest::{Method, StatusCode};
use serde_json::{json, Value};

use crate::error::{CicdError, Result};
use crate::models::pipeline::{ResourceQuantities, ResourceSpec, SecretMount};

/// Label prefix for every object the engine creates.
pub const LABEL_PREFIX: &str = "opsdeck.io";
pub const LABEL_RUN_ID: &str = "opsdeck.io/run-id";
pub const LABEL_PIPELINE_ID: &str = "opsdeck.io/pipeline-id";
pub const LABEL_JOB_NAME: &str = "opsdeck.io/job-name";

/// Container name inside every job Pod.
pub const CONTAINER_NAME: &str = "job";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Propagation {
    /// Delete the Job and let the cluster garbage-collect its Pods.
    Background,
    /// Delete the Job but keep its Pods (for log retrieval).
    Orphan,
}

impl Propagation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Propagation::Background => "Background",
            Propagation::Orphan => "Orphan",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobPhase {
    Active,
    Complete,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobState {
    pub name: String,
    pub phase: JobPhase,
    pub message: Option<String>,
}

impl JobState {
    /// Read the terminal condition out of a batch/v1 Job object.
    pub fn from_object(obj: &Value) -> Self {
        let name = obj["metadata"]["name"].as_str().unwrap_or_default().to_string();
        let conditions = obj["status"]["conditions"].as_array().cloned().unwrap_or_default();
        for cond in &conditions {
            if cond["status"].as_str() != Some("True") {
                continue;
            }
            let message = cond["message"]
                .as_str()
                .or_else(|| cond["reason"].as_str())
                .map(String::from);
            match cond["type"].as_str() {
                Some("Complete") => {
                    return Self {
                        name,
                        phase: JobPhase::Complete,
                        message,
                    }
                }
                Some("Failed") => {
                    return Self {
                        name,
                        phase: JobPhase::Failed,
                        message,
                    }
                }
                _ => {}
            }
        }
        Self {
            name,
            phase: JobPhase::Active,
            message: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodInfo {
    pub name: String,
    pub phase: String,
    /// Exit code of the job container once terminated.
    pub exit_code: Option<i32>,
}

impl PodInfo {
    pub fn from_object(obj: &Value) -> Self {
        let exit_code = obj["status"]["containerStatuses"]
            .as_array()
            .and_then(|statuses| {
                statuses
                    .iter()
                    .find(|s| s["name"].as_str() == Some(CONTAINER_NAME))
                    .or_else(|| statuses.first())
            })
            .and_then(|s| s["state"]["terminated"]["exitCode"].as_i64())
            .map(|c| c as i32);
        Self {
            name: obj["metadata"]["name"].as_str().unwrap_or_default().to_string(),
            phase: obj["status"]["phase"].as_str().unwrap_or("Unknown").to_string(),
            exit_code,
        }
    }
}

/// Everything needed to materialize one pipeline job as a cluster Job.
#[derive(Debug, Clone, Default)]
pub struct JobManifest {
    pub name: String,
    pub labels: BTreeMap<String, String>,
    pub image: String,
    pub script: String,
    pub workdir: Option<String>,
    pub env: Vec<(String, String)>,
    pub resources: ResourceSpec,
    pub secrets: Vec<SecretMount>,
    pub privileged: bool,
    pub deadline_secs: u64,
}

impl JobManifest {
    pub fn to_json(&self, namespace: &str) -> Value {
        let env: Vec<Value> = self
            .env
            .iter()
            .map(|(k, v)| json!({ "name": k, "value": v }))
            .collect();

        let mut mounts = Vec::new();
        let mut volumes = Vec::new();
        for (i, secret) in self.secrets.iter().enumerate() {
            let volume = format!("secret-{i}");
            mounts.push(json!({
                "name": volume,
                "mountPath": secret.mount_path,
                "readOnly": true,
            }));
            let mut source = json!({ "secretName": secret.name });
            if let Some(key) = &secret.key {
                source["items"] = json!([{ "key": key, "path": key }]);
            }
            volumes.push(json!({ "name": volume, "secret": source }));
        }

        let mut container = json!({
            "name": CONTAINER_NAME,
            "image": self.image,
            "command": ["sh", "-c", self.script],
            "env": env,
        });
        if let Some(dir) = &self.workdir {
            container["workingDir"] = json!(dir);
        }
        let resources = resources_json(&self.resources);
        if !resources.as_object().is_some_and(|m| m.is_empty()) {
            container["resources"] = resources;
        }
        if !mounts.is_empty() {
            container["volumeMounts"] = json!(mounts);
        }
        if self.privileged {
            container["securityContext"] = json!({
                "privileged": true,
                "allowPrivilegeEscalation": true,
            });
        }

        let mut pod_spec = json!({
            "restartPolicy": "Never",
            "containers": [container],
        });
        if !volumes.is_empty() {
            pod_spec["volumes"] = json!(volumes);
        }

        json!({
            "apiVersion": "batch/v1",
            "kind": "Job",
            "metadata": {
                "name": self.name,
                "namespace": namespace,
                "labels": self.labels,
            },
            "spec": {
                "backoffLimit": 0,
                "activeDeadlineSeconds": self.deadline_secs,
                "template": {
                    "metadata": { "labels": self.labels },
                    "spec": pod_spec,
                },
            },
        })
    }
}

fn resources_json(spec: &ResourceSpec) -> Value {
    let quantities = |q: &ResourceQuantities| {
        let mut m = serde_json::Map::new();
        if let Some(cpu) = &q.cpu {
            m.insert("cpu".into(), json!(cpu));
        }
        if let Some(mem) = &q.memory {
            m.insert("memory".into(), json!(mem));
        }
        Value::Object(m)
    };
    let mut out = serde_json::Map::new();
    if !spec.limits.is_empty() {
        out.insert("limits".into(), quantities(&spec.limits));
    }
    if !spec.requests.is_empty() {
        out.insert("requests".into(), quantities(&spec.requests));
    }
    Value::Object(out)
}

/// Cluster Job name: lowercase `[a-z0-9-]`, at most 63 characters,
/// alphanumeric at both ends.
pub fn cluster_job_name(run_id: &str, job: &str) -> String {
    let short: String = run_id
        .chars()
        .filter(char::is_ascii_alphanumeric)
        .take(8)
        .collect();
    let name: String = format!("opsdeck-{short}-{job}")
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_lowercase() || c.is_ascii_digit() { c } else { '-' })
        .take(63)
        .collect();
    trim_ends(&name).to_string()
}

/// Label value: at most 63 chars of `[A-Za-z0-9_.-]`, alphanumeric at both ends.
pub fn label_value(value: &str) -> String {
    let mapped: String = value
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || "-_.".contains(c) { c } else { '-' })
        .take(63)
        .collect();
    trim_ends(&mapped).to_string()
}

fn trim_ends(value: &str) -> &str {
    value.trim_matches(|c: char| !c.is_ascii_alphanumeric())
}

#[async_trait]
pub trait ClusterApi: Send + Sync {
    async fn create_job(&self, manifest: &JobManifest) -> Result<()>;

    /// `None` when the Job does not exist.
    async fn get_job(&self, name: &str) -> Result<Option<JobState>>;

    /// Stream of state changes for one Job, starting with its current state.
    async fn watch_job(&self, name: &str) -> Result<BoxStream<'static, Result<JobState>>>;

    /// Deleting a missing Job is not an error.
    async fn delete_job(&self, name: &str, propagation: Propagation) -> Result<()>;

    async fn delete_jobs_by_label(&self, selector: &str, propagation: Propagation) -> Result<()>;

    /// Pods created for the named Job.
    async fn list_pods(&self, job_name: &str) -> Result<Vec<PodInfo>>;

    async fn pod_logs(&self, pod: &str, container: &str) -> Result<String>;

    async fn follow_pod_logs(
        &self,
        pod: &str,
        container: &str,
    ) -> Result<BoxStream<'static, Result<Vec<u8>>>>;
}

/// Connection settings for [`KubeRestClient`].
#[derive(Debug, Clone)]
pub struct KubeSettings {
    pub api_url: String,
    pub namespace: String,
    pub token_path: String,
    pub ca_path: String,
    pub insecure: bool,
}

/// Kubernetes REST client using the service-account token.
pub struct KubeRestClient {
    http: reqwest::Client,
    settings: KubeSettings,
}

impl KubeRestClient {
    pub fn new(settings: KubeSettings) -> Result<Self> {
        let mut builder = reqwest::Client::builder();
        if settings.insecure {
            tracing::warn!("Cluster API TLS verification disabled");
            builder = builder.danger_accept_invalid_certs(true);
        } else {
            match std::fs::read(&settings.ca_path) {
                Ok(pem) => {
                    let cert = reqwest::Certificate::from_pem(&pem)
                        .map_err(|e| CicdError::Cluster(format!("invalid CA bundle: {e}")))?;
                    builder = builder.add_root_certificate(cert);
                }
                Err(e) => {
                    tracing::warn!(path = %settings.ca_path, "Cluster CA bundle unavailable: {e}");
                }
            }
        }
        let http = builder
            .build()
            .map_err(|e| CicdError::Cluster(format!("http client: {e}")))?;
        Ok(Self { http, settings })
    }

    pub fn namespace(&self) -> &str {
        &self.settings.namespace
    }

    fn jobs_url(&self) -> String {
        format!(
            "{}/apis/batch/v1/namespaces/{}/jobs",
            self.settings.api_url.trim_end_matches('/'),
            self.settings.namespace
        )
    }

    fn pods_url(&self) -> String {
        format!(
            "{}/api/v1/namespaces/{}/pods",
            self.settings.api_url.trim_end_matches('/'),
            self.settings.namespace
        )
    }

    /// Token is re-read per request so projected-token rotation is picked up.
    async fn request(&self, method: Method, url: &str) -> reqwest::RequestBuilder {
        let mut req = self.http.request(method, url);
        match tokio::fs::read_to_string(&self.settings.token_path).await {
            Ok(token) => req = req.bearer_auth(token.trim()),
            Err(e) => tracing::debug!("No service-account token: {e}"),
        }
        req
    }

    async fn send(&self, req: reqwest::RequestBuilder) -> Result<reqwest::Response> {
        let resp = req
            .send()
            .await
            .map_err(|e| CicdError::Cluster(format!("cluster API unreachable: {e}")))?;
        if resp.status().is_success() {
            return Ok(resp);
        }
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        Err(CicdError::Cluster(format!("cluster API returned {status}: {body}")))
    }

    fn delete_options(propagation: Propagation) -> Value {
        json!({
            "kind": "DeleteOptions",
            "apiVersion": "v1",
            "propagationPolicy": propagation.as_str(),
        })
    }
}

#[async_trait]
impl ClusterApi for KubeRestClient {
    async fn create_job(&self, manifest: &JobManifest) -> Result<()> {
        let body = manifest.to_json(&self.settings.namespace);
        let req = self.request(Method::POST, &self.jobs_url()).await.json(&body);
        self.send(req).await?;
        tracing::debug!(job = %manifest.name, "Cluster job created");
        Ok(())
    }

    async fn get_job(&self, name: &str) -> Result<Option<JobState>> {
        let url = format!("{}/{}", self.jobs_url(), name);
        let resp = self
            .request(Method::GET, &url)
            .await
            .send()
            .await
            .map_err(|e| CicdError::Cluster(format!("cluster API unreachable: {e}")))?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !resp.status().is_success() {
            return Err(CicdError::Cluster(format!(
                "get job {name} returned {}",
                resp.status()
            )));
        }
        let obj: Value = resp.json().await?;
        Ok(Some(JobState::from_object(&obj)))
    }

    async fn watch_job(&self, name: &str) -> Result<BoxStream<'static, Result<JobState>>> {
        let url = format!(
            "{}?watch=true&fieldSelector=metadata.name%3D{}",
            self.jobs_url(),
            name
        );
        let resp = self.send(self.request(Method::GET, &url).await).await?;
        let bytes = resp
            .bytes_stream()
            .map(|chunk| chunk.map(|b| b.to_vec()).map_err(CicdError::from))
            .boxed();
        Ok(watch_events(bytes))
    }

    async fn delete_job(&self, name: &str, propagation: Propagation) -> Result<()> {
        let url = format!("{}/{}", self.jobs_url(), name);
        let resp = self
            .request(Method::DELETE, &url)
            .await
            .json(&Self::delete_options(propagation))
            .send()
            .await
            .map_err(|e| CicdError::Cluster(format!("cluster API unreachable: {e}")))?;
        if resp.status().is_success() || resp.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        Err(CicdError::Cluster(format!(
            "delete job {name} returned {}",
            resp.status()
        )))
    }

    async fn delete_jobs_by_label(&self, selector: &str, propagation: Propagation) -> Result<()> {
        let mut url = url::Url::parse(&self.jobs_url())
            .map_err(|e| CicdError::Cluster(format!("bad API url: {e}")))?;
        url.query_pairs_mut().append_pair("labelSelector", selector);
        let req = self
            .request(Method::DELETE, url.as_str())
            .await
            .json(&Self::delete_options(propagation));
        self.send(req).await?;
        Ok(())
    }

    async fn list_pods(&self, job_name: &str) -> Result<Vec<PodInfo>> {
        let mut url = url::Url::parse(&self.pods_url())
            .map_err(|e| CicdError::Cluster(format!("bad API url: {e}")))?;
        url.query_pairs_mut()
            .append_pair("labelSelector", &format!("job-name={job_name}"));
        let resp = self.send(self.request(Method::GET, url.as_str()).await).await?;
        let list: Value = resp.json().await?;
        Ok(list["items"]
            .as_array()
            .map(|items| items.iter().map(PodInfo::from_object).collect())
            .unwrap_or_default())
    }

    async fn pod_logs(&self, pod: &str, container: &str) -> Result<String> {
        let url = format!("{}/{}/log?container={}", self.pods_url(), pod, container);
        let resp = self.send(self.request(Method::GET, &url).await).await?;
        Ok(resp.text().await?)
    }

    async fn follow_pod_logs(
        &self,
        pod: &str,
        container: &str,
    ) -> Result<BoxStream<'static, Result<Vec<u8>>>> {
        let url = format!(
            "{}/{}/log?container={}&follow=true",
            self.pods_url(),
            pod,
            container
        );
        let resp = self.send(self.request(Method::GET, &url).await).await?;
        Ok(resp
            .bytes_stream()
            .map(|chunk| chunk.map(|b| b.to_vec()).map_err(CicdError::from))
            .boxed())
    }
}

/// Split a watch response (one JSON event per line) into Job states.
pub fn watch_events(
    bytes: BoxStream<'static, Result<Vec<u8>>>,
) -> BoxStream<'static, Result<JobState>> {
    stream::unfold(
        (bytes, Vec::<u8>::new(), false),
        |(mut bytes, mut buf, done)| async move {
            if done {
                return None;
            }
            loop {
                if let Some(pos) = buf.iter().position(|b| *b == b'\n') {
                    let line: Vec<u8> = buf.drain(..=pos).collect();
                    if line.iter().all(u8::is_ascii_whitespace) {
                        continue;
                    }
                    let item = parse_watch_line(&line);
                    return Some((item, (bytes, buf, false)));
                }
                match bytes.next().await {
                    Some(Ok(chunk)) => buf.extend_from_slice(&chunk),
                    Some(Err(e)) => return Some((Err(e), (bytes, buf, true))),
                    None => {
                        if buf.iter().all(u8::is_ascii_whitespace) {
                            return None;
                        }
                        let line = std::mem::take(&mut buf);
                        return Some((parse_watch_line(&line), (bytes, buf, true)));
                    }
                }
            }
        },
    )
    .boxed()
}

fn parse_watch_line(line: &[u8]) -> Result<JobState> {
    let event: Value = serde_json::from_slice(line)?;
    match event["type"].as_str() {
        Some("ERROR") => Err(CicdError::Cluster(format!(
            "watch error: {}",
            event["object"]["message"].as_str().unwrap_or("unknown")
        ))),
        Some("DELETED") => Err(CicdError::Cluster(format!(
            "job {} was deleted",
            event["object"]["metadata"]["name"].as_str().unwrap_or_default()
        ))),
        _ => Ok(JobState::from_object(&event["object"])),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_name_sanitized_and_bounded() {
        let name = cluster_job_name("3f2a9c1e-aaaa-bbbb", "Unit_Tests");
        assert_eq!(name, "opsdeck-3f2a9c1e-unit-tests");

        let long = "x".repeat(80);
        let name = cluster_job_name("3f2a9c1e", &long);
        assert_eq!(name.len(), 63);

        let name = cluster_job_name("3f2a9c1e", &format!("{}-y", "a".repeat(45)));
        assert!(!name.ends_with('-'));

        assert_eq!(cluster_job_name("3f2a9c1e", "build_"), "opsdeck-3f2a9c1e-build");
        assert_eq!(cluster_job_name("3f2a9c1e", "--"), "opsdeck-3f2a9c1e");
    }

    #[test]
    fn test_label_value_starts_and_ends_alphanumeric() {
        assert_eq!(label_value("unit tests!"), "unit-tests");
        assert_eq!(label_value("build_"), "build");
        assert_eq!(label_value("_lint.v2_"), "lint.v2");
        assert_eq!(label_value("Unit_Tests"), "Unit_Tests");

        let long = format!("{}_{}", "a".repeat(62), "b");
        assert_eq!(label_value(&long), "a".repeat(62));
        assert_eq!(label_value("___"), "");
    }

    #[test]
    fn test_manifest_shape() {
        let manifest = JobManifest {
            name: "opsdeck-abc-build".into(),
            labels: BTreeMap::from([(LABEL_RUN_ID.to_string(), "abc".to_string())]),
            image: "rust:1.84".into(),
            script: "cargo build".into(),
            workdir: Some("/src".into()),
            env: vec![("RUN_ID".into(), "abc".into())],
            resources: ResourceSpec {
                limits: ResourceQuantities {
                    cpu: Some("2".into()),
                    memory: None,
                },
                requests: ResourceQuantities::default(),
            },
            secrets: vec![SecretMount {
                name: "kubeconfig".into(),
                mount_path: "/etc/kube".into(),
                key: Some("config".into()),
            }],
            privileged: true,
            deadline_secs: 600,
        };
        let v = manifest.to_json("ci");
        assert_eq!(v["metadata"]["namespace"], "ci");
        assert_eq!(v["spec"]["backoffLimit"], 0);
        assert_eq!(v["spec"]["activeDeadlineSeconds"], 600);
        let pod = &v["spec"]["template"]["spec"];
        assert_eq!(pod["restartPolicy"], "Never");
        let c = &pod["containers"][0];
        assert_eq!(c["name"], CONTAINER_NAME);
        assert_eq!(c["command"], json!(["sh", "-c", "cargo build"]));
        assert_eq!(c["workingDir"], "/src");
        assert_eq!(c["resources"]["limits"]["cpu"], "2");
        assert!(c["resources"].get("requests").is_none());
        assert_eq!(c["volumeMounts"][0]["readOnly"], true);
        assert_eq!(c["securityContext"]["privileged"], true);
        assert_eq!(pod["volumes"][0]["secret"]["items"][0]["key"], "config");
        assert_eq!(v["spec"]["template"]["metadata"]["labels"][LABEL_RUN_ID], "abc");
    }

    #[test]
    fn test_job_state_conditions() {
        let done = json!({
            "metadata": {"name": "j"},
            "status": {"conditions": [{"type": "Complete", "status": "True"}]}
        });
        assert_eq!(JobState::from_object(&done).phase, JobPhase::Complete);

        let failed = json!({
            "metadata": {"name": "j"},
            "status": {"conditions": [
                {"type": "Failed", "status": "True", "reason": "DeadlineExceeded"}
            ]}
        });
        let state = JobState::from_object(&failed);
        assert_eq!(state.phase, JobPhase::Failed);
        assert_eq!(state.message.as_deref(), Some("DeadlineExceeded"));

        let active = json!({"metadata": {"name": "j"}, "status": {"active": 1}});
        assert_eq!(JobState::from_object(&active).phase, JobPhase::Active);
    }

    #[test]
    fn test_pod_exit_code() {
        let pod = json!({
            "metadata": {"name": "p"},
            "status": {
                "phase": "Failed",
                "containerStatuses": [
                    {"name": "job", "state": {"terminated": {"exitCode": 3}}}
                ]
            }
        });
        let info = PodInfo::from_object(&pod);
        assert_eq!(info.exit_code, Some(3));
        assert_eq!(info.phase, "Failed");
    }

    #[tokio::test]
    async fn test_watch_events_split_across_chunks() {
        let l1 = r#"{"type":"ADDED","object":{"metadata":{"name":"j"},"status":{}}}"#;
        let l2 = r#"{"type":"MODIFIED","object":{"metadata":{"name":"j"},"status":{"conditions":[{"type":"Complete","status":"True"}]}}}"#;
        let joined = format!("{l1}\n{l2}\n");
        let (a, b) = joined.as_bytes().split_at(20);
        let chunks: Vec<Result<Vec<u8>>> = vec![Ok(a.to_vec()), Ok(b.to_vec())];
        let mut events = watch_events(stream::iter(chunks).boxed());

        assert_eq!(events.next().await.unwrap().unwrap().phase, JobPhase::Active);
        assert_eq!(events.next().await.unwrap().unwrap().phase, JobPhase::Complete);
        assert!(events.next().await.is_none());
    }

    #[tokio::test]
    async fn test_watch_error_event() {
        let line = r#"{"type":"ERROR","object":{"message":"too old resource version"}}"#;
        let chunks: Vec<Result<Vec<u8>>> = vec![Ok(line.as_bytes().to_vec())];
        let mut events = watch_events(stream::iter(chunks).boxed());
        let err = events.next().await.unwrap().unwrap_err();
        assert!(err.to_string().contains("too old resource version"));
    }
}
