//! Pipeline definition parser.
//!
//! Turns an `opsdeck/v1` `Pipeline` YAML document into a validated
//! [`Pipeline`]. Validation stops at the first problem found, and nothing is
//! minted (ids, tokens) until the whole document is accepted.

use std::collections::{BTreeMap, HashSet};
use std::sync::LazyLock;

use chrono::Utc;
use rand::RngCore;
use regex::Regex;
use serde::Deserialize;

use crate::error::{CicdError, Result};
use crate::models::pipeline::{
    ArtifactSpec, EnvVar, JobSpec, Pipeline, PipelineSpec, PipelineStatus, PipelineTrigger,
    ResourceQuantities, ResourceSpec, SecretMount, DEFAULT_JOB_TIMEOUT_SECS,
    MAX_JOB_TIMEOUT_SECS,
};

pub const API_VERSION: &str = "opsdeck/v1";
pub const KIND: &str = "Pipeline";

static NAME_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9_-]{1,63}$").unwrap_or_else(|e| panic!("name pattern: {e}"))
});

static QUANTITY_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[0-9]+(\.[0-9]+)?(m|k|Ki|M|Mi|G|Gi|T|Ti|P|Pi|E|Ei)?$")
        .unwrap_or_else(|e| panic!("quantity pattern: {e}"))
});

// ── Raw document shape ──

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawDocument {
    #[serde(default)]
    api_version: String,
    #[serde(default)]
    kind: String,
    #[serde(default)]
    metadata: RawMetadata,
    #[serde(default)]
    spec: RawSpec,
}

#[derive(Debug, Default, Deserialize)]
struct RawMetadata {
    #[serde(default)]
    name: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    labels: BTreeMap<String, String>,
}

#[derive(Debug, Default, Deserialize)]
struct RawSpec {
    #[serde(default)]
    variables: BTreeMap<String, String>,
    #[serde(default)]
    triggers: Vec<RawTrigger>,
    #[serde(default)]
    jobs: Vec<RawJob>,
    #[serde(default)]
    artifacts: Vec<ArtifactSpec>,
}

#[derive(Debug, Deserialize)]
struct RawTrigger {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    schedule: Option<String>,
    #[serde(default)]
    secret: Option<String>,
    #[serde(default)]
    enabled: Option<bool>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawJob {
    #[serde(default)]
    name: String,
    #[serde(default)]
    image: String,
    #[serde(default)]
    workdir: Option<String>,
    #[serde(default)]
    script: String,
    #[serde(default)]
    env: Vec<EnvVar>,
    #[serde(default)]
    secrets: Vec<SecretMount>,
    #[serde(default)]
    resources: ResourceSpec,
    #[serde(default)]
    timeout: Option<RawTimeout>,
    #[serde(default)]
    privileged: bool,
    #[serde(default)]
    depends_on: Vec<String>,
    #[serde(default)]
    skip_if: Option<String>,
}

/// `timeout: 300` or `timeout: "5m"`.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawTimeout {
    Seconds(u64),
    Text(String),
}

impl RawTimeout {
    fn to_secs(&self, job: &str) -> Result<u64> {
        let secs = match self {
            RawTimeout::Seconds(s) => *s,
            RawTimeout::Text(t) => parse_duration_secs(t).ok_or_else(|| {
                CicdError::Definition(format!("job '{job}': invalid timeout '{t}'"))
            })?,
        };
        if secs == 0 {
            return Err(CicdError::Definition(format!(
                "job '{job}': timeout must be positive"
            )));
        }
        if secs > MAX_JOB_TIMEOUT_SECS {
            return Err(CicdError::Definition(format!(
                "job '{job}': timeout {secs}s exceeds the {MAX_JOB_TIMEOUT_SECS}s maximum"
            )));
        }
        Ok(secs)
    }
}

/// `90`, `90s`, `15m`, `2h`.
fn parse_duration_secs(text: &str) -> Option<u64> {
    let text = text.trim();
    let (digits, unit) = match text.find(|c: char| !c.is_ascii_digit()) {
        Some(i) => text.split_at(i),
        None => (text, "s"),
    };
    let n: u64 = digits.parse().ok()?;
    let mult = match unit {
        "s" => 1,
        "m" => 60,
        "h" => 3600,
        _ => return None,
    };
    n.checked_mul(mult)
}

/// Parses pipeline documents and mints webhook callback URLs.
#[derive(Debug, Clone)]
pub struct PipelineParser {
    public_url: String,
}

impl PipelineParser {
    pub fn new(public_url: impl Into<String>) -> Self {
        Self {
            public_url: public_url.into().trim_end_matches('/').to_string(),
        }
    }

    /// Validate `source` and build a new [`Pipeline`] with a fresh id.
    pub fn parse(&self, source: &str) -> Result<Pipeline> {
        let (name, description, labels, spec) = validate(source)?;

        let id = uuid::Uuid::new_v4().to_string();
        let mut status = PipelineStatus::default();
        if spec
            .triggers
            .iter()
            .any(|t| matches!(t, PipelineTrigger::Webhook { .. }))
        {
            let token = generate_token();
            status.webhook_url = Some(self.webhook_url(&id, &token));
            status.webhook_token = Some(token);
        }

        let now = Utc::now();
        Ok(Pipeline {
            id,
            name,
            description,
            labels,
            spec,
            status,
            source: source.to_string(),
            created_at: now,
            updated_at: now,
        })
    }

    /// Re-parse an edited document for an existing pipeline. Id, counters and
    /// an existing webhook token are kept.
    pub fn reparse(&self, existing: &Pipeline, source: &str) -> Result<Pipeline> {
        let (name, description, labels, spec) = validate(source)?;

        let mut status = existing.status.clone();
        let wants_webhook = spec
            .triggers
            .iter()
            .any(|t| matches!(t, PipelineTrigger::Webhook { .. }));
        if wants_webhook {
            let token = status.webhook_token.clone().unwrap_or_else(generate_token);
            status.webhook_url = Some(self.webhook_url(&existing.id, &token));
            status.webhook_token = Some(token);
        } else {
            status.webhook_token = None;
            status.webhook_url = None;
        }

        Ok(Pipeline {
            id: existing.id.clone(),
            name,
            description,
            labels,
            spec,
            status,
            source: source.to_string(),
            created_at: existing.created_at,
            updated_at: Utc::now(),
        })
    }

    pub fn webhook_url(&self, pipeline_id: &str, token: &str) -> String {
        format!("{}/cicd/webhooks/{}/{}", self.public_url, pipeline_id, token)
    }
}

type Validated = (String, Option<String>, BTreeMap<String, String>, PipelineSpec);

fn validate(source: &str) -> Result<Validated> {
    let doc: RawDocument = serde_yaml::from_str(source)
        .map_err(|e| CicdError::Definition(format!("invalid pipeline document: {e}")))?;

    if doc.api_version != API_VERSION {
        return Err(CicdError::Definition(format!(
            "apiVersion must be '{API_VERSION}', got '{}'",
            doc.api_version
        )));
    }
    if doc.kind != KIND {
        return Err(CicdError::Definition(format!(
            "kind must be '{KIND}', got '{}'",
            doc.kind
        )));
    }
    check_name("pipeline name", &doc.metadata.name)?;

    if doc.spec.jobs.is_empty() {
        return Err(CicdError::Definition(
            "pipeline must declare at least one job".to_string(),
        ));
    }

    let mut seen = HashSet::new();
    let mut jobs = Vec::with_capacity(doc.spec.jobs.len());
    for raw in &doc.spec.jobs {
        check_name("job name", &raw.name)?;
        if !seen.insert(raw.name.as_str()) {
            return Err(CicdError::Definition(format!(
                "duplicate job name '{}'",
                raw.name
            )));
        }
        if raw.image.trim().is_empty() {
            return Err(CicdError::Definition(format!(
                "job '{}': image is required",
                raw.name
            )));
        }
        if raw.script.trim().is_empty() {
            return Err(CicdError::Definition(format!(
                "job '{}': script is required",
                raw.name
            )));
        }
        check_resources(&raw.name, &raw.resources)?;
        for secret in &raw.secrets {
            if secret.name.is_empty() || secret.mount_path.is_empty() {
                return Err(CicdError::Definition(format!(
                    "job '{}': secrets need name and mountPath",
                    raw.name
                )));
            }
        }

        let timeout_secs = match &raw.timeout {
            Some(t) => t.to_secs(&raw.name)?,
            None => DEFAULT_JOB_TIMEOUT_SECS,
        };

        jobs.push(JobSpec {
            name: raw.name.clone(),
            image: raw.image.clone(),
            script: raw.script.clone(),
            workdir: raw.workdir.clone().filter(|w| !w.is_empty()),
            timeout_secs,
            privileged: raw.privileged,
            resources: raw.resources.clone(),
            env: raw.env.clone(),
            secrets: raw.secrets.clone(),
            depends_on: raw.depends_on.clone(),
            skip_if: raw.skip_if.clone().filter(|s| !s.is_empty()),
        });
    }

    // References may point anywhere in the document; ordering is the
    // executor's concern.
    for job in &jobs {
        for dep in &job.depends_on {
            if !seen.contains(dep.as_str()) {
                return Err(CicdError::Definition(format!(
                    "job '{}' depends on unknown job '{}'",
                    job.name, dep
                )));
            }
        }
    }

    let mut triggers = Vec::with_capacity(doc.spec.triggers.len());
    for raw in &doc.spec.triggers {
        let enabled = raw.enabled.unwrap_or(true);
        match raw.kind.as_str() {
            "webhook" => triggers.push(PipelineTrigger::Webhook {
                enabled,
                secret: raw.secret.clone().filter(|s| !s.is_empty()),
            }),
            "cron" => {
                let schedule = raw.schedule.as_deref().map(str::trim).unwrap_or_default();
                if schedule.is_empty() {
                    return Err(CicdError::Definition(
                        "cron trigger requires a schedule".to_string(),
                    ));
                }
                triggers.push(PipelineTrigger::Cron {
                    schedule: schedule.to_string(),
                    enabled,
                });
            }
            other => {
                return Err(CicdError::Definition(format!(
                    "unsupported trigger type '{other}'"
                )));
            }
        }
    }

    for artifact in &doc.spec.artifacts {
        if let Some(job) = &artifact.job {
            if !seen.contains(job.as_str()) {
                return Err(CicdError::Definition(format!(
                    "artifact '{}' references unknown job '{}'",
                    artifact.name, job
                )));
            }
        }
    }

    let spec = PipelineSpec {
        variables: doc.spec.variables,
        jobs,
        artifacts: doc.spec.artifacts,
        triggers,
    };
    Ok((
        doc.metadata.name,
        doc.metadata.description,
        doc.metadata.labels,
        spec,
    ))
}

fn check_name(what: &str, name: &str) -> Result<()> {
    if NAME_REGEX.is_match(name) {
        Ok(())
    } else {
        Err(CicdError::Definition(format!(
            "{what} '{name}' must be 1-63 characters of [A-Za-z0-9_-]"
        )))
    }
}

fn check_resources(job: &str, resources: &ResourceSpec) -> Result<()> {
    let check = |q: &ResourceQuantities| -> Result<()> {
        for value in [&q.cpu, &q.memory].into_iter().flatten() {
            if !QUANTITY_REGEX.is_match(value) {
                return Err(CicdError::Definition(format!(
                    "job '{job}': invalid resource quantity '{value}'"
                )));
            }
        }
        Ok(())
    };
    check(&resources.limits)?;
    check(&resources.requests)
}

/// 32 random bytes, hex encoded.
pub fn generate_token() -> String {
    let mut bytes = [0u8; 32];
    rand::rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}
