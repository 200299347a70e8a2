//! JSON API for CRUD, manual trigger/cancel and stored logs.

use std::collections::BTreeMap;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::Json;
use serde::Deserialize;

use super::{json_or_default, CicdRouterState};
use crate::error::CicdError;
use crate::models::artifact::{ArtifactFilter, ArtifactMetadata};
use crate::models::freestyle::{FreestyleBuild, FreestyleJob};
use crate::models::host::{GitCredentialView, SshHostView};
use crate::models::notification::NotificationConfig;
use crate::models::pipeline::{Pipeline, PipelineRun};
use crate::models::TriggerInfo;
use crate::services::freestyle_service::FreestyleJobInput;
use crate::services::host_service::{GitCredentialInput, SshHostInput};
use crate::services::notification::NotificationInput;

type ApiResult<T> = Result<Json<T>, CicdError>;
type Created<T> = Result<(StatusCode, Json<T>), CicdError>;

const REDACTED: &str = "****";

#[derive(Debug, Default, Deserialize)]
pub struct TriggerPipelineRequest {
    #[serde(default)]
    pub variables: BTreeMap<String, String>,
    #[serde(default)]
    pub triggered_by: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct TriggerFreestyleRequest {
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
    #[serde(default)]
    pub triggered_by: Option<String>,
}

fn manual(triggered_by: Option<String>) -> TriggerInfo {
    TriggerInfo::manual(triggered_by.unwrap_or_else(|| "api".to_string()))
}

fn redact_job(mut job: FreestyleJob) -> FreestyleJob {
    if job.status.webhook_secret.is_some() {
        job.status.webhook_secret = Some(REDACTED.to_string());
    }
    job
}

fn redact_notification(mut config: NotificationConfig) -> NotificationConfig {
    if config.secret.is_some() {
        config.secret = Some(REDACTED.to_string());
    }
    config
}

// ── Pipelines ──

pub async fn list_pipelines(State(state): State<CicdRouterState>) -> ApiResult<Vec<Pipeline>> {
    state.engine.pipelines.list().await.map(Json)
}

/// Body is the raw pipeline YAML document.
pub async fn create_pipeline(State(state): State<CicdRouterState>, body: String) -> Created<Pipeline> {
    let pipeline = state.engine.pipelines.create(&body).await?;
    Ok((StatusCode::CREATED, Json(pipeline)))
}

pub async fn get_pipeline(
    State(state): State<CicdRouterState>,
    Path(id): Path<String>,
) -> ApiResult<Pipeline> {
    state.engine.pipelines.get(&id).await.map(Json)
}

pub async fn update_pipeline(
    State(state): State<CicdRouterState>,
    Path(id): Path<String>,
    body: String,
) -> ApiResult<Pipeline> {
    state.engine.pipelines.update(&id, &body).await.map(Json)
}

pub async fn delete_pipeline(
    State(state): State<CicdRouterState>,
    Path(id): Path<String>,
) -> Result<StatusCode, CicdError> {
    state.engine.pipelines.delete(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn trigger_pipeline(
    State(state): State<CicdRouterState>,
    Path(id): Path<String>,
    body: Bytes,
) -> Created<PipelineRun> {
    let req: TriggerPipelineRequest = json_or_default(&body)?;
    let run = state
        .engine
        .gateway
        .trigger_pipeline(&id, manual(req.triggered_by), req.variables)
        .await?;
    Ok((StatusCode::CREATED, Json(run)))
}

pub async fn list_runs(
    State(state): State<CicdRouterState>,
    Path(id): Path<String>,
) -> ApiResult<Vec<PipelineRun>> {
    state.engine.pipelines.get(&id).await?;
    state.engine.pipelines.list_runs(&id).await.map(Json)
}

pub async fn get_run(
    State(state): State<CicdRouterState>,
    Path(run_id): Path<String>,
) -> ApiResult<PipelineRun> {
    state.engine.pipelines.get_run(&run_id).await.map(Json)
}

pub async fn delete_run(
    State(state): State<CicdRouterState>,
    Path(run_id): Path<String>,
) -> Result<StatusCode, CicdError> {
    state.engine.pipelines.delete_run(&run_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn cancel_run(
    State(state): State<CicdRouterState>,
    Path(run_id): Path<String>,
) -> Result<(StatusCode, Json<PipelineRun>), CicdError> {
    let run = state.engine.gateway.cancel_run(&run_id).await?;
    Ok((StatusCode::ACCEPTED, Json(run)))
}

pub async fn run_logs(
    State(state): State<CicdRouterState>,
    Path(run_id): Path<String>,
) -> Result<String, CicdError> {
    state.engine.pipelines.run_logs(&run_id).await
}

pub async fn job_logs(
    State(state): State<CicdRouterState>,
    Path((run_id, job)): Path<(String, String)>,
) -> Result<String, CicdError> {
    state.engine.pipelines.job_logs(&run_id, &job).await
}

// ── Freestyle ──

pub async fn list_freestyle_jobs(
    State(state): State<CicdRouterState>,
) -> ApiResult<Vec<FreestyleJob>> {
    let jobs = state.engine.freestyle.list().await?;
    Ok(Json(jobs.into_iter().map(redact_job).collect()))
}

pub async fn create_freestyle_job(
    State(state): State<CicdRouterState>,
    Json(input): Json<FreestyleJobInput>,
) -> Created<FreestyleJob> {
    let job = state.engine.freestyle.create(input).await?;
    Ok((StatusCode::CREATED, Json(redact_job(job))))
}

pub async fn get_freestyle_job(
    State(state): State<CicdRouterState>,
    Path(id): Path<String>,
) -> ApiResult<FreestyleJob> {
    state.engine.freestyle.get(&id).await.map(redact_job).map(Json)
}

pub async fn update_freestyle_job(
    State(state): State<CicdRouterState>,
    Path(id): Path<String>,
    Json(input): Json<FreestyleJobInput>,
) -> ApiResult<FreestyleJob> {
    state
        .engine
        .freestyle
        .update(&id, input)
        .await
        .map(redact_job)
        .map(Json)
}

pub async fn delete_freestyle_job(
    State(state): State<CicdRouterState>,
    Path(id): Path<String>,
) -> Result<StatusCode, CicdError> {
    state.engine.freestyle.delete(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn trigger_freestyle_job(
    State(state): State<CicdRouterState>,
    Path(id): Path<String>,
    body: Bytes,
) -> Created<FreestyleBuild> {
    let req: TriggerFreestyleRequest = json_or_default(&body)?;
    let build = state
        .engine
        .gateway
        .trigger_freestyle(&id, manual(req.triggered_by), req.parameters)
        .await?;
    Ok((StatusCode::CREATED, Json(build)))
}

pub async fn list_builds(
    State(state): State<CicdRouterState>,
    Path(id): Path<String>,
) -> ApiResult<Vec<FreestyleBuild>> {
    state.engine.freestyle.get(&id).await?;
    state.engine.freestyle.list_builds(&id).await.map(Json)
}

pub async fn get_build(
    State(state): State<CicdRouterState>,
    Path(build_id): Path<String>,
) -> ApiResult<FreestyleBuild> {
    state.engine.freestyle.get_build(&build_id).await.map(Json)
}

pub async fn delete_build(
    State(state): State<CicdRouterState>,
    Path(build_id): Path<String>,
) -> Result<StatusCode, CicdError> {
    state.engine.freestyle.delete_build(&build_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn cancel_build(
    State(state): State<CicdRouterState>,
    Path(build_id): Path<String>,
) -> Result<(StatusCode, Json<FreestyleBuild>), CicdError> {
    let build = state.engine.gateway.cancel_build(&build_id).await?;
    Ok((StatusCode::ACCEPTED, Json(build)))
}

pub async fn build_logs(
    State(state): State<CicdRouterState>,
    Path(build_id): Path<String>,
) -> Result<String, CicdError> {
    state.engine.freestyle.build_logs(&build_id).await
}

// ── Hosts ──

pub async fn list_hosts(State(state): State<CicdRouterState>) -> ApiResult<Vec<SshHostView>> {
    state.engine.hosts.list_hosts().await.map(Json)
}

pub async fn create_host(
    State(state): State<CicdRouterState>,
    Json(input): Json<SshHostInput>,
) -> Created<SshHostView> {
    let host = state.engine.hosts.create_host(input).await?;
    Ok((StatusCode::CREATED, Json(host)))
}

pub async fn get_host(
    State(state): State<CicdRouterState>,
    Path(id): Path<String>,
) -> ApiResult<SshHostView> {
    state.engine.hosts.get_host(&id).await.map(Json)
}

pub async fn update_host(
    State(state): State<CicdRouterState>,
    Path(id): Path<String>,
    Json(input): Json<SshHostInput>,
) -> ApiResult<SshHostView> {
    state.engine.hosts.update_host(&id, input).await.map(Json)
}

pub async fn delete_host(
    State(state): State<CicdRouterState>,
    Path(id): Path<String>,
) -> Result<StatusCode, CicdError> {
    state.engine.hosts.delete_host(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Connection test result is recorded on the host and returned.
pub async fn test_host(
    State(state): State<CicdRouterState>,
    Path(id): Path<String>,
) -> ApiResult<SshHostView> {
    state.engine.hosts.test_connection(&id).await.map(Json)
}

// ── Git credentials ──

pub async fn list_credentials(
    State(state): State<CicdRouterState>,
) -> ApiResult<Vec<GitCredentialView>> {
    state.engine.hosts.list_credentials().await.map(Json)
}

pub async fn create_credential(
    State(state): State<CicdRouterState>,
    Json(input): Json<GitCredentialInput>,
) -> Created<GitCredentialView> {
    let cred = state.engine.hosts.create_credential(input).await?;
    Ok((StatusCode::CREATED, Json(cred)))
}

pub async fn get_credential(
    State(state): State<CicdRouterState>,
    Path(id): Path<String>,
) -> ApiResult<GitCredentialView> {
    state.engine.hosts.get_credential(&id).await.map(Json)
}

pub async fn update_credential(
    State(state): State<CicdRouterState>,
    Path(id): Path<String>,
    Json(input): Json<GitCredentialInput>,
) -> ApiResult<GitCredentialView> {
    state.engine.hosts.update_credential(&id, input).await.map(Json)
}

pub async fn delete_credential(
    State(state): State<CicdRouterState>,
    Path(id): Path<String>,
) -> Result<StatusCode, CicdError> {
    state.engine.hosts.delete_credential(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

// ── Notifications ──

pub async fn list_notifications(
    State(state): State<CicdRouterState>,
) -> ApiResult<Vec<NotificationConfig>> {
    let configs = state.engine.notifier.list().await?;
    Ok(Json(configs.into_iter().map(redact_notification).collect()))
}

pub async fn create_notification(
    State(state): State<CicdRouterState>,
    Json(input): Json<NotificationInput>,
) -> Created<NotificationConfig> {
    let config = state.engine.notifier.create(input).await?;
    Ok((StatusCode::CREATED, Json(redact_notification(config))))
}

pub async fn get_notification(
    State(state): State<CicdRouterState>,
    Path(id): Path<String>,
) -> ApiResult<NotificationConfig> {
    state
        .engine
        .notifier
        .get(&id)
        .await
        .map(redact_notification)
        .map(Json)
}

pub async fn update_notification(
    State(state): State<CicdRouterState>,
    Path(id): Path<String>,
    Json(input): Json<NotificationInput>,
) -> ApiResult<NotificationConfig> {
    state
        .engine
        .notifier
        .update(&id, input)
        .await
        .map(redact_notification)
        .map(Json)
}

pub async fn delete_notification(
    State(state): State<CicdRouterState>,
    Path(id): Path<String>,
) -> Result<StatusCode, CicdError> {
    state.engine.notifier.delete(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

// ── Artifacts ──

pub async fn list_artifacts(
    State(state): State<CicdRouterState>,
    Path(run_id): Path<String>,
) -> ApiResult<Vec<ArtifactMetadata>> {
    let filter = ArtifactFilter {
        run_id: Some(run_id),
        ..ArtifactFilter::default()
    };
    state.engine.artifacts.list(&filter).await.map(Json)
}

pub async fn delete_artifact(
    State(state): State<CicdRouterState>,
    Path(id): Path<String>,
) -> Result<StatusCode, CicdError> {
    state.engine.artifacts.delete(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}
