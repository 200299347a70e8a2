//! Inbound webhooks. Token in the path, optional HMAC over the raw body.

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::Json;
use serde::Serialize;

use super::CicdRouterState;
use crate::error::CicdError;
use crate::services::signature::SIGNATURE_HEADER;

#[derive(Debug, Serialize)]
pub struct WebhookAccepted {
    pub id: String,
    pub number: u64,
    pub status: String,
}

fn signature_header(headers: &HeaderMap) -> Option<&str> {
    headers.get(SIGNATURE_HEADER).and_then(|v| v.to_str().ok())
}

/// `POST /cicd/webhooks/{pipeline_id}/{token}`
pub async fn pipeline_webhook(
    State(state): State<CicdRouterState>,
    Path((pipeline_id, token)): Path<(String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<WebhookAccepted>), CicdError> {
    let run = state
        .engine
        .gateway
        .pipeline_webhook(&pipeline_id, &token, signature_header(&headers), &body)
        .await?;
    tracing::info!(
        run_id = %run.id,
        pipeline_id = %pipeline_id,
        "Pipeline run created from webhook"
    );
    Ok((
        StatusCode::ACCEPTED,
        Json(WebhookAccepted {
            id: run.id,
            number: run.number,
            status: run.status.to_string(),
        }),
    ))
}

/// `POST /cicd/freestyle/webhook/{token}`
pub async fn freestyle_webhook(
    State(state): State<CicdRouterState>,
    Path(token): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<WebhookAccepted>), CicdError> {
    let build = state
        .engine
        .gateway
        .freestyle_webhook(&token, signature_header(&headers), &body)
        .await?;
    tracing::info!(
        build_id = %build.id,
        job_id = %build.job_id,
        "Freestyle build created from webhook"
    );
    Ok((
        StatusCode::ACCEPTED,
        Json(WebhookAccepted {
            id: build.id,
            number: build.number,
            status: build.status.to_string(),
        }),
    ))
}
