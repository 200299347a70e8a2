//! Long-lived endpoints: live log tails over SSE and artifact transfer.

use std::convert::Infallible;
use std::time::Duration;

use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::sse::{Event, KeepAlive, KeepAliveStream, Sse};
use axum::response::{IntoResponse, Json, Response};
use futures::future::{BoxFuture, FutureExt};
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use serde::Deserialize;
use tokio_util::io::ReaderStream;

use super::CicdRouterState;
use crate::error::CicdError;
use crate::models::artifact::ArtifactMetadata;
use crate::services::artifact_service::ArtifactUpload;
use crate::services::output_stream::OutputStream;

type EventStream = BoxStream<'static, Result<Event, Infallible>>;
type LogTail = Sse<KeepAliveStream<EventStream>>;

/// SSE data lines cannot carry carriage returns.
fn log_event(chunk: &[u8]) -> Event {
    let text = String::from_utf8_lossy(chunk).replace("\r\n", "\n").replace('\r', "\n");
    Event::default().event("log").data(text)
}

fn end_event(status: &str) -> Event {
    Event::default().event("end").data(status)
}

/// History first, then live chunks until the stream closes, then the final status.
fn live_events(stream: &OutputStream, final_status: BoxFuture<'static, String>) -> EventStream {
    let rx = stream.subscribe();
    let chunks = stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|chunk| (Ok(log_event(&chunk)), rx))
    });
    chunks
        .chain(stream::once(final_status.map(|status| Ok(end_event(&status)))))
        .boxed()
}

/// A finished run/build: the stored output as one event, then `end`.
fn stored_events(logs: String, status: String) -> EventStream {
    let mut events = Vec::new();
    if !logs.is_empty() {
        events.push(Ok(log_event(logs.as_bytes())));
    }
    events.push(Ok(end_event(&status)));
    stream::iter(events).boxed()
}

fn sse(events: EventStream) -> LogTail {
    Sse::new(events).keep_alive(KeepAlive::new().interval(Duration::from_secs(15)))
}

/// `GET /cicd/runs/{run_id}/logs/stream`
pub async fn run_log_stream(
    State(state): State<CicdRouterState>,
    Path(run_id): Path<String>,
) -> Result<LogTail, CicdError> {
    let run = state.engine.pipelines.get_run(&run_id).await?;
    if let Some(live) = state.engine.streams.get(&run_id) {
        let engine = state.engine.clone();
        let final_status = async move {
            match engine.pipelines.get_run(&run_id).await {
                Ok(run) => run.status.to_string(),
                Err(_) => "unknown".to_string(),
            }
        };
        return Ok(sse(live_events(&live, final_status.boxed())));
    }
    let logs = state.engine.pipelines.run_logs(&run_id).await?;
    Ok(sse(stored_events(logs, run.status.to_string())))
}

/// `GET /cicd/freestyle/builds/{build_id}/logs/stream`
pub async fn build_log_stream(
    State(state): State<CicdRouterState>,
    Path(build_id): Path<String>,
) -> Result<LogTail, CicdError> {
    let build = state.engine.freestyle.get_build(&build_id).await?;
    if let Some(live) = state.engine.streams.get(&build_id) {
        let engine = state.engine.clone();
        let final_status = async move {
            match engine.freestyle.get_build(&build_id).await {
                Ok(build) => build.status.to_string(),
                Err(_) => "unknown".to_string(),
            }
        };
        return Ok(sse(live_events(&live, final_status.boxed())));
    }
    Ok(sse(stored_events(
        build.combined_output(),
        build.status.to_string(),
    )))
}

#[derive(Debug, Deserialize)]
pub struct UploadQuery {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub filename: Option<String>,
}

/// `POST /cicd/runs/{run_id}/artifacts?name=&filename=` with the raw file as body.
pub async fn upload_artifact(
    State(state): State<CicdRouterState>,
    Path(run_id): Path<String>,
    Query(query): Query<UploadQuery>,
    body: Body,
) -> Result<(StatusCode, Json<ArtifactMetadata>), CicdError> {
    let run = state.engine.pipelines.get_run(&run_id).await?;
    let filename = query
        .filename
        .or_else(|| query.name.clone())
        .ok_or_else(|| CicdError::Validation("filename is required".to_string()))?;
    let upload = ArtifactUpload {
        run_id: run.id,
        pipeline_id: run.pipeline_id,
        name: query.name,
        filename,
    };
    let data = body.into_data_stream().map_err(std::io::Error::other);
    let meta = state.engine.artifacts.save(upload, data).await?;
    Ok((StatusCode::CREATED, Json(meta)))
}

/// `GET /cicd/artifacts/{id}` streams the stored file.
pub async fn download_artifact(
    State(state): State<CicdRouterState>,
    Path(id): Path<String>,
) -> Result<Response, CicdError> {
    let meta = state.engine.artifacts.get(&id).await?;
    let file = tokio::fs::File::open(&meta.path)
        .await
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => CicdError::NotFound(format!("artifact file {id}")),
            _ => CicdError::Io(e),
        })?;

    let disposition = format!("attachment; filename=\"{}\"", meta.filename);
    let mut response = Body::from_stream(ReaderStream::new(file)).into_response();
    let headers = response.headers_mut();
    if let Ok(v) = HeaderValue::from_str(&meta.mime_type) {
        headers.insert(header::CONTENT_TYPE, v);
    }
    if let Ok(v) = HeaderValue::from_str(&disposition) {
        headers.insert(header::CONTENT_DISPOSITION, v);
    }
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(meta.size));
    if let Ok(v) = HeaderValue::from_str(&format!("\"{}\"", meta.checksum)) {
        headers.insert(header::ETAG, v);
    }
    Ok(response)
}
