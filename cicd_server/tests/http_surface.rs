mod common;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

use axum::body::{to_bytes, Body, Bytes};
use axum::extract::State;
use axum::http::{header, HeaderMap, Request, StatusCode};
use axum::routing::post;
use axum::Router;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tower::ServiceExt;

use common::{engine, pipeline_doc, wait_for_run};
use opsdeck_cicd::models::notification::{ChannelType, NotificationEvent};
use opsdeck_cicd::models::{RunStatus, TriggerInfo};
use opsdeck_cicd::routes::cicd_router;
use opsdeck_cicd::services::notification::NotificationInput;
use opsdeck_cicd::services::signature::{self, SIGNATURE_HEADER};

const SIMPLE_JOBS: &str = "    - name: only\n      image: alpine\n      script: echo ok\n";

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn test_health_and_pipeline_crud() {
    let t = engine().await;
    let app = cicd_router(t.engine.clone());

    let res = app
        .clone()
        .oneshot(Request::get("/cicd/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(body_json(res).await["status"], "ok");

    let res = app
        .clone()
        .oneshot(
            Request::post("/cicd/pipelines")
                .body(Body::from(pipeline_doc("api-made", "", SIMPLE_JOBS)))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::CREATED);
    let created = body_json(res).await;
    let id = created["id"].as_str().unwrap().to_string();
    assert_eq!(created["name"], "api-made");

    let res = app
        .clone()
        .oneshot(
            Request::post("/cicd/pipelines")
                .body(Body::from("apiVersion: nope\n"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    assert!(body_json(res).await["error"].is_string());

    let res = app
        .clone()
        .oneshot(
            Request::get(format!("/cicd/pipelines/{id}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    let res = app
        .clone()
        .oneshot(
            Request::get("/cicd/pipelines/does-not-exist")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);

    let res = app
        .clone()
        .oneshot(
            Request::post(format!("/cicd/pipelines/{id}/trigger"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::CREATED);
    let run = body_json(res).await;
    assert_eq!(run["number"], 1);
    assert_eq!(run["trigger"]["type"], "manual");
    assert_eq!(run["trigger"]["reference"], "api");

    let run_id = run["id"].as_str().unwrap().to_string();
    wait_for_run(&t.engine, &run_id).await;

    let res = app
        .clone()
        .oneshot(
            Request::post(format!("/cicd/runs/{run_id}/cancel"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::CONFLICT);

    let res = app
        .oneshot(
            Request::delete(format!("/cicd/pipelines/{id}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::NO_CONTENT);
}

#[tokio::test]
async fn test_webhook_routes_reject_bad_credentials() {
    let t = engine().await;
    let triggers = "  triggers:\n    - type: webhook\n      secret: hush\n";
    let pipeline = t
        .engine
        .pipelines
        .create(&pipeline_doc("hooked", triggers, SIMPLE_JOBS))
        .await
        .unwrap();
    let token = pipeline.status.webhook_token.clone().unwrap();
    let app = cicd_router(t.engine.clone());

    let res = app
        .clone()
        .oneshot(
            Request::post(format!("/cicd/webhooks/{}/bogus", pipeline.id))
                .body(Body::from("{}"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);

    let res = app
        .clone()
        .oneshot(
            Request::post("/cicd/freestyle/webhook/bogus")
                .body(Body::from("{}"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);

    let body = r#"{"branch":"release"}"#;
    let res = app
        .oneshot(
            Request::post(format!("/cicd/webhooks/{}/{token}", pipeline.id))
                .header(SIGNATURE_HEADER, signature::sign("hush", body.as_bytes()))
                .body(Body::from(body))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::ACCEPTED);
    let accepted = body_json(res).await;
    assert_eq!(accepted["number"], 1);

    let run_id = accepted["id"].as_str().unwrap();
    let run = wait_for_run(&t.engine, run_id).await;
    assert_eq!(run.variables["WEBHOOK_BRANCH"], "release");
}

#[tokio::test]
async fn test_artifact_upload_and_download() {
    let t = engine().await;
    let pipeline = t
        .engine
        .pipelines
        .create(&pipeline_doc("artifacts", "", SIMPLE_JOBS))
        .await
        .unwrap();
    let run = t
        .engine
        .gateway
        .trigger_pipeline(&pipeline.id, TriggerInfo::manual("api"), BTreeMap::new())
        .await
        .unwrap();
    wait_for_run(&t.engine, &run.id).await;
    let app = cicd_router(t.engine.clone());

    let payload = b"binary \x00\x01 payload".repeat(100);
    let res = app
        .clone()
        .oneshot(
            Request::post(format!(
                "/cicd/runs/{}/artifacts?name=bundle&filename=app.tar.gz",
                run.id
            ))
            .body(Body::from(payload.clone()))
            .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::CREATED);
    let meta = body_json(res).await;
    let expected = hex::encode(Sha256::digest(&payload));
    assert_eq!(meta["checksum"], expected.as_str());
    assert_eq!(meta["size"], payload.len() as u64);
    assert_eq!(meta["name"], "bundle");

    let res = app
        .clone()
        .oneshot(
            Request::get(format!("/cicd/runs/{}/artifacts", run.id))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(body_json(res).await.as_array().unwrap().len(), 1);

    let id = meta["id"].as_str().unwrap();
    let res = app
        .clone()
        .oneshot(
            Request::get(format!("/cicd/artifacts/{id}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let etag = res.headers()[header::ETAG].to_str().unwrap().to_string();
    assert_eq!(etag, format!("\"{expected}\""));
    assert!(res.headers()[header::CONTENT_DISPOSITION]
        .to_str()
        .unwrap()
        .contains("app.tar.gz"));
    let bytes = to_bytes(res.into_body(), usize::MAX).await.unwrap();
    assert_eq!(bytes.as_ref(), payload.as_slice());

    let res = app
        .clone()
        .oneshot(
            Request::post("/cicd/runs/missing-run/artifacts?filename=x.txt")
                .body(Body::from("x"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);

    let res = app
        .clone()
        .oneshot(
            Request::delete(format!("/cicd/artifacts/{id}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::NO_CONTENT);

    let res = app
        .oneshot(
            Request::get(format!("/cicd/artifacts/{id}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_finished_run_log_stream_replays_and_ends() {
    let t = engine().await;
    let pipeline = t
        .engine
        .pipelines
        .create(&pipeline_doc("tailed", "", SIMPLE_JOBS))
        .await
        .unwrap();
    let run = t
        .engine
        .gateway
        .trigger_pipeline(&pipeline.id, TriggerInfo::manual("api"), BTreeMap::new())
        .await
        .unwrap();
    wait_for_run(&t.engine, &run.id).await;
    t.engine.gateway.wait_idle().await;
    let app = cicd_router(t.engine.clone());

    let res = app
        .clone()
        .oneshot(
            Request::get(format!("/cicd/runs/{}/logs/stream", run.id))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    assert!(res.headers()[header::CONTENT_TYPE]
        .to_str()
        .unwrap()
        .starts_with("text/event-stream"));
    let body = to_bytes(res.into_body(), usize::MAX).await.unwrap();
    let text = String::from_utf8_lossy(&body);
    assert!(text.contains("event: log"), "{text}");
    assert!(text.contains("only ok"), "{text}");
    assert!(text.contains("event: end"), "{text}");
    assert!(text.trim_end().ends_with("succeeded"), "{text}");

    let res = app
        .oneshot(
            Request::get("/cicd/runs/missing/logs/stream")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
}

#[derive(Clone, Default)]
struct Captured {
    deliveries: Arc<Mutex<Vec<(Option<String>, Bytes)>>>,
}

async fn capture(State(captured): State<Captured>, headers: HeaderMap, body: Bytes) -> StatusCode {
    let sig = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    captured.deliveries.lock().unwrap().push((sig, body));
    StatusCode::OK
}

#[tokio::test]
async fn test_run_notifications_are_signed() {
    let captured = Captured::default();
    let receiver = Router::new()
        .route("/hook", post(capture))
        .with_state(captured.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { axum::serve(listener, receiver).await.unwrap() });

    let t = engine().await;
    t.engine
        .notifier
        .create(NotificationInput {
            name: "ops".into(),
            channel: ChannelType::Webhook,
            enabled: true,
            events: BTreeSet::from([NotificationEvent::RunSucceeded, NotificationEvent::RunFailed]),
            url: format!("http://{addr}/hook"),
            secret: Some("notify-key".into()),
            headers: BTreeMap::new(),
            job_ids: vec![],
            pipeline_ids: vec![],
        })
        .await
        .unwrap();

    let pipeline = t
        .engine
        .pipelines
        .create(&pipeline_doc("notified", "", SIMPLE_JOBS))
        .await
        .unwrap();
    let run = t
        .engine
        .gateway
        .trigger_pipeline(&pipeline.id, TriggerInfo::manual("api"), BTreeMap::new())
        .await
        .unwrap();
    let run = wait_for_run(&t.engine, &run.id).await;
    assert_eq!(run.status, RunStatus::Succeeded);
    t.engine.gateway.wait_idle().await;
    t.engine.notifier.flush().await;

    let deliveries = captured.deliveries.lock().unwrap().clone();
    assert_eq!(deliveries.len(), 1, "only the subscribed event is delivered");
    let (sig, body) = &deliveries[0];
    assert!(signature::verify("notify-key", body, sig.as_deref().unwrap()));

    let event: Value = serde_json::from_slice(body).unwrap();
    assert_eq!(event["event"], "run_succeeded");
    assert_eq!(event["pipeline_run"]["id"], run.id.as_str());
    assert_eq!(event["pipeline_run"]["status"], "succeeded");
}
