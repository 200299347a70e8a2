mod common;

use std::collections::BTreeMap;
use std::time::Duration;

use common::{engine, pipeline_doc, wait_for_run, FakeOutcome, BUILD_TEST_DEPLOY};
use opsdeck_cicd::error::CicdError;
use opsdeck_cicd::models::{JobStatus, RunStatus, TriggerInfo, TriggerKind};
use opsdeck_cicd::services::cluster::Propagation;
use opsdeck_cicd::services::pipeline_executor::PipelineExecutor;
use opsdeck_cicd::services::signature;
use opsdeck_cicd::storage::Bucket;

#[tokio::test]
async fn test_failed_build_cancels_downstream_jobs() {
    let t = engine().await;
    t.cluster.set_outcome(
        "build",
        FakeOutcome::Fail {
            exit_code: 2,
            logs: "error[E0425]: cannot find value\n".into(),
        },
    );
    let pipeline = t
        .engine
        .pipelines
        .create(&pipeline_doc("web", "", BUILD_TEST_DEPLOY))
        .await
        .unwrap();

    let run = t
        .engine
        .gateway
        .trigger_pipeline(&pipeline.id, TriggerInfo::manual("alice"), BTreeMap::new())
        .await
        .unwrap();
    assert_eq!(run.number, 1);
    assert_eq!(run.status, RunStatus::Pending);

    let run = wait_for_run(&t.engine, &run.id).await;
    assert_eq!(run.status, RunStatus::Failed);
    assert!(run.error.as_deref().unwrap().contains("build"));

    let build = run.job("build").unwrap();
    assert_eq!(build.status, JobStatus::Failed);
    assert_eq!(build.exit_code, Some(2));
    assert!(build.logs.contains("cannot find value"));
    assert_eq!(run.job("test").unwrap().status, JobStatus::Cancelled);
    assert_eq!(run.job("deploy").unwrap().status, JobStatus::Cancelled);

    // Only the failing job ever reached the cluster.
    assert_eq!(t.cluster.created_jobs(), vec!["build"]);
}

#[tokio::test]
async fn test_successful_run_records_logs_and_status() {
    let t = engine().await;
    let pipeline = t
        .engine
        .pipelines
        .create(&pipeline_doc("web", "", BUILD_TEST_DEPLOY))
        .await
        .unwrap();

    let run = t
        .engine
        .gateway
        .trigger_pipeline(&pipeline.id, TriggerInfo::manual("api"), BTreeMap::new())
        .await
        .unwrap();
    let run = wait_for_run(&t.engine, &run.id).await;
    t.engine.gateway.wait_idle().await;

    assert_eq!(run.status, RunStatus::Succeeded);
    assert!(run.jobs.iter().all(|j| j.status == JobStatus::Succeeded));
    assert!(run.duration_ms.is_some());
    assert_eq!(t.cluster.created_jobs(), vec!["build", "test", "deploy"]);

    // Finished jobs are removed while their Pods are kept for log retrieval.
    let deleted = t.cluster.deleted.lock().unwrap().clone();
    assert_eq!(deleted.len(), 3);
    assert!(deleted.iter().all(|(_, p)| *p == Propagation::Orphan));

    let manifests = t.cluster.created.lock().unwrap().clone();
    let env: BTreeMap<_, _> = manifests[0].env.iter().cloned().collect();
    assert_eq!(
        env["OPSDECK_ARTIFACT_URL"],
        format!("http://ci.test/cicd/runs/{}/artifacts", run.id)
    );
    assert_eq!(env["RUN_NUMBER"], "1");
    assert_eq!(env["JOB_NAME"], "build");

    let logs = t.engine.pipelines.run_logs(&run.id).await.unwrap();
    assert!(logs.contains("build ok"));
    assert!(logs.contains("deploy ok"));
    let job_logs = t.engine.pipelines.job_logs(&run.id, "test").await.unwrap();
    assert!(job_logs.contains("test ok"));

    let pipeline = t.engine.pipelines.get(&pipeline.id).await.unwrap();
    assert_eq!(pipeline.status.last_run_status, Some(RunStatus::Succeeded));
    assert_eq!(pipeline.status.last_run_id.as_deref(), Some(run.id.as_str()));
    assert_eq!(pipeline.status.total_runs, 1);
}

#[tokio::test]
async fn test_skip_if_variable_skips_job() {
    let t = engine().await;
    let jobs = "    - name: build
      image: alpine
      script: make
    - name: deploy
      image: alpine
      script: ./deploy.sh
      dependsOn: [build]
      skipIf: SKIP_DEPLOY
    - name: smoke
      image: alpine
      script: ./smoke.sh
      dependsOn: [deploy]
";
    let pipeline = t
        .engine
        .pipelines
        .create(&pipeline_doc("skippy", "", jobs))
        .await
        .unwrap();

    let vars = BTreeMap::from([("SKIP_DEPLOY".to_string(), "yes".to_string())]);
    let run = t
        .engine
        .gateway
        .trigger_pipeline(&pipeline.id, TriggerInfo::manual("api"), vars)
        .await
        .unwrap();
    let run = wait_for_run(&t.engine, &run.id).await;

    assert_eq!(run.status, RunStatus::Succeeded);
    assert_eq!(run.job("deploy").unwrap().status, JobStatus::Skipped);
    assert_eq!(run.job("smoke").unwrap().status, JobStatus::Succeeded);
    assert_eq!(t.cluster.created_jobs(), vec!["build", "smoke"]);
}

#[tokio::test]
async fn test_concurrent_triggers_get_distinct_numbers() {
    let t = engine().await;
    let pipeline = t
        .engine
        .pipelines
        .create(&pipeline_doc("busy", "", "    - name: only\n      image: alpine\n      script: echo ok\n"))
        .await
        .unwrap();

    let triggers = (0..8).map(|_| {
        t.engine
            .gateway
            .trigger_pipeline(&pipeline.id, TriggerInfo::manual("api"), BTreeMap::new())
    });
    let runs = futures::future::join_all(triggers).await;
    let mut numbers: Vec<u64> = runs.into_iter().map(|r| r.unwrap().number).collect();
    numbers.sort_unstable();
    assert_eq!(numbers, (1..=8).collect::<Vec<_>>());

    t.engine.gateway.wait_idle().await;
    let runs = t.engine.pipelines.list_runs(&pipeline.id).await.unwrap();
    assert_eq!(runs.len(), 8);
    assert_eq!(runs[0].number, 8);
    assert!(runs.iter().all(|r| r.status == RunStatus::Succeeded));
}

#[tokio::test]
async fn test_cancel_hanging_run_deletes_cluster_jobs() {
    let t = engine().await;
    t.cluster.set_outcome("build", FakeOutcome::Hang);
    let pipeline = t
        .engine
        .pipelines
        .create(&pipeline_doc("stuck", "", BUILD_TEST_DEPLOY))
        .await
        .unwrap();
    let run = t
        .engine
        .gateway
        .trigger_pipeline(&pipeline.id, TriggerInfo::manual("api"), BTreeMap::new())
        .await
        .unwrap();

    for _ in 0..200 {
        let current = t.engine.pipelines.get_run(&run.id).await.unwrap();
        if current.job("build").unwrap().status == JobStatus::Running {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(t.engine.gateway.is_active(&run.id));

    t.engine.gateway.cancel_run(&run.id).await.unwrap();
    let run = wait_for_run(&t.engine, &run.id).await;

    assert_eq!(run.status, RunStatus::Cancelled);
    assert_eq!(run.job("build").unwrap().status, JobStatus::Cancelled);
    assert_eq!(run.job("deploy").unwrap().status, JobStatus::Cancelled);
    let selectors = t.cluster.deleted_by_label.lock().unwrap().clone();
    assert!(selectors.contains(&PipelineExecutor::run_selector(&run.id)));

    let err = t.engine.gateway.cancel_run(&run.id).await.unwrap_err();
    assert!(matches!(err, CicdError::InvalidState(_)));
}

#[tokio::test]
async fn test_pipeline_webhook_checks_token_and_signature() {
    let t = engine().await;
    let triggers = "  triggers:\n    - type: webhook\n      secret: hush\n";
    let pipeline = t
        .engine
        .pipelines
        .create(&pipeline_doc("hooked", triggers, "    - name: only\n      image: alpine\n      script: echo ok\n"))
        .await
        .unwrap();
    let token = pipeline.status.webhook_token.clone().unwrap();
    assert!(pipeline
        .status
        .webhook_url
        .as_deref()
        .unwrap()
        .starts_with(&format!("http://ci.test/cicd/webhooks/{}/", pipeline.id)));

    let body = br#"{"ref":"refs/heads/main","commit":"abc123","author":"bob"}"#;
    let gw = &t.engine.gateway;

    let err = gw
        .pipeline_webhook(&pipeline.id, "wrong", Some(&signature::sign("hush", body)), body)
        .await
        .unwrap_err();
    assert!(matches!(err, CicdError::Unauthorized(_)));

    let err = gw
        .pipeline_webhook(&pipeline.id, &token, Some(&signature::sign("other", body)), body)
        .await
        .unwrap_err();
    assert!(matches!(err, CicdError::Unauthorized(_)));

    let err = gw.pipeline_webhook(&pipeline.id, &token, None, body).await.unwrap_err();
    assert!(matches!(err, CicdError::Unauthorized(_)));

    let err = gw
        .pipeline_webhook("missing", &token, None, body)
        .await
        .unwrap_err();
    assert!(matches!(err, CicdError::NotFound(_)));

    let run = gw
        .pipeline_webhook(&pipeline.id, &token, Some(&signature::sign("hush", body)), body)
        .await
        .unwrap();
    assert_eq!(run.trigger.kind, TriggerKind::Webhook);
    assert_eq!(run.variables["WEBHOOK_BRANCH"], "main");
    assert_eq!(run.variables["WEBHOOK_COMMIT"], "abc123");

    let run = wait_for_run(&t.engine, &run.id).await;
    assert_eq!(run.status, RunStatus::Succeeded);
}

#[tokio::test]
async fn test_cron_trigger_registered_and_removed_with_pipeline() {
    let t = engine().await;
    let triggers = "  triggers:\n    - type: cron\n      schedule: \"0 0 2 * * *\"\n";
    let pipeline = t
        .engine
        .pipelines
        .create(&pipeline_doc("nightly", triggers, "    - name: only\n      image: alpine\n      script: echo ok\n"))
        .await
        .unwrap();
    assert_eq!(t.engine.scheduler.pipeline_entries(&pipeline.id), 1);

    let without = pipeline_doc("nightly", "", "    - name: only\n      image: alpine\n      script: echo ok\n");
    t.engine.pipelines.update(&pipeline.id, &without).await.unwrap();
    assert_eq!(t.engine.scheduler.pipeline_entries(&pipeline.id), 0);

    let with = pipeline_doc("nightly", triggers, "    - name: only\n      image: alpine\n      script: echo ok\n");
    t.engine.pipelines.update(&pipeline.id, &with).await.unwrap();
    assert_eq!(t.engine.scheduler.pipeline_entries(&pipeline.id), 1);

    t.engine.pipelines.delete(&pipeline.id).await.unwrap();
    assert_eq!(t.engine.scheduler.pipeline_entries(&pipeline.id), 0);
    assert!(matches!(
        t.engine.pipelines.get(&pipeline.id).await.unwrap_err(),
        CicdError::NotFound(_)
    ));
}

#[tokio::test]
async fn test_duplicate_pipeline_name_rejected() {
    let t = engine().await;
    let doc = pipeline_doc("dup", "", "    - name: only\n      image: alpine\n      script: echo ok\n");
    t.engine.pipelines.create(&doc).await.unwrap();
    let err = t.engine.pipelines.create(&doc).await.unwrap_err();
    assert!(matches!(err, CicdError::Validation(_)));
}

#[tokio::test]
async fn test_delete_run_requires_terminal_state() {
    let t = engine().await;
    t.cluster.set_outcome("build", FakeOutcome::Hang);
    let pipeline = t
        .engine
        .pipelines
        .create(&pipeline_doc("slow", "", BUILD_TEST_DEPLOY))
        .await
        .unwrap();
    let run = t
        .engine
        .gateway
        .trigger_pipeline(&pipeline.id, TriggerInfo::manual("api"), BTreeMap::new())
        .await
        .unwrap();

    let err = t.engine.pipelines.delete_run(&run.id).await.unwrap_err();
    assert!(matches!(err, CicdError::InvalidState(_)));

    t.engine.gateway.cancel_run(&run.id).await.unwrap();
    wait_for_run(&t.engine, &run.id).await;
    t.engine.pipelines.delete_run(&run.id).await.unwrap();
    assert!(t.engine.pipelines.list_runs(&pipeline.id).await.unwrap().is_empty());
}

const ONLY_JOB: &str = "    - name: only\n      image: alpine\n      script: echo ok\n";

#[tokio::test]
async fn test_edit_racing_a_trigger_keeps_numbers_unique() {
    let t = engine().await;
    let pipeline = t
        .engine
        .pipelines
        .create(&pipeline_doc("edited", "", ONLY_JOB))
        .await
        .unwrap();

    // The edit's name check lists every pipeline; stall it so a trigger lands mid-edit.
    t.store.slow_list(Bucket::Pipelines, Duration::from_millis(200));
    let source = pipeline_doc("edited", "", &ONLY_JOB.replace("echo ok", "echo edited"));
    let edit = t.engine.pipelines.update(&pipeline.id, &source);
    let trigger = async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        t.engine
            .gateway
            .trigger_pipeline(&pipeline.id, TriggerInfo::manual("api"), BTreeMap::new())
            .await
    };
    let (edited, first) = tokio::join!(edit, trigger);
    edited.unwrap();
    let first = first.unwrap();

    let second = t
        .engine
        .gateway
        .trigger_pipeline(&pipeline.id, TriggerInfo::manual("api"), BTreeMap::new())
        .await
        .unwrap();
    assert_eq!(first.number, 1);
    assert_eq!(second.number, 2);

    t.engine.gateway.wait_idle().await;
    let stored = t.engine.pipelines.get(&pipeline.id).await.unwrap();
    assert_eq!(stored.status.last_run_number, 2);
    assert_eq!(stored.status.total_runs, 2);
    assert_eq!(stored.spec.jobs[0].script, "echo edited");
}

#[tokio::test]
async fn test_timeouts_are_bounded() {
    let t = engine().await;
    let huge = ONLY_JOB.to_string() + "      timeout: 18446744073709551615\n";
    let err = t
        .engine
        .pipelines
        .create(&pipeline_doc("forever", "", &huge))
        .await
        .unwrap_err();
    assert!(matches!(err, CicdError::Definition(_)), "{err:?}");

    let longest = ONLY_JOB.to_string() + "      timeout: 168h\n";
    let pipeline = t
        .engine
        .pipelines
        .create(&pipeline_doc("weekly", "", &longest))
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
    assert_eq!(t.engine.gateway.active_count(), 0);
}

#[tokio::test]
async fn test_storage_failure_mid_run_fails_the_run() {
    let t = engine().await;
    let pipeline = t
        .engine
        .pipelines
        .create(&pipeline_doc("flaky", "", BUILD_TEST_DEPLOY))
        .await
        .unwrap();

    // Writes: queued, running, first job running (fails).
    t.store.fail_nth_put(Bucket::PipelineRuns, 3);
    let run = t
        .engine
        .gateway
        .trigger_pipeline(&pipeline.id, TriggerInfo::manual("api"), BTreeMap::new())
        .await
        .unwrap();
    let run = wait_for_run(&t.engine, &run.id).await;
    t.engine.gateway.wait_idle().await;

    assert_eq!(run.status, RunStatus::Failed);
    assert!(run.error.as_deref().unwrap().contains("disk full"), "{:?}", run.error);
    assert!(run.jobs.iter().all(|j| j.status == JobStatus::Cancelled));
    assert!(t.engine.streams.get(&run.id).is_none());
    assert_eq!(t.engine.gateway.active_count(), 0);
    assert!(t.cluster.created_jobs().is_empty());

    let stored = t.engine.pipelines.get(&pipeline.id).await.unwrap();
    assert_eq!(stored.status.last_run_status, Some(RunStatus::Failed));
}

#[tokio::test]
async fn test_cancel_while_run_is_being_queued() {
    let t = engine().await;
    let pipeline = t
        .engine
        .pipelines
        .create(&pipeline_doc("racy", "", BUILD_TEST_DEPLOY))
        .await
        .unwrap();

    // The run record is stored before the pipeline counter; stall the latter.
    t.store.slow_put(Bucket::Pipelines, Duration::from_millis(200));
    let trigger = t
        .engine
        .gateway
        .trigger_pipeline(&pipeline.id, TriggerInfo::manual("api"), BTreeMap::new());
    let cancel = async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        let queued = t.engine.pipelines.list_runs(&pipeline.id).await.unwrap();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].status, RunStatus::Pending);
        t.engine.gateway.cancel_run(&queued[0].id).await
    };
    let (run, cancelled) = tokio::join!(trigger, cancel);
    let run = run.unwrap();
    assert_eq!(cancelled.unwrap().id, run.id);

    let run = wait_for_run(&t.engine, &run.id).await;
    t.engine.gateway.wait_idle().await;
    assert_eq!(run.status, RunStatus::Cancelled);
    assert!(run.started_at.is_none());
    assert!(run.jobs.iter().all(|j| j.status == JobStatus::Cancelled));
    assert!(t.cluster.created_jobs().is_empty());
}
