//! Prometheus metrics for CI/CD engine observability.

use metrics::{counter, gauge, histogram};

/// Initialize metrics exporter (Prometheus).
pub fn init_metrics() {
    let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
    if let Err(e) = builder.install() {
        tracing::warn!("Failed to install Prometheus exporter: {}", e);
    }
}

/// Record a webhook received event (`pipeline` or `freestyle`) and whether it was accepted.
pub fn webhook_received(source: &str, accepted: bool) {
    counter!(
        "cicd_webhooks_received_total",
        "source" => source.to_string(),
        "accepted" => accepted.to_string()
    )
    .increment(1);
}

/// Record a run/build state transition. `kind` is `pipeline` or `freestyle`.
pub fn run_status_changed(kind: &str, status: &str) {
    counter!(
        "cicd_runs_total",
        "kind" => kind.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record run/build duration.
pub fn run_duration(kind: &str, duration_ms: u64) {
    histogram!("cicd_run_duration_ms", "kind" => kind.to_string()).record(duration_ms as f64);
}

/// Record pipeline job duration.
pub fn job_duration(job: &str, duration_ms: u64) {
    histogram!("cicd_job_duration_ms", "job" => job.to_string()).record(duration_ms as f64);
}

/// Record freestyle step duration.
pub fn step_duration(step_name: &str, duration_ms: u64) {
    histogram!("cicd_step_duration_ms", "step" => step_name.to_string())
        .record(duration_ms as f64);
}

/// Set current in-flight run/build count.
pub fn active_runs(count: usize) {
    gauge!("cicd_active_runs").set(count as f64);
}

/// Record one notification delivery attempt.
pub fn notification_delivered(outcome: &str) {
    counter!("cicd_notifications_total", "outcome" => outcome.to_string()).increment(1);
}

/// Record runs/builds/artifacts removed by retention.
pub fn retention_purged(kind: &str, count: usize) {
    counter!("cicd_retention_purged_total", "kind" => kind.to_string()).increment(count as u64);
}

/// Record a stored artifact.
pub fn artifact_stored(size: u64) {
    histogram!("cicd_artifact_size_bytes").record(size as f64);
}
