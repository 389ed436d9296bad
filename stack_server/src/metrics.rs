//! Prometheus metrics for provisioning observability.

use metrics::{counter, gauge, histogram};

use crate::models::{DeploymentStatus, Stage};

/// Install the Prometheus exporter (server binary only).
pub fn init_metrics() {
    let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
    if let Err(e) = builder.install() {
        tracing::warn!("Failed to install Prometheus exporter: {}", e);
    }
}

pub fn signup_received(source: &str) {
    counter!("tenantstack_signups_received_total", "source" => source.to_string()).increment(1);
}

/// One stage outcome: `succeeded`, `failed` or `rolled_back`.
pub fn stage_finished(stage: Stage, outcome: &str, duration_ms: u64) {
    counter!(
        "tenantstack_stages_total",
        "stage" => stage.as_str(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
    histogram!("tenantstack_stage_duration_ms", "stage" => stage.as_str())
        .record(duration_ms as f64);
}

pub fn run_finished(status: DeploymentStatus, duration_ms: u64) {
    counter!("tenantstack_runs_total", "status" => status.as_str()).increment(1);
    histogram!("tenantstack_run_duration_ms").record(duration_ms as f64);
}

pub fn compensation_recorded(stage: Stage, outcome: &str) {
    counter!(
        "tenantstack_compensations_total",
        "stage" => stage.as_str(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

pub fn active_provisions(count: usize) {
    gauge!("tenantstack_active_provisions").set(count as f64);
}

pub fn error_recorded(kind: &str) {
    counter!("tenantstack_errors_total", "kind" => kind.to_string()).increment(1);
}
