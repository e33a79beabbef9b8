//! Prometheus metrics setup and metric definitions

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

/// Install the Prometheus recorder and return a handle for rendering metrics.
pub fn install_prometheus_recorder() -> Result<PrometheusHandle, BuildError> {
    // Enforcement is in-process, so the low end needs sub-millisecond buckets.
    let buckets = vec![
        0.0001, 0.0005, 0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5,
    ];

    PrometheusBuilder::new()
        .set_buckets(&buckets)?
        .install_recorder()
}

/// Register metric descriptions and emit initial zero values so Prometheus output
/// includes HELP/TYPE lines for all metrics from startup (not just after first use).
pub fn describe_metrics() {
    // Enforcement
    describe_counter!("rbac_enforce_total", "Enforcement decisions by result");
    describe_histogram!(
        "rbac_enforce_duration_seconds",
        "Time spent deciding one enforce or enforce-batch call"
    );
    describe_histogram!(
        "rbac_enforce_batch_objects",
        "Number of objects decided per enforce-batch call"
    );
    describe_counter!(
        "rbac_decision_cache_hits_total",
        "Batch decisions served from the decision cache"
    );

    // Engine state
    describe_counter!("rbac_engine_reload_total", "Engine reloads from the store");
    describe_gauge!("rbac_engine_policies", "Policies held by the engine");

    // Mutations
    describe_counter!(
        "rbac_gate_conflicts_total",
        "Mutations refused because another one was in flight for the principal"
    );
    describe_counter!(
        "rbac_audit_events_dropped_total",
        "Login audit events dropped because the queue was full"
    );

    // Lifecycle
    describe_counter!("rbac_gc_runs_total", "Role cleanup runs by result");
    describe_counter!(
        "rbac_gc_roles_deleted_total",
        "Role keys removed by the cleanup job"
    );

    counter!("rbac_enforce_total", "result" => "allow").absolute(0);
    counter!("rbac_enforce_total", "result" => "deny").absolute(0);
    histogram!("rbac_enforce_duration_seconds").record(0.0);
    counter!("rbac_decision_cache_hits_total").absolute(0);
    counter!("rbac_engine_reload_total", "result" => "success").absolute(0);
    gauge!("rbac_engine_policies").set(0.0);
    counter!("rbac_gate_conflicts_total").absolute(0);
    counter!("rbac_audit_events_dropped_total").absolute(0);
    counter!("rbac_gc_runs_total", "result" => "success").absolute(0);
    counter!("rbac_gc_roles_deleted_total").absolute(0);
}
