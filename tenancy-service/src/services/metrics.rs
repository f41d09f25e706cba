//! Prometheus metrics for tenancy-service.

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::Lazy;
use prometheus::{
    register_counter_vec, register_histogram_vec, CounterVec, HistogramVec, TextEncoder,
};
use std::sync::OnceLock;

/// Recorder behind the `metrics` facade (HTTP request counters and latency).
static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Tenant validity cache lookups by result.
pub static TENANT_CACHE_LOOKUPS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "tenancy_cache_lookups_total",
        "Tenant validity cache lookups",
        &["result"] // hit, miss
    )
    .expect("Failed to register cache_lookups_total")
});

/// Tenant store queries issued on cache miss.
pub static TENANT_STORE_QUERIES: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "tenancy_store_queries_total",
        "Tenant store validation queries",
        &["status"] // ok, error
    )
    .expect("Failed to register store_queries_total")
});

/// Requests rejected by the tenant middleware (no tenant_id label, cardinality).
pub static TENANT_REJECTIONS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "tenancy_rejections_total",
        "Requests rejected during tenant admission",
        &["reason"]
    )
    .expect("Failed to register rejections_total")
});

/// Session binding directives issued on checked-out connections.
pub static TENANT_BINDINGS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "tenancy_bindings_total",
        "Tenant session bindings issued",
        &["status"] // ok, error
    )
    .expect("Failed to register bindings_total")
});

/// Connections dropped from circulation instead of being released.
pub static CONNECTIONS_DISCARDED: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "tenancy_connections_discarded_total",
        "Checked-out connections discarded",
        &["reason"] // binding, begin, commit, rollback, open_transaction, cancelled
    )
    .expect("Failed to register connections_discarded_total")
});

/// Unit-of-work duration from checkout to release.
pub static UNIT_OF_WORK_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "tenancy_unit_of_work_duration_seconds",
        "Tenant-scoped unit of work duration in seconds",
        &["mode", "status"],
        vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5]
    )
    .expect("Failed to register unit_of_work_duration")
});

/// Install the Prometheus recorder and force the tenancy metrics.
///
/// Safe to call more than once; the recorder is installed on the first call.
pub fn init_metrics() {
    METRICS_HANDLE.get_or_init(|| {
        PrometheusBuilder::new()
            .install_recorder()
            .expect("failed to install Prometheus recorder")
    });

    Lazy::force(&TENANT_CACHE_LOOKUPS);
    Lazy::force(&TENANT_STORE_QUERIES);
    Lazy::force(&TENANT_REJECTIONS);
    Lazy::force(&TENANT_BINDINGS);
    Lazy::force(&CONNECTIONS_DISCARDED);
    Lazy::force(&UNIT_OF_WORK_DURATION);
}

/// Get metrics in Prometheus text format: the facade recorder's output
/// followed by the tenancy registry.
pub fn get_metrics() -> String {
    let mut output = METRICS_HANDLE
        .get()
        .map(|handle| handle.render())
        .unwrap_or_else(|| "# Metrics recorder not initialized\n".to_string());

    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    if let Ok(tenancy_metrics) = encoder.encode_to_string(&metric_families) {
        output.push_str(&tenancy_metrics);
    }

    output
}
