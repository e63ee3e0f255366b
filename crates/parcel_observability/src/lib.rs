//! Observability setup: structured logging and Prometheus metrics.

use metrics_exporter_prometheus::PrometheusBuilder;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

/// Initialize the global tracing subscriber with structured logging.
/// `RUST_LOG` overrides the default filter.
pub fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,parcel=debug"));

    let fmt_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}

/// Install the Prometheus recorder with an HTTP listener on `listen_addr`.
pub fn init_metrics(listen_addr: &str) -> Result<(), Box<dyn std::error::Error>> {
    let addr: std::net::SocketAddr = listen_addr.parse()?;
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("Prometheus metrics endpoint on http://{}/metrics", addr);
    Ok(())
}

pub fn record_share() {
    metrics::counter!("parcel_shares_total").increment(1);
}

/// `status` is the claim outcome label, e.g. "success" or "already_claimed".
pub fn record_claim(status: &str) {
    metrics::counter!("parcel_claims_total", "status" => status.to_string()).increment(1);
}

pub fn record_item_counts(total: usize, claimed: usize) {
    metrics::gauge!("parcel_items_total").set(total as f64);
    metrics::gauge!("parcel_items_claimed").set(claimed as f64);
}

pub fn record_memory_bytes(item_bytes: u64, audit_bytes: u64) {
    metrics::gauge!("parcel_memory_item_bytes").set(item_bytes as f64);
    metrics::gauge!("parcel_memory_audit_bytes").set(audit_bytes as f64);
}

// ---------------------------------------------------------------------------
// Admission gate
// ---------------------------------------------------------------------------

pub fn record_admission_sample(usage_bytes: u64, ratio: f64, disabled: bool) {
    metrics::gauge!("parcel_admission_usage_bytes").set(usage_bytes as f64);
    metrics::gauge!("parcel_admission_usage_ratio").set(ratio);
    metrics::gauge!("parcel_admission_writes_disabled").set(if disabled { 1.0 } else { 0.0 });
}

pub fn record_admission_rejected() {
    metrics::counter!("parcel_admission_rejected_total").increment(1);
}

// ---------------------------------------------------------------------------
// Audit and sweep
// ---------------------------------------------------------------------------

pub fn record_audit_event(action: &str, level: &str, suspicious: bool) {
    metrics::counter!(
        "parcel_audit_events_total",
        "action" => action.to_string(),
        "level" => level.to_string()
    )
    .increment(1);
    if suspicious {
        metrics::counter!("parcel_audit_suspicious_total", "action" => action.to_string())
            .increment(1);
    }
}

/// Record one sweep pass. `kind` is "fast", "slow" or "final".
pub fn record_sweep(kind: &str, removed: usize, duration_us: u64) {
    metrics::counter!("parcel_sweep_runs_total", "kind" => kind.to_string()).increment(1);
    metrics::counter!("parcel_sweep_removed_total").increment(removed as u64);
    metrics::histogram!("parcel_sweep_duration_us", "kind" => kind.to_string())
        .record(duration_us as f64);
}
