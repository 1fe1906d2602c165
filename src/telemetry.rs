//! Prometheus metrics.
//!
//! Everything is emitted through the `metrics` facade and is a no-op until
//! `install_recorder` runs. The API serves the rendered handle on `/metrics`.

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

use crate::delivery::FailureKind;
use crate::error::ErrorKind;
use crate::health::HealthMode;
use crate::queue::QueueStats;

const DELIVERY_SECONDS: &[f64] = &[0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0];

const HEALTH_MODES: [HealthMode; 3] = [HealthMode::Healthy, HealthMode::Degraded, HealthMode::Paused];

/// Install the process-wide Prometheus recorder. Fails if one is already set.
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    PrometheusBuilder::new()
        .set_buckets(DELIVERY_SECONDS)?
        .install_recorder()
}

pub fn batch_received(source: &str) {
    metrics::counter!("deal_relay_batches_total", "source" => source.to_string()).increment(1);
}

/// Per-item ingestion result: `admitted`, `duplicate`, `rejected`,
/// `backpressured` or `failed`.
pub fn items_ingested(outcome: &'static str, count: usize) {
    if count > 0 {
        metrics::counter!("deal_relay_ingest_items_total", "outcome" => outcome)
            .increment(count as u64);
    }
}

pub fn item_admitted() {
    metrics::counter!("deal_relay_admitted_total").increment(1);
}

pub fn entries_evicted(count: usize) {
    if count > 0 {
        metrics::counter!("deal_relay_evictions_total").increment(count as u64);
    }
}

pub fn delivered() {
    metrics::counter!("deal_relay_deliveries_total", "outcome" => "delivered").increment(1);
}

/// Wall time of one publish call, whatever its outcome.
pub fn publish_duration(seconds: f64) {
    metrics::histogram!("deal_relay_publish_duration_seconds").record(seconds);
}

pub fn delivery_failed(kind: FailureKind) {
    let outcome = match kind {
        FailureKind::Transient => "transient",
        FailureKind::Rejected => "rejected",
        FailureKind::Blocked => "blocked",
    };
    metrics::counter!("deal_relay_deliveries_total", "outcome" => outcome).increment(1);
}

pub fn error(kind: ErrorKind) {
    metrics::counter!("deal_relay_errors_total", "kind" => kind.to_string()).increment(1);
}

/// An entry put back because a brand or category bucket was exhausted.
/// Labelled by bucket scope (`brand`, `category`) to keep cardinality flat.
pub fn rate_deferred(bucket: &str) {
    let scope = bucket.split_once(':').map_or(bucket, |(scope, _)| scope);
    metrics::counter!("deal_relay_rate_deferrals_total", "scope" => scope.to_string())
        .increment(1);
}

/// One-hot gauge: the current mode reads 1, the others 0.
pub fn health_mode(mode: HealthMode) {
    for m in HEALTH_MODES {
        let value = if m == mode { 1.0 } else { 0.0 };
        metrics::gauge!("deal_relay_health_mode", "mode" => m.as_str()).set(value);
    }
}

pub fn queue_depth(stats: &QueueStats) {
    metrics::gauge!("deal_relay_queue_entries", "status" => "pending").set(stats.pending as f64);
    metrics::gauge!("deal_relay_queue_entries", "status" => "in_flight")
        .set(stats.in_flight as f64);
}
