//! Aggregate counters and the status snapshot served to operators.
//!
//! Every counter bump is mirrored to the Prometheus recorder.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::delivery::FailureKind;
use crate::error::ErrorKind;
use crate::health::{HealthEvent, HealthState};
use crate::queue::QueueStats;
use crate::telemetry;

/// Monotonic counters since process start.
#[derive(Debug, Default)]
pub struct PipelineCounters {
    batches: AtomicU64,
    admitted: AtomicU64,
    delivered: AtomicU64,
    delivery_failures: AtomicU64,
    errors: [AtomicU64; ErrorKind::ALL.len()],
}

impl PipelineCounters {
    pub fn batch(&self, source: &str) {
        self.batches.fetch_add(1, Ordering::Relaxed);
        telemetry::batch_received(source);
    }

    pub fn admitted(&self) {
        self.admitted.fetch_add(1, Ordering::Relaxed);
        telemetry::item_admitted();
    }

    pub fn delivered(&self) {
        self.delivered.fetch_add(1, Ordering::Relaxed);
        telemetry::delivered();
    }

    pub fn delivery_failed(&self, kind: FailureKind) {
        self.delivery_failures.fetch_add(1, Ordering::Relaxed);
        telemetry::delivery_failed(kind);
    }

    pub fn error(&self, kind: ErrorKind) {
        self.errors[kind_index(kind)].fetch_add(1, Ordering::Relaxed);
        telemetry::error(kind);
    }

    pub fn errors(&self, kind: ErrorKind) -> u64 {
        self.errors[kind_index(kind)].load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            batches: self.batches.load(Ordering::Relaxed),
            admitted: self.admitted.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            delivery_failures: self.delivery_failures.load(Ordering::Relaxed),
        }
    }

    pub fn error_counts(&self) -> HashMap<ErrorKind, u64> {
        ErrorKind::ALL
            .iter()
            .map(|kind| (*kind, self.errors(*kind)))
            .collect()
    }
}

fn kind_index(kind: ErrorKind) -> usize {
    ErrorKind::ALL
        .iter()
        .position(|k| *k == kind)
        .unwrap_or_default()
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterSnapshot {
    pub batches: u64,
    pub admitted: u64,
    pub delivered: u64,
    pub delivery_failures: u64,
}

/// Point-in-time view of the whole pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineStatus {
    /// Whether ingestion and delivery would proceed right now.
    pub accepting: bool,
    pub shutting_down: bool,
    pub queue: QueueStats,
    pub dedup_records: u64,
    pub health: HealthState,
    pub counters: CounterSnapshot,
    /// Failures per kind since process start.
    pub errors_total: HashMap<ErrorKind, u64>,
    /// Newest first.
    pub last_health_events: Vec<HealthEvent>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_counts_cover_every_kind() {
        let counters = PipelineCounters::default();
        counters.error(ErrorKind::Duplicate);
        counters.error(ErrorKind::Duplicate);
        counters.error(ErrorKind::Blocked);

        let counts = counters.error_counts();
        assert_eq!(counts.len(), ErrorKind::ALL.len());
        assert_eq!(counts[&ErrorKind::Duplicate], 2);
        assert_eq!(counts[&ErrorKind::Blocked], 1);
        assert_eq!(counts[&ErrorKind::Fatal], 0);
    }

    #[test]
    fn status_serializes_error_kinds_as_keys() {
        let counters = PipelineCounters::default();
        counters.error(ErrorKind::ValidationFailed);
        let json = serde_json::to_value(counters.error_counts()).unwrap();
        assert_eq!(json["validation_failed"], 1);
    }
}
