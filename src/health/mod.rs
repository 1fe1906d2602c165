//! HealthMonitor: persisted gate in front of all ingestion and delivery.
//!
//! The state lives in the store as a versioned singleton; every write is a
//! compare-and-swap, so racing workers can neither double-apply a signal nor
//! both claim the end of a pause.

pub mod state;

use std::sync::Arc;

use chrono::{DateTime, SubsecRound, Utc};
use rand::Rng;
use tracing::{debug, info, warn};

use crate::config::HealthConfig;
use crate::error::DatabaseError;
use crate::store::Store;

pub use state::{HealthEvent, HealthMode, HealthRecord, HealthSignal, HealthState};

/// Bounded retries of the compare-and-swap loop before giving up.
const MAX_CAS_ATTEMPTS: usize = 32;

/// Result of consulting the gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gate {
    Open { mode: HealthMode },
    Paused { until: DateTime<Utc> },
}

impl Gate {
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Open { .. })
    }
}

#[derive(Clone)]
pub struct HealthMonitor {
    store: Arc<dyn Store>,
    config: HealthConfig,
}

impl HealthMonitor {
    pub fn new(store: Arc<dyn Store>, config: HealthConfig) -> Self {
        Self { store, config }
    }

    pub async fn snapshot(&self) -> Result<HealthState, DatabaseError> {
        Ok(self.store.load_health().await?.state)
    }

    pub async fn recent_events(&self, limit: usize) -> Result<Vec<HealthEvent>, DatabaseError> {
        self.store.recent_health_events(limit).await
    }

    pub async fn check(&self) -> Result<Gate, DatabaseError> {
        self.check_at(Utc::now()).await
    }

    /// Consult the gate at `now`. An expired pause is claimed (by exactly one
    /// caller) and the gate reopens.
    pub async fn check_at(&self, now: DateTime<Utc>) -> Result<Gate, DatabaseError> {
        let record = self.store.load_health().await?;
        if !record.state.is_paused() {
            return Ok(Gate::Open {
                mode: record.state.mode,
            });
        }
        if !record.state.pause_expired(now) {
            return Ok(gate_for(&record.state, now));
        }

        self.claim_unpause(&record, now).await?;
        let after = self.store.load_health().await?;
        Ok(gate_for(&after.state, now))
    }

    pub async fn try_unpause(&self) -> Result<bool, DatabaseError> {
        self.try_unpause_at(Utc::now()).await
    }

    /// Atomically claim and clear an expired pause. Exactly one of any number
    /// of concurrent callers gets `true`.
    pub async fn try_unpause_at(&self, now: DateTime<Utc>) -> Result<bool, DatabaseError> {
        let record = self.store.load_health().await?;
        if !record.state.pause_expired(now) {
            return Ok(false);
        }
        self.claim_unpause(&record, now).await
    }

    async fn claim_unpause(
        &self,
        record: &HealthRecord,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let event = HealthEvent {
            from: HealthMode::Paused,
            to: HealthMode::Healthy,
            reason: "pause expired".into(),
            paused_until: None,
            at: now,
        };
        let claimed = self
            .store
            .swap_health(record.version, &HealthState::healthy(), Some(&event))
            .await?;
        if claimed {
            crate::telemetry::health_mode(HealthMode::Healthy);
            info!(
                paused_until = ?record.state.paused_until,
                "Pause expired, resuming ingestion and delivery"
            );
        }
        Ok(claimed)
    }

    pub async fn record(&self, signal: HealthSignal) -> Result<Option<HealthState>, DatabaseError> {
        self.record_at(signal, Utc::now()).await
    }

    /// Feed one observed outcome into the state machine. Returns the new
    /// state if the signal changed anything.
    pub async fn record_at(
        &self,
        signal: HealthSignal,
        now: DateTime<Utc>,
    ) -> Result<Option<HealthState>, DatabaseError> {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let record = self.store.load_health().await?;
            // Stored timestamps carry milliseconds; keep the in-memory value identical.
            let pause_until = || (now + self.pause_duration()).trunc_subsecs(3);
            let Some(next) = record
                .state
                .apply(&signal, self.config.degrade_after, pause_until)
            else {
                return Ok(None);
            };

            let event = (next.mode != record.state.mode).then(|| HealthEvent {
                from: record.state.mode,
                to: next.mode,
                reason: signal_reason(&signal),
                paused_until: next.paused_until,
                at: now,
            });

            if self
                .store
                .swap_health(record.version, &next, event.as_ref())
                .await?
            {
                log_transition(&record.state, &next, &signal);
                crate::telemetry::health_mode(next.mode);
                return Ok(Some(next));
            }
            debug!("Health state changed concurrently, retrying");
        }
        Err(DatabaseError::Unavailable(
            "health state update kept losing the race".into(),
        ))
    }

    /// Uniformly random pause in `[min_pause, max_pause]`.
    fn pause_duration(&self) -> chrono::Duration {
        let min = self.config.min_pause.as_millis() as i64;
        let max = (self.config.max_pause.as_millis() as i64).max(min);
        let millis = rand::thread_rng().gen_range(min..=max);
        chrono::Duration::milliseconds(millis)
    }
}

fn gate_for(state: &HealthState, now: DateTime<Utc>) -> Gate {
    if state.is_paused() {
        Gate::Paused {
            until: state.paused_until.unwrap_or(now),
        }
    } else {
        Gate::Open { mode: state.mode }
    }
}

fn signal_reason(signal: &HealthSignal) -> String {
    match signal {
        HealthSignal::Success => "delivery succeeded".into(),
        HealthSignal::AmbiguousFailure => "consecutive failures".into(),
        HealthSignal::Blocked { reason } => reason.clone(),
    }
}

fn log_transition(from: &HealthState, to: &HealthState, signal: &HealthSignal) {
    if from.mode == to.mode {
        debug!(
            mode = %to.mode,
            consecutive_failures = to.consecutive_failures,
            "Health counters updated"
        );
        return;
    }
    match to.mode {
        HealthMode::Paused => warn!(
            from = %from.mode,
            until = ?to.paused_until,
            reason = %signal_reason(signal),
            "Upstream looks blocked, pausing"
        ),
        HealthMode::Degraded => warn!(
            consecutive_failures = to.consecutive_failures,
            "Health degraded"
        ),
        HealthMode::Healthy => info!(from = %from.mode, "Health recovered"),
    }
}
