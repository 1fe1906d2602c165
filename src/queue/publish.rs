//! PublishQueue: durable, bounded, priority/time-ordered queue of delivery
//! attempts.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::QueueConfig;
use crate::error::QueueError;
use crate::items::ItemKey;
use crate::queue::model::{
    EnqueueOutcome, EntryId, EntryStatus, Placement, QueueEntry, QueueStats,
};
use crate::store::{Store, Transition};

/// Reason recorded on entries found in flight at startup.
pub const ABANDONED: &str = "abandoned";

/// Thin, state-checking facade over the store's queue operations.
///
/// Closing is tied to a cancellation token: once it fires, `enqueue` and
/// `dequeue` return `QueueError::Closed` while `mark_done`/`mark_error` keep
/// working so in-flight deliveries can still be recorded.
#[derive(Clone)]
pub struct PublishQueue {
    store: Arc<dyn Store>,
    config: QueueConfig,
    closed: CancellationToken,
}

impl PublishQueue {
    pub fn new(store: Arc<dyn Store>, config: QueueConfig, closed: CancellationToken) -> Self {
        Self {
            store,
            config,
            closed,
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Placement of a new entry under this queue's bound and policy.
    pub fn placement(&self, priority: i64, earliest_at: DateTime<Utc>, attempt: u32) -> Placement {
        Placement {
            priority,
            earliest_at,
            attempt,
            capacity: self.config.capacity,
            policy: self.config.policy,
        }
    }

    /// Schedule a follow-up attempt for an already-admitted item.
    pub async fn enqueue(
        &self,
        key: &ItemKey,
        priority: i64,
        earliest_at: DateTime<Utc>,
        attempt: u32,
    ) -> Result<EnqueueOutcome, QueueError> {
        if self.is_closed() {
            return Err(QueueError::Closed);
        }
        let placement = self.placement(priority, earliest_at, attempt);
        let outcome = self.store.enqueue(key, &placement).await?;
        match &outcome {
            EnqueueOutcome::Enqueued { entry_id, evicted } => {
                debug!(key = %key, entry_id = %entry_id, attempt, earliest_at = %earliest_at, "Entry enqueued");
                for victim in evicted {
                    warn!(entry_id = %victim, "Evicted pending entry to make room");
                }
                crate::telemetry::entries_evicted(evicted.len());
            }
            other => debug!(key = %key, outcome = ?other, "Entry not enqueued"),
        }
        Ok(outcome)
    }

    pub async fn dequeue(&self) -> Result<Option<QueueEntry>, QueueError> {
        self.dequeue_at(Utc::now()).await
    }

    /// Claim the best entry eligible at `now`, moving it to in_flight.
    pub async fn dequeue_at(&self, now: DateTime<Utc>) -> Result<Option<QueueEntry>, QueueError> {
        if self.is_closed() {
            return Err(QueueError::Closed);
        }
        Ok(self.store.dequeue(now).await?)
    }

    pub async fn mark_done(&self, id: EntryId) -> Result<(), QueueError> {
        self.transition(id, EntryStatus::Done, None).await
    }

    pub async fn mark_error(&self, id: EntryId, reason: &str) -> Result<(), QueueError> {
        self.transition(id, EntryStatus::Error, Some(reason)).await
    }

    async fn transition(
        &self,
        id: EntryId,
        to: EntryStatus,
        reason: Option<&str>,
    ) -> Result<(), QueueError> {
        match self.store.complete(id, to, reason).await? {
            Transition::Applied => Ok(()),
            Transition::NotFound => Err(QueueError::NotFound { id: id.0 }),
            Transition::Refused { current } => Err(QueueError::InvalidTransition {
                id: id.0,
                from: current.to_string(),
                to: to.to_string(),
            }),
        }
    }

    pub async fn get(&self, id: EntryId) -> Result<Option<QueueEntry>, QueueError> {
        Ok(self.store.get_entry(id).await?)
    }

    pub async fn stats(&self) -> Result<QueueStats, QueueError> {
        Ok(self.store.queue_stats().await?)
    }

    /// Fail every in_flight entry left by a previous process and re-enqueue
    /// those with attempts remaining. Call before any worker starts.
    /// Returns the number of follow-up entries created.
    pub async fn reconcile_abandoned(&self) -> Result<usize, QueueError> {
        let abandoned = self.store.list_entries(EntryStatus::InFlight).await?;
        if abandoned.is_empty() {
            return Ok(0);
        }

        let now = Utc::now();
        let mut requeued = 0;
        for entry in &abandoned {
            self.mark_error(entry.id, ABANDONED).await?;
            let next_attempt = entry.attempt + 1;
            if next_attempt >= self.config.max_attempts {
                warn!(key = %entry.item_key, entry_id = %entry.id, "Abandoned entry out of attempts");
                continue;
            }
            let outcome = self
                .enqueue(&entry.item_key, entry.priority, now, next_attempt)
                .await?;
            if outcome.entry_id().is_some() {
                requeued += 1;
            } else {
                warn!(key = %entry.item_key, outcome = ?outcome, "Could not requeue abandoned entry");
            }
        }

        info!(
            abandoned = abandoned.len(),
            requeued, "Reconciled entries left in flight by a previous run"
        );
        Ok(requeued)
    }
}
