//! `Store` trait: single async interface for all pipeline persistence.
//!
//! Every multi-step operation here is one transaction: callers never see a
//! dedup record without its item and queue entry, or a health transition
//! without its event log line.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::DatabaseError;
use crate::health::state::{HealthEvent, HealthRecord, HealthState};
use crate::items::{Item, ItemKey};
use crate::queue::model::{
    Admission, EnqueueOutcome, EntryId, EntryStatus, Placement, QueueEntry, QueueStats,
};

/// Result of a status update on a queue entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Applied,
    NotFound,
    /// The entry exists but is in a status that cannot move to the target.
    Refused { current: EntryStatus },
}

/// Rows removed by a retention sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PruneReport {
    pub dedup_records: u64,
    pub items: u64,
    pub entries: u64,
}

/// Backend-agnostic persistence for dedup, queue, and health state.
#[async_trait]
pub trait Store: Send + Sync {
    /// Run all pending schema migrations.
    async fn init_schema(&self) -> Result<(), DatabaseError>;

    // ── Admission ───────────────────────────────────────────────────

    /// Insert-if-absent on the dedup record, then the item and its first
    /// queue entry, all in one transaction. Nothing persists unless the
    /// result is `Admitted`.
    async fn try_admit(&self, item: &Item, placement: &Placement)
    -> Result<Admission, DatabaseError>;

    async fn get_item(&self, key: &ItemKey) -> Result<Option<Item>, DatabaseError>;

    /// When `key` was first admitted, if it is still remembered.
    async fn first_seen(&self, key: &ItemKey) -> Result<Option<DateTime<Utc>>, DatabaseError>;

    async fn count_dedup_records(&self) -> Result<u64, DatabaseError>;

    /// Forget keys first seen before `older_than` that have no active entry,
    /// together with their items and terminal entries.
    async fn prune(&self, older_than: DateTime<Utc>) -> Result<PruneReport, DatabaseError>;

    // ── Queue ───────────────────────────────────────────────────────

    /// Add a follow-up pending entry for an already-admitted item, under the
    /// same capacity rules as admission.
    async fn enqueue(
        &self,
        key: &ItemKey,
        placement: &Placement,
    ) -> Result<EnqueueOutcome, DatabaseError>;

    /// Atomically claim the best eligible pending entry (priority DESC,
    /// earliest_at ASC, id ASC; `earliest_at <= now`) and mark it in_flight.
    async fn dequeue(&self, now: DateTime<Utc>) -> Result<Option<QueueEntry>, DatabaseError>;

    /// Move an in_flight entry to `status` (done or error).
    async fn complete(
        &self,
        id: EntryId,
        status: EntryStatus,
        reason: Option<&str>,
    ) -> Result<Transition, DatabaseError>;

    async fn get_entry(&self, id: EntryId) -> Result<Option<QueueEntry>, DatabaseError>;

    /// All entries in `status`, oldest first.
    async fn list_entries(&self, status: EntryStatus) -> Result<Vec<QueueEntry>, DatabaseError>;

    /// Every entry ever created for `key`, oldest first.
    async fn entries_for_key(&self, key: &ItemKey) -> Result<Vec<QueueEntry>, DatabaseError>;

    async fn queue_stats(&self) -> Result<QueueStats, DatabaseError>;

    // ── Health ──────────────────────────────────────────────────────

    async fn load_health(&self) -> Result<HealthRecord, DatabaseError>;

    /// Replace the health state if its version is still `expected_version`,
    /// appending `event` (if any) in the same transaction. Returns `false`
    /// when another writer got there first.
    async fn swap_health(
        &self,
        expected_version: i64,
        next: &HealthState,
        event: Option<&HealthEvent>,
    ) -> Result<bool, DatabaseError>;

    /// Most recent health transitions, newest first.
    async fn recent_health_events(&self, limit: usize) -> Result<Vec<HealthEvent>, DatabaseError>;
}
