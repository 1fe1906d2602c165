//! Queue entry state machine and related types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::BackpressurePolicy;
use crate::items::ItemKey;

/// Monotonic queue entry id. Doubles as insertion order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntryId(pub i64);

impl std::fmt::Display for EntryId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Status of a queue entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryStatus {
    /// Waiting to be dequeued.
    Pending,
    /// Handed to a delivery worker.
    InFlight,
    /// Delivered.
    Done,
    /// Delivery failed; a retry, if any, is a new entry.
    Error,
}

impl EntryStatus {
    /// Transitions are strictly forward: pending → in_flight → done | error.
    pub fn can_transition_to(&self, target: EntryStatus) -> bool {
        use EntryStatus::*;

        matches!(
            (self, target),
            (Pending, InFlight) | (InFlight, Done) | (InFlight, Error)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Error)
    }

    /// Pending or in-flight entries count against queue capacity.
    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InFlight => "in_flight",
            Self::Done => "done",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for EntryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EntryStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "in_flight" => Ok(Self::InFlight),
            "done" => Ok(Self::Done),
            "error" => Ok(Self::Error),
            other => Err(format!("unknown entry status '{other}'")),
        }
    }
}

/// A scheduled attempt to deliver one item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub id: EntryId,
    pub item_key: ItemKey,
    pub priority: i64,
    /// Not eligible for dequeue before this instant.
    pub earliest_at: DateTime<Utc>,
    pub status: EntryStatus,
    /// 0 for the first attempt, incremented on each follow-up entry.
    pub attempt: u32,
    pub error_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Where and under which bound a new entry goes.
#[derive(Debug, Clone, PartialEq)]
pub struct Placement {
    pub priority: i64,
    pub earliest_at: DateTime<Utc>,
    pub attempt: u32,
    pub capacity: usize,
    pub policy: BackpressurePolicy,
}

/// Result of the atomic admission transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// Key was new; dedup record, item and queue entry were created together.
    Admitted {
        entry_id: EntryId,
        /// Entries removed to make room under `EvictOldest`.
        evicted: Vec<EntryId>,
    },
    /// Key had been admitted before. Nothing changed.
    Duplicate,
    /// No room under the backpressure policy. Nothing changed.
    QueueFull,
}

impl Admission {
    pub fn admitted(&self) -> bool {
        matches!(self, Self::Admitted { .. })
    }

    pub fn queue_entry_id(&self) -> Option<EntryId> {
        match self {
            Self::Admitted { entry_id, .. } => Some(*entry_id),
            _ => None,
        }
    }
}

/// Result of scheduling a follow-up entry for an admitted item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Enqueued {
        entry_id: EntryId,
        evicted: Vec<EntryId>,
    },
    /// The item already has a pending or in-flight entry.
    AlreadyActive,
    QueueFull,
    /// No item with this key was ever admitted (or it was pruned).
    UnknownItem,
}

impl EnqueueOutcome {
    pub fn entry_id(&self) -> Option<EntryId> {
        match self {
            Self::Enqueued { entry_id, .. } => Some(*entry_id),
            _ => None,
        }
    }
}

/// Entry counts per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub pending: u64,
    pub in_flight: u64,
    pub done: u64,
    pub error: u64,
}

impl QueueStats {
    /// Active entries, the quantity bounded by capacity.
    pub fn depth(&self) -> u64 {
        self.pending + self.in_flight
    }
}
