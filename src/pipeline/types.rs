//! Pipeline data types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::delivery::FailureKind;
use crate::items::Item;
use crate::queue::{EntryId, QueueEntry};

/// Why an ingest batch was not (fully) processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum Halt {
    Paused { until: DateTime<Utc> },
    ShuttingDown,
}

/// Tally of one ingest batch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestReport {
    pub source: String,
    pub received: usize,
    pub admitted: usize,
    pub duplicates: usize,
    /// Failed validation.
    pub rejected: usize,
    /// Refused because the queue was full.
    pub backpressured: usize,
    /// Storage or other errors.
    pub failed: usize,
    /// Set when the batch stopped early. Items not counted above were skipped.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub halted: Option<Halt>,
}

impl IngestReport {
    pub fn new(source: impl Into<String>, received: usize) -> Self {
        Self {
            source: source.into(),
            received,
            ..Default::default()
        }
    }

    pub fn processed(&self) -> usize {
        self.admitted + self.duplicates + self.rejected + self.backpressured + self.failed
    }
}

/// An entry claimed for delivery with every rate slot already granted.
#[derive(Debug, Clone, PartialEq)]
pub struct ReadyItem {
    pub entry: QueueEntry,
    pub item: Item,
}

/// What `next_ready` found.
#[derive(Debug, Clone, PartialEq)]
pub enum Dispatch {
    Ready(ReadyItem),
    /// Nothing is eligible right now.
    Idle,
    Paused { until: DateTime<Utc> },
    /// The pipeline is shutting down.
    Closed,
}

/// What `dispatch_once` did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchResult {
    Delivered { entry_id: EntryId },
    Failed { entry_id: EntryId, kind: FailureKind },
    Idle,
    Paused { until: DateTime<Utc> },
    Closed,
}
