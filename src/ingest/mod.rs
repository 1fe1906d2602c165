//! Ingestion collaborators: where candidate items come from.

pub mod spool;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::SourceError;
use crate::health::HealthSignal;
use crate::items::RawItem;

pub use spool::SpoolSource;

/// What the upstream looked like while a batch was being collected.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum UpstreamSignal {
    #[default]
    Clear,
    /// Something went wrong but it may not be a block (timeout, 5xx, empty page).
    Ambiguous,
    /// The upstream is refusing us (captcha, ban page, 403).
    Blocked { reason: String },
}

impl UpstreamSignal {
    pub fn to_health_signal(&self) -> HealthSignal {
        match self {
            Self::Clear => HealthSignal::Success,
            Self::Ambiguous => HealthSignal::AmbiguousFailure,
            Self::Blocked { reason } => HealthSignal::Blocked {
                reason: reason.clone(),
            },
        }
    }
}

/// One fetch worth of candidate items.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IngestBatch {
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub items: Vec<RawItem>,
    #[serde(default)]
    pub signal: UpstreamSignal,
}

impl IngestBatch {
    pub fn new(source: impl Into<String>, items: Vec<RawItem>) -> Self {
        Self {
            source: source.into(),
            items,
            signal: UpstreamSignal::Clear,
        }
    }

    pub fn with_signal(mut self, signal: UpstreamSignal) -> Self {
        self.signal = signal;
        self
    }
}

/// A pollable producer of ingest batches.
#[async_trait]
pub trait ItemSource: Send + Sync {
    fn name(&self) -> &str;

    /// The next batch, or `None` when nothing is available right now.
    async fn next_batch(&self) -> Result<Option<IngestBatch>, SourceError>;
}

/// Page-size rule for spotting block pages that parse as a normal listing.
///
/// A large page that yields few or no items is almost always a captcha or
/// ban interstitial rather than an empty category.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeuristic {
    /// Pages above this size must yield at least `min_items`.
    pub sparse_page_bytes: usize,
    pub min_items: usize,
    /// Pages above this size must yield at least one item.
    pub empty_page_bytes: usize,
}

impl Default for BlockHeuristic {
    fn default() -> Self {
        Self {
            sparse_page_bytes: 500 * 1024,
            min_items: 5,
            empty_page_bytes: 100 * 1024,
        }
    }
}

impl BlockHeuristic {
    pub fn assess(&self, page_bytes: usize, items_found: usize) -> UpstreamSignal {
        if page_bytes > self.sparse_page_bytes && items_found < self.min_items {
            return UpstreamSignal::Blocked {
                reason: format!("{items_found} items on a {} kB page", page_bytes / 1024),
            };
        }
        if page_bytes > self.empty_page_bytes && items_found == 0 {
            return UpstreamSignal::Blocked {
                reason: format!("no items on a {} kB page", page_bytes / 1024),
            };
        }
        UpstreamSignal::Clear
    }
}
