//! Delivery collaborators: where approved items go once they leave the queue.

pub mod telegram;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::DeliveryError;
use crate::items::Item;

pub use telegram::TelegramPublisher;

/// Sends one item to an external destination.
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Short name used in logs and errors.
    fn name(&self) -> &str;

    async fn publish(&self, item: &Item) -> Result<(), DeliveryError>;
}

/// How a failed delivery affects the item and the health state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Worth retrying later; counts as an ambiguous failure.
    Transient,
    /// The destination refused this item for good. No retry, no health impact.
    Rejected,
    /// The destination refused us. Pauses the pipeline.
    Blocked,
}

/// Result of one delivery attempt, reported back to the coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered,
    Failed {
        kind: FailureKind,
        reason: String,
        /// Earliest retry the destination asked for, if it said so.
        retry_after: Option<Duration>,
    },
}

impl DeliveryOutcome {
    pub fn failed(kind: FailureKind, reason: impl Into<String>) -> Self {
        Self::Failed {
            kind,
            reason: reason.into(),
            retry_after: None,
        }
    }
}

impl From<Result<(), DeliveryError>> for DeliveryOutcome {
    fn from(result: Result<(), DeliveryError>) -> Self {
        match result {
            Ok(()) => Self::Delivered,
            Err(e) => {
                let retry_after = match &e {
                    DeliveryError::RateLimited { retry_after, .. } => *retry_after,
                    _ => None,
                };
                Self::Failed {
                    kind: e.failure_kind(),
                    reason: e.to_string(),
                    retry_after,
                }
            }
        }
    }
}

impl DeliveryError {
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            Self::Rejected { .. } => FailureKind::Rejected,
            Self::Blocked { .. } => FailureKind::Blocked,
            Self::SendFailed { .. } | Self::RateLimited { .. } | Self::Timeout { .. } => {
                FailureKind::Transient
            }
        }
    }
}

/// Publisher that only logs. Used when no destination is configured.
#[derive(Debug, Default, Clone)]
pub struct DryRunPublisher;

#[async_trait]
impl Publisher for DryRunPublisher {
    fn name(&self) -> &str {
        "dry-run"
    }

    async fn publish(&self, item: &Item) -> Result<(), DeliveryError> {
        tracing::info!(
            key = %item.key,
            title = %item.title,
            price = ?item.price,
            "Dry run: would publish item"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::items::{ItemKey, RawItem};

    #[test]
    fn errors_map_to_failure_kinds() {
        let rejected = DeliveryError::Rejected {
            publisher: "t".into(),
            reason: "bad markup".into(),
        };
        assert_eq!(rejected.failure_kind(), FailureKind::Rejected);

        let blocked = DeliveryError::Blocked {
            publisher: "t".into(),
            reason: "bot kicked".into(),
        };
        assert_eq!(blocked.failure_kind(), FailureKind::Blocked);

        let timeout = DeliveryError::Timeout {
            publisher: "t".into(),
            timeout: Duration::from_secs(1),
        };
        assert_eq!(timeout.failure_kind(), FailureKind::Transient);
    }

    #[test]
    fn rate_limited_carries_retry_hint() {
        let outcome = DeliveryOutcome::from(Err(DeliveryError::RateLimited {
            publisher: "t".into(),
            retry_after: Some(Duration::from_secs(7)),
        }));
        match outcome {
            DeliveryOutcome::Failed {
                kind, retry_after, ..
            } => {
                assert_eq!(kind, FailureKind::Transient);
                assert_eq!(retry_after, Some(Duration::from_secs(7)));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn dry_run_always_succeeds() {
        let item = Item::from_raw(ItemKey::new("id:1"), RawItem::new("Phone"), Utc::now());
        assert!(DryRunPublisher.publish(&item).await.is_ok());
        assert_eq!(DryRunPublisher.name(), "dry-run");
    }
}
