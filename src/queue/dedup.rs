//! DedupGate: exactly-once admission of item keys.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::error::DatabaseError;
use crate::items::{Item, ItemKey};
use crate::queue::model::{Admission, Placement};
use crate::store::{PruneReport, Store};

/// Answers "is this key new?" with insert-if-absent, never check-then-insert.
///
/// A key is admitted at most once for the lifetime of its dedup record, no
/// matter how many workers race on it. Admission and the first queue entry
/// are created in the same transaction.
#[derive(Clone)]
pub struct DedupGate {
    store: Arc<dyn Store>,
}

impl DedupGate {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    pub async fn try_admit(
        &self,
        item: &Item,
        placement: &Placement,
    ) -> Result<Admission, DatabaseError> {
        let admission = self.store.try_admit(item, placement).await?;
        match &admission {
            Admission::Admitted { entry_id, evicted } => {
                info!(
                    key = %item.key,
                    entry_id = %entry_id,
                    priority = placement.priority,
                    "Item admitted"
                );
                for victim in evicted {
                    warn!(entry_id = %victim, "Evicted pending entry to make room");
                }
                crate::telemetry::entries_evicted(evicted.len());
            }
            Admission::Duplicate => debug!(key = %item.key, "Duplicate item skipped"),
            Admission::QueueFull => {
                warn!(key = %item.key, capacity = placement.capacity, "Queue full, item refused")
            }
        }
        Ok(admission)
    }

    /// Whether `key` has been admitted and not yet pruned.
    pub async fn is_known(&self, key: &ItemKey) -> Result<bool, DatabaseError> {
        Ok(self.store.first_seen(key).await?.is_some())
    }

    pub async fn count(&self) -> Result<u64, DatabaseError> {
        self.store.count_dedup_records().await
    }

    /// Drop dedup records (and their items) first seen before `older_than`.
    /// Keys with a pending or in-flight entry are kept.
    pub async fn prune(&self, older_than: DateTime<Utc>) -> Result<PruneReport, DatabaseError> {
        self.store.prune(older_than).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackpressurePolicy;
    use crate::items::RawItem;
    use crate::store::LibSqlBackend;

    fn placement() -> Placement {
        Placement {
            priority: 0,
            earliest_at: Utc::now(),
            attempt: 0,
            capacity: 100,
            policy: BackpressurePolicy::Reject,
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn racing_admissions_admit_once() {
        let store: Arc<dyn Store> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let gate = DedupGate::new(store);
        let item = Item::from_raw(ItemKey::new("id:123456"), RawItem::new("Phone"), Utc::now());

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let gate = gate.clone();
                let item = item.clone();
                tokio::spawn(async move { gate.try_admit(&item, &placement()).await.unwrap() })
            })
            .collect();

        let results: Vec<Admission> = futures::future::join_all(handles)
            .await
            .into_iter()
            .map(|r| r.unwrap())
            .collect();
        assert_eq!(results.iter().filter(|a| a.admitted()).count(), 1);
        assert_eq!(
            results
                .iter()
                .filter(|a| **a == Admission::Duplicate)
                .count(),
            15
        );
        assert_eq!(gate.count().await.unwrap(), 1);
        assert!(gate.is_known(&item.key).await.unwrap());
    }
}
