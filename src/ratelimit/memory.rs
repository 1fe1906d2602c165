//! In-process rate store, shared by every worker of one process.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use tokio::time::Instant;

use crate::error::DatabaseError;

use super::{RateDecision, RateLimit, RateStore};

/// Grant timestamps per bucket. The lock is held only for the synchronous
/// count-compare-record step, never across an await.
#[derive(Default)]
pub struct MemoryRateStore {
    buckets: Mutex<HashMap<String, VecDeque<Instant>>>,
}

impl MemoryRateStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn acquire_at(&self, bucket: &str, limit: &RateLimit, now: Instant) -> RateDecision {
        if limit.limit == 0 {
            return RateDecision::Denied {
                retry_after: limit.window,
            };
        }

        let mut buckets = self.buckets.lock().unwrap_or_else(PoisonError::into_inner);
        let grants = buckets.entry(bucket.to_string()).or_default();
        evict_expired(grants, limit, now);

        if grants.len() < limit.limit as usize {
            grants.push_back(now);
            return RateDecision::Granted;
        }

        let retry_after = grants
            .front()
            .map(|oldest| limit.window.saturating_sub(now.duration_since(*oldest)))
            .unwrap_or(limit.window);
        RateDecision::Denied { retry_after }
    }
}

fn evict_expired(grants: &mut VecDeque<Instant>, limit: &RateLimit, now: Instant) {
    while let Some(oldest) = grants.front() {
        if now.duration_since(*oldest) >= limit.window {
            grants.pop_front();
        } else {
            break;
        }
    }
}

#[async_trait]
impl RateStore for MemoryRateStore {
    async fn try_acquire(
        &self,
        bucket: &str,
        limit: &RateLimit,
    ) -> Result<RateDecision, DatabaseError> {
        Ok(self.acquire_at(bucket, limit, Instant::now()))
    }

    async fn in_window(&self, bucket: &str, limit: &RateLimit) -> Result<u32, DatabaseError> {
        let mut buckets = self.buckets.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(match buckets.get_mut(bucket) {
            Some(grants) => {
                evict_expired(grants, limit, Instant::now());
                grants.len() as u32
            }
            None => 0,
        })
    }
}
