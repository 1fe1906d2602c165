//! Sliding-window rate limiting.
//!
//! A bucket admits at most `limit` grants in any trailing `window`. The
//! count-compare-record step is a single atomic operation inside the
//! `RateStore`, so concurrent workers (or processes, with the shared store)
//! can never jointly exceed the bound.

pub mod memory;
pub mod shared;

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::RateLimitConfig;
use crate::error::DatabaseError;
use crate::items::Item;

pub use memory::MemoryRateStore;

/// Bucket every delivery passes through.
pub const GLOBAL_BUCKET: &str = "global";

/// At most `limit` grants per trailing `window`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimit {
    pub limit: u32,
    pub window: Duration,
}

impl RateLimit {
    pub const fn new(limit: u32, window: Duration) -> Self {
        Self { limit, window }
    }
}

/// Parses `limit/seconds`, e.g. `20/60`.
impl FromStr for RateLimit {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (limit, secs) = s
            .split_once('/')
            .ok_or_else(|| format!("expected limit/seconds, got '{s}'"))?;
        let limit: u32 = limit
            .trim()
            .parse()
            .map_err(|e| format!("bad limit '{limit}': {e}"))?;
        let secs: u64 = secs
            .trim()
            .parse()
            .map_err(|e| format!("bad window '{secs}': {e}"))?;
        if secs == 0 {
            return Err("window must be at least one second".into());
        }
        Ok(Self::new(limit, Duration::from_secs(secs)))
    }
}

/// Answer to a single acquisition attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    Granted,
    /// Denied; a slot frees up after `retry_after`.
    Denied { retry_after: Duration },
}

impl RateDecision {
    pub fn is_granted(&self) -> bool {
        matches!(self, Self::Granted)
    }
}

/// Storage for grant timestamps. Implementations must make `try_acquire`
/// atomic per bucket.
#[async_trait]
pub trait RateStore: Send + Sync {
    /// Record a grant if fewer than `limit.limit` grants fall inside the
    /// trailing window, otherwise report when the oldest one expires.
    async fn try_acquire(
        &self,
        bucket: &str,
        limit: &RateLimit,
    ) -> Result<RateDecision, DatabaseError>;

    /// Grants currently inside the trailing window.
    async fn in_window(&self, bucket: &str, limit: &RateLimit) -> Result<u32, DatabaseError>;
}

/// Named-bucket limiter over a pluggable store.
pub struct RateLimiter {
    store: Arc<dyn RateStore>,
    config: RateLimitConfig,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn RateStore>, config: RateLimitConfig) -> Self {
        Self { store, config }
    }

    /// Limit applying to `bucket`: explicit override, then the per-brand or
    /// per-category default, then the global limit.
    pub fn limit_for(&self, bucket: &str) -> RateLimit {
        if let Some(limit) = self.config.overrides.get(bucket) {
            return *limit;
        }
        let scoped = if bucket.starts_with("brand:") {
            self.config.per_brand
        } else if bucket.starts_with("category:") {
            self.config.per_category
        } else {
            None
        };
        scoped.unwrap_or(self.config.global)
    }

    /// Buckets an item must pass, in acquisition order.
    pub fn buckets_for(&self, item: &Item) -> Vec<String> {
        let mut buckets = vec![GLOBAL_BUCKET.to_string()];
        if let Some(brand) = &item.brand {
            let bucket = format!("brand:{}", brand.to_lowercase());
            if self.config.per_brand.is_some() || self.config.overrides.contains_key(&bucket) {
                buckets.push(bucket);
            }
        }
        if let Some(category) = &item.category {
            let bucket = format!("category:{}", category.to_lowercase());
            if self.config.per_category.is_some() || self.config.overrides.contains_key(&bucket) {
                buckets.push(bucket);
            }
        }
        buckets
    }

    pub async fn try_acquire(&self, bucket: &str) -> Result<RateDecision, DatabaseError> {
        let limit = self.limit_for(bucket);
        self.store.try_acquire(bucket, &limit).await
    }

    /// Wait until a slot in `bucket` is granted. Sleeps on the store's
    /// retry hint between attempts. Returns `false` if cancelled first.
    pub async fn acquire(
        &self,
        bucket: &str,
        cancel: &CancellationToken,
    ) -> Result<bool, DatabaseError> {
        loop {
            if cancel.is_cancelled() {
                return Ok(false);
            }
            match self.try_acquire(bucket).await? {
                RateDecision::Granted => return Ok(true),
                RateDecision::Denied { retry_after } => {
                    debug!(bucket, retry_after_ms = retry_after.as_millis() as u64, "Rate limited");
                    let wait = retry_after.max(Duration::from_millis(1));
                    tokio::select! {
                        _ = cancel.cancelled() => return Ok(false),
                        _ = tokio::time::sleep(wait) => {}
                    }
                }
            }
        }
    }

    pub async fn in_window(&self, bucket: &str) -> Result<u32, DatabaseError> {
        let limit = self.limit_for(bucket);
        self.store.in_window(bucket, &limit).await
    }
}
