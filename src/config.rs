//! Configuration types.
//!
//! Everything is read from `DEAL_RELAY_*` environment variables (plus the
//! usual `TELEGRAM_*` pair) with defaults suitable for a single local node.

use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use rust_decimal::Decimal;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::ratelimit::RateLimit;

// ── Pipeline ────────────────────────────────────────────────────────

/// Top-level pipeline configuration.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// libSQL database file.
    pub db_path: PathBuf,
    /// Number of concurrent delivery workers.
    pub delivery_workers: usize,
    /// Number of concurrent ingestion workers per source.
    pub ingestion_workers: usize,
    /// How long an idle worker sleeps before polling again.
    pub poll_interval: Duration,
    /// Upper bound on a single `Publisher::publish` call.
    pub delivery_timeout: Duration,
    /// How long shutdown waits for workers before aborting them.
    pub shutdown_grace: Duration,
    /// Dedup records older than this are pruned (if no longer active).
    pub retention: Duration,
    /// Interval of the retention sweep.
    pub maintenance_interval: Duration,
    pub queue: QueueConfig,
    pub rate: RateLimitConfig,
    pub health: HealthConfig,
    pub validation: ValidationConfig,
    pub retry: RetryConfig,
    pub rate_store: RateStoreKind,
    pub telegram: Option<TelegramConfig>,
    /// Port for the status/ingest HTTP API. Disabled when `None`.
    pub status_port: Option<u16>,
    /// Directory polled by the spool ingestion source. Disabled when `None`.
    pub spool_dir: Option<PathBuf>,
    /// Directory for rolling log files. Stderr only when `None`.
    pub log_dir: Option<PathBuf>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("./data/deal-relay.db"),
            delivery_workers: 2,
            ingestion_workers: 1,
            poll_interval: Duration::from_secs(1),
            delivery_timeout: Duration::from_secs(30),
            shutdown_grace: Duration::from_secs(10),
            retention: Duration::from_secs(30 * 24 * 3600), // 30 days
            maintenance_interval: Duration::from_secs(3600),
            queue: QueueConfig::default(),
            rate: RateLimitConfig::default(),
            health: HealthConfig::default(),
            validation: ValidationConfig::default(),
            retry: RetryConfig::default(),
            rate_store: RateStoreKind::Memory,
            telegram: None,
            status_port: None,
            spool_dir: None,
            log_dir: None,
        }
    }
}

impl PipelineConfig {
    /// Build config from environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let d = Self::default();

        let retention_days: u64 = env_parse("DEAL_RELAY_RETENTION_DAYS", 30)?;
        let retention = retention_from_days(retention_days)?;

        Ok(Self {
            db_path: env_opt("DEAL_RELAY_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or(d.db_path),
            delivery_workers: env_parse("DEAL_RELAY_DELIVERY_WORKERS", d.delivery_workers)?,
            ingestion_workers: env_parse("DEAL_RELAY_INGESTION_WORKERS", d.ingestion_workers)?,
            poll_interval: env_millis("DEAL_RELAY_POLL_INTERVAL_MS", d.poll_interval)?,
            delivery_timeout: env_secs("DEAL_RELAY_DELIVERY_TIMEOUT_SECS", d.delivery_timeout)?,
            shutdown_grace: env_secs("DEAL_RELAY_SHUTDOWN_GRACE_SECS", d.shutdown_grace)?,
            retention,
            maintenance_interval: env_secs(
                "DEAL_RELAY_MAINTENANCE_INTERVAL_SECS",
                d.maintenance_interval,
            )?,
            queue: QueueConfig::from_env()?,
            rate: RateLimitConfig::from_env()?,
            health: HealthConfig::from_env()?,
            validation: ValidationConfig::from_env()?,
            retry: d.retry,
            rate_store: env_parse("DEAL_RELAY_RATE_STORE", d.rate_store)?,
            telegram: TelegramConfig::from_env(),
            status_port: env_opt("DEAL_RELAY_STATUS_PORT")
                .map(|s| parse_value("DEAL_RELAY_STATUS_PORT", &s))
                .transpose()?,
            spool_dir: env_opt("DEAL_RELAY_SPOOL_DIR").map(PathBuf::from),
            log_dir: env_opt("DEAL_RELAY_LOG_DIR").map(PathBuf::from),
        })
    }
}

fn retention_from_days(days: u64) -> Result<Duration, ConfigError> {
    days.checked_mul(24 * 3600)
        .map(Duration::from_secs)
        .ok_or_else(|| ConfigError::InvalidValue {
            key: "DEAL_RELAY_RETENTION_DAYS".into(),
            message: format!("{days} days does not fit in a duration"),
        })
}

// ── Queue ───────────────────────────────────────────────────────────

/// What happens when an admission would exceed the queue capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackpressurePolicy {
    /// Refuse the newcomer; the caller sees a retryable `QueueFull`.
    Reject,
    /// Drop the lowest-priority, oldest pending entry to make room.
    EvictOldest,
}

impl FromStr for BackpressurePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "reject" => Ok(Self::Reject),
            "evict_oldest" | "evict-oldest" | "evict" => Ok(Self::EvictOldest),
            other => Err(format!("unknown backpressure policy '{other}'")),
        }
    }
}

impl std::fmt::Display for BackpressurePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Reject => write!(f, "reject"),
            Self::EvictOldest => write!(f, "evict_oldest"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Maximum number of active (pending + in-flight) entries.
    pub capacity: usize,
    pub policy: BackpressurePolicy,
    /// Total delivery attempts per item, including the first.
    pub max_attempts: u32,
    /// Delay before the first retry of a transient delivery failure.
    pub retry_base: Duration,
    /// Cap on the retry delay.
    pub retry_max: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: 1000,
            policy: BackpressurePolicy::Reject,
            max_attempts: 3,
            retry_base: Duration::from_secs(30),
            retry_max: Duration::from_secs(3600),
        }
    }
}

impl QueueConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let d = Self::default();
        let capacity: usize = env_parse("DEAL_RELAY_QUEUE_CAPACITY", d.capacity)?;
        if capacity == 0 {
            return Err(ConfigError::InvalidValue {
                key: "DEAL_RELAY_QUEUE_CAPACITY".into(),
                message: "must be at least 1".into(),
            });
        }
        Ok(Self {
            capacity,
            policy: env_parse("DEAL_RELAY_QUEUE_POLICY", d.policy)?,
            max_attempts: env_parse("DEAL_RELAY_MAX_ATTEMPTS", d.max_attempts)?.max(1),
            retry_base: env_secs("DEAL_RELAY_RETRY_BASE_SECS", d.retry_base)?,
            retry_max: env_secs("DEAL_RELAY_RETRY_MAX_SECS", d.retry_max)?,
        })
    }

    /// Delay before attempt number `attempt` (0-based) is retried:
    /// `retry_base * 2^attempt`, capped at `retry_max`.
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(16)).unwrap_or(u32::MAX);
        self.retry_base
            .checked_mul(factor)
            .unwrap_or(self.retry_max)
            .min(self.retry_max)
    }
}

// ── Rate limits ─────────────────────────────────────────────────────

/// Which `RateStore` backs the limiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateStoreKind {
    /// In-process store, shared by all workers of this process.
    Memory,
    /// The libSQL database, shared by every process using the same file.
    Shared,
}

impl FromStr for RateStoreKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(Self::Memory),
            "shared" | "db" | "database" => Ok(Self::Shared),
            other => Err(format!("unknown rate store '{other}'")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Limit for the `global` bucket every delivery passes through.
    pub global: RateLimit,
    /// Per-brand limit (bucket `brand:<name>`), if any.
    pub per_brand: Option<RateLimit>,
    /// Per-category limit (bucket `category:<name>`), if any.
    pub per_category: Option<RateLimit>,
    /// Explicit limits for individual buckets.
    pub overrides: HashMap<String, RateLimit>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            global: RateLimit::new(20, Duration::from_secs(60)),
            per_brand: None,
            per_category: None,
            overrides: HashMap::new(),
        }
    }
}

impl RateLimitConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let d = Self::default();
        let overrides = match env_opt("DEAL_RELAY_RATE_OVERRIDES") {
            Some(raw) => parse_overrides(&raw)?,
            None => HashMap::new(),
        };
        Ok(Self {
            global: env_parse("DEAL_RELAY_RATE_LIMIT", d.global)?,
            per_brand: env_opt("DEAL_RELAY_BRAND_RATE_LIMIT")
                .map(|s| parse_value("DEAL_RELAY_BRAND_RATE_LIMIT", &s))
                .transpose()?,
            per_category: env_opt("DEAL_RELAY_CATEGORY_RATE_LIMIT")
                .map(|s| parse_value("DEAL_RELAY_CATEGORY_RATE_LIMIT", &s))
                .transpose()?,
            overrides,
        })
    }
}

/// Parse `bucket=limit/secs` pairs separated by commas. Bucket names are
/// lowercased to match the names `RateLimiter::buckets_for` derives.
fn parse_overrides(raw: &str) -> Result<HashMap<String, RateLimit>, ConfigError> {
    let mut out = HashMap::new();
    for pair in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let (bucket, limit) = pair.split_once('=').ok_or_else(|| ConfigError::InvalidValue {
            key: "DEAL_RELAY_RATE_OVERRIDES".into(),
            message: format!("expected bucket=limit/secs, got '{pair}'"),
        })?;
        out.insert(
            bucket.trim().to_lowercase(),
            parse_value("DEAL_RELAY_RATE_OVERRIDES", limit)?,
        );
    }
    Ok(out)
}

// ── Health ──────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct HealthConfig {
    /// Consecutive ambiguous failures that move healthy → degraded.
    pub degrade_after: u32,
    /// Shortest randomized pause.
    pub min_pause: Duration,
    /// Longest randomized pause.
    pub max_pause: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            degrade_after: 3,
            min_pause: Duration::from_secs(6 * 3600),
            max_pause: Duration::from_secs(12 * 3600),
        }
    }
}

impl HealthConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let d = Self::default();
        let min_pause = env_secs("DEAL_RELAY_MIN_PAUSE_SECS", d.min_pause)?;
        let max_pause = env_secs("DEAL_RELAY_MAX_PAUSE_SECS", d.max_pause)?;
        if max_pause < min_pause {
            return Err(ConfigError::InvalidValue {
                key: "DEAL_RELAY_MAX_PAUSE_SECS".into(),
                message: "must not be shorter than DEAL_RELAY_MIN_PAUSE_SECS".into(),
            });
        }
        Ok(Self {
            degrade_after: env_parse("DEAL_RELAY_DEGRADE_AFTER", d.degrade_after)?.max(1),
            min_pause,
            max_pause,
        })
    }
}

// ── Validation ──────────────────────────────────────────────────────

/// Content rules applied before admission.
#[derive(Debug, Clone, Default)]
pub struct ValidationConfig {
    pub min_price: Option<Decimal>,
    pub max_price: Option<Decimal>,
    /// Reject items that carry no price at all.
    pub require_price: bool,
    /// Lowercased words that disqualify a title.
    pub stop_words: Vec<String>,
}

impl ValidationConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            min_price: env_opt("DEAL_RELAY_MIN_PRICE")
                .map(|s| parse_value("DEAL_RELAY_MIN_PRICE", &s))
                .transpose()?,
            max_price: env_opt("DEAL_RELAY_MAX_PRICE")
                .map(|s| parse_value("DEAL_RELAY_MAX_PRICE", &s))
                .transpose()?,
            require_price: env_parse("DEAL_RELAY_REQUIRE_PRICE", false)?,
            stop_words: env_list("DEAL_RELAY_STOP_WORDS")
                .into_iter()
                .map(|w| w.to_lowercase())
                .collect(),
        })
    }
}

// ── Storage retry ───────────────────────────────────────────────────

/// Backoff applied to transient storage failures.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub initial_interval: Duration,
    pub max_interval: Duration,
    /// Give up after this much total time.
    pub max_elapsed: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_millis(200),
            max_interval: Duration::from_secs(5),
            max_elapsed: Duration::from_secs(30),
        }
    }
}

// ── Telegram ────────────────────────────────────────────────────────

/// Telegram delivery target. Absent when `TELEGRAM_BOT_TOKEN` is unset.
#[derive(Debug, Clone)]
pub struct TelegramConfig {
    pub bot_token: SecretString,
    /// Channel username (`@deals`) or numeric chat id.
    pub chat_id: String,
}

impl TelegramConfig {
    /// Returns `None` if either `TELEGRAM_BOT_TOKEN` or `TELEGRAM_CHANNEL_ID`
    /// is missing (delivery falls back to the dry-run publisher).
    pub fn from_env() -> Option<Self> {
        let token = env_opt("TELEGRAM_BOT_TOKEN")?;
        let chat_id = env_opt("TELEGRAM_CHANNEL_ID")?;
        Some(Self {
            bot_token: SecretString::from(token),
            chat_id,
        })
    }
}

// ── Env helpers ─────────────────────────────────────────────────────

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn env_list(key: &str) -> Vec<String> {
    env_opt(key)
        .unwrap_or_default()
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn parse_value<T>(key: &str, raw: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("'{raw}': {e}"),
    })
}

fn env_parse<T>(key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env_opt(key) {
        Some(raw) => parse_value(key, &raw),
        None => Ok(default),
    }
}

fn env_secs(key: &str, default: Duration) -> Result<Duration, ConfigError> {
    env_parse(key, default.as_secs()).map(Duration::from_secs)
}

fn env_millis(key: &str, default: Duration) -> Result<Duration, ConfigError> {
    env_parse(key, default.as_millis() as u64).map(Duration::from_millis)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn policy_parses_both_spellings() {
        assert_eq!(
            "evict-oldest".parse::<BackpressurePolicy>().unwrap(),
            BackpressurePolicy::EvictOldest
        );
        assert_eq!(
            "Reject".parse::<BackpressurePolicy>().unwrap(),
            BackpressurePolicy::Reject
        );
        assert!("drop".parse::<BackpressurePolicy>().is_err());
    }

    #[test]
    fn retry_delay_doubles_and_caps() {
        let q = QueueConfig {
            retry_base: Duration::from_secs(30),
            retry_max: Duration::from_secs(100),
            ..QueueConfig::default()
        };
        assert_eq!(q.retry_delay(0), Duration::from_secs(30));
        assert_eq!(q.retry_delay(1), Duration::from_secs(60));
        assert_eq!(q.retry_delay(2), Duration::from_secs(100));
        assert_eq!(q.retry_delay(40), Duration::from_secs(100));
    }

    #[test]
    fn overrides_parse() {
        let map = parse_overrides("brand:apple=2/60, category:phones=10/3600").unwrap();
        assert_eq!(map["brand:apple"], RateLimit::new(2, Duration::from_secs(60)));
        assert_eq!(
            map["category:phones"],
            RateLimit::new(10, Duration::from_secs(3600))
        );
        assert!(parse_overrides("brand:apple").is_err());
    }

    #[test]
    fn override_buckets_are_case_folded() {
        let map = parse_overrides("brand:Acme=1/60,Category:TVs=2/60").unwrap();
        assert!(map.contains_key("brand:acme"));
        assert!(map.contains_key("category:tvs"));
    }

    #[test]
    fn oversized_retention_is_a_config_error() {
        assert_eq!(
            retention_from_days(2).unwrap(),
            Duration::from_secs(2 * 24 * 3600)
        );
        let err = retention_from_days(u64::MAX).unwrap_err();
        assert!(err.to_string().contains("DEAL_RELAY_RETENTION_DAYS"));
    }

    #[test]
    fn garbage_value_is_reported() {
        let err = parse_value::<u32>("DEAL_RELAY_MAX_ATTEMPTS", "three").unwrap_err();
        assert!(err.to_string().contains("DEAL_RELAY_MAX_ATTEMPTS"));
    }
}
