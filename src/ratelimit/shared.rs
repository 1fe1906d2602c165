//! Cross-process rate store on top of the libSQL database.
//!
//! Grants are rows in `rate_events`. Each acquisition runs in an immediate
//! transaction, so processes sharing the database file serialize on SQLite's
//! write lock and see each other's grants.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use libsql::{Connection, params};

use crate::error::DatabaseError;
use crate::store::LibSqlBackend;
use crate::store::libsql_backend::{begin_immediate, finish};

use super::{RateDecision, RateLimit, RateStore};

fn window_ms(limit: &RateLimit) -> i64 {
    limit.window.as_millis().min(i64::MAX as u128) as i64
}

async fn acquire_in_tx(
    conn: &Connection,
    bucket: &str,
    limit: &RateLimit,
    now_ms: i64,
) -> Result<RateDecision, DatabaseError> {
    let window = window_ms(limit);
    let map = |e| DatabaseError::from_libsql("rate_acquire", e);

    conn.execute(
        "DELETE FROM rate_events WHERE bucket = ?1 AND at_ms <= ?2",
        params![bucket, now_ms - window],
    )
    .await
    .map_err(map)?;

    let mut rows = conn
        .query(
            "SELECT COUNT(*), MIN(at_ms) FROM rate_events WHERE bucket = ?1",
            params![bucket],
        )
        .await
        .map_err(map)?;
    let row = rows
        .next()
        .await
        .map_err(map)?
        .ok_or_else(|| DatabaseError::Query("rate_acquire: no row".into()))?;
    let count: i64 = row
        .get(0)
        .map_err(|e| DatabaseError::Query(format!("row parse: {e}")))?;
    let oldest: Option<i64> = row.get::<i64>(1).ok();
    drop(rows);

    if count < limit.limit as i64 {
        conn.execute(
            "INSERT INTO rate_events (bucket, at_ms) VALUES (?1, ?2)",
            params![bucket, now_ms],
        )
        .await
        .map_err(map)?;
        return Ok(RateDecision::Granted);
    }

    let retry_ms = oldest
        .map(|oldest| (oldest + window - now_ms).max(0))
        .unwrap_or(window);
    Ok(RateDecision::Denied {
        retry_after: Duration::from_millis(retry_ms as u64),
    })
}

#[async_trait]
impl RateStore for LibSqlBackend {
    async fn try_acquire(
        &self,
        bucket: &str,
        limit: &RateLimit,
    ) -> Result<RateDecision, DatabaseError> {
        let now_ms = Utc::now().timestamp_millis();
        let conn = self.conn().await;
        let tx = begin_immediate(&conn, "rate_acquire").await?;
        let result = acquire_in_tx(&tx, bucket, limit, now_ms).await;
        finish(tx, result, |_| true, "rate_acquire").await
    }

    async fn in_window(&self, bucket: &str, limit: &RateLimit) -> Result<u32, DatabaseError> {
        let since = Utc::now().timestamp_millis() - window_ms(limit);
        let conn = self.conn().await;
        let mut rows = conn
            .query(
                "SELECT COUNT(*) FROM rate_events WHERE bucket = ?1 AND at_ms > ?2",
                params![bucket, since],
            )
            .await
            .map_err(|e| DatabaseError::from_libsql("rate_in_window", e))?;
        let row = rows
            .next()
            .await
            .map_err(|e| DatabaseError::from_libsql("rate_in_window", e))?
            .ok_or_else(|| DatabaseError::Query("rate_in_window: no row".into()))?;
        let count: i64 = row
            .get(0)
            .map_err(|e| DatabaseError::Query(format!("row parse: {e}")))?;
        Ok(count.max(0) as u32)
    }
}
