//! libSQL backend: async `Store` trait implementation.
//!
//! Supports local file and in-memory databases. All access goes through one
//! connection behind an async mutex, so each operation (one statement or one
//! `BEGIN IMMEDIATE` transaction) runs to completion before the next starts.
//! Other processes sharing the same file are kept honest by SQLite's own
//! write lock and the busy timeout.

use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, Transaction, TransactionBehavior, params};
use rust_decimal::Decimal;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::config::BackpressurePolicy;
use crate::error::DatabaseError;
use crate::health::state::{HealthEvent, HealthMode, HealthRecord, HealthState};
use crate::items::{Item, ItemKey};
use crate::queue::model::{
    Admission, EnqueueOutcome, EntryId, EntryStatus, Placement, QueueEntry, QueueStats,
};
use crate::store::migrations;
use crate::store::traits::{PruneReport, Store, Transition};

/// How long a statement waits on another process's write lock.
const BUSY_TIMEOUT_MS: u64 = 5000;

/// libSQL database backend.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Mutex<Connection>,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let backend = Self::from_database(db).await?;
        {
            let conn = backend.conn.lock().await;
            pragma(&conn, &format!("PRAGMA busy_timeout = {BUSY_TIMEOUT_MS}")).await?;
            pragma(&conn, "PRAGMA journal_mode = WAL").await?;
        }
        backend.init_schema().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let backend = Self::from_database(db).await?;
        backend.init_schema().await?;
        Ok(backend)
    }

    async fn from_database(db: LibSqlDatabase) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;
        Ok(Self {
            db: Arc::new(db),
            conn: Mutex::new(conn),
        })
    }

    /// Exclusive use of the connection for one operation.
    pub(crate) async fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().await
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Run a pragma and step it once (pragmas that set a value return a row).
async fn pragma(conn: &Connection, sql: &str) -> Result<(), DatabaseError> {
    let mut rows = conn
        .query(sql, ())
        .await
        .map_err(|e| DatabaseError::Pool(format!("{sql}: {e}")))?;
    rows.next()
        .await
        .map_err(|e| DatabaseError::Pool(format!("{sql}: {e}")))?;
    Ok(())
}

/// Start a `BEGIN IMMEDIATE` transaction, taking the write lock up front.
pub(crate) async fn begin_immediate(
    conn: &Connection,
    op: &str,
) -> Result<Transaction, DatabaseError> {
    if !conn.is_autocommit() {
        // An aborted task can leave its transaction open on the shared connection.
        warn!(op, "Rolling back abandoned transaction");
        conn.execute("ROLLBACK", ())
            .await
            .map_err(|e| DatabaseError::from_libsql(op, e))?;
    }
    conn.transaction_with_behavior(TransactionBehavior::Immediate)
        .await
        .map_err(|e| DatabaseError::from_libsql(op, e))
}

/// Commit when `keep` approves the result, otherwise roll back.
pub(crate) async fn finish<T>(
    tx: Transaction,
    result: Result<T, DatabaseError>,
    keep: impl FnOnce(&T) -> bool,
    op: &str,
) -> Result<T, DatabaseError> {
    match result {
        Ok(value) if keep(&value) => {
            tx.commit()
                .await
                .map_err(|e| DatabaseError::from_libsql(op, e))?;
            Ok(value)
        }
        Ok(value) => {
            tx.rollback()
                .await
                .map_err(|e| DatabaseError::from_libsql(op, e))?;
            Ok(value)
        }
        Err(e) => {
            if let Err(rb) = tx.rollback().await {
                warn!(op, error = %rb, "Rollback failed");
            }
            Err(e)
        }
    }
}

/// Fixed-width RFC 3339 (millisecond, `Z`) so text comparison orders by time.
pub(crate) fn fmt_ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

fn row_err(e: libsql::Error) -> DatabaseError {
    DatabaseError::Query(format!("row parse: {e}"))
}

const ENTRY_COLUMNS: &str =
    "id, item_key, priority, earliest_at, status, attempt, error_reason, created_at, updated_at";

const ITEM_COLUMNS: &str = "key, title, brand, category, price, url, attributes, discovered_at";

/// Map a libsql Row to a QueueEntry. Column order matches ENTRY_COLUMNS.
fn row_to_entry(row: &libsql::Row) -> Result<QueueEntry, DatabaseError> {
    let status_str: String = row.get(4).map_err(row_err)?;
    let status = EntryStatus::from_str(&status_str).map_err(DatabaseError::Serialization)?;
    let earliest: String = row.get(3).map_err(row_err)?;
    let created: String = row.get(7).map_err(row_err)?;
    let updated: String = row.get(8).map_err(row_err)?;

    Ok(QueueEntry {
        id: EntryId(row.get(0).map_err(row_err)?),
        item_key: ItemKey::new(row.get::<String>(1).map_err(row_err)?),
        priority: row.get(2).map_err(row_err)?,
        earliest_at: parse_datetime(&earliest),
        status,
        attempt: row.get::<i64>(5).map_err(row_err)?.max(0) as u32,
        error_reason: row.get::<String>(6).ok(),
        created_at: parse_datetime(&created),
        updated_at: parse_datetime(&updated),
    })
}

/// Map a libsql Row to an Item. Column order matches ITEM_COLUMNS.
fn row_to_item(row: &libsql::Row) -> Result<Item, DatabaseError> {
    let price = row
        .get::<String>(4)
        .ok()
        .map(|p| Decimal::from_str(&p))
        .transpose()
        .map_err(|e| DatabaseError::Serialization(format!("item price: {e}")))?;
    let attributes: String = row.get(6).map_err(row_err)?;
    let discovered: String = row.get(7).map_err(row_err)?;

    Ok(Item {
        key: ItemKey::new(row.get::<String>(0).map_err(row_err)?),
        title: row.get(1).map_err(row_err)?,
        brand: row.get::<String>(2).ok(),
        category: row.get::<String>(3).ok(),
        price,
        url: row.get::<String>(5).ok(),
        attributes: serde_json::from_str(&attributes)
            .map_err(|e| DatabaseError::Serialization(format!("item attributes: {e}")))?,
        discovered_at: parse_datetime(&discovered),
    })
}

async fn count_active(conn: &Connection) -> Result<u64, DatabaseError> {
    let mut rows = conn
        .query(
            "SELECT COUNT(*) FROM queue_entries WHERE status IN ('pending', 'in_flight')",
            (),
        )
        .await
        .map_err(|e| DatabaseError::from_libsql("count_active", e))?;
    let row = rows
        .next()
        .await
        .map_err(|e| DatabaseError::from_libsql("count_active", e))?
        .ok_or_else(|| DatabaseError::Query("count_active: no row".into()))?;
    Ok(row.get::<i64>(0).map_err(row_err)?.max(0) as u64)
}

enum Room {
    Available { evicted: Vec<EntryId> },
    Full,
}

/// Make space for one more active entry according to the placement's policy.
/// Evictions happen inside the caller's transaction and are undone with it.
async fn make_room(conn: &Connection, placement: &Placement) -> Result<Room, DatabaseError> {
    let active = count_active(conn).await?;
    let capacity = placement.capacity as u64;
    if active < capacity {
        return Ok(Room::Available {
            evicted: Vec::new(),
        });
    }
    if placement.policy == BackpressurePolicy::Reject {
        return Ok(Room::Full);
    }

    let needed = active + 1 - capacity;
    let mut evicted = Vec::new();
    let mut rows = conn
        .query(
            "SELECT id, priority FROM queue_entries WHERE status = 'pending'
             ORDER BY priority ASC, earliest_at ASC, id ASC LIMIT ?1",
            params![needed as i64],
        )
        .await
        .map_err(|e| DatabaseError::from_libsql("make_room", e))?;
    while let Some(row) = rows
        .next()
        .await
        .map_err(|e| DatabaseError::from_libsql("make_room", e))?
    {
        let id: i64 = row.get(0).map_err(row_err)?;
        let priority: i64 = row.get(1).map_err(row_err)?;
        if priority > placement.priority {
            return Ok(Room::Full);
        }
        evicted.push(EntryId(id));
    }
    drop(rows);

    if (evicted.len() as u64) < needed {
        // Not enough pending entries; in-flight ones are never evicted.
        return Ok(Room::Full);
    }
    for id in &evicted {
        conn.execute("DELETE FROM queue_entries WHERE id = ?1", params![id.0])
            .await
            .map_err(|e| DatabaseError::from_libsql("make_room", e))?;
    }
    Ok(Room::Available { evicted })
}

async fn insert_entry(
    conn: &Connection,
    key: &ItemKey,
    placement: &Placement,
    now: &str,
) -> Result<EntryId, DatabaseError> {
    let mut rows = conn
        .query(
            "INSERT INTO queue_entries
                (item_key, priority, earliest_at, status, attempt, created_at, updated_at)
             VALUES (?1, ?2, ?3, 'pending', ?4, ?5, ?5)
             RETURNING id",
            params![
                key.as_str(),
                placement.priority,
                fmt_ts(placement.earliest_at),
                placement.attempt as i64,
                now,
            ],
        )
        .await
        .map_err(|e| DatabaseError::from_libsql("insert_entry", e))?;
    let row = rows
        .next()
        .await
        .map_err(|e| DatabaseError::from_libsql("insert_entry", e))?
        .ok_or_else(|| DatabaseError::Query("insert_entry: no id returned".into()))?;
    Ok(EntryId(row.get(0).map_err(row_err)?))
}

async fn admit_in_tx(
    conn: &Connection,
    item: &Item,
    placement: &Placement,
) -> Result<Admission, DatabaseError> {
    let now = fmt_ts(Utc::now());

    let inserted = conn
        .execute(
            "INSERT INTO dedup_records (key, first_seen_at) VALUES (?1, ?2)
             ON CONFLICT(key) DO NOTHING",
            params![item.key.as_str(), fmt_ts(item.discovered_at)],
        )
        .await
        .map_err(|e| DatabaseError::from_libsql("try_admit", e))?;
    if inserted == 0 {
        return Ok(Admission::Duplicate);
    }

    let attributes = serde_json::to_string(&item.attributes)
        .map_err(|e| DatabaseError::Serialization(format!("item attributes: {e}")))?;
    conn.execute(
        "INSERT OR REPLACE INTO items
            (key, title, brand, category, price, url, attributes, discovered_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            item.key.as_str(),
            item.title.as_str(),
            opt_text(item.brand.as_deref()),
            opt_text(item.category.as_deref()),
            opt_text(item.price.map(|p| p.to_string()).as_deref()),
            opt_text(item.url.as_deref()),
            attributes,
            fmt_ts(item.discovered_at),
        ],
    )
    .await
    .map_err(|e| DatabaseError::from_libsql("try_admit", e))?;

    let evicted = match make_room(conn, placement).await? {
        Room::Available { evicted } => evicted,
        Room::Full => return Ok(Admission::QueueFull),
    };

    let entry_id = insert_entry(conn, &item.key, placement, &now).await?;
    Ok(Admission::Admitted { entry_id, evicted })
}

async fn enqueue_in_tx(
    conn: &Connection,
    key: &ItemKey,
    placement: &Placement,
) -> Result<EnqueueOutcome, DatabaseError> {
    let mut rows = conn
        .query(
            "SELECT
                EXISTS(SELECT 1 FROM items WHERE key = ?1),
                EXISTS(SELECT 1 FROM queue_entries
                       WHERE item_key = ?1 AND status IN ('pending', 'in_flight'))",
            params![key.as_str()],
        )
        .await
        .map_err(|e| DatabaseError::from_libsql("enqueue", e))?;
    let row = rows
        .next()
        .await
        .map_err(|e| DatabaseError::from_libsql("enqueue", e))?
        .ok_or_else(|| DatabaseError::Query("enqueue: no row".into()))?;
    let known = row.get::<i64>(0).map_err(row_err)? != 0;
    let active = row.get::<i64>(1).map_err(row_err)? != 0;
    drop(rows);

    if !known {
        return Ok(EnqueueOutcome::UnknownItem);
    }
    if active {
        return Ok(EnqueueOutcome::AlreadyActive);
    }

    let evicted = match make_room(conn, placement).await? {
        Room::Available { evicted } => evicted,
        Room::Full => return Ok(EnqueueOutcome::QueueFull),
    };
    let entry_id = insert_entry(conn, key, placement, &fmt_ts(Utc::now())).await?;
    Ok(EnqueueOutcome::Enqueued { entry_id, evicted })
}

async fn prune_in_tx(conn: &Connection, cutoff: &str) -> Result<PruneReport, DatabaseError> {
    let map = |e| DatabaseError::from_libsql("prune", e);

    let entries = conn
        .execute(
            "DELETE FROM queue_entries
             WHERE status IN ('done', 'error')
               AND item_key IN (SELECT key FROM dedup_records WHERE first_seen_at < ?1)
               AND item_key NOT IN (SELECT item_key FROM queue_entries
                                    WHERE status IN ('pending', 'in_flight'))",
            params![cutoff],
        )
        .await
        .map_err(map)?;

    let items = conn
        .execute(
            "DELETE FROM items
             WHERE key IN (SELECT key FROM dedup_records WHERE first_seen_at < ?1)
               AND key NOT IN (SELECT item_key FROM queue_entries
                               WHERE status IN ('pending', 'in_flight'))",
            params![cutoff],
        )
        .await
        .map_err(map)?;

    let dedup_records = conn
        .execute(
            "DELETE FROM dedup_records
             WHERE first_seen_at < ?1
               AND key NOT IN (SELECT item_key FROM queue_entries
                               WHERE status IN ('pending', 'in_flight'))",
            params![cutoff],
        )
        .await
        .map_err(map)?;

    conn.execute("DELETE FROM health_events WHERE at < ?1", params![cutoff])
        .await
        .map_err(map)?;

    Ok(PruneReport {
        dedup_records,
        items,
        entries,
    })
}

async fn swap_health_in_tx(
    conn: &Connection,
    expected_version: i64,
    next: &HealthState,
    event: Option<&HealthEvent>,
) -> Result<bool, DatabaseError> {
    let now = fmt_ts(event.map(|e| e.at).unwrap_or_else(Utc::now));
    let updated = conn
        .execute(
            "UPDATE health_state
             SET mode = ?1, paused_until = ?2, consecutive_failures = ?3,
                 version = version + 1, updated_at = ?4
             WHERE id = 1 AND version = ?5",
            params![
                next.mode.as_str(),
                opt_text(next.paused_until.map(fmt_ts).as_deref()),
                next.consecutive_failures as i64,
                now,
                expected_version,
            ],
        )
        .await
        .map_err(|e| DatabaseError::from_libsql("swap_health", e))?;
    if updated == 0 {
        return Ok(false);
    }
    let Some(event) = event else {
        return Ok(true);
    };

    conn.execute(
        "INSERT INTO health_events (from_mode, to_mode, reason, paused_until, at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            event.from.as_str(),
            event.to.as_str(),
            event.reason.as_str(),
            opt_text(event.paused_until.map(fmt_ts).as_deref()),
            fmt_ts(event.at),
        ],
    )
    .await
    .map_err(|e| DatabaseError::from_libsql("swap_health", e))?;
    Ok(true)
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl Store for LibSqlBackend {
    async fn init_schema(&self) -> Result<(), DatabaseError> {
        let conn = self.conn().await;
        migrations::run_migrations(&conn).await
    }

    // ── Admission ───────────────────────────────────────────────────

    async fn try_admit(
        &self,
        item: &Item,
        placement: &Placement,
    ) -> Result<Admission, DatabaseError> {
        let conn = self.conn().await;
        let tx = begin_immediate(&conn, "try_admit").await?;
        let result = admit_in_tx(&tx, item, placement).await;
        let admission = finish(tx, result, Admission::admitted, "try_admit").await?;

        debug!(key = %item.key, result = ?admission, "Admission attempted");
        Ok(admission)
    }

    async fn get_item(&self, key: &ItemKey) -> Result<Option<Item>, DatabaseError> {
        let conn = self.conn().await;
        let mut rows = conn
            .query(
                &format!("SELECT {ITEM_COLUMNS} FROM items WHERE key = ?1"),
                params![key.as_str()],
            )
            .await
            .map_err(|e| DatabaseError::from_libsql("get_item", e))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_item(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::from_libsql("get_item", e)),
        }
    }

    async fn first_seen(&self, key: &ItemKey) -> Result<Option<DateTime<Utc>>, DatabaseError> {
        let conn = self.conn().await;
        let mut rows = conn
            .query(
                "SELECT first_seen_at FROM dedup_records WHERE key = ?1",
                params![key.as_str()],
            )
            .await
            .map_err(|e| DatabaseError::from_libsql("first_seen", e))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let s: String = row.get(0).map_err(row_err)?;
                Ok(Some(parse_datetime(&s)))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::from_libsql("first_seen", e)),
        }
    }

    async fn count_dedup_records(&self) -> Result<u64, DatabaseError> {
        let conn = self.conn().await;
        let mut rows = conn
            .query("SELECT COUNT(*) FROM dedup_records", ())
            .await
            .map_err(|e| DatabaseError::from_libsql("count_dedup_records", e))?;
        let row = rows
            .next()
            .await
            .map_err(|e| DatabaseError::from_libsql("count_dedup_records", e))?
            .ok_or_else(|| DatabaseError::Query("count_dedup_records: no row".into()))?;
        Ok(row.get::<i64>(0).map_err(row_err)?.max(0) as u64)
    }

    async fn prune(&self, older_than: DateTime<Utc>) -> Result<PruneReport, DatabaseError> {
        let conn = self.conn().await;
        let tx = begin_immediate(&conn, "prune").await?;
        let result = prune_in_tx(&tx, &fmt_ts(older_than)).await;
        let report = finish(tx, result, |_| true, "prune").await?;

        if report != PruneReport::default() {
            info!(
                dedup_records = report.dedup_records,
                items = report.items,
                entries = report.entries,
                "Pruned expired records"
            );
        }
        Ok(report)
    }

    // ── Queue ───────────────────────────────────────────────────────

    async fn enqueue(
        &self,
        key: &ItemKey,
        placement: &Placement,
    ) -> Result<EnqueueOutcome, DatabaseError> {
        let conn = self.conn().await;
        let tx = begin_immediate(&conn, "enqueue").await?;
        let result = enqueue_in_tx(&tx, key, placement).await;
        finish(
            tx,
            result,
            |o| matches!(o, EnqueueOutcome::Enqueued { .. }),
            "enqueue",
        )
        .await
    }

    async fn dequeue(&self, now: DateTime<Utc>) -> Result<Option<QueueEntry>, DatabaseError> {
        let now = fmt_ts(now);
        let conn = self.conn().await;
        let mut rows = conn
            .query(
                &format!(
                    "UPDATE queue_entries SET status = 'in_flight', updated_at = ?1
                     WHERE id = (
                         SELECT id FROM queue_entries
                         WHERE status = 'pending' AND earliest_at <= ?1
                         ORDER BY priority DESC, earliest_at ASC, id ASC
                         LIMIT 1
                     ) AND status = 'pending'
                     RETURNING {ENTRY_COLUMNS}"
                ),
                params![now],
            )
            .await
            .map_err(|e| DatabaseError::from_libsql("dequeue", e))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_entry(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::from_libsql("dequeue", e)),
        }
    }

    async fn complete(
        &self,
        id: EntryId,
        status: EntryStatus,
        reason: Option<&str>,
    ) -> Result<Transition, DatabaseError> {
        let conn = self.conn().await;

        if EntryStatus::InFlight.can_transition_to(status) {
            let updated = conn
                .execute(
                    "UPDATE queue_entries SET status = ?1, error_reason = ?2, updated_at = ?3
                     WHERE id = ?4 AND status = 'in_flight'",
                    params![status.as_str(), opt_text(reason), fmt_ts(Utc::now()), id.0],
                )
                .await
                .map_err(|e| DatabaseError::from_libsql("complete", e))?;
            if updated > 0 {
                return Ok(Transition::Applied);
            }
        }

        let mut rows = conn
            .query(
                "SELECT status FROM queue_entries WHERE id = ?1",
                params![id.0],
            )
            .await
            .map_err(|e| DatabaseError::from_libsql("complete", e))?;
        match rows
            .next()
            .await
            .map_err(|e| DatabaseError::from_libsql("complete", e))?
        {
            Some(row) => {
                let s: String = row.get(0).map_err(row_err)?;
                let current = EntryStatus::from_str(&s).map_err(DatabaseError::Serialization)?;
                Ok(Transition::Refused { current })
            }
            None => Ok(Transition::NotFound),
        }
    }

    async fn get_entry(&self, id: EntryId) -> Result<Option<QueueEntry>, DatabaseError> {
        let conn = self.conn().await;
        let mut rows = conn
            .query(
                &format!("SELECT {ENTRY_COLUMNS} FROM queue_entries WHERE id = ?1"),
                params![id.0],
            )
            .await
            .map_err(|e| DatabaseError::from_libsql("get_entry", e))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_entry(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::from_libsql("get_entry", e)),
        }
    }

    async fn list_entries(&self, status: EntryStatus) -> Result<Vec<QueueEntry>, DatabaseError> {
        let conn = self.conn().await;
        let mut rows = conn
            .query(
                &format!("SELECT {ENTRY_COLUMNS} FROM queue_entries WHERE status = ?1 ORDER BY id"),
                params![status.as_str()],
            )
            .await
            .map_err(|e| DatabaseError::from_libsql("list_entries", e))?;

        let mut entries = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::from_libsql("list_entries", e))?
        {
            entries.push(row_to_entry(&row)?);
        }
        Ok(entries)
    }

    async fn entries_for_key(&self, key: &ItemKey) -> Result<Vec<QueueEntry>, DatabaseError> {
        let conn = self.conn().await;
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {ENTRY_COLUMNS} FROM queue_entries WHERE item_key = ?1 ORDER BY id"
                ),
                params![key.as_str()],
            )
            .await
            .map_err(|e| DatabaseError::from_libsql("entries_for_key", e))?;

        let mut entries = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::from_libsql("entries_for_key", e))?
        {
            entries.push(row_to_entry(&row)?);
        }
        Ok(entries)
    }

    async fn queue_stats(&self) -> Result<QueueStats, DatabaseError> {
        let conn = self.conn().await;
        let mut rows = conn
            .query(
                "SELECT status, COUNT(*) FROM queue_entries GROUP BY status",
                (),
            )
            .await
            .map_err(|e| DatabaseError::from_libsql("queue_stats", e))?;

        let mut stats = QueueStats::default();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::from_libsql("queue_stats", e))?
        {
            let status: String = row.get(0).map_err(row_err)?;
            let count = row.get::<i64>(1).map_err(row_err)?.max(0) as u64;
            match EntryStatus::from_str(&status) {
                Ok(EntryStatus::Pending) => stats.pending = count,
                Ok(EntryStatus::InFlight) => stats.in_flight = count,
                Ok(EntryStatus::Done) => stats.done = count,
                Ok(EntryStatus::Error) => stats.error = count,
                Err(e) => warn!(error = %e, "Ignoring unknown queue status"),
            }
        }
        Ok(stats)
    }

    // ── Health ──────────────────────────────────────────────────────

    async fn load_health(&self) -> Result<HealthRecord, DatabaseError> {
        let conn = self.conn().await;
        let mut rows = conn
            .query(
                "SELECT mode, paused_until, consecutive_failures, version
                 FROM health_state WHERE id = 1",
                (),
            )
            .await
            .map_err(|e| DatabaseError::from_libsql("load_health", e))?;

        let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::from_libsql("load_health", e))?
        else {
            return Ok(HealthRecord {
                state: HealthState::healthy(),
                version: 0,
            });
        };

        let mode_str: String = row.get(0).map_err(row_err)?;
        let mode = HealthMode::from_str(&mode_str).map_err(DatabaseError::Serialization)?;
        let paused_until: Option<String> = row.get(1).ok();
        Ok(HealthRecord {
            state: HealthState {
                mode,
                paused_until: paused_until.as_deref().map(parse_datetime),
                consecutive_failures: row.get::<i64>(2).map_err(row_err)?.max(0) as u32,
            },
            version: row.get(3).map_err(row_err)?,
        })
    }

    async fn swap_health(
        &self,
        expected_version: i64,
        next: &HealthState,
        event: Option<&HealthEvent>,
    ) -> Result<bool, DatabaseError> {
        let conn = self.conn().await;
        let tx = begin_immediate(&conn, "swap_health").await?;
        let result = swap_health_in_tx(&tx, expected_version, next, event).await;
        finish(tx, result, |swapped| *swapped, "swap_health").await
    }

    async fn recent_health_events(&self, limit: usize) -> Result<Vec<HealthEvent>, DatabaseError> {
        let conn = self.conn().await;
        let mut rows = conn
            .query(
                "SELECT from_mode, to_mode, reason, paused_until, at
                 FROM health_events ORDER BY id DESC LIMIT ?1",
                params![limit as i64],
            )
            .await
            .map_err(|e| DatabaseError::from_libsql("recent_health_events", e))?;

        let mut events = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::from_libsql("recent_health_events", e))?
        {
            let from: String = row.get(0).map_err(row_err)?;
            let to: String = row.get(1).map_err(row_err)?;
            let paused_until: Option<String> = row.get(3).ok();
            let at: String = row.get(4).map_err(row_err)?;
            events.push(HealthEvent {
                from: HealthMode::from_str(&from).map_err(DatabaseError::Serialization)?,
                to: HealthMode::from_str(&to).map_err(DatabaseError::Serialization)?,
                reason: row.get(2).map_err(row_err)?,
                paused_until: paused_until.as_deref().map(parse_datetime),
                at: parse_datetime(&at),
            });
        }
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;
    use rust_decimal_macros::dec;

    use super::*;
    use crate::items::RawItem;

    async fn test_db() -> LibSqlBackend {
        LibSqlBackend::new_memory().await.unwrap()
    }

    fn make_item(key: &str) -> Item {
        Item::from_raw(
            ItemKey::new(key),
            RawItem::new(format!("Item {key}"))
                .with_brand("Acme")
                .with_price(dec!(1999.90)),
            Utc::now(),
        )
    }

    fn placement(priority: i64, capacity: usize, policy: BackpressurePolicy) -> Placement {
        Placement {
            priority,
            earliest_at: Utc::now() - Duration::seconds(1),
            attempt: 0,
            capacity,
            policy,
        }
    }

    fn open(priority: i64) -> Placement {
        placement(priority, 100, BackpressurePolicy::Reject)
    }

    // ── Admission tests ─────────────────────────────────────────────

    #[tokio::test]
    async fn admit_then_duplicate() {
        let db = test_db().await;
        let item = make_item("id:123456");

        let first = db.try_admit(&item, &open(0)).await.unwrap();
        assert!(first.admitted());
        let second = db.try_admit(&item, &open(0)).await.unwrap();
        assert_eq!(second, Admission::Duplicate);

        assert_eq!(db.count_dedup_records().await.unwrap(), 1);
        assert_eq!(db.entries_for_key(&item.key).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn item_round_trips() {
        let db = test_db().await;
        let mut item = make_item("offer:abc");
        item.attributes
            .insert("old_price".into(), serde_json::json!("2999.90"));
        db.try_admit(&item, &open(0)).await.unwrap();

        let fetched = db.get_item(&item.key).await.unwrap().unwrap();
        assert_eq!(fetched.title, item.title);
        assert_eq!(fetched.brand.as_deref(), Some("Acme"));
        assert_eq!(fetched.price, Some(dec!(1999.90)));
        assert_eq!(fetched.attributes["old_price"], "2999.90");
        assert!(db.get_item(&ItemKey::new("offer:nope")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn queue_full_rolls_back_dedup_record() {
        let db = test_db().await;
        let full = placement(0, 1, BackpressurePolicy::Reject);

        assert!(db.try_admit(&make_item("id:1"), &full).await.unwrap().admitted());
        let refused = db.try_admit(&make_item("id:2"), &full).await.unwrap();
        assert_eq!(refused, Admission::QueueFull);

        // The refused key left no trace and can be admitted later.
        assert!(db.first_seen(&ItemKey::new("id:2")).await.unwrap().is_none());
        assert!(db.get_item(&ItemKey::new("id:2")).await.unwrap().is_none());
        assert_eq!(db.count_dedup_records().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn evict_oldest_drops_lowest_priority_pending() {
        let db = test_db().await;
        let cap = |p| placement(p, 2, BackpressurePolicy::EvictOldest);

        let a = db.try_admit(&make_item("id:a"), &cap(5)).await.unwrap();
        let b = db.try_admit(&make_item("id:b"), &cap(1)).await.unwrap();
        let c = db.try_admit(&make_item("id:c"), &cap(3)).await.unwrap();

        match c {
            Admission::Admitted { evicted, .. } => {
                assert_eq!(evicted, vec![b.queue_entry_id().unwrap()])
            }
            other => panic!("expected admission, got {other:?}"),
        }
        assert!(db.get_entry(a.queue_entry_id().unwrap()).await.unwrap().is_some());
        assert!(db.get_entry(b.queue_entry_id().unwrap()).await.unwrap().is_none());
        assert_eq!(db.queue_stats().await.unwrap().depth(), 2);

        // A newcomer that ranks below every pending entry is refused.
        let low = db.try_admit(&make_item("id:d"), &cap(0)).await.unwrap();
        assert_eq!(low, Admission::QueueFull);
    }

    #[tokio::test]
    async fn evict_oldest_prefers_the_earliest_eligible_entry() {
        let db = test_db().await;
        let now = Utc::now();
        let at = |secs_ago: i64| Placement {
            earliest_at: now - Duration::seconds(secs_ago),
            ..placement(1, 2, BackpressurePolicy::EvictOldest)
        };

        // Inserted first, but eligible later than its sibling.
        let recent = db.try_admit(&make_item("id:recent"), &at(10)).await.unwrap();
        let stale = db.try_admit(&make_item("id:stale"), &at(600)).await.unwrap();

        match db.try_admit(&make_item("id:new"), &at(0)).await.unwrap() {
            Admission::Admitted { evicted, .. } => {
                assert_eq!(evicted, vec![stale.queue_entry_id().unwrap()])
            }
            other => panic!("expected admission, got {other:?}"),
        }
        assert!(db.get_entry(recent.queue_entry_id().unwrap()).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn evict_never_touches_in_flight() {
        let db = test_db().await;
        let cap = placement(0, 1, BackpressurePolicy::EvictOldest);
        db.try_admit(&make_item("id:a"), &cap).await.unwrap();
        db.dequeue(Utc::now()).await.unwrap().unwrap();

        let refused = db.try_admit(&make_item("id:b"), &cap).await.unwrap();
        assert_eq!(refused, Admission::QueueFull);
    }

    // ── Queue tests ─────────────────────────────────────────────────

    #[tokio::test]
    async fn dequeue_order_priority_then_time_then_id() {
        let db = test_db().await;
        let now = Utc::now();
        let at = |secs_ago: i64, priority: i64| Placement {
            earliest_at: now - Duration::seconds(secs_ago),
            ..open(priority)
        };

        let low = db.try_admit(&make_item("id:low"), &at(100, 0)).await.unwrap();
        let late = db.try_admit(&make_item("id:late"), &at(10, 5)).await.unwrap();
        let early = db.try_admit(&make_item("id:early"), &at(50, 5)).await.unwrap();
        let tie = db.try_admit(&make_item("id:tie"), &at(50, 5)).await.unwrap();

        let order: Vec<EntryId> = {
            let mut out = Vec::new();
            while let Some(e) = db.dequeue(now).await.unwrap() {
                assert_eq!(e.status, EntryStatus::InFlight);
                out.push(e.id);
            }
            out
        };
        let expected: Vec<EntryId> = [early, tie, late, low]
            .iter()
            .map(|a| a.queue_entry_id().unwrap())
            .collect();
        assert_eq!(order, expected);
    }

    #[tokio::test]
    async fn dequeue_respects_earliest_at() {
        let db = test_db().await;
        let now = Utc::now();
        let future = Placement {
            earliest_at: now + Duration::minutes(10),
            ..open(100)
        };
        db.try_admit(&make_item("id:later"), &future).await.unwrap();

        assert!(db.dequeue(now).await.unwrap().is_none());
        let entry = db
            .dequeue(now + Duration::minutes(10))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(entry.item_key.as_str(), "id:later");
    }

    #[tokio::test]
    async fn complete_only_from_in_flight() {
        let db = test_db().await;
        let id = db
            .try_admit(&make_item("id:1"), &open(0))
            .await
            .unwrap()
            .queue_entry_id()
            .unwrap();

        assert_eq!(
            db.complete(id, EntryStatus::Done, None).await.unwrap(),
            Transition::Refused {
                current: EntryStatus::Pending
            }
        );

        db.dequeue(Utc::now()).await.unwrap().unwrap();
        assert_eq!(
            db.complete(id, EntryStatus::Error, Some("boom")).await.unwrap(),
            Transition::Applied
        );
        assert_eq!(
            db.complete(id, EntryStatus::Done, None).await.unwrap(),
            Transition::Refused {
                current: EntryStatus::Error
            }
        );
        let entry = db.get_entry(id).await.unwrap().unwrap();
        assert_eq!(entry.status, EntryStatus::Error);
        assert_eq!(entry.error_reason.as_deref(), Some("boom"));

        assert_eq!(
            db.complete(EntryId(999), EntryStatus::Done, None).await.unwrap(),
            Transition::NotFound
        );
    }

    #[tokio::test]
    async fn enqueue_follow_up() {
        let db = test_db().await;
        let item = make_item("id:1");
        db.try_admit(&item, &open(0)).await.unwrap();

        // Still pending, so no second active entry.
        assert_eq!(
            db.enqueue(&item.key, &open(0)).await.unwrap(),
            EnqueueOutcome::AlreadyActive
        );
        assert_eq!(
            db.enqueue(&ItemKey::new("id:unknown"), &open(0)).await.unwrap(),
            EnqueueOutcome::UnknownItem
        );

        let entry = db.dequeue(Utc::now()).await.unwrap().unwrap();
        db.complete(entry.id, EntryStatus::Error, Some("timeout"))
            .await
            .unwrap();

        let retry = Placement {
            attempt: 1,
            ..open(0)
        };
        let outcome = db.enqueue(&item.key, &retry).await.unwrap();
        let new_id = outcome.entry_id().unwrap();
        assert!(new_id > entry.id);
        let follow_up = db.get_entry(new_id).await.unwrap().unwrap();
        assert_eq!(follow_up.attempt, 1);
        assert_eq!(follow_up.status, EntryStatus::Pending);
    }

    #[tokio::test]
    async fn queue_stats_counts_by_status() {
        let db = test_db().await;
        for k in ["id:1", "id:2", "id:3"] {
            db.try_admit(&make_item(k), &open(0)).await.unwrap();
        }
        let e = db.dequeue(Utc::now()).await.unwrap().unwrap();
        db.complete(e.id, EntryStatus::Done, None).await.unwrap();
        db.dequeue(Utc::now()).await.unwrap().unwrap();

        let stats = db.queue_stats().await.unwrap();
        assert_eq!(
            stats,
            QueueStats {
                pending: 1,
                in_flight: 1,
                done: 1,
                error: 0
            }
        );
        assert_eq!(db.list_entries(EntryStatus::InFlight).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn prune_keeps_active_keys() {
        let db = test_db().await;
        let old = Utc::now() - Duration::days(40);
        let mut finished = make_item("id:finished");
        finished.discovered_at = old;
        let mut waiting = make_item("id:waiting");
        waiting.discovered_at = old;

        db.try_admit(&finished, &open(10)).await.unwrap();
        db.try_admit(&waiting, &open(0)).await.unwrap();
        let e = db.dequeue(Utc::now()).await.unwrap().unwrap();
        assert_eq!(e.item_key, finished.key);
        db.complete(e.id, EntryStatus::Done, None).await.unwrap();

        let report = db.prune(Utc::now() - Duration::days(30)).await.unwrap();
        assert_eq!(
            report,
            PruneReport {
                dedup_records: 1,
                items: 1,
                entries: 1
            }
        );
        assert!(db.first_seen(&finished.key).await.unwrap().is_none());
        assert!(db.first_seen(&waiting.key).await.unwrap().is_some());
        assert!(db.get_item(&waiting.key).await.unwrap().is_some());
    }

    // ── Health tests ────────────────────────────────────────────────

    #[tokio::test]
    async fn health_starts_healthy() {
        let db = test_db().await;
        let record = db.load_health().await.unwrap();
        assert_eq!(record.state, HealthState::healthy());
        assert_eq!(record.version, 0);
    }

    #[tokio::test]
    async fn swap_health_is_compare_and_swap() {
        let db = test_db().await;
        let until = Utc::now() + Duration::hours(6);
        let next = HealthState {
            mode: HealthMode::Paused,
            paused_until: Some(until),
            consecutive_failures: 0,
        };
        let event = HealthEvent {
            from: HealthMode::Healthy,
            to: HealthMode::Paused,
            reason: "captcha".into(),
            paused_until: Some(until),
            at: Utc::now(),
        };

        assert!(db.swap_health(0, &next, Some(&event)).await.unwrap());
        // Stale version loses and logs nothing.
        assert!(
            !db.swap_health(0, &HealthState::healthy(), Some(&event))
                .await
                .unwrap()
        );

        let record = db.load_health().await.unwrap();
        assert_eq!(record.version, 1);
        assert_eq!(record.state.mode, HealthMode::Paused);
        assert_eq!(
            record.state.paused_until.map(fmt_ts),
            Some(fmt_ts(until))
        );

        let events = db.recent_health_events(10).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].reason, "captcha");
        assert_eq!(events[0].to, HealthMode::Paused);
    }

    #[tokio::test]
    async fn file_database_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("relay.db");

        {
            let db = LibSqlBackend::new_local(&path).await.unwrap();
            db.try_admit(&make_item("id:123456"), &open(0)).await.unwrap();
        }

        let db = LibSqlBackend::new_local(&path).await.unwrap();
        assert_eq!(db.count_dedup_records().await.unwrap(), 1);
        assert_eq!(
            db.try_admit(&make_item("id:123456"), &open(0)).await.unwrap(),
            Admission::Duplicate
        );
    }
}
