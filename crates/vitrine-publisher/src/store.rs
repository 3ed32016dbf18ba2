use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Datelike, SecondsFormat, Utc};
use rusqlite::{types::Type, Connection, Row, TransactionBehavior};
use tracing::debug;
use uuid::Uuid;

use crate::error::{Result, StoreError};
use crate::types::{ContentItem, NewContentItem};

const SELECT_COLUMNS: &str = "id, published, scheduled_at, created_at, updated_at";

/// Due-item predicate. `?1` is "now". Comparing through `julianday()` keeps
/// the ordering chronological whatever ISO 8601 form a writer used.
const DUE_PREDICATE: &str = "published = 0
    AND scheduled_at IS NOT NULL
    AND julianday(scheduled_at) <= julianday(?1)";

/// Handle to the content store.
///
/// Wraps a single SQLite connection in a `Mutex`; every method is blocking
/// and is expected to run on the blocking pool when called from async code.
#[derive(Debug)]
pub struct ContentStore {
    db: Mutex<Connection>,
}

impl ContentStore {
    /// Wrap an already-open (and usually `init_db`-initialised) connection.
    pub fn new(conn: Connection) -> Self {
        Self {
            db: Mutex::new(conn),
        }
    }

    /// Publish every draft whose `scheduled_at` is at or before `now`.
    ///
    /// A single `UPDATE … WHERE <predicate> RETURNING id` inside an immediate
    /// transaction: selection and mutation cannot be separated, rows already
    /// flipped by a concurrent caller no longer match, and the returned ids
    /// are exactly the rows this call changed.
    pub fn publish_due(&self, now: DateTime<Utc>) -> Result<Vec<String>> {
        let now = encode_ts(now)?;
        let mut db = self.lock()?;
        let tx = db.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let mut ids = {
            let mut stmt = tx.prepare_cached(&format!(
                "UPDATE content_items
                 SET published = 1, updated_at = ?1
                 WHERE {DUE_PREDICATE}
                 RETURNING id"
            ))?;
            let rows = stmt
                .query_map([&now], |row| row.get::<_, String>(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        };
        tx.commit()?;
        ids.sort();
        Ok(ids)
    }

    /// Number of items [`ContentStore::publish_due`] would change at `now`.
    pub fn count_due(&self, now: DateTime<Utc>) -> Result<u64> {
        let now = encode_ts(now)?;
        let db = self.lock()?;
        let n = db.query_row(
            &format!("SELECT COUNT(*) FROM content_items WHERE {DUE_PREDICATE}"),
            [&now],
            |row| row.get::<_, i64>(0),
        )?;
        Ok(n.max(0) as u64)
    }

    /// Insert a draft item. Stands in for the content CRUD layer in tests
    /// and operator tooling.
    ///
    /// Fails with [`StoreError::TimestampOutOfRange`] before touching the
    /// database if `scheduled_at` cannot be stored.
    pub fn insert(&self, item: NewContentItem) -> Result<ContentItem> {
        let id = item.id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let scheduled = item.scheduled_at.map(encode_ts).transpose()?;
        let now = encode_ts(Utc::now())?;

        let mut db = self.lock()?;
        let tx = db.transaction()?;
        tx.execute(
            "INSERT INTO content_items (id, published, scheduled_at, created_at, updated_at)
             VALUES (?1, 0, ?2, ?3, ?3)",
            rusqlite::params![id, scheduled, now],
        )?;
        // Read back so the returned timestamps carry the stored precision.
        let item = tx.query_row(
            &format!("SELECT {SELECT_COLUMNS} FROM content_items WHERE id = ?1"),
            [&id],
            row_to_item,
        )?;
        tx.commit()?;
        debug!(item_id = %id, scheduled_at = ?scheduled, "content item inserted");
        Ok(item)
    }

    /// Fresh read of a single item, `None` if it does not exist.
    pub fn get(&self, id: &str) -> Result<Option<ContentItem>> {
        let db = self.lock()?;
        match db.query_row(
            &format!("SELECT {SELECT_COLUMNS} FROM content_items WHERE id = ?1"),
            [id],
            row_to_item,
        ) {
            Ok(item) => Ok(Some(item)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(StoreError::Database(e)),
        }
    }

    /// Unpublished items that carry a schedule, soonest first.
    pub fn list_pending(&self) -> Result<Vec<ContentItem>> {
        let db = self.lock()?;
        let mut stmt = db.prepare(&format!(
            "SELECT {SELECT_COLUMNS} FROM content_items
             WHERE published = 0 AND scheduled_at IS NOT NULL
             ORDER BY julianday(scheduled_at), id"
        ))?;
        let items = stmt
            .query_map([], row_to_item)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(items)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.db.lock().map_err(|_| StoreError::Poisoned)
    }
}

/// RFC 3339 with milliseconds (`2026-10-19T08:30:00.000Z`).
///
/// Years outside 0000-9999 have no four-digit form and are rejected.
pub(crate) fn encode_ts(ts: DateTime<Utc>) -> Result<String> {
    if !(0..=9999).contains(&ts.year()) {
        return Err(StoreError::TimestampOutOfRange(ts));
    }
    Ok(ts.to_rfc3339_opts(SecondsFormat::Millis, true))
}

fn decode_ts(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn row_to_item(row: &Row<'_>) -> rusqlite::Result<ContentItem> {
    let scheduled_at = match row.get::<_, Option<String>>(2)? {
        Some(raw) => Some(decode_ts(2, &raw)?),
        None => None,
    };
    Ok(ContentItem {
        id: row.get(0)?,
        published: row.get(1)?,
        scheduled_at,
        created_at: decode_ts(3, &row.get::<_, String>(3)?)?,
        updated_at: decode_ts(4, &row.get::<_, String>(4)?)?,
    })
}
