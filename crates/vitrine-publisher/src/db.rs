use rusqlite::Connection;

use crate::error::Result;

/// Initialise the content schema in `conn`.
///
/// Creates the `content_items` table (idempotent) and an index matching the
/// publish predicate so the due-item update stays cheap on large tables.
///
/// Timestamps are ISO 8601 text. Any form SQLite's `julianday()` understands
/// is accepted (with or without fractional seconds, `Z` or a numeric offset);
/// the `CHECK` rejects anything else, so a row the publisher cannot order is
/// never stored. This crate itself writes `2026-10-19T08:30:00.000Z`.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS content_items (
            id           TEXT    NOT NULL PRIMARY KEY,
            published    INTEGER NOT NULL DEFAULT 0,
            scheduled_at TEXT,              -- NULL means never auto-publish
            created_at   TEXT    NOT NULL,
            updated_at   TEXT    NOT NULL,
            CHECK (scheduled_at IS NULL OR julianday(scheduled_at) IS NOT NULL)
        ) STRICT;

        CREATE INDEX IF NOT EXISTS idx_content_items_due
            ON content_items (published, julianday(scheduled_at));
        ",
    )?;
    Ok(())
}
