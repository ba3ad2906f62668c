use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Datelike, SecondsFormat, Utc};
use rusqlite::Connection;

use crate::error::Result;

/// Initialise the scheduler schema in `conn`.
///
/// Creates the `schedule_items` and `publish_attempts` tables (idempotent)
/// plus the index the due-item scan relies on.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS schedule_items (
            id                TEXT    NOT NULL PRIMARY KEY,
            owner_id          TEXT    NOT NULL,
            content           TEXT    NOT NULL,
            media_refs        TEXT    NOT NULL DEFAULT '[]',  -- JSON array
            platforms         TEXT    NOT NULL,               -- JSON array
            kind              TEXT    NOT NULL,
            status            TEXT    NOT NULL DEFAULT 'pending',
            next_run_at       TEXT,                           -- NULL once completed/cancelled
            occurrence_at     TEXT,                           -- recurrence anchor
            recurrence        TEXT,                           -- JSON, NULL for one-shot
            occurrence_count  INTEGER NOT NULL DEFAULT 0,
            attempt_count     INTEGER NOT NULL DEFAULT 0,
            max_attempts      INTEGER NOT NULL,
            last_error        TEXT,
            claim_token       TEXT,                           -- set only while in flight
            claimed_at        TEXT,
            pre_claim_status  TEXT,
            created_at        TEXT    NOT NULL,
            updated_at        TEXT    NOT NULL,
            completed_at      TEXT
        ) STRICT;

        -- Due scan: WHERE status IN (...) AND next_run_at <= ? ORDER BY next_run_at
        CREATE INDEX IF NOT EXISTS idx_items_due
            ON schedule_items (status, next_run_at);
        CREATE INDEX IF NOT EXISTS idx_items_owner
            ON schedule_items (owner_id, created_at);

        CREATE TABLE IF NOT EXISTS publish_attempts (
            id                INTEGER PRIMARY KEY AUTOINCREMENT,
            item_id           TEXT    NOT NULL,
            occurrence        INTEGER NOT NULL,
            attempt           INTEGER NOT NULL,
            platform          TEXT    NOT NULL,
            success           INTEGER NOT NULL,
            external_post_id  TEXT,
            error             TEXT,
            created_at        TEXT    NOT NULL
        ) STRICT;

        CREATE INDEX IF NOT EXISTS idx_attempts_item
            ON publish_attempts (item_id, id);
        ",
    )?;
    Ok(())
}

/// Open a connection suitable for sharing a database file between several
/// scanners: WAL journal, a busy timeout so writers queue, schema applied.
pub fn open(path: impl AsRef<Path>, busy_timeout: Duration) -> Result<Connection> {
    let conn = Connection::open(path)?;
    conn.busy_timeout(busy_timeout)?;
    conn.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))?;
    init_db(&conn)?;
    Ok(conn)
}

/// Fixed-width UTC timestamp so that SQL text comparison orders correctly.
///
/// Only four-digit years keep the width fixed; see [`is_storable`].
pub(crate) fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub(crate) fn parse_ts(s: &str) -> std::result::Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(s).map(|dt| dt.with_timezone(&Utc))
}

/// Whether `dt` can be written by [`ts`] and read back by [`parse_ts`].
///
/// chrono renders years past 9999 as `+10000-...`, which neither sorts
/// against four-digit years nor parses as RFC 3339.
pub fn is_storable(dt: DateTime<Utc>) -> bool {
    (0..=9999).contains(&dt.year())
}
