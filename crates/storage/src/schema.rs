use rusqlite::Connection;

use crate::error::StorageError;

pub const SCHEMA_VERSION: i32 = 1;

pub fn init_schema(conn: &Connection) -> Result<(), StorageError> {
    conn.execute_batch(
        "
        PRAGMA journal_mode = WAL;
        PRAGMA synchronous = NORMAL;
        PRAGMA foreign_keys = ON;
        PRAGMA cache_size = -32000;
        PRAGMA busy_timeout = 5000;
    ",
    )?;
    conn.execute_batch(SCHEMA_SQL)?;
    Ok(())
}

// Timestamps are milliseconds since the Unix epoch.
const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER PRIMARY KEY,
    applied_at INTEGER NOT NULL
);
INSERT OR IGNORE INTO schema_version (version, applied_at) VALUES (1, unixepoch());

CREATE TABLE IF NOT EXISTS bundles (
    bundle_id BLOB PRIMARY KEY CHECK (length(bundle_id) = 16),
    bundle_key TEXT NOT NULL,
    account_id BLOB NOT NULL CHECK (length(account_id) = 16),
    start_date INTEGER NOT NULL,
    last_system_update_time INTEGER NOT NULL,
    UNIQUE (account_id, bundle_key)
);

CREATE TABLE IF NOT EXISTS subscriptions (
    subscription_id BLOB PRIMARY KEY CHECK (length(subscription_id) = 16),
    bundle_id BLOB NOT NULL REFERENCES bundles (bundle_id),
    category TEXT NOT NULL,
    start_date INTEGER NOT NULL,
    bundle_start_date INTEGER NOT NULL,
    align_start_date INTEGER NOT NULL,
    charged_through_date INTEGER,
    active_version INTEGER NOT NULL CHECK (active_version >= 1)
);
CREATE INDEX IF NOT EXISTS idx_subscriptions_bundle ON subscriptions (bundle_id);

CREATE TABLE IF NOT EXISTS events (
    total_ordering INTEGER PRIMARY KEY AUTOINCREMENT,
    event_id BLOB NOT NULL CHECK (length(event_id) = 16),
    subscription_id BLOB NOT NULL REFERENCES subscriptions (subscription_id),
    event_type TEXT NOT NULL,
    effective_date INTEGER NOT NULL,
    processed_date INTEGER NOT NULL,
    requested_date INTEGER NOT NULL,
    payload BLOB NOT NULL,
    active_version INTEGER NOT NULL,
    created_by TEXT NOT NULL,
    UNIQUE (event_id, active_version)
);
CREATE INDEX IF NOT EXISTS idx_events_visible ON events (subscription_id, active_version, effective_date, total_ordering);

CREATE TABLE IF NOT EXISTS repairs (
    repair_id INTEGER PRIMARY KEY AUTOINCREMENT,
    bundle_id BLOB NOT NULL REFERENCES bundles (bundle_id),
    subscriptions BLOB NOT NULL,
    event_count INTEGER NOT NULL,
    checksum BLOB NOT NULL CHECK (length(checksum) = 32),
    created_by TEXT NOT NULL,
    created_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_repairs_bundle ON repairs (bundle_id);

CREATE TABLE IF NOT EXISTS bundle_locks (
    bundle_id BLOB PRIMARY KEY CHECK (length(bundle_id) = 16),
    owner TEXT NOT NULL,
    acquired_at INTEGER NOT NULL
);
";
