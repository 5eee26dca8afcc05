// Change store schema initialization and migrations

use super::*;
use rusqlite::params;
use tracing::{debug, info};

/// Current schema version - increment when adding migrations
pub const LATEST_SCHEMA_VERSION: i32 = 2;

/// Create the schema and bring it up to `LATEST_SCHEMA_VERSION`
pub(super) fn initialize(conn: &Connection) -> StoreResult<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at INTEGER NOT NULL,
            description TEXT NOT NULL
        )",
        [],
    )?;

    let current_version = schema_version(conn)?;
    if current_version >= LATEST_SCHEMA_VERSION {
        debug!(
            "Change store schema is up-to-date at version {}",
            current_version
        );
        return Ok(());
    }

    info!(
        "Running change store migrations: version {} -> {}",
        current_version, LATEST_SCHEMA_VERSION
    );

    for version in (current_version + 1)..=LATEST_SCHEMA_VERSION {
        let tx = conn.unchecked_transaction()?;
        let description = apply_migration(&tx, version)?;
        tx.execute(
            "INSERT OR REPLACE INTO schema_version (version, applied_at, description)
             VALUES (?1, ?2, ?3)",
            params![version, chrono::Utc::now().timestamp(), description],
        )?;
        tx.commit()?;
        info!("Migration to version {} completed", version);
    }

    Ok(())
}

/// Get the current schema version (0 for a fresh database)
pub fn schema_version(conn: &Connection) -> StoreResult<i32> {
    let version = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )?;
    Ok(version)
}

fn apply_migration(conn: &Connection, version: i32) -> StoreResult<&'static str> {
    match version {
        1 => {
            conn.execute(
                "CREATE TABLE IF NOT EXISTS tracked_files (
                    path TEXT PRIMARY KEY,
                    hash TEXT NOT NULL,
                    last_processed INTEGER NOT NULL,
                    status TEXT NOT NULL DEFAULT 'pending'
                )",
                [],
            )?;
            Ok("Initial tracked_files table")
        }
        2 => {
            conn.execute(
                "CREATE INDEX IF NOT EXISTS idx_tracked_files_hash ON tracked_files(hash)",
                [],
            )?;
            conn.execute(
                "CREATE INDEX IF NOT EXISTS idx_tracked_files_status ON tracked_files(status)",
                [],
            )?;
            Ok("Add hash and status indexes")
        }
        _ => Err(StoreError::UnknownMigration(version)),
    }
}
