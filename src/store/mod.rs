//! Change-Decision Store - SQLite-backed record of every tracked file
//!
//! One row per absolute file path holding the last-seen content hash, the
//! time it was last processed and the delivery status of that attempt. The
//! store is shared between concurrent file-processing tasks; every operation
//! is a single statement executed under the connection lock, so a reader never
//! observes a half-written record.

use chrono::{TimeZone, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::error::{StoreError, StoreResult};

mod schema;
pub mod types;

pub use schema::LATEST_SCHEMA_VERSION;
pub use types::{DeliveryStatus, TrackedFile};

pub struct ChangeStore {
    conn: Mutex<Option<Connection>>,
    file_path: Option<PathBuf>,
}

impl ChangeStore {
    /// Open (or create) the store at `db_path` and run pending migrations
    pub fn open<P: AsRef<Path>>(db_path: P) -> StoreResult<Self> {
        let file_path = db_path.as_ref().to_path_buf();
        let conn = connect(&file_path)?;

        Ok(Self {
            conn: Mutex::new(Some(conn)),
            file_path: Some(file_path),
        })
    }

    /// Open a throwaway store that lives only as long as this value
    pub fn open_in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        schema::initialize(&conn)?;
        Ok(Self {
            conn: Mutex::new(Some(conn)),
            file_path: None,
        })
    }

    pub fn file_path(&self) -> Option<&Path> {
        self.file_path.as_deref()
    }

    pub fn schema_version(&self) -> StoreResult<i32> {
        self.with_conn(schema::schema_version)
    }

    /// Look up the record for `path`
    pub fn get(&self, path: &Path) -> StoreResult<Option<TrackedFile>> {
        let key = path_key(path)?;
        let row = self.with_conn(|conn| {
            conn.query_row(
                "SELECT path, hash, last_processed, status FROM tracked_files WHERE path = ?1",
                params![key],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                },
            )
            .optional()
            .map_err(StoreError::from)
        })?;

        row.map(into_tracked_file).transpose()
    }

    /// Insert or replace the record for `path`, stamping it with the current time
    pub fn upsert(&self, path: &Path, hash: &str, status: DeliveryStatus) -> StoreResult<()> {
        let key = path_key(path)?;
        let now = Utc::now().timestamp_millis();
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO tracked_files (path, hash, last_processed, status)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(path) DO UPDATE SET
                    hash = excluded.hash,
                    last_processed = excluded.last_processed,
                    status = excluded.status",
                params![key, hash, now, status.as_str()],
            )?;
            Ok(())
        })?;

        debug!("Recorded {} as {} ({})", key, status, short_hash(hash));
        Ok(())
    }

    /// Update only the status of an existing record. Returns false if the path is untracked.
    pub fn set_status(&self, path: &Path, status: DeliveryStatus) -> StoreResult<bool> {
        let key = path_key(path)?;
        let now = Utc::now().timestamp_millis();
        let updated = self.with_conn(|conn| {
            conn.execute(
                "UPDATE tracked_files SET status = ?2, last_processed = ?3 WHERE path = ?1",
                params![key, status.as_str(), now],
            )
            .map_err(StoreError::from)
        })?;
        Ok(updated > 0)
    }

    /// Forget `path`. Returns false if it was not tracked.
    pub fn delete(&self, path: &Path) -> StoreResult<bool> {
        let key = path_key(path)?;
        let deleted = self.with_conn(|conn| {
            conn.execute("DELETE FROM tracked_files WHERE path = ?1", params![key])
                .map_err(StoreError::from)
        })?;
        if deleted > 0 {
            debug!("Untracked {}", key);
        }
        Ok(deleted > 0)
    }

    pub fn count(&self) -> StoreResult<i64> {
        self.with_conn(|conn| {
            conn.query_row("SELECT COUNT(*) FROM tracked_files", [], |row| row.get(0))
                .map_err(StoreError::from)
        })
    }

    pub fn count_by_status(&self, status: DeliveryStatus) -> StoreResult<i64> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM tracked_files WHERE status = ?1",
                params![status.as_str()],
                |row| row.get(0),
            )
            .map_err(StoreError::from)
        })
    }

    /// All records with the given status, oldest first
    pub fn list_by_status(&self, status: DeliveryStatus) -> StoreResult<Vec<TrackedFile>> {
        let rows = self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT path, hash, last_processed, status FROM tracked_files
                 WHERE status = ?1 ORDER BY last_processed, path",
            )?;
            let rows = stmt
                .query_map(params![status.as_str()], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })?;

        rows.into_iter().map(into_tracked_file).collect()
    }

    /// Close the underlying connection. Later calls fail with `StoreError::Closed`.
    pub fn close(&self) -> StoreResult<()> {
        let conn = self.lock().take();
        match conn {
            Some(conn) => {
                conn.close().map_err(|(_, e)| StoreError::from(e))?;
                info!("Change store closed");
                Ok(())
            }
            None => Ok(()),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.lock().is_none()
    }

    /// Reconnect a closed on-disk store. A no-op while open; an in-memory
    /// store cannot be reopened since its contents died with the connection.
    pub fn reopen(&self) -> StoreResult<()> {
        let mut guard = self.lock();
        if guard.is_some() {
            return Ok(());
        }

        let file_path = self.file_path.as_deref().ok_or(StoreError::Closed)?;
        *guard = Some(connect(file_path)?);
        Ok(())
    }

    fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> StoreResult<T>) -> StoreResult<T> {
        let guard = self.lock();
        let conn = guard.as_ref().ok_or(StoreError::Closed)?;
        f(conn)
    }

    fn lock(&self) -> MutexGuard<'_, Option<Connection>> {
        match self.conn.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!("Change store mutex poisoned, recovering: {}", poisoned);
                poisoned.into_inner()
            }
        }
    }
}

fn connect(file_path: &Path) -> StoreResult<Connection> {
    info!("Opening change store at: {}", file_path.display());

    if let Some(parent) = file_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let conn = Connection::open(file_path)?;

    // Several processing tasks may write at once - wait for locks instead of failing
    conn.busy_timeout(std::time::Duration::from_millis(5000))?;
    let journal: String = conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
    debug!("Change store journal mode: {}", journal);

    schema::initialize(&conn)?;
    Ok(conn)
}

/// Keys are the path text; a lossy conversion would let distinct paths collide
fn path_key(path: &Path) -> StoreResult<&str> {
    path.to_str()
        .ok_or_else(|| StoreError::NonUtf8Path(path.to_path_buf()))
}

fn short_hash(hash: &str) -> &str {
    hash.get(..12).unwrap_or(hash)
}

fn into_tracked_file(
    (path, hash, last_processed, status): (String, String, i64, String),
) -> StoreResult<TrackedFile> {
    Ok(TrackedFile {
        path,
        hash,
        last_processed: Utc
            .timestamp_millis_opt(last_processed)
            .single()
            .unwrap_or_default(),
        status: status.parse()?,
    })
}
