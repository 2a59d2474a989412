//! SQLite connection pool with read/write separation and retry logic.
//!
//! - Maintains a **write mutex** per DB for serialized in-process write access
//! - Creates fresh **read connections** per operation (no mutex, concurrent via WAL)
//! - Retries writes that hit `SQLITE_BUSY` / `SQLITE_LOCKED` with exponential backoff,
//!   which is how cross-process contention between scraper workers is absorbed
//!
//! Connections are NOT pooled (opened fresh each time) so that separate worker
//! processes never share WAL/SHM file handles.

use crate::core::db;
use crate::core::error::ShelfwiseError;
use rusqlite::Connection;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock};
use std::thread;
use std::time::Duration;

/// Maximum retry attempts for busy/locked errors.
const MAX_RETRIES: u32 = 5;
/// Base delay for exponential backoff (milliseconds).
const BASE_DELAY_MS: u64 = 100;
/// Maximum delay cap (milliseconds).
const MAX_DELAY_MS: u64 = 5_000;

const WRITE_BUSY_TIMEOUT_SECS: u32 = 5;
const READ_BUSY_TIMEOUT_SECS: u32 = 5;

/// Per-database entry holding a write mutex for serialized write access.
struct PoolEntry {
    write_lock: Mutex<()>,
    db_path: PathBuf,
}

pub struct SqlitePool {
    entries: Mutex<HashMap<PathBuf, Arc<PoolEntry>>>,
}

impl SqlitePool {
    fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn get_entry(&self, db_path: &Path) -> Result<Arc<PoolEntry>, ShelfwiseError> {
        let key = db_path.to_path_buf();
        let mut entries = self.entries.lock().map_err(|_| {
            ShelfwiseError::ValidationError("SqlitePool entries lock poisoned".to_string())
        })?;
        let entry = entries.entry(key.clone()).or_insert_with(|| {
            Arc::new(PoolEntry {
                write_lock: Mutex::new(()),
                db_path: key,
            })
        });
        Ok(Arc::clone(entry))
    }

    /// Execute a closure with a write connection for the given DB path.
    ///
    /// The closure may run more than once: a busy/locked failure reopens the
    /// connection and retries the whole unit after a backoff delay.
    pub fn with_write<F, R>(&self, db_path: &Path, mut f: F) -> Result<R, ShelfwiseError>
    where
        F: FnMut(&Connection) -> Result<R, ShelfwiseError>,
    {
        let entry = self.get_entry(db_path)?;
        retry_on_busy(|| {
            let _guard = entry.write_lock.lock().map_err(|_| {
                ShelfwiseError::ValidationError("Pool write lock poisoned".to_string())
            })?;
            let conn = db::db_connect_pooled(
                &entry.db_path.to_string_lossy(),
                WRITE_BUSY_TIMEOUT_SECS,
            )?;
            f(&conn)
        })
    }

    /// Execute a closure with a read connection (no mutex serialization).
    pub fn with_read<F, R>(&self, db_path: &Path, f: F) -> Result<R, ShelfwiseError>
    where
        F: FnOnce(&Connection) -> Result<R, ShelfwiseError>,
    {
        let conn = db::db_connect_pooled(&db_path.to_string_lossy(), READ_BUSY_TIMEOUT_SECS)?;
        f(&conn)
    }
}

/// Retry a closure on `SQLITE_BUSY` / `SQLITE_LOCKED` with exponential backoff.
pub fn retry_on_busy<F, R>(mut f: F) -> Result<R, ShelfwiseError>
where
    F: FnMut() -> Result<R, ShelfwiseError>,
{
    let mut attempt = 0u32;
    loop {
        match f() {
            Ok(v) => return Ok(v),
            Err(e) if is_busy_error(&e) && attempt < MAX_RETRIES => {
                attempt += 1;
                let delay_ms = backoff_delay_ms(attempt);
                tracing::debug!(attempt, delay_ms, "sqlite busy, retrying");
                thread::sleep(Duration::from_millis(delay_ms));
            }
            Err(e) => return Err(e),
        }
    }
}

fn backoff_delay_ms(attempt: u32) -> u64 {
    (BASE_DELAY_MS * 2u64.pow(attempt.saturating_sub(1))).min(MAX_DELAY_MS)
}

/// Check if an error is a SQLite busy/locked error that is retryable.
pub fn is_busy_error(err: &ShelfwiseError) -> bool {
    match err {
        ShelfwiseError::RusqliteError(rusqlite::Error::SqliteFailure(code, _)) => matches!(
            code.code,
            rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
        ),
        _ => false,
    }
}

/// Global pool instance (same lifetime as the process).
pub fn global_pool() -> &'static SqlitePool {
    static POOL: OnceLock<SqlitePool> = OnceLock::new();
    POOL.get_or_init(SqlitePool::new)
}
