use crate::core::broker::DbBroker;
use crate::core::error;
use crate::core::schemas;
use rusqlite::Connection;
use std::fs;
use std::path::{Path, PathBuf};

pub fn db_connect(db_path: &str) -> Result<Connection, error::ShelfwiseError> {
    db_connect_pooled(db_path, 5)
}

/// Open a connection with WAL, foreign keys and the given busy timeout.
pub fn db_connect_pooled(
    db_path: &str,
    busy_timeout_secs: u32,
) -> Result<Connection, error::ShelfwiseError> {
    let conn = Connection::open(db_path)?;
    conn.busy_timeout(std::time::Duration::from_secs(busy_timeout_secs as u64))?;
    conn.query_row("PRAGMA journal_mode=WAL;", [], |_| Ok(()))?;
    conn.execute("PRAGMA foreign_keys=ON;", [])?;
    Ok(conn)
}

pub fn registry_db_path(root: &Path) -> PathBuf {
    root.join(schemas::REGISTRY_DB_NAME)
}

pub fn initialize_registry_db(root: &Path) -> Result<(), error::ShelfwiseError> {
    fs::create_dir_all(root).map_err(error::ShelfwiseError::IoError)?;
    let db_path = registry_db_path(root);

    let broker = DbBroker::new(root);
    broker.with_conn(&db_path, "shelfwise", "registry.init", |conn| {
        for stmt in schemas::REGISTRY_DB_SCHEMA {
            conn.execute(stmt, [])?;
        }
        Ok(())
    })?;

    tracing::debug!(path = %db_path.display(), "registry database initialized");
    Ok(())
}
