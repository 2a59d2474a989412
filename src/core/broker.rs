use crate::core::error;
use crate::core::pool;
use crate::core::schemas;
use crate::core::time;
use rusqlite::{Connection, Transaction, TransactionBehavior};
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

/// The DB Broker is the thin waist for registry access.
///
/// Every mutation goes through the pool's write path (serialized per DB, retried on
/// busy) and leaves one line in the append-only audit log.
pub struct DbBroker {
    audit_log_path: PathBuf,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct BrokerEvent {
    pub ts: String,
    pub event_id: String,
    pub actor: String,
    pub op: String,
    pub db_id: String,
    pub status: String,
}

impl DbBroker {
    pub fn new(root: &Path) -> Self {
        Self {
            audit_log_path: root.join(schemas::AUDIT_LOG_NAME),
        }
    }

    pub fn audit_log_path(&self) -> &Path {
        &self.audit_log_path
    }

    /// Execute a closure with a write connection to the specified DB.
    pub fn with_conn<F, R>(
        &self,
        db_path: &Path,
        actor: &str,
        op_name: &str,
        mut f: F,
    ) -> Result<R, error::ShelfwiseError>
    where
        F: FnMut(&Connection) -> Result<R, error::ShelfwiseError>,
    {
        let result = pool::global_pool().with_write(db_path, |conn| f(conn));
        self.audit(db_path, actor, op_name, &result);
        result
    }

    /// Execute a closure inside an IMMEDIATE transaction.
    ///
    /// The transaction commits only if the closure returns `Ok`; any error rolls the
    /// whole unit back. An audit-log failure is logged and never masks the result.
    pub fn with_tx<F, R>(
        &self,
        db_path: &Path,
        actor: &str,
        op_name: &str,
        mut f: F,
    ) -> Result<R, error::ShelfwiseError>
    where
        F: FnMut(&Transaction<'_>) -> Result<R, error::ShelfwiseError>,
    {
        let result = pool::global_pool().with_write(db_path, |conn| {
            let tx = Transaction::new_unchecked(conn, TransactionBehavior::Immediate)?;
            let out = f(&tx)?;
            tx.commit()?;
            Ok(out)
        });
        self.audit(db_path, actor, op_name, &result);
        result
    }

    /// Read-only access; not audited.
    pub fn with_read<F, R>(&self, db_path: &Path, f: F) -> Result<R, error::ShelfwiseError>
    where
        F: FnOnce(&Connection) -> Result<R, error::ShelfwiseError>,
    {
        pool::global_pool().with_read(db_path, f)
    }

    fn audit<R>(
        &self,
        db_path: &Path,
        actor: &str,
        op_name: &str,
        result: &Result<R, error::ShelfwiseError>,
    ) {
        let db_id = db_path
            .file_name()
            .unwrap_or_default()
            .to_string_lossy()
            .to_string();
        let status = match result {
            Ok(_) => "success",
            Err(e) => {
                tracing::debug!(op = op_name, error = %e, "broker operation failed");
                "error"
            }
        };
        if let Err(e) = self.log_event(actor, op_name, &db_id, status) {
            tracing::warn!(op = op_name, status, error = %e, "audit log write failed");
        }
    }

    fn log_event(
        &self,
        actor: &str,
        op: &str,
        db_id: &str,
        status: &str,
    ) -> Result<(), error::ShelfwiseError> {
        let ev = BrokerEvent {
            ts: time::now_epoch_z(),
            event_id: time::new_event_id(),
            actor: actor.to_string(),
            op: op.to_string(),
            db_id: db_id.to_string(),
            status: status.to_string(),
        };

        let mut f = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.audit_log_path)
            .map_err(error::ShelfwiseError::IoError)?;

        writeln!(f, "{}", serde_json::to_string(&ev)?).map_err(error::ShelfwiseError::IoError)?;
        Ok(())
    }
}

pub fn schema() -> serde_json::Value {
    serde_json::json!({
        "name": "broker",
        "version": "0.1.0",
        "description": "Registry mutation broker (serialized, retried, audited)",
        "storage": [schemas::AUDIT_LOG_NAME]
    })
}
