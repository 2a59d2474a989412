use rusqlite;
use std::env;
use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ShelfwiseError {
    #[error("SQLite error: {0}")]
    RusqliteError(#[from] rusqlite::Error),
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
    #[error("Environment variable error: {0}")]
    EnvVarError(#[from] env::VarError),
    #[error("Configuration error: {0}")]
    ConfigError(String),
    #[error("Validation error: {0}")]
    ValidationError(String),
    #[error("Not found: {0}")]
    NotFound(String),
    /// A registry invariant would be violated (a store already belongs to a group).
    #[error("Conflict: {0}")]
    Conflict(String),
    #[error("Store {store_id} is not a member of group {group_id}")]
    NotAMember { group_id: String, store_id: i64 },
    #[error("Store {store_id} is already a representative or pending candidate")]
    AlreadyPending { store_id: i64 },
}

impl ShelfwiseError {
    /// Invariant violations are surfaced and skipped, never retried.
    pub fn is_invariant_violation(&self) -> bool {
        matches!(
            self,
            ShelfwiseError::Conflict(_)
                | ShelfwiseError::NotAMember { .. }
                | ShelfwiseError::AlreadyPending { .. }
        )
    }
}
