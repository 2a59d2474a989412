//! Core modules shared by every subsystem.
//!
//! Persistence (db, pool, broker, schemas), configuration, logging, the store
//! record, and the error taxonomy live here.

pub mod broker;
pub mod config;
pub mod db;
pub mod error;
pub mod logging;
pub mod output;
pub mod pool;
pub mod schemas;
pub mod store;
pub mod time;
