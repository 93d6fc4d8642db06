//! Pairdrive Store - Durable sync database
//!
//! The only durable state of the engine: the node table mapping logical
//! objects to their per-replica identifiers, the sync-node sets (temporary
//! blacklists), per-node error counts, and a small key/value meta table for
//! the remote listing cursor.

mod pool;
mod sync_db;

pub use pool::DbPool;
pub use sync_db::{NewNode, NodeRecord, SyncDb, SyncNodeSet};

use thiserror::Error;

/// Errors surfaced by the store
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Schema migration failed: {0}")]
    MigrationFailed(String),

    #[error("Query failed: {0}")]
    Query(#[from] sqlx::Error),

    #[error("Corrupt row: {0}")]
    CorruptRow(String),
}
