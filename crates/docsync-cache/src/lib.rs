//! docsync Cache - Change store persistence
//!
//! SQLite-based storage for:
//! - The last synchronized state of every tracked file and folder
//! - Per-operation retry counters
//! - Per-folder change-log tokens and first-sync markers
//!
//! ## Architecture
//!
//! This crate implements the `IChangeStore` port from `docsync-core`
//! using SQLite as the storage backend. It is a driven (secondary) adapter
//! in the hexagonal architecture.
//!
//! ## Usage
//!
//! ```no_run
//! use std::path::Path;
//! use docsync_cache::DatabasePool;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let db = DatabasePool::new(Path::new("/home/user/.local/share/docsync/docsync.db")).await?;
//! let store = db.store("team");
//! // Use store as IChangeStore...
//! # Ok(())
//! # }
//! ```

pub mod pool;
pub mod store;

pub use pool::DatabasePool;
pub use store::SqliteChangeStore;

/// Errors that can occur during change store operations
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// Failed to establish a database connection
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// A database query failed
    #[error("Query failed: {0}")]
    QueryFailed(String),

    /// Schema migration failed
    #[error("Migration failed: {0}")]
    MigrationFailed(String),

    /// A stored value could not be converted to its domain type
    #[error("Serialization error: {0}")]
    SerializationError(String),
}

impl From<sqlx::Error> for CacheError {
    fn from(e: sqlx::Error) -> Self {
        CacheError::QueryFailed(e.to_string())
    }
}
