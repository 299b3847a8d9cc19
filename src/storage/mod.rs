//! SQLite-backed document storage -- pool, schema, repository.

pub mod repository;
pub mod schema;
pub mod sqlite;

pub use self::repository::{Document, DocumentRepository, Filter, Stored};
pub use self::sqlite::SqliteRepository;

use std::time::Duration;

use r2d2::Pool as R2D2Pool;
use r2d2_sqlite::SqliteConnectionManager;

use crate::config::StorageConfig;
use crate::error::Result;

/// Connection Pool type
pub type Pool = R2D2Pool<SqliteConnectionManager>;

/// Open (or create) the SQLite database and return a connection pool.
pub fn open_pool(cfg: &StorageConfig) -> Result<Pool> {
    if let Some(parent) = cfg.database_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(|e| {
                crate::error::DispatchError::StoreUnavailable(format!(
                    "failed to create {}: {e}",
                    parent.display()
                ))
            })?;
        }
    }

    let busy_timeout = cfg.busy_timeout_ms;
    let manager = SqliteConnectionManager::file(&cfg.database_path).with_init(move |c| {
        c.execute_batch(&format!(
            "PRAGMA journal_mode = WAL;
                 PRAGMA synchronous = NORMAL;
                 PRAGMA temp_store = MEMORY;
                 PRAGMA foreign_keys = ON;
                 PRAGMA busy_timeout = {busy_timeout};"
        ))
    });

    let pool = R2D2Pool::builder()
        .max_size(cfg.pool_size)
        .connection_timeout(Duration::from_millis(cfg.operation_timeout_ms))
        .build(manager)?;

    // Run migrations on a single connection
    let conn = pool.get()?;
    schema::migrate(&conn)?;

    tracing::info!(path = %cfg.database_path.display(), "document store ready");
    Ok(pool)
}
