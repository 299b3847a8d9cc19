use std::sync::Arc;

use anyhow::{Context, Result};

use crate::config::DispatchConfig;
use crate::dispatch::Dispatcher;
use crate::packaging::Packager;
use crate::storage::{self, SqliteRepository};

/// Shared handles for request handlers and CLI commands.
#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Dispatcher<SqliteRepository>,
    pub packager: Packager,
}

impl AppState {
    /// Open the document store and build the packager from `config`.
    pub fn from_config(config: &DispatchConfig) -> Result<Self> {
        let pool = storage::open_pool(&config.storage).with_context(|| {
            format!(
                "opening document store at {}",
                config.storage.database_path.display()
            )
        })?;
        let repo = SqliteRepository::new(pool, config.storage.operation_timeout());
        let dispatcher = Dispatcher::new(Arc::new(repo), config.storage.max_update_retries);
        let packager =
            Packager::from_config(&config.scripts).context("building script packager")?;
        Ok(Self {
            dispatcher,
            packager,
        })
    }
}
