//! Store backends and their configuration
//!
//! The loader never talks to a backend directly: a [`StoreConfig`] is
//! resolved once, turned into an `Arc<dyn Store>` by [`open`], and that
//! handle is passed to everything that needs it.

mod config;
mod elasticsearch;
mod sqlite;

pub use config::{
    BackendKind, DEFAULT_RETRY_BACKOFF, StoreConfig, StoreDescriptor, StoreSpec,
};
pub use elasticsearch::ElasticsearchStore;
pub use sqlite::SqliteStore;

use crate::etl::Store;
use eyre::Result;
use std::sync::Arc;

/// Build the store adapter for a canonical config
pub fn open(config: StoreConfig) -> Result<Arc<dyn Store>> {
    log::debug!("Opening store {}", config);
    Ok(match config.backend {
        BackendKind::Sqlite => Arc::new(SqliteStore::new(config)),
        BackendKind::Elasticsearch => Arc::new(ElasticsearchStore::try_new(config)?),
    })
}
