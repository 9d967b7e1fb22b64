//! Durable backends
//!
//! Each backend implements [`DurableBackend`](crate::core::DurableBackend)
//! and is selected at startup from [`BackendConfig`]:
//! - `flatfile` - A single CSV file, rewritten on every flush
//! - `sqlite` - A pooled SQLite database
//! - `memory` - Process-local, for tests and throwaway runs

use std::sync::Arc;

use crate::config::BackendConfig;
use crate::core::DurableBackend;
use crate::types::StorageError;

pub mod flatfile;
pub mod memory;
pub mod sqlite;

pub use flatfile::FlatFileBackend;
pub use memory::MemoryBackend;
pub use sqlite::SqliteBackend;

/// Open the backend described by `config`
///
/// # Arguments
///
/// * `config` - Which backend to open and where its data lives
/// * `decimals` - Currency precision, used by backends that store minor units
///
/// # Returns
///
/// A shared backend ready for the initial load
pub fn open_backend(
    config: &BackendConfig,
    decimals: u32,
) -> Result<Arc<dyn DurableBackend>, StorageError> {
    let backend: Arc<dyn DurableBackend> = match config {
        BackendConfig::Flatfile { path } => Arc::new(FlatFileBackend::open(path)?),
        BackendConfig::Sqlite { path, pool_size } => {
            let pool_size = pool_size.unwrap_or_else(num_cpus::get);
            Arc::new(SqliteBackend::open(path, pool_size, decimals)?)
        }
        BackendConfig::Memory => Arc::new(MemoryBackend::new()),
    };
    Ok(backend)
}
