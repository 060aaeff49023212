//! Cache store for ingested records.
//!
//! Records live under a `(category, entry)` key, where the category is the
//! queue id that produced them. Two interchangeable backends implement
//! [`CacheStore`]:
//!
//! - [`MemoryStore`]: nested in-process map; every write goes through one
//!   worker task, which is the only place the map is mutated.
//! - [`RedisStore`]: networked key-value service, keys composed by
//!   [`KeySpace`].
//!
//! Callers never see store failures. Writes are logged and dropped, reads
//! collapse "not found" and "unreachable" into `None`. [`CacheStore::lookup`]
//! keeps the distinction for diagnostics.

mod config;
mod keys;
mod lock;
mod memory;
mod redis_store;

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use metrics::counter;
use serde_json::Value;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::domain::CacheRecord;

pub use config::{CacheBackendKind, CacheConfig, PreheatRecord};
pub use keys::{DEFAULT_DELIMITER, KeySpace};
pub(crate) use lock::mutex_lock;
pub use memory::{MemoryStore, MemoryStoreWorker};
pub use redis_store::RedisStore;

pub(crate) const METRIC_CACHE_WRITE: &str = "mqbridge_cache_write_total";
pub(crate) const METRIC_CACHE_WRITE_FAILED: &str = "mqbridge_cache_write_failed_total";
pub(crate) const METRIC_CACHE_READ: &str = "mqbridge_cache_read_total";
pub(crate) const METRIC_MEMORY_STORE_PENDING: &str = "mqbridge_memory_store_pending";

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache backend unavailable: {0}")]
    Unavailable(String),
    #[error("stored value under `{key}` could not be decoded: {reason}")]
    Corrupt { key: String, reason: String },
    #[error("cache writer has stopped")]
    WriterStopped,
}

impl CacheError {
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable(message.into())
    }
}

/// Get/set/list contract shared by every cache backend.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Short backend label used in logs and metrics.
    fn backend(&self) -> &'static str;

    /// Store `value` under `(category, entry)`, last write wins.
    async fn write(&self, category: &str, entry: &str, value: Value);

    /// Read a record, keeping backend failures distinguishable from absence.
    async fn lookup(&self, category: &str, entry: &str)
    -> Result<Option<CacheRecord>, CacheError>;

    async fn list_categories(&self) -> Result<BTreeSet<String>, CacheError>;

    async fn list_entries(&self, category: &str) -> Result<BTreeSet<String>, CacheError>;

    /// Read a record; absent if never written or if the backend failed.
    async fn read(&self, category: &str, entry: &str) -> Option<CacheRecord> {
        let backend = self.backend();
        match self.lookup(category, entry).await {
            Ok(Some(record)) => {
                counter!(METRIC_CACHE_READ, "backend" => backend, "result" => "hit").increment(1);
                Some(record)
            }
            Ok(None) => {
                counter!(METRIC_CACHE_READ, "backend" => backend, "result" => "miss").increment(1);
                None
            }
            Err(err) => {
                counter!(METRIC_CACHE_READ, "backend" => backend, "result" => "unavailable")
                    .increment(1);
                warn!(backend, category, entry, error = %err, "Cache read failed");
                None
            }
        }
    }

    /// Categories with at least one record; empty if the backend failed.
    async fn categories(&self) -> BTreeSet<String> {
        self.list_categories().await.unwrap_or_else(|err| {
            warn!(backend = self.backend(), error = %err, "Listing categories failed");
            BTreeSet::new()
        })
    }

    /// Entries written under `category`; empty if the backend failed.
    async fn entries(&self, category: &str) -> BTreeSet<String> {
        self.list_entries(category).await.unwrap_or_else(|err| {
            warn!(backend = self.backend(), category, error = %err, "Listing entries failed");
            BTreeSet::new()
        })
    }
}

/// A connected store plus the background writer it may own.
pub struct CacheHandle {
    pub store: Arc<dyn CacheStore>,
    pub worker: Option<JoinHandle<()>>,
}

/// Build the configured backend.
///
/// The memory backend spawns its writer task, so this must run inside a
/// tokio runtime.
pub async fn connect(config: &CacheConfig) -> Result<CacheHandle, CacheError> {
    match config.backend {
        CacheBackendKind::Memory => {
            let (store, worker) = MemoryStore::spawn();
            info!(backend = "memory", "Cache store ready");
            Ok(CacheHandle {
                store,
                worker: Some(worker),
            })
        }
        CacheBackendKind::Redis => {
            let store = RedisStore::connect(config).await?;
            Ok(CacheHandle {
                store: Arc::new(store),
                worker: None,
            })
        }
    }
}

/// Write the configured preheat records through the regular write path.
pub async fn preheat(store: &dyn CacheStore, records: &[PreheatRecord]) {
    for record in records {
        store
            .write(&record.category, &record.entry, record.value.clone())
            .await;
    }
    if !records.is_empty() {
        info!(count = records.len(), "Cache preheated");
    }
}
