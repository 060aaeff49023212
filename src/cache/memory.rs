//! In-process cache backend.
//!
//! Producers enqueue writes on an unbounded channel; one worker task drains
//! it and is the only code that mutates the nested map. Reads take a shared
//! guard and may lag behind writes still sitting in the channel.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use metrics::{counter, gauge};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::domain::CacheRecord;

use super::lock::{rw_read, rw_write};
use super::{
    CacheError, CacheStore, METRIC_CACHE_WRITE, METRIC_CACHE_WRITE_FAILED,
    METRIC_MEMORY_STORE_PENDING,
};

const SOURCE: &str = "cache::memory";
const BACKEND: &str = "memory";

type CategoryMap = BTreeMap<String, BTreeMap<String, CacheRecord>>;

enum StoreCommand {
    Write {
        category: String,
        entry: String,
        record: CacheRecord,
    },
    /// Resolves once every command enqueued before it has been applied.
    Flush(oneshot::Sender<()>),
}

/// Nested `category -> entry -> record` map with a single serial writer.
pub struct MemoryStore {
    data: Arc<RwLock<CategoryMap>>,
    sender: mpsc::UnboundedSender<StoreCommand>,
    pending: Arc<AtomicUsize>,
}

/// The writer half of a [`MemoryStore`]; run it on its own task.
pub struct MemoryStoreWorker {
    data: Arc<RwLock<CategoryMap>>,
    receiver: mpsc::UnboundedReceiver<StoreCommand>,
    pending: Arc<AtomicUsize>,
}

impl MemoryStore {
    /// Create a store and its not-yet-running worker.
    pub fn new() -> (Self, MemoryStoreWorker) {
        let data = Arc::new(RwLock::new(CategoryMap::new()));
        let pending = Arc::new(AtomicUsize::new(0));
        let (sender, receiver) = mpsc::unbounded_channel();

        let store = Self {
            data: data.clone(),
            sender,
            pending: pending.clone(),
        };
        let worker = MemoryStoreWorker {
            data,
            receiver,
            pending,
        };
        (store, worker)
    }

    /// Create a store and spawn its worker on the current runtime.
    pub fn spawn() -> (Arc<Self>, JoinHandle<()>) {
        let (store, worker) = Self::new();
        let handle = tokio::spawn(worker.run());
        (Arc::new(store), handle)
    }

    /// Wait until every write enqueued so far is visible to readers.
    pub async fn flush(&self) -> Result<(), CacheError> {
        let (done, wait) = oneshot::channel();
        self.sender
            .send(StoreCommand::Flush(done))
            .map_err(|_| CacheError::WriterStopped)?;
        wait.await.map_err(|_| CacheError::WriterStopped)
    }

    /// Number of writes enqueued but not yet applied.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }
}

impl MemoryStoreWorker {
    /// Apply commands until every [`MemoryStore`] handle is dropped.
    pub async fn run(mut self) {
        debug!("Memory store worker started");
        while let Some(command) = self.receiver.recv().await {
            self.apply(command);
        }
        info!("Memory store worker stopped");
    }

    fn apply(&self, command: StoreCommand) {
        match command {
            StoreCommand::Write {
                category,
                entry,
                record,
            } => {
                rw_write(&self.data, SOURCE, "apply_write")
                    .entry(category)
                    .or_default()
                    .insert(entry, record);
                let remaining = self.pending.fetch_sub(1, Ordering::SeqCst).saturating_sub(1);
                gauge!(METRIC_MEMORY_STORE_PENDING).set(remaining as f64);
            }
            StoreCommand::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
}

#[async_trait]
impl CacheStore for MemoryStore {
    fn backend(&self) -> &'static str {
        BACKEND
    }

    async fn write(&self, category: &str, entry: &str, value: Value) {
        let record = CacheRecord::now(value);
        let queued = self.pending.fetch_add(1, Ordering::SeqCst) + 1;
        let command = StoreCommand::Write {
            category: category.to_string(),
            entry: entry.to_string(),
            record,
        };

        if self.sender.send(command).is_err() {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            counter!(METRIC_CACHE_WRITE_FAILED, "backend" => BACKEND).increment(1);
            warn!(category, entry, "Memory store writer stopped; dropping write");
            return;
        }

        counter!(METRIC_CACHE_WRITE, "backend" => BACKEND).increment(1);
        gauge!(METRIC_MEMORY_STORE_PENDING).set(queued as f64);
        debug!(category, entry, "Cache write enqueued");
    }

    async fn lookup(
        &self,
        category: &str,
        entry: &str,
    ) -> Result<Option<CacheRecord>, CacheError> {
        Ok(rw_read(&self.data, SOURCE, "lookup")
            .get(category)
            .and_then(|entries| entries.get(entry))
            .cloned())
    }

    async fn list_categories(&self) -> Result<BTreeSet<String>, CacheError> {
        Ok(rw_read(&self.data, SOURCE, "list_categories")
            .keys()
            .cloned()
            .collect())
    }

    async fn list_entries(&self, category: &str) -> Result<BTreeSet<String>, CacheError> {
        Ok(rw_read(&self.data, SOURCE, "list_entries")
            .get(category)
            .map(|entries| entries.keys().cloned().collect())
            .unwrap_or_default())
    }
}
