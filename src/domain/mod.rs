//! Domain types shared by ingestion, caching, and the API surface.

pub mod queue;
pub mod record;

pub use queue::{BrokerBinding, MappingBlock, MappingEntry, QueueDefinition, WriteOperationSpec};
pub use record::{CacheRecord, RecordMeta};
