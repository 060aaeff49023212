//! Queue definitions and their exposed API mappings.
//!
//! A [`QueueDefinition`] is parsed once from configuration and shared
//! read-only between the ingestion subsystem and the API generator.

use std::collections::BTreeMap;

use serde::Deserialize;

/// One logical ingestion source.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueDefinition {
    /// Unique queue id, also the cache category for everything it ingests.
    pub id: String,
    /// Configured handler type name, resolved through the handler registry.
    pub handler: String,
    pub binding: BrokerBinding,
    /// Overrides the global broker URL for this queue only.
    pub broker_url: Option<String>,
    pub mapping: Option<MappingBlock>,
}

impl QueueDefinition {
    pub fn new(id: impl Into<String>, handler: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            handler: handler.into(),
            binding: BrokerBinding::default(),
            broker_url: None,
            mapping: None,
        }
    }

    pub fn with_binding(mut self, exchange: &str, routing_key: &str) -> Self {
        self.binding = BrokerBinding {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
        };
        self
    }

    pub fn with_mapping(mut self, mapping: MappingBlock) -> Self {
        self.mapping = Some(mapping);
        self
    }

    /// Mapping entries declared for this queue, empty when no mapping block exists.
    pub fn mapping_entries(&self) -> &[MappingEntry] {
        self.mapping
            .as_ref()
            .map(|block| block.map.as_slice())
            .unwrap_or(&[])
    }

    /// Returns true if any mapping entry declares a write-operation.
    pub fn declares_write_operations(&self) -> bool {
        self.mapping_entries().iter().any(|entry| entry.is_writable())
    }
}

/// Exchange and routing key a consumer binds its receiving queue to.
///
/// Empty strings mean the default exchange and the match-all routing key.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BrokerBinding {
    pub exchange: String,
    pub routing_key: String,
}

/// The `mapping` block of a queue: a base path plus the exposed entries.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct MappingBlock {
    #[serde(default)]
    pub base: String,
    #[serde(default)]
    pub map: Vec<MappingEntry>,
}

/// One exposed operation derived from a queue's mapping block.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct MappingEntry {
    /// Path suffix appended to the mapping base.
    pub to: String,
    /// Cache entry key read under the owning queue id.
    pub from: String,
    #[serde(default)]
    pub description: String,
    /// Registers a companion write endpoint when true.
    #[serde(default)]
    pub post: bool,
    /// Role required in addition to the getter/setter capability.
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default, rename = "handlermethod")]
    pub handler_method: Option<WriteOperationSpec>,
}

impl MappingEntry {
    pub fn is_writable(&self) -> bool {
        self.post
    }
}

/// Declared write-operation: the handler operation name and its argument shape.
///
/// Argument types are raw type names here; they are resolved to scalar kinds
/// when the API surface is generated.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct WriteOperationSpec {
    pub name: String,
    #[serde(default)]
    pub args: BTreeMap<String, String>,
}
