//! Cache store configuration.

use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;

use super::keys::DEFAULT_DELIMITER;

const DEFAULT_PREFIX: &str = "mqbridge";
const DEFAULT_POOL_SIZE: usize = 8;
const DEFAULT_TIMEOUT_MS: u64 = 2000;

/// Which backend holds cached records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheBackendKind {
    /// In-process nested map fed by a single writer task.
    Memory,
    /// Networked Redis/Valkey instance.
    Redis,
}

/// Record written once at startup before ingestion begins.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PreheatRecord {
    pub category: String,
    pub entry: String,
    pub value: Value,
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub backend: CacheBackendKind,
    pub redis_url: Option<String>,
    pub prefix: String,
    pub delimiter: String,
    pub pool_size: usize,
    pub timeout: Duration,
    pub preheat: Vec<PreheatRecord>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            backend: CacheBackendKind::Memory,
            redis_url: None,
            prefix: DEFAULT_PREFIX.to_string(),
            delimiter: DEFAULT_DELIMITER.to_string(),
            pool_size: DEFAULT_POOL_SIZE,
            timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
            preheat: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_values() {
        let config = CacheConfig::default();
        assert_eq!(config.backend, CacheBackendKind::Memory);
        assert_eq!(config.prefix, "mqbridge");
        assert_eq!(config.delimiter, ":");
        assert_eq!(config.pool_size, 8);
        assert_eq!(config.timeout, Duration::from_millis(2000));
        assert!(config.preheat.is_empty());
    }
}
