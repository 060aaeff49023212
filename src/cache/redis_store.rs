//! Redis/Valkey cache backend.

use std::collections::BTreeSet;

use async_trait::async_trait;
use deadpool_redis::{Config as PoolSettings, Connection, Pool, PoolConfig, Runtime};
use metrics::counter;
use redis::AsyncCommands;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::domain::CacheRecord;

use super::{
    CacheConfig, CacheError, CacheStore, KeySpace, METRIC_CACHE_WRITE, METRIC_CACHE_WRITE_FAILED,
};

const BACKEND: &str = "redis";

/// Stores each record as a JSON string under a namespaced key.
pub struct RedisStore {
    pool: Pool,
    keys: KeySpace,
}

impl RedisStore {
    pub fn new(pool: Pool, keys: KeySpace) -> Self {
        Self { pool, keys }
    }

    /// Build a pool from `config` and make sure one connection can be opened.
    pub async fn connect(config: &CacheConfig) -> Result<Self, CacheError> {
        let url = config
            .redis_url
            .as_deref()
            .ok_or_else(|| CacheError::unavailable("cache.redis_url is not set"))?;

        let mut settings = PoolSettings::from_url(url);
        let mut pool_config = PoolConfig::new(config.pool_size.max(1));
        pool_config.timeouts.wait = Some(config.timeout);
        pool_config.timeouts.create = Some(config.timeout);
        pool_config.timeouts.recycle = Some(config.timeout);
        settings.pool = Some(pool_config);

        let pool = settings
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|err| CacheError::unavailable(format!("failed to build pool: {err}")))?;

        pool.get()
            .await
            .map_err(|err| CacheError::unavailable(format!("connection test failed: {err}")))?;

        info!(
            backend = BACKEND,
            pool_size = config.pool_size,
            prefix = %config.prefix,
            "Cache store ready"
        );
        Ok(Self::new(
            pool,
            KeySpace::new(config.prefix.clone(), config.delimiter.clone()),
        ))
    }

    async fn connection(&self) -> Result<Connection, CacheError> {
        self.pool
            .get()
            .await
            .map_err(|err| CacheError::unavailable(err.to_string()))
    }

    async fn matching_keys(&self, pattern: &str) -> Result<Vec<String>, CacheError> {
        let mut conn = self.connection().await?;
        conn.keys(pattern)
            .await
            .map_err(|err| CacheError::unavailable(err.to_string()))
    }
}

/// Decode a stored value; anything that is not a serialized record is corrupt.
pub(crate) fn decode_record(key: &str, raw: &str) -> Result<CacheRecord, CacheError> {
    serde_json::from_str(raw).map_err(|err| CacheError::Corrupt {
        key: key.to_string(),
        reason: err.to_string(),
    })
}

#[async_trait]
impl CacheStore for RedisStore {
    fn backend(&self) -> &'static str {
        BACKEND
    }

    async fn write(&self, category: &str, entry: &str, value: Value) {
        let key = self.keys.record_key(category, entry);
        let payload = match serde_json::to_string(&CacheRecord::now(value)) {
            Ok(payload) => payload,
            Err(err) => {
                counter!(METRIC_CACHE_WRITE_FAILED, "backend" => BACKEND).increment(1);
                warn!(key = %key, error = %err, "Failed to encode cache record");
                return;
            }
        };

        let result = match self.connection().await {
            Ok(mut conn) => conn
                .set::<_, _, ()>(&key, payload)
                .await
                .map_err(|err| CacheError::unavailable(err.to_string())),
            Err(err) => Err(err),
        };

        match result {
            Ok(()) => {
                counter!(METRIC_CACHE_WRITE, "backend" => BACKEND).increment(1);
                debug!(key = %key, "Cache write stored");
            }
            Err(err) => {
                counter!(METRIC_CACHE_WRITE_FAILED, "backend" => BACKEND).increment(1);
                warn!(key = %key, error = %err, "Cache write dropped");
            }
        }
    }

    async fn lookup(
        &self,
        category: &str,
        entry: &str,
    ) -> Result<Option<CacheRecord>, CacheError> {
        let key = self.keys.record_key(category, entry);
        let mut conn = self.connection().await?;
        let raw: Option<String> = conn
            .get(&key)
            .await
            .map_err(|err| CacheError::unavailable(err.to_string()))?;

        raw.map(|raw| decode_record(&key, &raw)).transpose()
    }

    async fn list_categories(&self) -> Result<BTreeSet<String>, CacheError> {
        let keys = self.matching_keys(&self.keys.all_pattern()).await?;
        Ok(keys
            .iter()
            .filter_map(|key| self.keys.parse(key))
            .map(|(category, _)| category.to_string())
            .collect())
    }

    async fn list_entries(&self, category: &str) -> Result<BTreeSet<String>, CacheError> {
        let keys = self
            .matching_keys(&self.keys.category_pattern(category))
            .await?;
        Ok(keys
            .iter()
            .filter_map(|key| self.keys.parse(key))
            .filter(|(found, _)| *found == category)
            .map(|(_, entry)| entry.to_string())
            .collect())
    }
}
