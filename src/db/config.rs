use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::storage::WriterOptions;
use crate::types::{Result, UmbraError};

/// Tunables supplied when constructing an [`super::Engine`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Posting lists kept in the cache.
    pub cache_capacity: usize,
    /// Number of shards the cache is split across.
    pub cache_shards: usize,
    /// Attempts per durable write before the error surfaces.
    pub write_retry_attempts: u32,
    /// Backoff before the first write retry, doubled after each attempt.
    pub write_retry_backoff_ms: u64,
    /// Data keys scanned between cancellation checks during a rebuild.
    pub rebuild_batch_size: usize,
    /// Age after which [`super::Engine::abort_stale`] reclaims a transaction.
    pub txn_ttl_ms: Option<u64>,
    /// Namespace used when parsing schema text.
    pub default_namespace: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cache_capacity: 4096,
            cache_shards: 8,
            write_retry_attempts: 3,
            write_retry_backoff_ms: 5,
            rebuild_batch_size: 256,
            txn_ttl_ms: None,
            default_namespace: 0,
        }
    }
}

impl EngineConfig {
    /// Small cache and eager rebuild cancellation, for tests.
    pub fn testing() -> Self {
        Self {
            cache_capacity: 64,
            cache_shards: 2,
            write_retry_backoff_ms: 1,
            rebuild_batch_size: 16,
            ..Self::default()
        }
    }

    /// Sets the cache capacity.
    pub fn cache_capacity(mut self, lists: usize) -> Self {
        self.cache_capacity = lists;
        self
    }

    /// Sets the cache shard count.
    pub fn cache_shards(mut self, shards: usize) -> Self {
        self.cache_shards = shards;
        self
    }

    /// Sets write retry attempts and initial backoff.
    pub fn write_retries(mut self, attempts: u32, backoff: Duration) -> Self {
        self.write_retry_attempts = attempts;
        self.write_retry_backoff_ms = u64::try_from(backoff.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Sets the rebuild scan batch size.
    pub fn rebuild_batch_size(mut self, keys: usize) -> Self {
        self.rebuild_batch_size = keys;
        self
    }

    /// Sets the stale transaction age.
    pub fn txn_ttl(mut self, ttl: Duration) -> Self {
        self.txn_ttl_ms = Some(u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX));
        self
    }

    /// Sets the schema text namespace.
    pub fn default_namespace(mut self, namespace: u64) -> Self {
        self.default_namespace = namespace;
        self
    }

    /// Parses a TOML document; missing keys take their defaults.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(text).map_err(|err| UmbraError::Config(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reads and parses a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|err| UmbraError::Config(format!("{}: {err}", path.display())))?;
        Self::from_toml_str(&text)
    }

    /// Renders the configuration as TOML.
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string(self).map_err(|err| UmbraError::Config(err.to_string()))
    }

    fn validate(&self) -> Result<()> {
        if self.cache_shards == 0 {
            return Err(UmbraError::Config("cache_shards must be positive".into()));
        }
        if self.rebuild_batch_size == 0 {
            return Err(UmbraError::Config("rebuild_batch_size must be positive".into()));
        }
        Ok(())
    }

    pub(crate) fn writer_options(&self) -> WriterOptions {
        WriterOptions {
            retry_attempts: self.write_retry_attempts,
            retry_backoff: Duration::from_millis(self.write_retry_backoff_ms),
        }
    }

    pub(crate) fn txn_ttl_duration(&self) -> Option<Duration> {
        self.txn_ttl_ms.map(Duration::from_millis)
    }
}
