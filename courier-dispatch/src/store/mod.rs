//! Counter stores backing the fixed-window rate limiter
//!
//! A store only needs two operations: read a counter and increment it with
//! an expiry. Keys are built by the limiter and already encode the provider,
//! window size and window start, so an expired key is never read again and
//! must be dropped by the store itself: Redis through its TTL, the memory
//! store through a periodic sweep.

mod memory;
mod redis_store;

use std::{fmt::Debug, sync::Arc, time::Duration};

use async_trait::async_trait;
pub use memory::MemoryCounterStore;
pub use redis_store::RedisCounterStore;
use serde::{Deserialize, Serialize};

use crate::{
    clock::Clock,
    error::{DispatchError, StoreError},
};

#[async_trait]
pub trait CounterStore: Send + Sync + Debug {
    /// Current value of `key`, zero when absent or expired
    async fn get(&self, key: &str) -> Result<u64, StoreError>;

    /// Add one to `key`, creating it with `ttl` if absent, and return the new
    /// value
    async fn increment(&self, key: &str, ttl: Duration) -> Result<u64, StoreError>;

    /// Short backend name for logs
    fn backend(&self) -> &'static str;
}

/// Which counter store to use
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub enum StoreConfig {
    /// Counters live in this process only
    #[default]
    Memory,

    /// Counters are shared through Redis
    Redis(RedisStoreConfig),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisStoreConfig {
    /// Redis connection URL (e.g. `redis://localhost:6379`)
    pub url: String,

    /// Deadline for every store call, in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Prefix for every key written
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

const fn default_timeout_ms() -> u64 {
    100
}

fn default_key_prefix() -> String {
    "ratelimit".to_string()
}

impl StoreConfig {
    /// Name of the backend this configuration builds, as reported by
    /// [`CounterStore::backend`]
    #[must_use]
    pub const fn backend(&self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Redis(_) => "redis",
        }
    }

    /// # Errors
    ///
    /// Returns [`DispatchError::Configuration`] for an empty Redis URL or a
    /// zero timeout.
    pub fn validate(&self) -> Result<(), DispatchError> {
        match self {
            Self::Memory => Ok(()),
            Self::Redis(redis) if redis.url.trim().is_empty() => Err(
                DispatchError::Configuration("rate_limit_store: Redis url must not be empty".into()),
            ),
            Self::Redis(redis) if redis.timeout_ms == 0 => Err(DispatchError::Configuration(
                "rate_limit_store: timeout_ms must be greater than 0".into(),
            )),
            Self::Redis(_) => Ok(()),
        }
    }

    /// Build the configured store
    ///
    /// # Errors
    ///
    /// Returns an error if the Redis URL cannot be parsed. No connection is
    /// made until the first counter is read.
    pub fn build(&self, clock: Arc<dyn Clock>) -> Result<Arc<dyn CounterStore>, DispatchError> {
        Ok(match self {
            Self::Memory => Arc::new(MemoryCounterStore::new(clock)),
            Self::Redis(redis) => Arc::new(RedisCounterStore::new(
                &redis.url,
                Duration::from_millis(redis.timeout_ms),
                &redis.key_prefix,
            )?),
        })
    }
}
