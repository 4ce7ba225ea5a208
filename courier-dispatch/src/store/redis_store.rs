//! Redis-backed counter store, shared by every process using the same server
//!
//! The connection is established on first use and a failed connect is
//! retried on the next call. Once up, it is held by a [`ConnectionManager`],
//! which reconnects by itself after the server restarts or the socket drops.
//! Every call is bounded by the configured timeout.

use std::{future::Future, time::Duration};

use async_trait::async_trait;
use redis::{Client, Pipeline, aio::ConnectionManager};
use tokio::{sync::OnceCell, time::timeout};

use super::CounterStore;
use crate::error::StoreError;

pub struct RedisCounterStore {
    client: Client,
    connection: OnceCell<ConnectionManager>,
    timeout: Duration,
    key_prefix: String,
}

impl std::fmt::Debug for RedisCounterStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisCounterStore")
            .field("connected", &self.connection.initialized())
            .field("timeout", &self.timeout)
            .field("key_prefix", &self.key_prefix)
            .finish_non_exhaustive()
    }
}

impl RedisCounterStore {
    /// # Errors
    ///
    /// Returns an error if `url` is not a valid Redis URL.
    pub fn new(url: &str, timeout: Duration, key_prefix: &str) -> Result<Self, StoreError> {
        let client = Client::open(url)?;

        Ok(Self {
            client,
            connection: OnceCell::new(),
            timeout,
            key_prefix: key_prefix.to_string(),
        })
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}:{key}", self.key_prefix)
    }

    async fn bounded<T, F>(&self, future: F) -> Result<T, StoreError>
    where
        F: Future<Output = Result<T, redis::RedisError>> + Send,
    {
        timeout(self.timeout, future)
            .await
            .map_err(|_| StoreError::Timeout(self.timeout))?
            .map_err(StoreError::from)
    }

    async fn connection(&self) -> Result<ConnectionManager, StoreError> {
        self.connection
            .get_or_try_init(|| self.bounded(self.client.get_connection_manager()))
            .await
            .cloned()
    }
}

/// `SET key 0 PX ttl NX` then `INCR key`, in one `MULTI`/`EXEC`
///
/// The key gets its expiry in the same transaction that creates it, so no
/// counter is ever left without one.
fn increment_pipeline(key: &str, ttl: Duration) -> Pipeline {
    let ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1);

    let mut pipe = redis::pipe();
    pipe.atomic()
        .cmd("SET")
        .arg(key)
        .arg(0)
        .arg("PX")
        .arg(ttl_ms)
        .arg("NX")
        .ignore()
        .cmd("INCR")
        .arg(key);
    pipe
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn get(&self, key: &str) -> Result<u64, StoreError> {
        let mut conn = self.connection().await?;
        let value: Option<u64> = self
            .bounded(redis::cmd("GET").arg(self.full_key(key)).query_async(&mut conn))
            .await?;

        Ok(value.unwrap_or(0))
    }

    async fn increment(&self, key: &str, ttl: Duration) -> Result<u64, StoreError> {
        let mut conn = self.connection().await?;
        let pipe = increment_pipeline(&self.full_key(key), ttl);

        let (value,): (u64,) = self.bounded(pipe.query_async(&mut conn)).await?;
        Ok(value)
    }

    fn backend(&self) -> &'static str {
        "redis"
    }
}
