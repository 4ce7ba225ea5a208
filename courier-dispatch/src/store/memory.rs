//! In-process counter store

use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, SystemTime},
};

use async_trait::async_trait;
use dashmap::DashMap;

use super::CounterStore;
use crate::{clock::Clock, error::StoreError};

/// Increments between two sweeps of expired counters
const SWEEP_EVERY: u64 = 256;

#[derive(Debug, Clone, Copy)]
struct Counter {
    value: u64,
    expires_at: SystemTime,
}

impl Counter {
    fn is_expired(&self, now: SystemTime) -> bool {
        now >= self.expires_at
    }
}

/// Counters held in a [`DashMap`], expired lazily on access and in bulk by
/// [`purge_expired`](Self::purge_expired)
///
/// Window keys carry their window start, so an expired key is never read
/// again. Every 256 increments the store purges itself, which
/// keeps it bounded by the keys written since the last sweep.
#[derive(Debug)]
pub struct MemoryCounterStore {
    counters: DashMap<String, Counter>,
    increments: AtomicU64,
    clock: Arc<dyn Clock>,
}

impl MemoryCounterStore {
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            counters: DashMap::new(),
            increments: AtomicU64::new(0),
            clock,
        }
    }

    /// Drop every expired counter, returning how many were removed
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let before = self.counters.len();
        self.counters.retain(|_, counter| !counter.is_expired(now));
        before.saturating_sub(self.counters.len())
    }

    /// Number of live and not yet purged counters
    #[must_use]
    pub fn len(&self) -> usize {
        self.counters.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn get(&self, key: &str) -> Result<u64, StoreError> {
        let now = self.clock.now();
        let value = self.counters.get(key).map(|counter| *counter);

        match value {
            Some(counter) if counter.is_expired(now) => {
                self.counters
                    .remove_if(key, |_, counter| counter.is_expired(now));
                Ok(0)
            }
            Some(counter) => Ok(counter.value),
            None => Ok(0),
        }
    }

    async fn increment(&self, key: &str, ttl: Duration) -> Result<u64, StoreError> {
        let now = self.clock.now();
        let value = {
            let mut entry = self.counters.entry(key.to_string()).or_insert(Counter {
                value: 0,
                expires_at: now + ttl,
            });

            if entry.is_expired(now) {
                *entry = Counter {
                    value: 0,
                    expires_at: now + ttl,
                };
            }

            entry.value += 1;
            entry.value
        };

        // The entry guard must be gone before retain takes every shard lock
        if self.increments.fetch_add(1, Ordering::Relaxed) % SWEEP_EVERY == SWEEP_EVERY - 1 {
            let purged = self.purge_expired();
            if purged > 0 {
                tracing::trace!(purged, remaining = self.counters.len(), "Swept expired counters");
            }
        }

        Ok(value)
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}
