//! Per-provider admission control
//!
//! Each provider may carry any combination of:
//! - Fixed-window ceilings per second, minute, hour and day, counted in a
//!   shared [`CounterStore`]
//! - A burst token bucket: once the per-second ceiling is reached, each extra
//!   send in that second spends one token
//! - A cap on concurrent transport calls
//!
//! # Peek, then commit
//!
//! [`RateLimiter::can_send`] only reads counters. [`RateLimiter::consume`]
//! is called after the transport accepted the message. Two callers that peek
//! at the same time can therefore both be admitted; that overshoot is
//! accepted in exchange for never holding a lock across a transport call.
//!
//! # Windows
//!
//! ```text
//! perMinute: 3, now = 12:00:42
//!
//! window start 12:00:00            reset 12:01:00
//! |------ count: 3 ------ now ------|
//!                          retry after 18s
//! ```
//!
//! Windows are aligned to the wall clock, so every process sharing a store
//! agrees on where a window starts. Store failures fail open.

use std::{
    sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    },
    time::{Duration, SystemTime},
};

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::{
    clock::{Clock, unix_millis},
    error::DispatchError,
    store::CounterStore,
};

/// Admission limits for one provider. Anything unset is unlimited.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default)]
    pub per_second: Option<u64>,

    #[serde(default)]
    pub per_minute: Option<u64>,

    #[serde(default)]
    pub per_hour: Option<u64>,

    #[serde(default)]
    pub per_day: Option<u64>,

    /// Maximum transport calls in progress at once
    #[serde(default)]
    pub concurrent: Option<u32>,

    /// Extra per-second headroom
    #[serde(default)]
    pub burst: Option<BurstConfig>,
}

impl RateLimitConfig {
    #[must_use]
    pub const fn limit(&self, window: Window) -> Option<u64> {
        match window {
            Window::Second => self.per_second,
            Window::Minute => self.per_minute,
            Window::Hour => self.per_hour,
            Window::Day => self.per_day,
        }
    }

    /// # Errors
    ///
    /// Returns [`DispatchError::Configuration`] for a burst with a zero
    /// interval.
    pub fn validate(&self, provider: &str) -> Result<(), DispatchError> {
        if let Some(burst) = &self.burst
            && burst.interval_secs == 0
        {
            return Err(DispatchError::Configuration(format!(
                "provider {provider}: burst.interval_secs must be greater than 0"
            )));
        }

        Ok(())
    }
}

/// `tokens` extra sends, refilled evenly over `interval_secs`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BurstConfig {
    pub tokens: u32,
    pub interval_secs: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Window {
    Second,
    Minute,
    Hour,
    Day,
}

impl Window {
    /// Checked shortest first
    pub const ALL: [Self; 4] = [Self::Second, Self::Minute, Self::Hour, Self::Day];

    #[must_use]
    pub const fn size_ms(self) -> u64 {
        match self {
            Self::Second => 1_000,
            Self::Minute => 60_000,
            Self::Hour => 3_600_000,
            Self::Day => 86_400_000,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Second => "second",
            Self::Minute => "minute",
            Self::Hour => "hour",
            Self::Day => "day",
        }
    }

    /// Start of the window containing `now_ms`, and milliseconds until it ends
    #[must_use]
    pub const fn bounds(self, now_ms: u64) -> (u64, u64) {
        let size = self.size_ms();
        let start = now_ms - now_ms % size;
        (start, start + size - now_ms)
    }
}

/// Result of [`RateLimiter::can_send`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Admission {
    pub allowed: bool,

    /// Time until the violated window resets
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl Admission {
    #[must_use]
    pub const fn allow() -> Self {
        Self {
            allowed: true,
            retry_after_ms: None,
            reason: None,
        }
    }

    #[must_use]
    pub const fn deny(retry_after_ms: Option<u64>, reason: String) -> Self {
        Self {
            allowed: false,
            retry_after_ms,
            reason: Some(reason),
        }
    }
}

/// Token bucket refilled continuously at `capacity / interval`
#[derive(Debug)]
struct TokenBucket {
    tokens: f64,
    capacity: f64,
    /// Tokens added per second
    refill_rate: f64,
    last_refill: SystemTime,
}

impl TokenBucket {
    #[allow(clippy::cast_precision_loss, reason = "Burst intervals are far below 2^52")]
    fn new(config: BurstConfig, now: SystemTime) -> Self {
        let capacity = f64::from(config.tokens);
        Self {
            tokens: capacity,
            capacity,
            refill_rate: capacity / config.interval_secs.max(1) as f64,
            last_refill: now,
        }
    }

    fn refill(&mut self, now: SystemTime) {
        // A clock that went backwards adds nothing
        let elapsed = now
            .duration_since(self.last_refill)
            .unwrap_or_default()
            .as_secs_f64();

        self.tokens = elapsed.mul_add(self.refill_rate, self.tokens).min(self.capacity);
        if now > self.last_refill {
            self.last_refill = now;
        }
    }

    /// Whole tokens available at `now`
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        reason = "Tokens are clamped to [0, capacity] and capacity fits in u32"
    )]
    fn available(&mut self, now: SystemTime) -> u64 {
        self.refill(now);
        self.tokens.max(0.0).floor() as u64
    }

    fn try_consume(&mut self, now: SystemTime) -> bool {
        self.refill(now);

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

#[derive(Debug)]
struct ProviderLimits {
    config: RateLimitConfig,
    burst: Option<Mutex<TokenBucket>>,
    in_flight: AtomicU32,
}

impl ProviderLimits {
    fn new(config: RateLimitConfig, now: SystemTime) -> Self {
        Self {
            burst: config
                .burst
                .map(|burst| Mutex::new(TokenBucket::new(burst, now))),
            config,
            in_flight: AtomicU32::new(0),
        }
    }

    fn burst_available(&self, now: SystemTime) -> u64 {
        self.burst
            .as_ref()
            .map_or(0, |bucket| bucket.lock().available(now))
    }
}

/// Marks one transport call in progress; releases the slot on drop
#[derive(Debug)]
#[must_use = "the slot is released as soon as the guard is dropped"]
pub struct InFlightGuard {
    limits: Arc<ProviderLimits>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.limits.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Counters for one window, for operators
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WindowStats {
    pub window: Window,
    pub count: u64,
    pub limit: u64,
    pub resets_in_ms: u64,
}

/// Current limiter state for one provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RateLimitStats {
    pub provider: String,
    pub windows: Vec<WindowStats>,
    pub burst_available: Option<u64>,
    pub in_flight: u32,
    pub concurrent: Option<u32>,
}

/// Per-provider rate limiter
#[derive(Debug)]
pub struct RateLimiter {
    store: Arc<dyn CounterStore>,
    clock: Arc<dyn Clock>,
    providers: DashMap<String, Arc<ProviderLimits>>,
}

impl RateLimiter {
    #[must_use]
    pub fn new(store: Arc<dyn CounterStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            providers: DashMap::new(),
        }
    }

    /// Install or replace the limits for `provider`
    pub fn configure(&self, provider: &str, config: RateLimitConfig) {
        let limits = ProviderLimits::new(config, self.clock.now());
        self.providers
            .insert(provider.to_string(), Arc::new(limits));
    }

    /// Limits for `provider`; providers never configured are unlimited
    fn limits(&self, provider: &str) -> Arc<ProviderLimits> {
        if let Some(limits) = self.providers.get(provider) {
            return Arc::clone(&limits);
        }

        let now = self.clock.now();
        Arc::clone(
            &self
                .providers
                .entry(provider.to_string())
                .or_insert_with(|| Arc::new(ProviderLimits::new(RateLimitConfig::default(), now))),
        )
    }

    fn key(provider: &str, window: Window, start_ms: u64) -> String {
        format!("{provider}:{}:{start_ms}", window.as_str())
    }

    #[must_use]
    pub fn store_backend(&self) -> &'static str {
        self.store.backend()
    }

    /// Whether `provider` may take one more message right now
    pub async fn can_send(&self, provider: &str, recipient_key: &str) -> Admission {
        self.can_send_at(provider, recipient_key, self.clock.now())
            .await
    }

    /// [`can_send`](Self::can_send) at an explicit point in time
    pub async fn can_send_at(
        &self,
        provider: &str,
        recipient_key: &str,
        now: SystemTime,
    ) -> Admission {
        let limits = self.limits(provider);
        let now_ms = unix_millis(now);

        for window in Window::ALL {
            let Some(limit) = limits.config.limit(window) else {
                continue;
            };

            let (start_ms, resets_in_ms) = window.bounds(now_ms);
            let key = Self::key(provider, window, start_ms);

            match self.store.get(&key).await {
                // Past the per-second ceiling, each extra send needs a burst token
                Ok(count)
                    if count >= limit
                        && !(window == Window::Second && limits.burst_available(now) > 0) =>
                {
                    tracing::debug!(
                        provider,
                        recipient_key,
                        window = window.as_str(),
                        count,
                        limit,
                        retry_after_ms = resets_in_ms,
                        "Rate limit reached"
                    );
                    return Admission::deny(
                        Some(resets_in_ms),
                        format!("per-{} limit of {limit} reached", window.as_str()),
                    );
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(
                        provider,
                        backend = self.store.backend(),
                        window = window.as_str(),
                        error = %e,
                        "Counter store read failed, admitting"
                    );
                }
            }
        }

        if let Some(concurrent) = limits.config.concurrent {
            let in_flight = limits.in_flight.load(Ordering::Acquire);
            if in_flight >= concurrent {
                tracing::debug!(provider, in_flight, concurrent, "Concurrency limit reached");
                return Admission::deny(
                    None,
                    format!("concurrency limit of {concurrent} reached"),
                );
            }
        }

        Admission::allow()
    }

    /// Count one accepted message against every configured window
    pub async fn consume(&self, provider: &str, recipient_key: &str) {
        self.consume_at(provider, recipient_key, self.clock.now())
            .await;
    }

    /// [`consume`](Self::consume) at an explicit point in time
    pub async fn consume_at(&self, provider: &str, recipient_key: &str, now: SystemTime) {
        let limits = self.limits(provider);
        let now_ms = unix_millis(now);

        for window in Window::ALL {
            let Some(limit) = limits.config.limit(window) else {
                continue;
            };

            let (start_ms, resets_in_ms) = window.bounds(now_ms);
            let key = Self::key(provider, window, start_ms);

            match self
                .store
                .increment(&key, Duration::from_millis(resets_in_ms))
                .await
            {
                Ok(count) if window == Window::Second && count > limit => {
                    // Running over the per-second ceiling spends burst; an empty
                    // bucket never blocks a message that already went out
                    if let Some(bucket) = &limits.burst
                        && !bucket.lock().try_consume(now)
                    {
                        tracing::debug!(provider, recipient_key, "Burst bucket exhausted");
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(
                        provider,
                        backend = self.store.backend(),
                        window = window.as_str(),
                        error = %e,
                        "Counter store increment failed"
                    );
                }
            }
        }
    }

    /// Reserve a concurrency slot for the duration of a transport call
    pub fn acquire(&self, provider: &str) -> InFlightGuard {
        let limits = self.limits(provider);
        limits.in_flight.fetch_add(1, Ordering::AcqRel);
        InFlightGuard { limits }
    }

    #[must_use]
    pub fn in_flight(&self, provider: &str) -> u32 {
        self.providers
            .get(provider)
            .map_or(0, |limits| limits.in_flight.load(Ordering::Acquire))
    }

    /// Window counts, burst tokens and in-flight calls for `provider`
    pub async fn stats(&self, provider: &str) -> RateLimitStats {
        let limits = self.limits(provider);
        let now = self.clock.now();
        let now_ms = unix_millis(now);

        let mut windows = Vec::new();
        for window in Window::ALL {
            let Some(limit) = limits.config.limit(window) else {
                continue;
            };

            let (start_ms, resets_in_ms) = window.bounds(now_ms);
            let count = self
                .store
                .get(&Self::key(provider, window, start_ms))
                .await
                .unwrap_or_default();

            windows.push(WindowStats {
                window,
                count,
                limit,
                resets_in_ms,
            });
        }

        RateLimitStats {
            provider: provider.to_string(),
            windows,
            burst_available: limits
                .burst
                .as_ref()
                .map(|bucket| bucket.lock().available(now)),
            in_flight: limits.in_flight.load(Ordering::Acquire),
            concurrent: limits.config.concurrent,
        }
    }
}
