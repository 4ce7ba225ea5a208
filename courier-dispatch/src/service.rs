//! The dispatch service: one explicitly constructed owner of the registry,
//! limiter, scorer and selector
//!
//! # Send pipeline
//!
//! ```text
//! send(message)
//!   │
//!   ├─ ordered_candidates()  ── empty ──> failure: no providers available
//!   │
//!   └─ for each candidate, in order
//!        ├─ can_send()  ── denied ──> attempt{rate_limit}, next candidate
//!        ├─ acquire in-flight slot
//!        ├─ transport.send() under timeout, slot released
//!        ├─ ok  ──> consume(), on_success(), return success
//!        └─ err ──> classify, on_failure(), attempt{class}, next candidate
//!
//!   exhausted ──> failure with every attempt
//! ```
//!
//! A single provider's failure never surfaces as an error; only exhausting
//! every candidate produces an unsuccessful [`SendResult`]. Several services
//! can live side by side, each with its own state.

use std::{sync::Arc, time::Duration};

use ahash::AHashMap;
use courier_common::{Message, ScheduledTask, internal, outgoing, task::CancellationToken};
use courier_metrics::{DashboardSnapshot, DispatchMetrics, LogAlertSink, Metrics, MetricsConfig};
use tokio::time::Instant;

use crate::{
    clock::{Clock, SystemClock, unix_millis, unix_secs},
    config::DispatchConfig,
    error::{DispatchError, ErrorClass, TransportError},
    health::{HealthConfig, HealthScorer, HealthState},
    provider::{Provider, ProviderRegistry},
    rate_limiter::{RateLimitConfig, RateLimitStats, RateLimiter},
    recovery::{HealthRecovery, RecoveryConfig},
    selection::Selector,
    store::{CounterStore, MemoryCounterStore},
    types::{
        DeliveryAttempt, DeliveryOutcome, ProviderStatus, ProviderStatusReport, SendResult,
    },
};

/// Transport deadline for providers added without one
pub const DEFAULT_TRANSPORT_TIMEOUT: Duration = Duration::from_secs(30);

/// Counts a send as queued for as long as it is alive
struct QueueDepthGuard<'a> {
    metrics: &'a DispatchMetrics,
}

impl<'a> QueueDepthGuard<'a> {
    fn enter(metrics: &'a DispatchMetrics) -> Self {
        metrics.increment_queue_depth();
        Self { metrics }
    }
}

impl Drop for QueueDepthGuard<'_> {
    fn drop(&mut self) {
        self.metrics.decrement_queue_depth();
    }
}

#[derive(Debug)]
struct ProviderEntry {
    provider: Provider,
    limits: RateLimitConfig,
    timeout: Duration,
}

/// Assembles a [`DispatchService`]; anything not supplied gets a default
#[derive(Debug, Default)]
pub struct DispatchServiceBuilder {
    providers: Vec<ProviderEntry>,
    health: HealthConfig,
    recovery: RecoveryConfig,
    store: Option<Arc<dyn CounterStore>>,
    clock: Option<Arc<dyn Clock>>,
    selector: Option<Selector>,
    metrics: Option<Arc<Metrics>>,
}

impl DispatchServiceBuilder {
    #[must_use]
    pub fn provider(mut self, provider: Provider, limits: RateLimitConfig) -> Self {
        self.providers.push(ProviderEntry {
            provider,
            limits,
            timeout: DEFAULT_TRANSPORT_TIMEOUT,
        });
        self
    }

    /// Add a provider whose transport calls are cut off after `timeout`
    #[must_use]
    pub fn provider_with_timeout(
        mut self,
        provider: Provider,
        limits: RateLimitConfig,
        timeout: Duration,
    ) -> Self {
        self.providers.push(ProviderEntry {
            provider,
            limits,
            timeout,
        });
        self
    }

    #[must_use]
    pub fn health(mut self, config: HealthConfig) -> Self {
        self.health = config;
        self
    }

    #[must_use]
    pub fn recovery(mut self, config: RecoveryConfig) -> Self {
        self.recovery = config;
        self
    }

    #[must_use]
    pub fn store(mut self, store: Arc<dyn CounterStore>) -> Self {
        self.store = Some(store);
        self
    }

    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    #[must_use]
    pub fn selector(mut self, selector: Selector) -> Self {
        self.selector = Some(selector);
        self
    }

    #[must_use]
    pub fn metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// # Errors
    ///
    /// Returns an error for duplicate provider names, invalid health,
    /// recovery or rate limit settings, or if default metrics cannot be
    /// created.
    pub fn build(self) -> Result<DispatchService, DispatchError> {
        self.health.validate()?;
        self.recovery.validate()?;

        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(MemoryCounterStore::new(Arc::clone(&clock))));
        let metrics = match self.metrics {
            Some(metrics) => metrics,
            None => Arc::new(Metrics::new(
                MetricsConfig::default(),
                Arc::new(LogAlertSink),
            )?),
        };

        let limiter = RateLimiter::new(store, Arc::clone(&clock));
        let mut timeouts = AHashMap::with_capacity(self.providers.len());
        let mut providers = Vec::with_capacity(self.providers.len());
        for entry in self.providers {
            let name = entry.provider.name().to_string();
            entry.limits.validate(&name)?;
            limiter.configure(&name, entry.limits);
            timeouts.insert(name, entry.timeout);
            providers.push(entry.provider);
        }

        let registry = Arc::new(ProviderRegistry::new(providers)?);
        let scorer = Arc::new(HealthScorer::new(
            self.health,
            Arc::clone(&registry),
            Arc::clone(&metrics),
            Arc::clone(&clock),
        ));
        let recovery = Arc::new(HealthRecovery::new(
            self.recovery,
            Arc::clone(&registry),
            Arc::clone(&scorer),
            Arc::clone(&clock),
        ));

        for provider in registry.all() {
            metrics.dispatch.register_provider(provider.name());
            metrics.dispatch.set_in_flight(provider.name(), 0);
            scorer.publish(provider.name());
        }

        internal!(
            level = INFO,
            providers = registry.len(),
            store = limiter.store_backend(),
            "Dispatch service ready"
        );

        Ok(DispatchService {
            registry,
            limiter,
            scorer,
            recovery,
            selector: self.selector.unwrap_or_default(),
            metrics,
            clock,
            timeouts,
        })
    }
}

/// Sends messages through the configured providers
#[derive(Debug)]
pub struct DispatchService {
    registry: Arc<ProviderRegistry>,
    limiter: RateLimiter,
    scorer: Arc<HealthScorer>,
    recovery: Arc<HealthRecovery>,
    selector: Selector,
    metrics: Arc<Metrics>,
    clock: Arc<dyn Clock>,
    timeouts: AHashMap<String, Duration>,
}

impl DispatchService {
    #[must_use]
    pub fn builder() -> DispatchServiceBuilder {
        DispatchServiceBuilder::default()
    }

    /// Validate `config`, build every transport and the counter store, and
    /// assemble the service.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or a transport or
    /// store cannot be constructed.
    pub fn from_config(config: &DispatchConfig, metrics: Arc<Metrics>) -> Result<Self, DispatchError> {
        config.validate()?;

        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let mut builder = Self::builder()
            .health(config.health.clone())
            .recovery(config.recovery.clone())
            .store(config.rate_limit_store.build(Arc::clone(&clock))?)
            .clock(clock)
            .metrics(metrics);

        for provider in &config.providers {
            let transport = provider.transport.build(&provider.name)?;
            builder = builder.provider_with_timeout(
                Provider::new(
                    &provider.name,
                    transport,
                    provider.priority_tier,
                    provider.weight,
                    provider.enabled,
                ),
                provider.rate_limits.clone(),
                provider.timeout(),
            );
        }

        builder.build()
    }

    #[must_use]
    pub const fn registry(&self) -> &Arc<ProviderRegistry> {
        &self.registry
    }

    #[must_use]
    pub const fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    #[must_use]
    pub const fn scorer(&self) -> &Arc<HealthScorer> {
        &self.scorer
    }

    #[must_use]
    pub const fn recovery(&self) -> &Arc<HealthRecovery> {
        &self.recovery
    }

    #[must_use]
    pub const fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    fn timeout(&self, provider: &str) -> Duration {
        self.timeouts
            .get(provider)
            .copied()
            .unwrap_or(DEFAULT_TRANSPORT_TIMEOUT)
    }

    /// Offer `message` to each candidate provider in turn until one accepts
    pub async fn send(&self, message: &Message) -> SendResult {
        let _queued = QueueDepthGuard::enter(&self.metrics.dispatch);

        let candidates = self.selector.ordered_candidates(self.registry.all());
        if candidates.is_empty() {
            tracing::warn!(message_id = %message.id, "No providers available");
            return SendResult::no_providers(&message.id);
        }

        let recipient_key = message.recipient_key();
        let mut attempts = Vec::with_capacity(candidates.len());

        for (position, provider) in candidates.iter().enumerate() {
            let name = provider.name();
            let has_next = position + 1 < candidates.len();
            let started_at = unix_millis(self.clock.now());

            let admission = self.limiter.can_send(name, &recipient_key).await;
            if !admission.allowed {
                self.metrics.dispatch.record_rate_limited(name);
                let reason = admission
                    .reason
                    .unwrap_or_else(|| "rate limit reached".to_string());
                outgoing!(
                    level = DEBUG,
                    message_id = %message.id,
                    provider = name,
                    reason = %reason,
                    "Provider skipped by admission control"
                );
                attempts.push(DeliveryAttempt::rate_limited(
                    name,
                    started_at,
                    reason,
                    admission.retry_after_ms,
                ));
                if has_next {
                    self.metrics.dispatch.record_retry(name);
                }
                continue;
            }

            let timeout = self.timeout(name);
            let slot = self.limiter.acquire(name);
            self.metrics
                .dispatch
                .set_in_flight(name, self.limiter.in_flight(name));

            outgoing!(message_id = %message.id, provider = name, "Sending");
            let timer = Instant::now();
            let outcome = tokio::time::timeout(timeout, provider.transport().send(message))
                .await
                .unwrap_or(Err(TransportError::Timeout(timeout)));
            let latency = timer.elapsed();

            drop(slot);
            self.metrics
                .dispatch
                .set_in_flight(name, self.limiter.in_flight(name));
            if let Err(e) = self.registry.mark_used(name, self.clock.now()) {
                tracing::warn!(provider = name, error = %e, "Cannot stamp provider use");
            }

            let latency_ms = u64::try_from(latency.as_millis()).unwrap_or(u64::MAX);
            match outcome {
                Ok(transport_id) => {
                    self.limiter.consume(name, &recipient_key).await;
                    self.scorer.on_success(name);
                    self.metrics.dispatch.record_success(name, latency);

                    outgoing!(
                        level = INFO,
                        message_id = %message.id,
                        provider = name,
                        transport_id = %transport_id,
                        latency_ms,
                        attempts = attempts.len() + 1,
                        "Message accepted"
                    );

                    attempts.push(DeliveryAttempt::succeeded(name, started_at, latency_ms));
                    return SendResult::delivered(&message.id, attempts, name, transport_id);
                }
                Err(e) => {
                    let class = e.class();
                    self.scorer.on_failure(name);
                    self.metrics
                        .dispatch
                        .record_failure(name, class.as_str(), latency);

                    tracing::warn!(
                        message_id = %message.id,
                        provider = name,
                        error_class = %class,
                        error = %e,
                        latency_ms,
                        "Provider failed, falling back"
                    );

                    attempts.push(DeliveryAttempt::failed(
                        name,
                        started_at,
                        latency_ms,
                        class,
                        e.to_string(),
                    ));
                    if has_next {
                        self.metrics.dispatch.record_retry(name);
                    }
                }
            }
        }

        let result = SendResult::exhausted(&message.id, attempts);
        tracing::error!(
            message_id = %message.id,
            attempts = result.attempts.len(),
            error = result.error.as_deref().unwrap_or_default(),
            "Send failed on every provider"
        );
        result
    }

    /// Feed later delivery feedback from `provider` into health and metrics.
    ///
    /// A delivery raises the provider's health. A bounce lowers it unless
    /// the recipient was at fault (`invalid_recipient`, or no class given).
    /// Complaints and deferrals are only counted.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::UnknownProvider`] if no provider has this name.
    pub fn report_delivery_event(
        &self,
        provider: &str,
        outcome: DeliveryOutcome,
        error_class: Option<ErrorClass>,
    ) -> Result<(), DispatchError> {
        self.registry.get(provider)?;

        let outcome_label = match outcome {
            DeliveryOutcome::Delivered => "delivered",
            DeliveryOutcome::Bounced => "bounced",
            DeliveryOutcome::Complained => "complained",
            DeliveryOutcome::Deferred => "deferred",
        };
        self.metrics
            .dispatch
            .record_delivery_event(provider, outcome_label);

        match (outcome, error_class) {
            (DeliveryOutcome::Delivered, _) => {
                self.scorer.on_success(provider);
            }
            (DeliveryOutcome::Bounced, Some(class)) if class != ErrorClass::InvalidRecipient => {
                self.scorer.on_failure(provider);
            }
            _ => {}
        }

        internal!(
            level = DEBUG,
            provider,
            outcome = outcome_label,
            error_class = ?error_class,
            "Delivery event recorded"
        );

        Ok(())
    }

    /// Read-only view of every provider, in configuration order
    #[must_use]
    pub fn provider_status(&self) -> ProviderStatusReport {
        let health = self.scorer.config();
        let providers: Vec<ProviderStatus> = self
            .registry
            .all()
            .iter()
            .map(|provider| {
                let snapshot = provider.snapshot();
                ProviderStatus {
                    state: health.state(snapshot.enabled, snapshot.health_score),
                    in_flight: self.limiter.in_flight(&snapshot.name),
                    last_used_at: snapshot.last_used_at.map(unix_secs),
                    last_error_at: snapshot.last_error_at.map(unix_secs),
                    name: snapshot.name,
                    kind: snapshot.kind,
                    priority_tier: snapshot.priority_tier,
                    weight: snapshot.weight,
                    enabled: snapshot.enabled,
                    health_score: snapshot.health_score,
                }
            })
            .collect();

        ProviderStatusReport {
            healthy_count: providers
                .iter()
                .filter(|p| p.state == HealthState::Healthy)
                .count(),
            available_count: providers
                .iter()
                .filter(|p| p.enabled && p.health_score > 0)
                .count(),
            total_count: providers.len(),
            providers,
        }
    }

    /// Prometheus text exposition of every instrument
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails.
    pub fn metrics_text(&self) -> Result<String, DispatchError> {
        Ok(self.metrics.render()?)
    }

    #[must_use]
    pub fn dashboard(&self) -> DashboardSnapshot {
        self.metrics.dashboard()
    }

    /// Replace the queue depth gauge with the embedding application's own
    /// queue size
    pub fn set_queue_depth(&self, depth: u64) {
        self.metrics.dispatch.set_queue_depth(depth);
    }

    /// Limiter counters for one provider
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::UnknownProvider`] if no provider has this name.
    pub async fn rate_limit_stats(&self, provider: &str) -> Result<RateLimitStats, DispatchError> {
        self.registry.get(provider)?;
        Ok(self.limiter.stats(provider).await)
    }

    /// Start the health recovery loop
    #[must_use]
    pub fn spawn_recovery(&self, token: CancellationToken) -> ScheduledTask {
        Arc::clone(&self.recovery).spawn(token)
    }
}
