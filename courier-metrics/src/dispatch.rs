//! Dispatch pipeline metrics
//!
//! Tracks outbound sends including:
//! - Sent, failed, retried and rate-limited counts per provider
//! - Delivery feedback events per provider and outcome
//! - Send latency per provider
//! - In-flight, health score and enabled gauges per provider
//! - Queue depth and the cross-provider consecutive failure streak
//!
//! Every instrument is registered in a Prometheus [`Registry`]. Plain atomic
//! counters are kept alongside so the dashboard and the alert tick can read
//! totals without parsing the exposition output.

use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use dashmap::DashMap;
use prometheus::{
    HistogramOpts, HistogramVec, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry,
};
use serde::Serialize;

use crate::MetricsError;

const LATENCY_BUCKETS: &[f64] = &[0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0];

/// Point-in-time counters for one provider
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ProviderStats {
    pub sent: u64,
    pub failed: u64,
    pub retried: u64,
    pub rate_limited: u64,
    pub latency_total_ms: u64,
    pub latency_samples: u64,
}

impl ProviderStats {
    /// Transport attempts (successes plus failures)
    #[must_use]
    pub const fn attempts(&self) -> u64 {
        self.sent + self.failed
    }

    /// Failures over attempts, `0.0` when nothing was attempted
    #[must_use]
    #[allow(clippy::cast_precision_loss, reason = "Ratios tolerate precision loss")]
    pub fn failure_rate(&self) -> f64 {
        let attempts = self.attempts();
        if attempts == 0 {
            return 0.0;
        }
        self.failed as f64 / attempts as f64
    }

    /// Mean transport latency, `0.0` without samples
    #[must_use]
    #[allow(clippy::cast_precision_loss, reason = "Averages tolerate precision loss")]
    pub fn average_latency_ms(&self) -> f64 {
        if self.latency_samples == 0 {
            return 0.0;
        }
        self.latency_total_ms as f64 / self.latency_samples as f64
    }

    /// Counters accumulated since `earlier`
    #[must_use]
    pub const fn since(&self, earlier: &Self) -> Self {
        Self {
            sent: self.sent.saturating_sub(earlier.sent),
            failed: self.failed.saturating_sub(earlier.failed),
            retried: self.retried.saturating_sub(earlier.retried),
            rate_limited: self.rate_limited.saturating_sub(earlier.rate_limited),
            latency_total_ms: self.latency_total_ms.saturating_sub(earlier.latency_total_ms),
            latency_samples: self.latency_samples.saturating_sub(earlier.latency_samples),
        }
    }
}

#[derive(Debug, Default)]
struct ProviderCounters {
    sent: AtomicU64,
    failed: AtomicU64,
    retried: AtomicU64,
    rate_limited: AtomicU64,
    latency_total_ms: AtomicU64,
    latency_samples: AtomicU64,
}

impl ProviderCounters {
    fn snapshot(&self) -> ProviderStats {
        ProviderStats {
            sent: self.sent.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            rate_limited: self.rate_limited.load(Ordering::Relaxed),
            latency_total_ms: self.latency_total_ms.load(Ordering::Relaxed),
            latency_samples: self.latency_samples.load(Ordering::Relaxed),
        }
    }

    fn record_latency(&self, latency: Duration) {
        let millis = u64::try_from(latency.as_millis()).unwrap_or(u64::MAX);
        self.latency_total_ms.fetch_add(millis, Ordering::Relaxed);
        self.latency_samples.fetch_add(1, Ordering::Relaxed);
    }
}

/// Dispatch metrics collector
#[derive(Debug)]
pub struct DispatchMetrics {
    /// Messages accepted by a provider
    sent_total: IntCounterVec,

    /// Transport failures by provider and error class
    failed_total: IntCounterVec,

    /// Sends that moved on to another provider after this one failed
    retried_total: IntCounterVec,

    /// Attempts denied by admission control
    rate_limited_total: IntCounterVec,

    /// Delivery feedback reported after the send, by provider and outcome
    delivery_events_total: IntCounterVec,

    /// Distribution of transport call durations
    duration_seconds: HistogramVec,

    in_flight: IntGaugeVec,
    health_score: IntGaugeVec,
    enabled: IntGaugeVec,
    queue_depth: IntGauge,
    consecutive_failures: IntGauge,

    providers: DashMap<String, Arc<ProviderCounters>>,
}

impl DispatchMetrics {
    /// Create the instruments and register them with `registry`
    ///
    /// # Errors
    ///
    /// Returns an error if an instrument cannot be created or is already
    /// registered.
    pub fn new(registry: &Registry) -> Result<Self, MetricsError> {
        let sent_total = IntCounterVec::new(
            Opts::new(
                "courier_messages_sent_total",
                "Total number of messages accepted by a provider",
            ),
            &["provider"],
        )?;

        let failed_total = IntCounterVec::new(
            Opts::new(
                "courier_messages_failed_total",
                "Total number of failed transport attempts",
            ),
            &["provider", "error_class"],
        )?;

        let retried_total = IntCounterVec::new(
            Opts::new(
                "courier_messages_retried_total",
                "Total number of sends that fell back to another provider",
            ),
            &["provider"],
        )?;

        let rate_limited_total = IntCounterVec::new(
            Opts::new(
                "courier_rate_limited_total",
                "Total number of attempts denied by admission control",
            ),
            &["provider"],
        )?;

        let delivery_events_total = IntCounterVec::new(
            Opts::new(
                "courier_delivery_events_total",
                "Total number of delivery events reported by providers",
            ),
            &["provider", "outcome"],
        )?;

        let duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "courier_send_duration_seconds",
                "Distribution of provider transport call durations",
            )
            .buckets(LATENCY_BUCKETS.to_vec()),
            &["provider", "outcome"],
        )?;

        let in_flight = IntGaugeVec::new(
            Opts::new(
                "courier_provider_in_flight",
                "Transport calls currently in progress",
            ),
            &["provider"],
        )?;

        let health_score = IntGaugeVec::new(
            Opts::new("courier_provider_health_score", "Provider health score (0-100)"),
            &["provider"],
        )?;

        let enabled = IntGaugeVec::new(
            Opts::new(
                "courier_provider_enabled",
                "Whether the provider is admitted to selection (1) or disabled (0)",
            ),
            &["provider"],
        )?;

        let queue_depth = IntGauge::new("courier_queue_depth", "Sends currently in progress")?;

        let consecutive_failures = IntGauge::new(
            "courier_consecutive_failures",
            "Consecutive transport failures across all providers",
        )?;

        registry.register(Box::new(sent_total.clone()))?;
        registry.register(Box::new(failed_total.clone()))?;
        registry.register(Box::new(retried_total.clone()))?;
        registry.register(Box::new(rate_limited_total.clone()))?;
        registry.register(Box::new(delivery_events_total.clone()))?;
        registry.register(Box::new(duration_seconds.clone()))?;
        registry.register(Box::new(in_flight.clone()))?;
        registry.register(Box::new(health_score.clone()))?;
        registry.register(Box::new(enabled.clone()))?;
        registry.register(Box::new(queue_depth.clone()))?;
        registry.register(Box::new(consecutive_failures.clone()))?;

        Ok(Self {
            sent_total,
            failed_total,
            retried_total,
            rate_limited_total,
            delivery_events_total,
            duration_seconds,
            in_flight,
            health_score,
            enabled,
            queue_depth,
            consecutive_failures,
            providers: DashMap::new(),
        })
    }

    fn counters(&self, provider: &str) -> Arc<ProviderCounters> {
        if let Some(counters) = self.providers.get(provider) {
            return Arc::clone(&counters);
        }

        Arc::clone(
            &self
                .providers
                .entry(provider.to_string())
                .or_insert_with(|| Arc::new(ProviderCounters::default())),
        )
    }

    /// Make a provider visible in snapshots before it records any traffic
    pub fn register_provider(&self, provider: &str) {
        let _counters = self.counters(provider);
    }

    /// Record a message accepted by `provider`
    pub fn record_success(&self, provider: &str, latency: Duration) {
        self.sent_total.with_label_values(&[provider]).inc();
        self.duration_seconds
            .with_label_values(&[provider, "success"])
            .observe(latency.as_secs_f64());

        let counters = self.counters(provider);
        counters.sent.fetch_add(1, Ordering::Relaxed);
        counters.record_latency(latency);
    }

    /// Record a failed transport attempt
    pub fn record_failure(&self, provider: &str, error_class: &str, latency: Duration) {
        self.failed_total
            .with_label_values(&[provider, error_class])
            .inc();
        self.duration_seconds
            .with_label_values(&[provider, "failure"])
            .observe(latency.as_secs_f64());

        let counters = self.counters(provider);
        counters.failed.fetch_add(1, Ordering::Relaxed);
        counters.record_latency(latency);
    }

    /// Record a send moving on from `provider` to the next candidate
    pub fn record_retry(&self, provider: &str) {
        self.retried_total.with_label_values(&[provider]).inc();
        self.counters(provider)
            .retried
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Record an attempt denied by admission control
    pub fn record_rate_limited(&self, provider: &str) {
        self.rate_limited_total.with_label_values(&[provider]).inc();
        self.counters(provider)
            .rate_limited
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Record delivery feedback (delivered, bounced, ...) for `provider`
    pub fn record_delivery_event(&self, provider: &str, outcome: &str) {
        self.delivery_events_total
            .with_label_values(&[provider, outcome])
            .inc();
    }

    pub fn set_in_flight(&self, provider: &str, in_flight: u32) {
        self.in_flight
            .with_label_values(&[provider])
            .set(i64::from(in_flight));
    }

    pub fn set_provider_health(&self, provider: &str, score: u8, enabled: bool) {
        self.health_score
            .with_label_values(&[provider])
            .set(i64::from(score));
        self.enabled
            .with_label_values(&[provider])
            .set(i64::from(enabled));
    }

    pub fn set_queue_depth(&self, depth: u64) {
        self.queue_depth
            .set(i64::try_from(depth).unwrap_or(i64::MAX));
    }

    pub fn increment_queue_depth(&self) {
        self.queue_depth.inc();
    }

    pub fn decrement_queue_depth(&self) {
        self.queue_depth.dec();
    }

    #[must_use]
    pub fn queue_depth(&self) -> u64 {
        u64::try_from(self.queue_depth.get()).unwrap_or(0)
    }

    pub fn set_consecutive_failures(&self, count: u32) {
        self.consecutive_failures.set(i64::from(count));
    }

    #[must_use]
    pub fn consecutive_failures(&self) -> u32 {
        u32::try_from(self.consecutive_failures.get()).unwrap_or(0)
    }

    /// Total in-flight transport calls across providers
    #[must_use]
    pub fn in_flight_total(&self) -> u64 {
        self.providers
            .iter()
            .map(|entry| {
                u64::try_from(self.in_flight.with_label_values(&[entry.key().as_str()]).get())
                    .unwrap_or(0)
            })
            .sum()
    }

    /// Counters for one provider, `None` if it never recorded anything
    #[must_use]
    pub fn provider_stats(&self, provider: &str) -> Option<ProviderStats> {
        self.providers
            .get(provider)
            .map(|counters| counters.snapshot())
    }

    /// Counters for every known provider, sorted by name
    #[must_use]
    pub fn all_provider_stats(&self) -> Vec<(String, ProviderStats)> {
        let mut stats: Vec<_> = self
            .providers
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().snapshot()))
            .collect();
        stats.sort_by(|a, b| a.0.cmp(&b.0));
        stats
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn metrics() -> DispatchMetrics {
        DispatchMetrics::new(&Registry::new()).unwrap()
    }

    #[test]
    fn test_counters_track_outcomes() {
        let metrics = metrics();

        metrics.record_success("primary", Duration::from_millis(100));
        metrics.record_success("primary", Duration::from_millis(300));
        metrics.record_failure("primary", "timeout", Duration::from_millis(200));
        metrics.record_retry("primary");
        metrics.record_rate_limited("backup");

        let primary = metrics.provider_stats("primary").unwrap();
        assert_eq!(
            primary,
            ProviderStats {
                sent: 2,
                failed: 1,
                retried: 1,
                rate_limited: 0,
                latency_total_ms: 600,
                latency_samples: 3,
            }
        );
        assert!((primary.failure_rate() - 1.0 / 3.0).abs() < 1e-9);
        assert!((primary.average_latency_ms() - 200.0).abs() < 1e-9);

        let backup = metrics.provider_stats("backup").unwrap();
        assert_eq!(backup.rate_limited, 1);
        assert_eq!(backup.attempts(), 0);
        assert!(backup.failure_rate().abs() < f64::EPSILON);
    }

    #[test]
    fn test_delivery_events_exported() {
        let registry = Registry::new();
        let metrics = DispatchMetrics::new(&registry).unwrap();

        metrics.record_delivery_event("primary", "bounced");
        metrics.record_delivery_event("primary", "bounced");

        let text = prometheus::TextEncoder::new()
            .encode_to_string(&registry.gather())
            .unwrap();
        assert!(text.contains(
            "courier_delivery_events_total{outcome=\"bounced\",provider=\"primary\"} 2"
        ));
    }

    #[test]
    fn test_unknown_provider_has_no_stats() {
        let metrics = metrics();
        assert!(metrics.provider_stats("ghost").is_none());

        metrics.register_provider("ghost");
        assert_eq!(metrics.provider_stats("ghost"), Some(ProviderStats::default()));
    }

    #[test]
    fn test_since_subtracts_saturating() {
        let later = ProviderStats {
            sent: 10,
            failed: 4,
            retried: 2,
            rate_limited: 1,
            latency_total_ms: 1_000,
            latency_samples: 14,
        };
        let earlier = ProviderStats {
            sent: 6,
            failed: 4,
            ..ProviderStats::default()
        };

        let delta = later.since(&earlier);
        assert_eq!(delta.sent, 4);
        assert_eq!(delta.failed, 0);
        assert_eq!(delta.latency_samples, 14);
        assert_eq!(earlier.since(&later), ProviderStats::default());
    }

    #[test]
    fn test_gauges() {
        let metrics = metrics();
        metrics.register_provider("primary");
        metrics.register_provider("backup");

        metrics.set_in_flight("primary", 3);
        metrics.set_in_flight("backup", 2);
        assert_eq!(metrics.in_flight_total(), 5);

        metrics.set_queue_depth(7);
        metrics.increment_queue_depth();
        metrics.decrement_queue_depth();
        metrics.decrement_queue_depth();
        assert_eq!(metrics.queue_depth(), 6);

        metrics.set_consecutive_failures(4);
        assert_eq!(metrics.consecutive_failures(), 4);
    }

    #[test]
    fn test_duplicate_registration_fails() {
        let registry = Registry::new();
        assert!(DispatchMetrics::new(&registry).is_ok());
        assert!(DispatchMetrics::new(&registry).is_err());
    }
}
