//! Dashboard aggregate over cumulative counters

use serde::Serialize;

use crate::{
    config::HealthThresholds,
    dispatch::{DispatchMetrics, ProviderStats},
};

/// Qualitative health derived from failure rate and latency
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthLabel {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthLabel {
    /// Label a failure rate and average latency against `thresholds`
    #[must_use]
    #[allow(clippy::cast_precision_loss, reason = "Thresholds are far below 2^52")]
    pub fn classify(failure_rate: f64, average_latency_ms: f64, thresholds: &HealthThresholds) -> Self {
        if failure_rate >= thresholds.unhealthy_failure_rate
            || average_latency_ms >= thresholds.unhealthy_latency_ms as f64
        {
            Self::Unhealthy
        } else if failure_rate >= thresholds.degraded_failure_rate
            || average_latency_ms >= thresholds.degraded_latency_ms as f64
        {
            Self::Degraded
        } else {
            Self::Healthy
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProviderDashboard {
    pub provider: String,
    pub sent: u64,
    pub failed: u64,
    pub retried: u64,
    pub rate_limited: u64,
    pub failure_rate: f64,
    pub average_latency_ms: f64,
    pub health: HealthLabel,
}

impl ProviderDashboard {
    fn new(provider: String, stats: &ProviderStats, thresholds: &HealthThresholds) -> Self {
        let failure_rate = stats.failure_rate();
        let average_latency_ms = stats.average_latency_ms();

        Self {
            provider,
            sent: stats.sent,
            failed: stats.failed,
            retried: stats.retried,
            rate_limited: stats.rate_limited,
            failure_rate,
            average_latency_ms,
            health: HealthLabel::classify(failure_rate, average_latency_ms, thresholds),
        }
    }
}

/// Totals since startup plus one row per provider
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DashboardSnapshot {
    pub total_sent: u64,
    pub total_failed: u64,
    pub total_rate_limited: u64,
    pub failure_rate: f64,
    pub average_latency_ms: f64,
    pub queue_depth: u64,
    pub in_flight: u64,
    pub consecutive_failures: u32,
    pub providers: Vec<ProviderDashboard>,

    /// Overall label; the worst of the aggregate and any single provider
    pub health: HealthLabel,
}

impl DashboardSnapshot {
    #[must_use]
    pub fn collect(metrics: &DispatchMetrics, thresholds: &HealthThresholds) -> Self {
        let mut totals = ProviderStats::default();
        let mut providers = Vec::new();

        for (provider, stats) in metrics.all_provider_stats() {
            totals.sent += stats.sent;
            totals.failed += stats.failed;
            totals.retried += stats.retried;
            totals.rate_limited += stats.rate_limited;
            totals.latency_total_ms += stats.latency_total_ms;
            totals.latency_samples += stats.latency_samples;

            providers.push(ProviderDashboard::new(provider, &stats, thresholds));
        }

        let failure_rate = totals.failure_rate();
        let average_latency_ms = totals.average_latency_ms();
        let health = providers
            .iter()
            .map(|p| p.health)
            .chain(std::iter::once(HealthLabel::classify(
                failure_rate,
                average_latency_ms,
                thresholds,
            )))
            .max()
            .unwrap_or(HealthLabel::Healthy);

        Self {
            total_sent: totals.sent,
            total_failed: totals.failed,
            total_rate_limited: totals.rate_limited,
            failure_rate,
            average_latency_ms,
            queue_depth: metrics.queue_depth(),
            in_flight: metrics.in_flight_total(),
            consecutive_failures: metrics.consecutive_failures(),
            providers,
            health,
        }
    }
}
