//! Metrics and alerting configuration

use serde::{Deserialize, Serialize};

use crate::MetricsError;

/// Configuration for metrics collection and the periodic alert tick
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable or disable the periodic alert evaluation tick
    ///
    /// Counters are always recorded; this only controls whether alerts are
    /// evaluated in the background.
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// How often alert conditions are evaluated (in seconds)
    #[serde(default = "default_tick_interval_secs")]
    pub tick_interval_secs: u64,

    /// Thresholds used to label provider health on the dashboard
    #[serde(default)]
    pub health: HealthThresholds,

    /// Alert ceilings
    #[serde(default)]
    pub alerts: AlertConfig,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            tick_interval_secs: default_tick_interval_secs(),
            health: HealthThresholds::default(),
            alerts: AlertConfig::default(),
        }
    }
}

impl MetricsConfig {
    /// Check that every ratio lies in `[0, 1]` and every ordering holds
    ///
    /// # Errors
    ///
    /// Returns [`MetricsError::Configuration`] describing the first violation.
    pub fn validate(&self) -> Result<(), MetricsError> {
        if self.tick_interval_secs == 0 {
            return Err(MetricsError::Configuration(
                "tick_interval_secs must be greater than 0".to_string(),
            ));
        }

        for (name, value) in [
            ("health.degraded_failure_rate", self.health.degraded_failure_rate),
            ("health.unhealthy_failure_rate", self.health.unhealthy_failure_rate),
            ("alerts.failure_rate_threshold", self.alerts.failure_rate_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(MetricsError::Configuration(format!(
                    "{name} must be between 0.0 and 1.0"
                )));
            }
        }

        if self.health.degraded_failure_rate > self.health.unhealthy_failure_rate {
            return Err(MetricsError::Configuration(
                "health.degraded_failure_rate must not exceed health.unhealthy_failure_rate"
                    .to_string(),
            ));
        }

        if self.health.degraded_latency_ms > self.health.unhealthy_latency_ms {
            return Err(MetricsError::Configuration(
                "health.degraded_latency_ms must not exceed health.unhealthy_latency_ms"
                    .to_string(),
            ));
        }

        Ok(())
    }
}

/// Failure-rate and latency bands for the qualitative health label
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthThresholds {
    /// Failure rate at or above which a provider is `degraded`
    #[serde(default = "defaults::degraded_failure_rate")]
    pub degraded_failure_rate: f64,

    /// Failure rate at or above which a provider is `unhealthy`
    #[serde(default = "defaults::unhealthy_failure_rate")]
    pub unhealthy_failure_rate: f64,

    /// Average latency at or above which a provider is `degraded`
    #[serde(default = "defaults::degraded_latency_ms")]
    pub degraded_latency_ms: u64,

    /// Average latency at or above which a provider is `unhealthy`
    #[serde(default = "defaults::unhealthy_latency_ms")]
    pub unhealthy_latency_ms: u64,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            degraded_failure_rate: defaults::degraded_failure_rate(),
            unhealthy_failure_rate: defaults::unhealthy_failure_rate(),
            degraded_latency_ms: defaults::degraded_latency_ms(),
            unhealthy_latency_ms: defaults::unhealthy_latency_ms(),
        }
    }
}

/// Ceilings that raise alerts when exceeded
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertConfig {
    /// Sends in progress above which a queue depth alert fires
    #[serde(default = "defaults::queue_depth_threshold")]
    pub queue_depth_threshold: u64,

    /// Per-provider failure rate above which an alert fires
    #[serde(default = "defaults::failure_rate_threshold")]
    pub failure_rate_threshold: f64,

    /// Per-provider average latency above which an alert fires
    #[serde(default = "defaults::latency_threshold_ms")]
    pub latency_threshold_ms: u64,

    /// Consecutive failures across all providers that raise an alert
    #[serde(default = "defaults::consecutive_failures_threshold")]
    pub consecutive_failures_threshold: u32,

    /// Attempts a provider needs within one tick before rate and latency
    /// alerts are considered
    #[serde(default = "defaults::min_samples")]
    pub min_samples: u64,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            queue_depth_threshold: defaults::queue_depth_threshold(),
            failure_rate_threshold: defaults::failure_rate_threshold(),
            latency_threshold_ms: defaults::latency_threshold_ms(),
            consecutive_failures_threshold: defaults::consecutive_failures_threshold(),
            min_samples: defaults::min_samples(),
        }
    }
}

const fn default_enabled() -> bool {
    true
}

const fn default_tick_interval_secs() -> u64 {
    60
}

mod defaults {
    pub const fn degraded_failure_rate() -> f64 {
        0.05
    }

    pub const fn unhealthy_failure_rate() -> f64 {
        0.25
    }

    pub const fn degraded_latency_ms() -> u64 {
        2_000
    }

    pub const fn unhealthy_latency_ms() -> u64 {
        10_000
    }

    pub const fn queue_depth_threshold() -> u64 {
        1_000
    }

    pub const fn failure_rate_threshold() -> f64 {
        0.10
    }

    pub const fn latency_threshold_ms() -> u64 {
        5_000
    }

    pub const fn consecutive_failures_threshold() -> u32 {
        10
    }

    pub const fn min_samples() -> u64 {
        10
    }
}
