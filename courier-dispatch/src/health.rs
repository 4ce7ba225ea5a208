//! Provider health scoring
//!
//! # States
//!
//! ```text
//!            failure (-20)                 failure, score reaches 0
//! ┌─────────┐ ───────────> ┌──────────┐ ─────────────────────────> ┌──────────┐
//! │ Healthy │              │ Degraded │                            │ Disabled │
//! └─────────┘ <─────────── └──────────┘ <───────────────────────── └──────────┘
//!            success (+5)                  recovery loop, after cooldown
//! ```
//!
//! A success only ever raises the score; it never re-enables a disabled
//! provider. The scorer also keeps one consecutive failure counter across
//! all providers, reset by any success, which feeds the consecutive
//! failure alert.

use std::sync::{
    Arc,
    atomic::{AtomicU32, Ordering},
};

use courier_metrics::Metrics;
use serde::{Deserialize, Serialize};

use crate::{
    clock::Clock,
    error::DispatchError,
    provider::{MAX_HEALTH, ProviderRegistry},
};

/// Configuration for health scoring
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    /// Points added for each success
    #[serde(default = "default_success_increment")]
    pub success_increment: u8,

    /// Points removed for each failure
    #[serde(default = "default_failure_penalty")]
    pub failure_penalty: u8,

    /// Scores at or above this are reported as healthy, below as degraded
    #[serde(default = "default_healthy_threshold")]
    pub healthy_threshold: u8,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            success_increment: default_success_increment(),
            failure_penalty: default_failure_penalty(),
            healthy_threshold: default_healthy_threshold(),
        }
    }
}

const fn default_success_increment() -> u8 {
    5
}

const fn default_failure_penalty() -> u8 {
    20
}

const fn default_healthy_threshold() -> u8 {
    80
}

impl HealthConfig {
    /// # Errors
    ///
    /// Returns [`DispatchError::Configuration`] if a step is zero or the
    /// threshold is outside `1..=100`.
    pub fn validate(&self) -> Result<(), DispatchError> {
        if self.success_increment == 0 || self.failure_penalty == 0 {
            return Err(DispatchError::Configuration(
                "health: success_increment and failure_penalty must be greater than 0".into(),
            ));
        }
        if self.healthy_threshold == 0 || self.healthy_threshold > MAX_HEALTH {
            return Err(DispatchError::Configuration(
                "health: healthy_threshold must be between 1 and 100".into(),
            ));
        }
        Ok(())
    }

    #[must_use]
    pub const fn state(&self, enabled: bool, score: u8) -> HealthState {
        if !enabled || score == 0 {
            HealthState::Disabled
        } else if score >= self.healthy_threshold {
            HealthState::Healthy
        } else {
            HealthState::Degraded
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    Healthy,
    Degraded,
    Disabled,
}

/// Applies transport outcomes to provider health
#[derive(Debug)]
pub struct HealthScorer {
    config: HealthConfig,
    registry: Arc<ProviderRegistry>,
    metrics: Arc<Metrics>,
    clock: Arc<dyn Clock>,
    consecutive_failures: AtomicU32,
}

impl HealthScorer {
    #[must_use]
    pub fn new(
        config: HealthConfig,
        registry: Arc<ProviderRegistry>,
        metrics: Arc<Metrics>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            registry,
            metrics,
            clock,
            consecutive_failures: AtomicU32::new(0),
        }
    }

    #[must_use]
    pub const fn config(&self) -> &HealthConfig {
        &self.config
    }

    /// Failures across all providers since the last success
    #[must_use]
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Acquire)
    }

    /// Raise the provider's score and reset the failure streak.
    ///
    /// Returns the new score, or `None` for an unknown provider.
    pub fn on_success(&self, provider: &str) -> Option<u8> {
        self.consecutive_failures.store(0, Ordering::Release);
        self.metrics.dispatch.set_consecutive_failures(0);

        self.adjust(provider, i32::from(self.config.success_increment))
    }

    /// Lower the provider's score and extend the failure streak, raising the
    /// consecutive failure alert when the streak reaches its threshold.
    ///
    /// Returns the new score, or `None` for an unknown provider.
    pub fn on_failure(&self, provider: &str) -> Option<u8> {
        let streak = self
            .consecutive_failures
            .fetch_add(1, Ordering::AcqRel)
            .saturating_add(1);
        self.metrics.dispatch.set_consecutive_failures(streak);
        self.metrics.alerts.on_consecutive_failure(streak, provider);

        let score = self.adjust(provider, -i32::from(self.config.failure_penalty))?;
        if score == 0 {
            tracing::warn!(
                provider,
                consecutive_failures = streak,
                "Provider health exhausted, disabling"
            );
        }

        Some(score)
    }

    fn adjust(&self, provider: &str, delta: i32) -> Option<u8> {
        match self.registry.adjust_health(provider, delta, self.clock.now()) {
            Ok(score) => {
                self.publish(provider);
                tracing::debug!(provider, delta, score, "Health adjusted");
                Some(score)
            }
            Err(e) => {
                tracing::warn!(provider, error = %e, "Cannot adjust health");
                None
            }
        }
    }

    /// Push the provider's current score and enabled flag to the gauges
    pub fn publish(&self, provider: &str) {
        if let Ok(provider) = self.registry.get(provider) {
            let snapshot = provider.snapshot();
            self.metrics.dispatch.set_provider_health(
                &snapshot.name,
                snapshot.health_score,
                snapshot.enabled,
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use courier_metrics::{Alert, AlertConfig, MetricsConfig, RecordingAlertSink};
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        clock::ManualClock,
        provider::Provider,
        transport::ScriptedTransport,
    };

    struct Fixture {
        scorer: HealthScorer,
        registry: Arc<ProviderRegistry>,
        metrics: Arc<Metrics>,
        sink: Arc<RecordingAlertSink>,
    }

    fn fixture(threshold: u32) -> Fixture {
        let registry = Arc::new(
            ProviderRegistry::new(vec![
                Provider::new("a", Arc::new(ScriptedTransport::accepting()), 1, 1.0, true),
                Provider::new("b", Arc::new(ScriptedTransport::accepting()), 1, 1.0, true),
            ])
            .unwrap(),
        );
        let sink = Arc::new(RecordingAlertSink::new());
        let config = MetricsConfig {
            alerts: AlertConfig {
                consecutive_failures_threshold: threshold,
                ..AlertConfig::default()
            },
            ..MetricsConfig::default()
        };
        let metrics = Arc::new(Metrics::new(config, sink.clone()).unwrap());
        let clock = Arc::new(ManualClock::at_unix_secs(1_000));

        Fixture {
            scorer: HealthScorer::new(
                HealthConfig::default(),
                Arc::clone(&registry),
                Arc::clone(&metrics),
                clock,
            ),
            registry,
            metrics,
            sink,
        }
    }

    #[test]
    fn test_success_and_failure_steps() {
        let f = fixture(10);

        assert_eq!(f.scorer.on_failure("a"), Some(80));
        assert_eq!(f.scorer.on_success("a"), Some(85));
        for _ in 0..10 {
            f.scorer.on_success("a");
        }
        assert_eq!(f.registry.get("a").unwrap().health_score(), 100);
    }

    #[test]
    fn test_five_failures_disable() {
        let f = fixture(10);

        for expected in [80, 60, 40, 20, 0] {
            assert_eq!(f.scorer.on_failure("a"), Some(expected));
        }
        assert_eq!(f.scorer.on_failure("a"), Some(0));

        let a = f.registry.get("a").unwrap();
        assert!(!a.is_enabled());
        assert_eq!(
            HealthConfig::default().state(a.is_enabled(), a.health_score()),
            HealthState::Disabled
        );
    }

    #[test]
    fn test_streak_spans_providers_and_resets() {
        let f = fixture(3);

        f.scorer.on_failure("a");
        f.scorer.on_failure("b");
        assert_eq!(f.scorer.consecutive_failures(), 2);
        assert!(f.sink.alerts().is_empty());

        f.scorer.on_failure("a");
        assert_eq!(
            f.sink.take(),
            vec![Alert::ConsecutiveFailures {
                count: 3,
                threshold: 3,
                last_provider: Some("a".to_string()),
            }]
        );

        f.scorer.on_success("b");
        assert_eq!(f.scorer.consecutive_failures(), 0);
        assert_eq!(f.metrics.dispatch.consecutive_failures(), 0);
    }

    #[test]
    fn test_unknown_provider_is_swallowed() {
        let f = fixture(10);
        assert_eq!(f.scorer.on_failure("ghost"), None);
        assert_eq!(f.scorer.on_success("ghost"), None);
    }

    #[test]
    fn test_gauges_follow_score() {
        let f = fixture(10);
        f.scorer.on_failure("b");

        let text = f.metrics.render().unwrap();
        assert!(text.contains("courier_provider_health_score{provider=\"b\"} 80"));
    }

    #[test]
    fn test_state_bands() {
        let config = HealthConfig::default();
        assert_eq!(config.state(true, 100), HealthState::Healthy);
        assert_eq!(config.state(true, 80), HealthState::Healthy);
        assert_eq!(config.state(true, 79), HealthState::Degraded);
        assert_eq!(config.state(true, 0), HealthState::Disabled);
        assert_eq!(config.state(false, 100), HealthState::Disabled);
    }
}
