//! Alert conditions, evaluation and delivery
//!
//! Conditions are evaluated on a periodic tick against the counters recorded
//! since the previous tick, so a provider that failed heavily an hour ago does
//! not keep alerting once it has recovered. The consecutive failure alert is
//! additionally raised the moment the streak reaches its threshold.
//!
//! Delivering alerts anywhere beyond the log is left to an [`AlertSink`]
//! supplied by the embedding application.

use std::{collections::HashMap, fmt, sync::Arc};

use courier_common::internal;
use parking_lot::Mutex;
use prometheus::{IntCounterVec, Opts, Registry};
use serde::Serialize;

use crate::{
    MetricsError,
    config::AlertConfig,
    dispatch::{DispatchMetrics, ProviderStats},
};

/// A raised alert condition
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Alert {
    QueueDepth {
        depth: u64,
        threshold: u64,
    },
    FailureRate {
        provider: String,
        failure_rate: f64,
        threshold: f64,
        samples: u64,
    },
    Latency {
        provider: String,
        average_ms: f64,
        threshold_ms: u64,
    },
    ConsecutiveFailures {
        count: u32,
        threshold: u32,
        last_provider: Option<String>,
    },
}

impl Alert {
    /// Stable label used for the alert counter and in logs
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::QueueDepth { .. } => "queue_depth",
            Self::FailureRate { .. } => "failure_rate",
            Self::Latency { .. } => "latency",
            Self::ConsecutiveFailures { .. } => "consecutive_failures",
        }
    }
}

impl fmt::Display for Alert {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::QueueDepth { depth, threshold } => {
                write!(f, "Queue depth {depth} exceeds {threshold}")
            }
            Self::FailureRate {
                provider,
                failure_rate,
                threshold,
                samples,
            } => write!(
                f,
                "Provider {provider} failure rate {:.1}% exceeds {:.1}% over {samples} attempts",
                failure_rate * 100.0,
                threshold * 100.0
            ),
            Self::Latency {
                provider,
                average_ms,
                threshold_ms,
            } => write!(
                f,
                "Provider {provider} average latency {average_ms:.0}ms exceeds {threshold_ms}ms"
            ),
            Self::ConsecutiveFailures {
                count,
                threshold,
                last_provider,
            } => write!(
                f,
                "{count} consecutive send failures (threshold {threshold}, last provider {})",
                last_provider.as_deref().unwrap_or("none")
            ),
        }
    }
}

/// Destination for raised alerts
///
/// Implementations must not block: alerts are raised from the dispatch path.
pub trait AlertSink: Send + Sync + fmt::Debug {
    fn deliver(&self, alert: &Alert);
}

/// Writes alerts to the log as warnings
#[derive(Debug, Default)]
pub struct LogAlertSink;

impl AlertSink for LogAlertSink {
    fn deliver(&self, alert: &Alert) {
        internal!(level = WARN, alert = alert.kind(), "{alert}");
    }
}

/// Keeps every delivered alert in memory
#[derive(Debug, Default)]
pub struct RecordingAlertSink {
    alerts: Mutex<Vec<Alert>>,
}

impl RecordingAlertSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn alerts(&self) -> Vec<Alert> {
        self.alerts.lock().clone()
    }

    /// Remove and return everything recorded so far
    pub fn take(&self) -> Vec<Alert> {
        std::mem::take(&mut *self.alerts.lock())
    }
}

impl AlertSink for RecordingAlertSink {
    fn deliver(&self, alert: &Alert) {
        self.alerts.lock().push(alert.clone());
    }
}

/// Evaluates alert conditions and forwards raised alerts to a sink
#[derive(Debug)]
pub struct AlertManager {
    config: AlertConfig,
    sink: Arc<dyn AlertSink>,
    alerts_total: IntCounterVec,

    /// Provider counters as seen on the previous tick
    last_seen: Mutex<HashMap<String, ProviderStats>>,
}

impl AlertManager {
    /// # Errors
    ///
    /// Returns an error if the alert counter cannot be registered.
    pub fn new(
        config: AlertConfig,
        sink: Arc<dyn AlertSink>,
        registry: &Registry,
    ) -> Result<Self, MetricsError> {
        let alerts_total = IntCounterVec::new(
            Opts::new("courier_alerts_total", "Total number of alerts raised"),
            &["kind"],
        )?;
        registry.register(Box::new(alerts_total.clone()))?;

        Ok(Self {
            config,
            sink,
            alerts_total,
            last_seen: Mutex::new(HashMap::new()),
        })
    }

    #[must_use]
    pub const fn config(&self) -> &AlertConfig {
        &self.config
    }

    /// Count, log and deliver one alert
    pub fn raise(&self, alert: &Alert) {
        self.alerts_total.with_label_values(&[alert.kind()]).inc();
        internal!(level = DEBUG, alert = alert.kind(), "Alert raised");
        self.sink.deliver(alert);
    }

    /// Raise the consecutive failure alert when `count` has just reached the
    /// threshold. Returns whether an alert was raised.
    pub fn on_consecutive_failure(&self, count: u32, last_provider: &str) -> bool {
        let threshold = self.config.consecutive_failures_threshold;
        if threshold == 0 || count != threshold {
            return false;
        }

        self.raise(&Alert::ConsecutiveFailures {
            count,
            threshold,
            last_provider: Some(last_provider.to_string()),
        });
        true
    }

    /// Evaluate every condition against `metrics`, raise what fires, and
    /// return the raised alerts.
    pub fn evaluate(&self, metrics: &DispatchMetrics) -> Vec<Alert> {
        let mut alerts = Vec::new();

        let depth = metrics.queue_depth();
        if depth > self.config.queue_depth_threshold {
            alerts.push(Alert::QueueDepth {
                depth,
                threshold: self.config.queue_depth_threshold,
            });
        }

        {
            let mut last_seen = self.last_seen.lock();
            for (provider, current) in metrics.all_provider_stats() {
                let previous = last_seen.insert(provider.clone(), current).unwrap_or_default();
                let delta = current.since(&previous);

                if delta.attempts() == 0 || delta.attempts() < self.config.min_samples {
                    continue;
                }

                let failure_rate = delta.failure_rate();
                if failure_rate > self.config.failure_rate_threshold {
                    alerts.push(Alert::FailureRate {
                        provider: provider.clone(),
                        failure_rate,
                        threshold: self.config.failure_rate_threshold,
                        samples: delta.attempts(),
                    });
                }

                #[allow(clippy::cast_precision_loss, reason = "Thresholds are far below 2^52")]
                let threshold_ms = self.config.latency_threshold_ms as f64;
                let average_ms = delta.average_latency_ms();
                if average_ms > threshold_ms {
                    alerts.push(Alert::Latency {
                        provider,
                        average_ms,
                        threshold_ms: self.config.latency_threshold_ms,
                    });
                }
            }
        }

        let streak = metrics.consecutive_failures();
        let threshold = self.config.consecutive_failures_threshold;
        if threshold > 0 && streak >= threshold {
            alerts.push(Alert::ConsecutiveFailures {
                count: streak,
                threshold,
                last_provider: None,
            });
        }

        for alert in &alerts {
            self.raise(alert);
        }

        alerts
    }

    /// Total alerts raised for `kind` since startup
    #[must_use]
    pub fn raised(&self, kind: &str) -> u64 {
        self.alerts_total.with_label_values(&[kind]).get()
    }
}
