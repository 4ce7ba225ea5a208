//! Metrics and alerting for the courier dispatcher
//!
//! This crate observes the dispatch pipeline without ever being able to fail
//! it: recording is infallible, and only construction and exposition return
//! errors.
//!
//! # Features
//!
//! - **Dispatch Metrics**: sent/failed/retried/rate-limited counts, latency
//!   histograms, in-flight, health and queue gauges
//! - **Exposition**: Prometheus text format rendered on demand for scraping
//! - **Dashboard**: cumulative totals with a healthy/degraded/unhealthy label
//! - **Alerts**: queue depth, failure rate, latency and consecutive failure
//!   conditions delivered to an [`AlertSink`]
//!
//! # Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use courier_metrics::{LogAlertSink, Metrics, MetricsConfig};
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let metrics = Metrics::new(MetricsConfig::default(), Arc::new(LogAlertSink))?;
//!
//! metrics.dispatch.record_success("primary", std::time::Duration::from_millis(120));
//! println!("{}", metrics.render()?);
//! # Ok(())
//! # }
//! ```

mod alert;
mod config;
mod dashboard;
mod dispatch;
mod error;

use std::sync::Arc;

pub use alert::{Alert, AlertManager, AlertSink, LogAlertSink, RecordingAlertSink};
pub use config::{AlertConfig, HealthThresholds, MetricsConfig};
use courier_common::internal;
pub use dashboard::{DashboardSnapshot, HealthLabel, ProviderDashboard};
pub use dispatch::{DispatchMetrics, ProviderStats};
pub use error::MetricsError;
use prometheus::{Encoder, Registry, TextEncoder};

/// Root metrics container, owned by a dispatch service
#[derive(Debug)]
pub struct Metrics {
    pub dispatch: DispatchMetrics,
    pub alerts: AlertManager,
    config: MetricsConfig,
    registry: Registry,
}

impl Metrics {
    /// Build a metrics container with its own registry
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the instruments
    /// cannot be registered.
    pub fn new(config: MetricsConfig, sink: Arc<dyn AlertSink>) -> Result<Self, MetricsError> {
        config.validate()?;

        let registry = Registry::new();
        let dispatch = DispatchMetrics::new(&registry)?;
        let alerts = AlertManager::new(config.alerts.clone(), sink, &registry)?;

        Ok(Self {
            dispatch,
            alerts,
            config,
            registry,
        })
    }

    #[must_use]
    pub const fn config(&self) -> &MetricsConfig {
        &self.config
    }

    /// Render every registered instrument in the Prometheus text format
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails.
    pub fn render(&self) -> Result<String, MetricsError> {
        let encoder = TextEncoder::new();
        let families = self.registry.gather();

        let mut buffer = Vec::new();
        encoder
            .encode(&families, &mut buffer)
            .map_err(|e| MetricsError::PrometheusExport(e.to_string()))?;

        String::from_utf8(buffer).map_err(|e| MetricsError::PrometheusExport(e.to_string()))
    }

    #[must_use]
    pub fn dashboard(&self) -> DashboardSnapshot {
        DashboardSnapshot::collect(&self.dispatch, &self.config.health)
    }

    /// One alert evaluation pass, run by the periodic metrics task
    pub fn tick(&self) -> Vec<Alert> {
        let alerts = self.alerts.evaluate(&self.dispatch);
        internal!(
            level = DEBUG,
            alerts = alerts.len(),
            queue_depth = self.dispatch.queue_depth(),
            "Metrics tick complete"
        );
        alerts
    }
}
