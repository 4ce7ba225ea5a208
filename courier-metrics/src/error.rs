//! Error types for metrics operations

use thiserror::Error;

/// Errors that can occur during metrics operations
#[derive(Debug, Error)]
pub enum MetricsError {
    /// Instrument creation or registration failed
    #[error("Prometheus error: {0}")]
    Prometheus(#[from] prometheus::Error),

    /// Exposition text could not be produced
    #[error("Prometheus export error: {0}")]
    PrometheusExport(String),

    /// Invalid metrics or alerting configuration
    #[error("Invalid metrics configuration: {0}")]
    Configuration(String),
}
