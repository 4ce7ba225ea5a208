//! Dispatch configuration
//!
//! Loaded once at startup, typically from the `dispatch` section of
//! `courier.config.ron`:
//!
//! ```ron
//! (
//!     providers: [
//!         (
//!             name: "primary",
//!             transport: HttpApi(endpoint: "https://api.example.com/v1/send", api_key: "secret"),
//!             priority_tier: 1,
//!             rate_limits: (per_second: 10, per_minute: 500, burst: (tokens: 20, interval_secs: 60)),
//!         ),
//!         (
//!             name: "relay",
//!             transport: Smtp(host: "smtp.example.net", port: 587),
//!             priority_tier: 2,
//!             weight: 2.0,
//!         ),
//!     ],
//!     rate_limit_store: Redis(url: "redis://127.0.0.1:6379"),
//! )
//! ```

use std::{collections::HashSet, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{
    error::DispatchError, health::HealthConfig, rate_limiter::RateLimitConfig,
    recovery::RecoveryConfig, store::StoreConfig, transport::TransportConfig,
};

const fn default_priority_tier() -> u32 {
    1
}

const fn default_weight() -> f64 {
    1.0
}

const fn default_enabled() -> bool {
    true
}

const fn default_timeout_secs() -> u64 {
    30
}

/// One provider as written in configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Unique name, used in logs, metrics labels and limiter keys
    pub name: String,

    pub transport: TransportConfig,

    /// Lower tiers are tried first
    #[serde(default = "default_priority_tier")]
    pub priority_tier: u32,

    /// Relative selection mass within the tier
    #[serde(default = "default_weight")]
    pub weight: f64,

    #[serde(default = "default_enabled")]
    pub enabled: bool,

    #[serde(default)]
    pub rate_limits: RateLimitConfig,

    /// Deadline for one transport call (in seconds)
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl ProviderConfig {
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// # Errors
    ///
    /// Returns [`DispatchError::Configuration`] describing the first problem.
    pub fn validate(&self) -> Result<(), DispatchError> {
        if self.name.trim().is_empty() {
            return Err(DispatchError::Configuration(
                "provider name must not be empty".into(),
            ));
        }
        if !self.weight.is_finite() || self.weight <= 0.0 {
            return Err(DispatchError::Configuration(format!(
                "provider {}: weight must be a positive number, got {}",
                self.name, self.weight
            )));
        }
        if self.timeout_secs == 0 {
            return Err(DispatchError::Configuration(format!(
                "provider {}: timeout_secs must be greater than 0",
                self.name
            )));
        }

        self.rate_limits.validate(&self.name)?;
        self.transport.validate(&self.name)
    }
}

/// Everything the dispatch service is built from
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DispatchConfig {
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,

    #[serde(default)]
    pub health: HealthConfig,

    #[serde(default)]
    pub recovery: RecoveryConfig,

    #[serde(default)]
    pub rate_limit_store: StoreConfig,
}

impl DispatchConfig {
    /// # Errors
    ///
    /// Returns [`DispatchError::Configuration`] for duplicate provider names
    /// or any invalid section.
    pub fn validate(&self) -> Result<(), DispatchError> {
        let mut seen = HashSet::with_capacity(self.providers.len());
        for provider in &self.providers {
            provider.validate()?;
            if !seen.insert(provider.name.as_str()) {
                return Err(DispatchError::Configuration(format!(
                    "duplicate provider name {}",
                    provider.name
                )));
            }
        }

        self.health.validate()?;
        self.recovery.validate()?;
        self.rate_limit_store.validate()
    }
}
