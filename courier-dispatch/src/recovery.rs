//! Background health recovery
//!
//! Runs on a fixed interval and does two things:
//! - A provider disabled by failures is re-enabled at
//!   [`RECOVERY_HEALTH`] once its last error is older than the cooldown,
//!   whatever its score has drifted to since
//! - An enabled provider below full health that has seen no traffic for the
//!   idle period is healed by a fixed increment, up to 100
//!
//! Providers disabled in configuration or by an operator are left alone.

use std::{
    sync::Arc,
    time::{Duration, SystemTime},
};

use courier_common::{ScheduledTask, internal, task::CancellationToken};
use serde::{Deserialize, Serialize};

use crate::{
    clock::Clock,
    error::DispatchError,
    health::HealthScorer,
    provider::{MAX_HEALTH, ProviderRegistry, ProviderSnapshot, RECOVERY_HEALTH},
};

const fn default_interval_secs() -> u64 {
    30
}

const fn default_cooldown_secs() -> u64 {
    300
}

const fn default_idle_secs() -> u64 {
    60
}

const fn default_heal_increment() -> u8 {
    10
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryConfig {
    /// How often the loop runs (in seconds)
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,

    /// How long a disabled provider must stay error free before it is
    /// re-enabled (in seconds)
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,

    /// How long an enabled provider must go without traffic before it is
    /// healed (in seconds)
    #[serde(default = "default_idle_secs")]
    pub idle_secs: u64,

    /// Points added to an idle provider per run
    #[serde(default = "default_heal_increment")]
    pub heal_increment: u8,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            cooldown_secs: default_cooldown_secs(),
            idle_secs: default_idle_secs(),
            heal_increment: default_heal_increment(),
        }
    }
}

impl RecoveryConfig {
    #[must_use]
    pub const fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    /// # Errors
    ///
    /// Returns [`DispatchError::Configuration`] for a zero interval or heal
    /// increment.
    pub fn validate(&self) -> Result<(), DispatchError> {
        if self.interval_secs == 0 {
            return Err(DispatchError::Configuration(
                "recovery: interval_secs must be greater than 0".into(),
            ));
        }
        if self.heal_increment == 0 {
            return Err(DispatchError::Configuration(
                "recovery: heal_increment must be greater than 0".into(),
            ));
        }
        Ok(())
    }
}

/// What one recovery run changed
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    pub reenabled: Vec<String>,
    pub healed: Vec<String>,
}

impl RecoveryReport {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.reenabled.is_empty() && self.healed.is_empty()
    }
}

#[derive(Debug)]
pub struct HealthRecovery {
    config: RecoveryConfig,
    registry: Arc<ProviderRegistry>,
    scorer: Arc<HealthScorer>,
    clock: Arc<dyn Clock>,
}

fn elapsed_since(now: SystemTime, then: SystemTime) -> Duration {
    now.duration_since(then).unwrap_or_default()
}

impl HealthRecovery {
    #[must_use]
    pub fn new(
        config: RecoveryConfig,
        registry: Arc<ProviderRegistry>,
        scorer: Arc<HealthScorer>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            registry,
            scorer,
            clock,
        }
    }

    #[must_use]
    pub const fn config(&self) -> &RecoveryConfig {
        &self.config
    }

    fn cooled_down(&self, snapshot: &ProviderSnapshot, now: SystemTime) -> bool {
        !snapshot.enabled
            && snapshot.tripped_by_health
            && snapshot.last_error_at.is_some_and(|at| {
                elapsed_since(now, at) >= Duration::from_secs(self.config.cooldown_secs)
            })
    }

    fn idle(&self, snapshot: &ProviderSnapshot, now: SystemTime) -> bool {
        let last_activity = snapshot.last_used_at.max(snapshot.last_error_at);
        snapshot.enabled
            && snapshot.health_score < MAX_HEALTH
            && last_activity.is_none_or(|at| {
                elapsed_since(now, at) >= Duration::from_secs(self.config.idle_secs)
            })
    }

    /// One pass over every provider at the current time
    pub fn run(&self) -> RecoveryReport {
        self.run_at(self.clock.now())
    }

    /// One pass over every provider at `now`
    pub fn run_at(&self, now: SystemTime) -> RecoveryReport {
        let mut report = RecoveryReport::default();

        for provider in self.registry.all() {
            let snapshot = provider.snapshot();

            if self.cooled_down(&snapshot, now) {
                if let Err(e) = self.registry.reenable(&snapshot.name, RECOVERY_HEALTH) {
                    tracing::warn!(provider = %snapshot.name, error = %e, "Cannot re-enable provider");
                    continue;
                }
                internal!(
                    level = INFO,
                    provider = %snapshot.name,
                    health_score = RECOVERY_HEALTH,
                    "Provider re-enabled after cooldown"
                );
                self.scorer.publish(&snapshot.name);
                report.reenabled.push(snapshot.name);
            } else if self.idle(&snapshot, now) {
                match self.registry.adjust_health(
                    &snapshot.name,
                    i32::from(self.config.heal_increment),
                    now,
                ) {
                    Ok(score) => {
                        internal!(
                            level = DEBUG,
                            provider = %snapshot.name,
                            health_score = score,
                            "Idle provider healed"
                        );
                        self.scorer.publish(&snapshot.name);
                        report.healed.push(snapshot.name);
                    }
                    Err(e) => {
                        tracing::warn!(provider = %snapshot.name, error = %e, "Cannot heal provider");
                    }
                }
            }
        }

        report
    }

    /// Run every [`RecoveryConfig::interval_secs`] until `token` is cancelled
    #[must_use]
    pub fn spawn(self: Arc<Self>, token: CancellationToken) -> ScheduledTask {
        let period = self.config.interval();
        ScheduledTask::spawn("health-recovery", period, token, move || {
            let recovery = Arc::clone(&self);
            async move {
                let report = recovery.run();
                if !report.is_empty() {
                    internal!(
                        level = DEBUG,
                        reenabled = report.reenabled.len(),
                        healed = report.healed.len(),
                        "Health recovery pass complete"
                    );
                }
            }
        })
    }
}
