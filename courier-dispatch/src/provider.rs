//! Provider registry
//!
//! Static attributes (name, transport, tier, weight) are fixed at startup.
//! Dynamic state (enabled flag, health score, timestamps) sits behind one
//! lock per provider, so updates to different providers never contend and
//! no operation spans more than one provider.

use std::{sync::Arc, time::SystemTime};

use ahash::AHashMap;
use parking_lot::Mutex;
use serde::Serialize;

use crate::{
    error::DispatchError,
    transport::{Transport, TransportKind},
};

pub const MAX_HEALTH: u8 = 100;

/// Score given to a provider brought back from the disabled state
pub const RECOVERY_HEALTH: u8 = 50;

#[derive(Debug, Clone, Copy)]
struct ProviderState {
    enabled: bool,
    health_score: u8,
    last_used_at: Option<SystemTime>,
    last_error_at: Option<SystemTime>,
    /// Disabled by reaching zero health, as opposed to by configuration or
    /// an operator
    tripped_by_health: bool,
}

/// One configured transport provider
#[derive(Debug)]
pub struct Provider {
    name: String,
    transport: Arc<dyn Transport>,
    priority_tier: u32,
    weight: f64,
    state: Mutex<ProviderState>,
}

/// Point-in-time copy of a provider's attributes and state
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProviderSnapshot {
    pub name: String,
    pub kind: TransportKind,
    pub priority_tier: u32,
    pub weight: f64,
    pub enabled: bool,
    pub health_score: u8,
    pub last_used_at: Option<SystemTime>,
    pub last_error_at: Option<SystemTime>,
    pub tripped_by_health: bool,
}

impl Provider {
    /// A provider starts at full health
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        transport: Arc<dyn Transport>,
        priority_tier: u32,
        weight: f64,
        enabled: bool,
    ) -> Self {
        Self {
            name: name.into(),
            transport,
            priority_tier,
            weight,
            state: Mutex::new(ProviderState {
                enabled,
                health_score: MAX_HEALTH,
                last_used_at: None,
                last_error_at: None,
                tripped_by_health: false,
            }),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    #[must_use]
    pub fn kind(&self) -> TransportKind {
        self.transport.kind()
    }

    #[must_use]
    pub const fn priority_tier(&self) -> u32 {
        self.priority_tier
    }

    #[must_use]
    pub const fn weight(&self) -> f64 {
        self.weight
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.state.lock().enabled
    }

    #[must_use]
    pub fn health_score(&self) -> u8 {
        self.state.lock().health_score
    }

    /// Enabled with a non-zero score
    #[must_use]
    pub fn is_available(&self) -> bool {
        let state = self.state.lock();
        state.enabled && state.health_score > 0
    }

    #[must_use]
    pub fn snapshot(&self) -> ProviderSnapshot {
        let state = *self.state.lock();
        ProviderSnapshot {
            name: self.name.clone(),
            kind: self.kind(),
            priority_tier: self.priority_tier,
            weight: self.weight,
            enabled: state.enabled,
            health_score: state.health_score,
            last_used_at: state.last_used_at,
            last_error_at: state.last_error_at,
            tripped_by_health: state.tripped_by_health,
        }
    }
}

/// All configured providers, in configuration order
#[derive(Debug, Default)]
pub struct ProviderRegistry {
    providers: Vec<Arc<Provider>>,
    index: AHashMap<String, usize>,
}

impl ProviderRegistry {
    /// # Errors
    ///
    /// Returns [`DispatchError::Configuration`] if two providers share a name.
    pub fn new(providers: Vec<Provider>) -> Result<Self, DispatchError> {
        let mut index = AHashMap::with_capacity(providers.len());
        for (position, provider) in providers.iter().enumerate() {
            if index.insert(provider.name.clone(), position).is_some() {
                return Err(DispatchError::Configuration(format!(
                    "duplicate provider name {}",
                    provider.name
                )));
            }
        }

        Ok(Self {
            providers: providers.into_iter().map(Arc::new).collect(),
            index,
        })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.providers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    #[must_use]
    pub fn all(&self) -> &[Arc<Provider>] {
        &self.providers
    }

    /// Providers whose enabled flag is set
    #[must_use]
    pub fn list_enabled(&self) -> Vec<Arc<Provider>> {
        self.providers
            .iter()
            .filter(|provider| provider.is_enabled())
            .cloned()
            .collect()
    }

    /// # Errors
    ///
    /// Returns [`DispatchError::UnknownProvider`] if no provider has this name.
    pub fn get(&self, name: &str) -> Result<Arc<Provider>, DispatchError> {
        self.index
            .get(name)
            .map(|&position| Arc::clone(&self.providers[position]))
            .ok_or_else(|| DispatchError::UnknownProvider(name.to_string()))
    }

    /// Set the enabled flag.
    ///
    /// Enabling a provider whose score is zero also lifts the score to
    /// [`RECOVERY_HEALTH`], since an enabled provider never sits at zero.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::UnknownProvider`] if no provider has this name.
    pub fn set_enabled(&self, name: &str, enabled: bool) -> Result<(), DispatchError> {
        let provider = self.get(name)?;
        let mut state = provider.state.lock();
        state.enabled = enabled;
        state.tripped_by_health = false;
        if enabled && state.health_score == 0 {
            state.health_score = RECOVERY_HEALTH;
        }
        Ok(())
    }

    /// Re-enable a provider and set its score, used by the recovery loop
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::UnknownProvider`] if no provider has this name.
    pub fn reenable(&self, name: &str, score: u8) -> Result<(), DispatchError> {
        let provider = self.get(name)?;
        let mut state = provider.state.lock();
        state.enabled = true;
        state.tripped_by_health = false;
        state.health_score = score.clamp(1, MAX_HEALTH);
        Ok(())
    }

    /// Add `delta` to the health score, clamped to `[0, 100]`, and return the
    /// new score.
    ///
    /// A negative delta stamps `last_error_at`. Reaching zero while enabled
    /// disables the provider and marks it as tripped, which hands it to the
    /// recovery loop. A positive delta never re-enables and leaves the trip
    /// mark in place.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::UnknownProvider`] if no provider has this name.
    pub fn adjust_health(&self, name: &str, delta: i32, now: SystemTime) -> Result<u8, DispatchError> {
        let provider = self.get(name)?;
        let mut state = provider.state.lock();

        let score = (i32::from(state.health_score) + delta).clamp(0, i32::from(MAX_HEALTH));
        state.health_score = u8::try_from(score).unwrap_or(0);

        if delta < 0 {
            state.last_error_at = Some(now);
        }
        if state.health_score == 0 && state.enabled {
            state.enabled = false;
            state.tripped_by_health = true;
        }

        Ok(state.health_score)
    }

    /// Stamp `last_used_at`
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::UnknownProvider`] if no provider has this name.
    pub fn mark_used(&self, name: &str, now: SystemTime) -> Result<(), DispatchError> {
        self.get(name)?.state.lock().last_used_at = Some(now);
        Ok(())
    }
}
