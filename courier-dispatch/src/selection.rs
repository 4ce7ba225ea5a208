//! Tiered, weighted-random provider ordering
//!
//! Providers are grouped by priority tier, lowest first. Inside a tier with
//! more than one member each provider draws `random(0, 1) × weight ×
//! health / 100` and the tier is sorted by that score, highest first, so
//! heavier and healthier providers tend to lead without starving the rest.

use std::{collections::BTreeMap, sync::Arc};

use parking_lot::Mutex;
use rand::{Rng, SeedableRng, rngs::StdRng};

use crate::provider::{MAX_HEALTH, Provider};

/// Orders candidates for one send using an injected random source
#[derive(Debug)]
pub struct Selector {
    rng: Mutex<StdRng>,
}

impl Default for Selector {
    fn default() -> Self {
        Self::from_os_rng()
    }
}

impl Selector {
    #[must_use]
    pub const fn new(rng: StdRng) -> Self {
        Self {
            rng: Mutex::new(rng),
        }
    }

    /// Reproducible ordering for a given seed
    #[must_use]
    pub fn seeded(seed: u64) -> Self {
        Self::new(StdRng::seed_from_u64(seed))
    }

    #[must_use]
    pub fn from_os_rng() -> Self {
        Self::new(StdRng::from_os_rng())
    }

    /// Available providers (enabled, score above zero) in the order they
    /// should be tried
    pub fn ordered_candidates(&self, providers: &[Arc<Provider>]) -> Vec<Arc<Provider>> {
        let mut tiers: BTreeMap<u32, Vec<(Arc<Provider>, u8)>> = BTreeMap::new();
        for provider in providers {
            let snapshot = provider.snapshot();
            if snapshot.enabled && snapshot.health_score > 0 {
                tiers
                    .entry(snapshot.priority_tier)
                    .or_default()
                    .push((Arc::clone(provider), snapshot.health_score));
            }
        }

        let mut ordered = Vec::with_capacity(providers.len());
        for (_, tier) in tiers {
            if tier.len() == 1 {
                ordered.extend(tier.into_iter().map(|(provider, _)| provider));
                continue;
            }

            let mut scored: Vec<(f64, Arc<Provider>)> = {
                let mut rng = self.rng.lock();
                tier.into_iter()
                    .map(|(provider, health)| {
                        let score = rng.random::<f64>()
                            * provider.weight()
                            * (f64::from(health) / f64::from(MAX_HEALTH));
                        (score, provider)
                    })
                    .collect()
            };

            scored.sort_by(|a, b| b.0.total_cmp(&a.0));
            ordered.extend(scored.into_iter().map(|(_, provider)| provider));
        }

        ordered
    }
}
