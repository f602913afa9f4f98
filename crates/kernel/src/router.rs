//! Router (C3): selects provider candidates by task complexity, breaker
//! health, and policy.
//!
//! Grounded on `sa_providers::router::LlmRouter` (capability filtering,
//! fallback walking) and `sa_providers::smart_router` (tier/profile
//! resolution, reused here unchanged via `sa_domain::config::llm`'s
//! `ModelTier`/`RoutingProfile`/`TierConfig` types). Adds breaker-state
//! filtering, which the teacher's router has no need for since it keeps
//! no persistent breaker state.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use sa_domain::config::{ModelTier, RoutingProfile, TierConfig};

use crate::breaker::{BreakerState, CircuitBreaker};
use crate::model::Complexity;

/// One candidate in priority order for a given task.
#[derive(Debug, Clone)]
pub struct ProviderCandidate {
    pub provider_id: String,
    pub model: String,
    pub tier: ModelTier,
}

/// Map a task's complexity to the tier table used by `TierConfig`.
/// (`Critical` escalates to `Reasoning`, matching distilled-spec §4.3's
/// "critical -> [most_capable, fast]" example.)
pub fn complexity_to_tier(complexity: Complexity) -> ModelTier {
    match complexity {
        Complexity::Simple => ModelTier::Simple,
        Complexity::Moderate => ModelTier::Complex,
        Complexity::Complex => ModelTier::Complex,
        Complexity::Critical => ModelTier::Reasoning,
    }
}

/// Tier fallback order, reused from `sa_providers::smart_router`'s
/// private `fallback_tiers` (reimplemented here since that function isn't
/// exported — same table).
fn fallback_tiers(starting: ModelTier) -> Vec<ModelTier> {
    match starting {
        ModelTier::Simple => vec![ModelTier::Complex, ModelTier::Reasoning],
        ModelTier::Complex => vec![ModelTier::Reasoning, ModelTier::Simple],
        ModelTier::Reasoning => vec![ModelTier::Complex, ModelTier::Simple],
        ModelTier::Free => vec![ModelTier::Simple, ModelTier::Complex, ModelTier::Reasoning],
    }
}

fn tier_models(tier: ModelTier, tiers: &TierConfig) -> &[String] {
    match tier {
        ModelTier::Simple => &tiers.simple,
        ModelTier::Complex => &tiers.complex,
        ModelTier::Reasoning => &tiers.reasoning,
        ModelTier::Free => &tiers.free,
    }
}

/// Per-provider breaker registry, single-writer discipline per provider id
/// (§5: "Provider CircuitState is guarded by a single-writer discipline").
/// The map itself is behind a `parking_lot::RwLock` so the registry can be
/// shared via `Arc` across concurrently-running tasks: readers (routing
/// decisions) take a read lock, and `get_or_create`'s rare insert path
/// takes a write lock only for the entry that doesn't exist yet.
pub struct BreakerRegistry {
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
    default_config: crate::config::BreakerConfig,
}

impl BreakerRegistry {
    pub fn new(default_config: crate::config::BreakerConfig) -> Self {
        Self {
            breakers: RwLock::new(HashMap::new()),
            default_config,
        }
    }

    pub fn get_or_create(&self, provider_id: &str) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.breakers.read().get(provider_id) {
            return existing.clone();
        }
        self.breakers
            .write()
            .entry(provider_id.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(self.default_config.clone())))
            .clone()
    }

    /// Alias for [`get_or_create`], read naturally at call sites that just
    /// want "the breaker for this provider" (C1's gating path).
    pub fn breaker_for(&self, provider_id: &str) -> Arc<CircuitBreaker> {
        self.get_or_create(provider_id)
    }

    fn is_available(&self, provider_id: &str) -> bool {
        self.breakers
            .read()
            .get(provider_id)
            .map(|b| b.state() != BreakerState::Open)
            .unwrap_or(true)
    }
}

/// Pure routing function (§4.3, step 1-3; step 4's latency tie-break is
/// left to the caller, which has the live EMA data this function doesn't
/// own): given a task's complexity and the configured tier table, return
/// an ordered list of provider candidates, filtering out any whose
/// breaker is open and preferring `closed` over `half_open`.
pub fn route(
    complexity: Complexity,
    tiers: &TierConfig,
    breakers: &BreakerRegistry,
) -> Vec<ProviderCandidate> {
    let target_tier = complexity_to_tier(complexity);
    let mut ordered_tiers = vec![target_tier];
    ordered_tiers.extend(fallback_tiers(target_tier));

    let mut closed = Vec::new();
    let mut half_open = Vec::new();

    for tier in ordered_tiers {
        for model_spec in tier_models(tier, tiers) {
            let (provider_id, model) = split_model_spec(model_spec);
            if !breakers.is_available(provider_id) {
                continue;
            }
            let candidate = ProviderCandidate {
                provider_id: provider_id.to_string(),
                model: model.to_string(),
                tier,
            };
            let state = breakers
                .breakers
                .read()
                .get(provider_id)
                .map(|b| b.state())
                .unwrap_or(BreakerState::Closed);
            if state == BreakerState::HalfOpen {
                half_open.push(candidate);
            } else {
                closed.push(candidate);
            }
        }
    }

    closed.extend(half_open);
    closed
}

fn split_model_spec(spec: &str) -> (&str, &str) {
    match spec.split_once('/') {
        Some((provider, model)) => (provider, model),
        None => (spec, ""),
    }
}

/// Resolve the routing profile for an explicit model override, matching
/// `sa_providers::smart_router::resolve_model_for_request`'s bypass rule.
pub fn profile_to_tier(profile: RoutingProfile) -> Option<ModelTier> {
    match profile {
        RoutingProfile::Auto => None,
        RoutingProfile::Eco => Some(ModelTier::Simple),
        RoutingProfile::Premium => Some(ModelTier::Complex),
        RoutingProfile::Free => Some(ModelTier::Free),
        RoutingProfile::Reasoning => Some(ModelTier::Reasoning),
    }
}
