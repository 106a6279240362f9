//! Backends and the tiered weighted selector.

use super::availability::AvailabilityCounter;
use arc_swap::ArcSwap;
use crate::endpoint::ClientEndpoint;
use rand::Rng;
use std::sync::Arc;
use std::time::Instant;

/// An upstream broker with its health state.
///
/// `weight > 0` marks a backend *active*; `weight <= 0` marks it *passive* —
/// used only when no active backend is on the menu. Health lives in an
/// atomically swappable immutable counter so readers never lock.
pub struct Backend {
    name: String,
    weight: i32,
    endpoint: Arc<dyn ClientEndpoint>,
    availability: Arc<ArcSwap<AvailabilityCounter>>,
}

impl Backend {
    /// Create a backend over a client endpoint.
    #[must_use]
    pub fn new(name: impl Into<String>, weight: i32, endpoint: Arc<dyn ClientEndpoint>) -> Self {
        Self {
            name: name.into(),
            weight,
            endpoint,
            availability: Arc::new(ArcSwap::from_pointee(AvailabilityCounter::unknown())),
        }
    }

    /// A view of the same physical backend with a different weight.
    ///
    /// The health counter is shared: a group member and the base backend
    /// observe the same dial outcomes.
    #[must_use]
    pub fn with_weight(&self, weight: i32) -> Self {
        Self {
            name: self.name.clone(),
            weight,
            endpoint: Arc::clone(&self.endpoint),
            availability: Arc::clone(&self.availability),
        }
    }

    /// Backend name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Selection weight.
    #[must_use]
    pub fn weight(&self) -> i32 {
        self.weight
    }

    /// The dialing endpoint.
    #[must_use]
    pub fn endpoint(&self) -> &Arc<dyn ClientEndpoint> {
        &self.endpoint
    }

    /// Snapshot of the current availability state.
    #[must_use]
    pub fn availability(&self) -> Arc<AvailabilityCounter> {
        self.availability.load_full()
    }

    /// Whether the selector may offer this backend right now.
    #[must_use]
    pub fn is_available_to_try(&self, now: Instant) -> bool {
        self.availability.load().is_available_to_try(now)
    }

    /// Record a successful dial.
    pub fn on_connection_succeeded(&self) {
        self.update(AvailabilityCounter::on_success);
    }

    /// Record a failed dial.
    pub fn on_connection_failed(&self) {
        self.update(AvailabilityCounter::on_failure);
    }

    /// Load, derive, compare-and-swap. A lost race re-reads and recomputes
    /// from the freshly observed state.
    fn update(&self, transition: fn(&AvailabilityCounter, Instant) -> AvailabilityCounter) {
        let now = Instant::now();
        loop {
            let current = self.availability.load_full();
            let next = Arc::new(transition(&current, now));
            let previous = self.availability.compare_and_swap(&current, next);
            if Arc::ptr_eq(&previous, &current) {
                return;
            }
        }
    }
}

impl std::fmt::Debug for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backend")
            .field("name", &self.name)
            .field("weight", &self.weight)
            .field("address", &self.endpoint.address())
            .finish_non_exhaustive()
    }
}

/// Pick a backend for one connection attempt.
///
/// Tier cascade, first non-empty tier wins:
///
/// 1. active (`weight > 0`), not tried, available
/// 2. passive (`weight <= 0`), not tried, available
/// 3. active, not tried, ignoring availability
/// 4. passive, not tried, ignoring availability
///
/// A backend in `tried` is never returned. Within a tier the pick is
/// weighted random; passives weigh `1 - weight`, so larger negatives are
/// preferred within the passive tier.
#[must_use]
pub fn select_backend(backends: &[Arc<Backend>], tried: &[Arc<Backend>]) -> Option<Arc<Backend>> {
    let now = Instant::now();
    let not_tried = |backend: &Arc<Backend>| !tried.iter().any(|t| Arc::ptr_eq(t, backend));

    let tiers: [&dyn Fn(&Arc<Backend>) -> bool; 4] = [
        &|b| b.weight() > 0 && not_tried(b) && b.is_available_to_try(now),
        &|b| b.weight() <= 0 && not_tried(b) && b.is_available_to_try(now),
        &|b| b.weight() > 0 && not_tried(b),
        &|b| b.weight() <= 0 && not_tried(b),
    ];

    for filter in tiers {
        let candidates: Vec<&Arc<Backend>> = backends.iter().filter(|b| filter(b)).collect();
        if !candidates.is_empty() {
            return Some(weighted_pick(&candidates));
        }
    }
    None
}

/// Effective selection weight: actives count as-is, passives as `1 - weight`.
fn effective_weight(backend: &Backend) -> i64 {
    if backend.weight() > 0 {
        i64::from(backend.weight())
    } else {
        1 - i64::from(backend.weight())
    }
}

/// Draw uniformly from `[0, Σw)` and walk the list.
fn weighted_pick(candidates: &[&Arc<Backend>]) -> Arc<Backend> {
    let total: i64 = candidates.iter().map(|b| effective_weight(b)).sum();
    let mut draw = rand::rng().random_range(0..total);
    for backend in candidates {
        let weight = effective_weight(backend);
        if draw < weight {
            return Arc::clone(backend);
        }
        draw -= weight;
    }
    // Unreachable with a correct total; keep the last candidate as a guard.
    Arc::clone(candidates[candidates.len() - 1])
}
