//! Weighted variant allocation for one campaign's variations.

use rand::Rng;
use tracing::debug;

use popup_core::types::Variation;

/// Assigns exactly one variation per draw, honoring per-variation traffic
/// percentages. Never refuses to select: malformed or zero weights fall
/// back to a uniform draw.
#[derive(Debug, Clone, Default)]
pub struct VariantAllocator;

impl VariantAllocator {
    pub fn new() -> Self {
        Self
    }

    /// Draws one variation with `rand::thread_rng`. Returns `None` only
    /// for an empty list. Each draw is independent; assignment is not
    /// sticky across evaluation passes.
    pub fn allocate<'a>(&self, variations: &'a [Variation]) -> Option<&'a Variation> {
        self.allocate_with(variations, &mut rand::thread_rng())
    }

    /// Draw with a caller-supplied RNG, for deterministic tests.
    pub fn allocate_with<'a, R: Rng>(
        &self,
        variations: &'a [Variation],
        rng: &mut R,
    ) -> Option<&'a Variation> {
        if variations.is_empty() {
            return None;
        }

        let total_weight: f64 = variations
            .iter()
            .map(|v| v.traffic_percentage.max(0.0))
            .filter(|w| w.is_finite())
            .sum();

        // Zero or degenerate weights: uniform across all variations. The
        // control variation participates like any other.
        if !(total_weight > 0.0) || !total_weight.is_finite() {
            debug!("Traffic percentages degenerate, falling back to uniform allocation");
            let idx = rng.gen_range(0..variations.len());
            return variations.get(idx);
        }

        let roll: f64 = rng.gen::<f64>() * total_weight;
        let mut cumulative = 0.0;
        for variation in variations {
            let weight = variation.traffic_percentage.max(0.0);
            if weight.is_finite() {
                cumulative += weight;
            }
            if roll < cumulative {
                return Some(variation);
            }
        }
        // Floating point edge at the top of the range.
        variations.last()
    }
}
