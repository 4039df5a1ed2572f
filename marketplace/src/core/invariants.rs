//! Invariants every projected state must satisfy.

use crate::core::types::MarketplaceState;
use crate::core::weights::{WEIGHT_EPSILON, WeightConstraints};

/// Check derived-state invariants:
/// - weights sum to 1.0 within tolerance
/// - every weight inside `[min_weight, max_weight]`
/// - efficiency inside `[0, 1]`
/// - the budget pool equals `expected_pool`
pub fn check_state_invariants(
    state: &MarketplaceState,
    expected_pool: u32,
    constraints: &WeightConstraints,
) -> Vec<String> {
    let mut errors = Vec::new();

    if !state.competitors.is_empty() {
        let sum = state.weight_sum();
        if (sum - 1.0).abs() > WEIGHT_EPSILON * state.competitors.len() as f64 {
            errors.push(format!("weights sum to {sum:.12}, expected 1.0"));
        }
    }

    for record in state.competitors.values() {
        if record.weight < constraints.min_weight - WEIGHT_EPSILON
            || record.weight > constraints.max_weight + WEIGHT_EPSILON
        {
            errors.push(format!(
                "{}: weight {:.6} outside [{}, {}]",
                record.id, record.weight, constraints.min_weight, constraints.max_weight
            ));
        }
        if !(0.0..=1.0).contains(&record.efficiency) {
            errors.push(format!(
                "{}: efficiency {:.6} outside [0, 1]",
                record.id, record.efficiency
            ));
        }
    }

    if state.total_budget_pool != expected_pool {
        errors.push(format!(
            "budget pool {} drifted from {}",
            state.total_budget_pool, expected_pool
        ));
    }

    errors
}
