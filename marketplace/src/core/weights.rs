//! Bounded, normalized trust-weight updates.
//!
//! Every update adds a delta to one competitor, clamps all weights into
//! `[min_weight, max_weight]`, then renormalizes to a sum of exactly 1.0
//! without leaving the bounds.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::core::types::OutcomeKind;
use crate::error::MarketError;

/// Tolerance used for weight-sum comparisons.
pub const WEIGHT_EPSILON: f64 = 1e-9;

/// `|predicted - actual|` at or below this earns [`ACCURACY_BONUS`].
pub const ACCURACY_BONUS_THRESHOLD: f64 = 0.15;
pub const ACCURACY_BONUS: f64 = 0.05;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WeightConstraints {
    pub min_weight: f64,
    pub max_weight: f64,
}

impl Default for WeightConstraints {
    fn default() -> Self {
        Self {
            min_weight: 0.05,
            max_weight: 0.60,
        }
    }
}

impl WeightConstraints {
    /// Check that `count` weights can sum to 1.0 inside the bounds.
    pub fn check_feasible(&self, count: usize) -> Result<(), MarketError> {
        let n = count as f64;
        if n * self.min_weight > 1.0 + WEIGHT_EPSILON || n * self.max_weight < 1.0 - WEIGHT_EPSILON
        {
            return Err(MarketError::InfeasibleConstraints {
                min: self.min_weight,
                max: self.max_weight,
                count,
            });
        }
        Ok(())
    }

    fn clamp(&self, weight: f64) -> f64 {
        weight.clamp(self.min_weight, self.max_weight)
    }
}

/// Base delta for an outcome, before any accuracy bonus.
pub fn base_delta(kind: OutcomeKind) -> f64 {
    match kind {
        OutcomeKind::RankedFirstSuccess => 0.10,
        OutcomeKind::RankedFirstFailure => -0.15,
        OutcomeKind::RankedSecondPlusSuccess => 0.08,
        OutcomeKind::RankedSecondPlusFailure => -0.18,
        OutcomeKind::RankedNotTried => -0.02,
        OutcomeKind::ReplanNewSuccess => 0.12,
        OutcomeKind::ReplanFailedAgain => -0.20,
        OutcomeKind::ReplanResubmittedSame => -0.05,
        OutcomeKind::Aborted => 0.0,
    }
}

/// Delta for an outcome, adding the accuracy bonus to accurate successes.
pub fn weight_delta(kind: OutcomeKind, accuracy: Option<f64>) -> f64 {
    let base = base_delta(kind);
    match accuracy {
        Some(error) if kind.is_success() && error <= ACCURACY_BONUS_THRESHOLD => {
            base + ACCURACY_BONUS
        }
        _ => base,
    }
}

/// Add `delta` to `competitor_id`, then clamp and renormalize all weights.
pub fn apply_delta(
    weights: &mut BTreeMap<String, f64>,
    competitor_id: &str,
    delta: f64,
    constraints: &WeightConstraints,
) -> Result<(), MarketError> {
    let weight = weights
        .get_mut(competitor_id)
        .ok_or_else(|| MarketError::UnknownCompetitor(competitor_id.to_string()))?;
    *weight += delta;
    normalize(weights, constraints)
}

/// Clamp every weight into bounds and renormalize to sum 1.0.
///
/// Proportional rescaling that pushes a weight out of bounds pins it at the
/// bound; the residual is spread over the remaining free weights. Each pass
/// either converges or pins at least one more weight, so at most `n` passes
/// run.
pub fn normalize(
    weights: &mut BTreeMap<String, f64>,
    constraints: &WeightConstraints,
) -> Result<(), MarketError> {
    if weights.is_empty() {
        return Ok(());
    }
    constraints.check_feasible(weights.len())?;

    for weight in weights.values_mut() {
        *weight = if weight.is_finite() {
            constraints.clamp(*weight)
        } else {
            constraints.min_weight
        };
    }

    let mut pinned: BTreeSet<String> = BTreeSet::new();
    for _ in 0..=weights.len() {
        let pinned_sum: f64 = weights
            .iter()
            .filter(|(id, _)| pinned.contains(*id))
            .map(|(_, w)| *w)
            .sum();
        let free: Vec<String> = weights
            .keys()
            .filter(|id| !pinned.contains(*id))
            .cloned()
            .collect();
        if free.is_empty() {
            break;
        }
        let free_sum: f64 = free.iter().map(|id| weights[id]).sum();
        let target = 1.0 - pinned_sum;
        if (free_sum - target).abs() <= WEIGHT_EPSILON {
            break;
        }

        let mut pinned_new = false;
        for id in &free {
            let Some(weight) = weights.get_mut(id) else {
                continue;
            };
            let scaled = if free_sum > 0.0 {
                *weight * target / free_sum
            } else {
                target / free.len() as f64
            };
            if scaled < constraints.min_weight {
                *weight = constraints.min_weight;
                pinned.insert(id.clone());
                pinned_new = true;
            } else if scaled > constraints.max_weight {
                *weight = constraints.max_weight;
                pinned.insert(id.clone());
                pinned_new = true;
            } else {
                *weight = scaled;
            }
        }
        if !pinned_new {
            break;
        }
    }

    settle_residual(weights, constraints);
    Ok(())
}

/// Push any remaining floating residual into weights with room to absorb it.
fn settle_residual(weights: &mut BTreeMap<String, f64>, constraints: &WeightConstraints) {
    let mut residual = 1.0 - weights.values().sum::<f64>();
    if residual.abs() <= WEIGHT_EPSILON {
        return;
    }
    for weight in weights.values_mut() {
        if residual.abs() <= f64::EPSILON {
            break;
        }
        let room = if residual > 0.0 {
            constraints.max_weight - *weight
        } else {
            constraints.min_weight - *weight
        };
        let step = if residual > 0.0 {
            residual.min(room.max(0.0))
        } else {
            residual.max(room.min(0.0))
        };
        *weight += step;
        residual -= step;
    }
}
