//! Zero-sum iteration budget allocation.
//!
//! ```text
//! weight × efficiency ──► share ──► floor(share × pool) ──► largest remainder ──► exact pool
//! ```

use std::cmp::Ordering;
use std::collections::BTreeMap;

/// Per-competitor allocation input.
#[derive(Debug, Clone, PartialEq)]
pub struct AllocationInput {
    pub id: String,
    pub weight: f64,
    pub efficiency: f64,
}

impl AllocationInput {
    pub fn new(id: impl Into<String>, weight: f64, efficiency: f64) -> Self {
        Self {
            id: id.into(),
            weight,
            efficiency,
        }
    }
}

/// Split `total_pool` iterations across competitors.
///
/// # Invariants
/// - Allocations sum exactly to `total_pool` for any non-empty input.
/// - Shares are monotone in both weight and efficiency, up to the minimum
///   below.
/// - Every competitor gets at least one iteration while the pool covers the
///   field; the unit comes from the highest-scoring competitor holding more
///   than one.
/// - All-zero efficiencies fall back to efficiency 1 for everyone.
/// - Remainder ties resolve by larger raw score, then competitor id.
pub fn allocate(competitors: &[AllocationInput], total_pool: u32) -> BTreeMap<String, u32> {
    if competitors.is_empty() {
        return BTreeMap::new();
    }

    let all_zero_efficiency = competitors
        .iter()
        .all(|c| sanitize(c.efficiency) == 0.0);
    let mut scores: Vec<f64> = competitors
        .iter()
        .map(|c| {
            let efficiency = if all_zero_efficiency {
                1.0
            } else {
                sanitize(c.efficiency)
            };
            sanitize(c.weight) * efficiency
        })
        .collect();
    if scores.iter().sum::<f64>() <= 0.0 {
        scores = vec![1.0; competitors.len()];
    }
    let score_sum: f64 = scores.iter().sum();

    let pool = f64::from(total_pool);
    let raw: Vec<f64> = scores.iter().map(|s| s / score_sum * pool).collect();
    let mut allocated: Vec<u32> = raw
        .iter()
        .map(|r| (r.floor() as u32).min(total_pool))
        .collect();

    let floored: u64 = allocated.iter().map(|a| u64::from(*a)).sum();
    let mut remaining = u64::from(total_pool).saturating_sub(floored);

    let mut order: Vec<usize> = (0..competitors.len()).collect();
    order.sort_by(|&a, &b| {
        let frac_a = raw[a] - raw[a].floor();
        let frac_b = raw[b] - raw[b].floor();
        frac_b
            .total_cmp(&frac_a)
            .then_with(|| scores[b].total_cmp(&scores[a]))
            .then_with(|| competitors[a].id.cmp(&competitors[b].id))
    });
    // Floating error can leave more than `n` units over; cycle until exhausted.
    let mut cursor = 0usize;
    while remaining > 0 {
        allocated[order[cursor % order.len()]] += 1;
        remaining -= 1;
        cursor += 1;
    }
    trim_overflow(&mut allocated, &order, total_pool);
    enforce_minimum(&mut allocated, &scores, competitors);

    competitors
        .iter()
        .zip(allocated)
        .map(|(c, a)| (c.id.clone(), a))
        .collect()
}

/// Guard against floored values already summing past the pool.
fn trim_overflow(allocated: &mut [u32], order: &[usize], total_pool: u32) {
    let mut total: u64 = allocated.iter().map(|a| u64::from(*a)).sum();
    for &idx in order.iter().rev().cycle() {
        if total <= u64::from(total_pool) {
            break;
        }
        if allocated[idx] > 0 {
            allocated[idx] -= 1;
            total -= 1;
        }
    }
}

/// Move single units from the richest competitors to those left at zero.
///
/// The pool sum is preserved; when no donor holds more than one unit the
/// remaining zeros stay.
fn enforce_minimum(allocated: &mut [u32], scores: &[f64], competitors: &[AllocationInput]) {
    let mut by_score: Vec<usize> = (0..competitors.len()).collect();
    by_score.sort_by(|&a, &b| {
        scores[b]
            .total_cmp(&scores[a])
            .then_with(|| competitors[a].id.cmp(&competitors[b].id))
    });
    for &starved in by_score.iter().rev() {
        if allocated[starved] > 0 {
            continue;
        }
        let Some(&donor) = by_score.iter().find(|&&idx| allocated[idx] > 1) else {
            break;
        };
        allocated[donor] -= 1;
        allocated[starved] += 1;
    }
}

fn sanitize(value: f64) -> f64 {
    if value.is_finite() && value > 0.0 {
        value
    } else {
        0.0
    }
}

/// Order allocations for display: largest budget first, then id.
pub fn sorted_allocations(allocations: &BTreeMap<String, u32>) -> Vec<(&str, u32)> {
    let mut rows: Vec<(&str, u32)> = allocations
        .iter()
        .map(|(id, budget)| (id.as_str(), *budget))
        .collect();
    rows.sort_by(|a, b| match b.1.cmp(&a.1) {
        Ordering::Equal => a.0.cmp(b.0),
        other => other,
    });
    rows
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn inputs(weights: &[f64], efficiencies: &[f64]) -> Vec<AllocationInput> {
        weights
            .iter()
            .zip(efficiencies)
            .enumerate()
            .map(|(i, (w, e))| AllocationInput::new(format!("bidder_{}", i + 1), *w, *e))
            .collect()
    }

    #[test]
    fn proportional_split_sums_exactly() {
        let allocation = allocate(&inputs(&[0.5, 0.3, 0.2], &[1.0, 1.0, 1.0]), 30);
        assert_eq!(allocation.values().sum::<u32>(), 30);
        assert_eq!(allocation["bidder_1"], 15);
        assert_eq!(allocation["bidder_2"], 9);
        assert_eq!(allocation["bidder_3"], 6);
    }

    #[test]
    fn largest_remainder_breaks_thirds() {
        let third = 1.0 / 3.0;
        let allocation = allocate(&inputs(&[third, third, third], &[1.0, 1.0, 1.0]), 10);
        assert_eq!(allocation.values().sum::<u32>(), 10);
        let mut values: Vec<u32> = allocation.values().copied().collect();
        values.sort_unstable();
        assert_eq!(values, vec![3, 3, 4]);
    }

    #[test]
    fn all_zero_efficiency_falls_back_to_weights() {
        let allocation = allocate(&inputs(&[0.6, 0.4], &[0.0, 0.0]), 10);
        assert_eq!(allocation["bidder_1"], 6);
        assert_eq!(allocation["bidder_2"], 4);
    }

    #[test]
    fn single_competitor_takes_whole_pool() {
        let allocation = allocate(&inputs(&[1.0], &[0.0]), 7);
        assert_eq!(allocation["bidder_1"], 7);
    }

    #[test]
    fn efficiency_shifts_share() {
        let allocation = allocate(&inputs(&[0.5, 0.5], &[1.0, 0.5]), 30);
        assert_eq!(allocation["bidder_1"], 20);
        assert_eq!(allocation["bidder_2"], 10);
    }

    #[test]
    fn zero_efficiency_competitor_keeps_one_iteration() {
        let allocation = allocate(&inputs(&[0.4, 0.3, 0.3], &[0.0, 1.0, 1.0]), 30);
        assert_eq!(allocation["bidder_1"], 1);
        assert_eq!(allocation["bidder_2"], 14);
        assert_eq!(allocation["bidder_3"], 15);
        assert_eq!(allocation.values().sum::<u32>(), 30);
    }

    #[test]
    fn pool_smaller_than_field_leaves_zeros() {
        let third = 1.0 / 3.0;
        let allocation = allocate(&inputs(&[third, third, third], &[1.0, 1.0, 1.0]), 2);
        assert_eq!(allocation.values().sum::<u32>(), 2);
        assert_eq!(allocation["bidder_1"], 1);
        assert_eq!(allocation["bidder_2"], 1);
        assert_eq!(allocation["bidder_3"], 0);
    }

    #[test]
    fn random_vectors_always_sum_to_pool() {
        let mut rng = StdRng::seed_from_u64(42);
        for _ in 0..500 {
            let n = rng.gen_range(1..=9usize);
            let pool = rng.gen_range(1..=200u32);
            let weights: Vec<f64> = (0..n).map(|_| rng.gen_range(0.0..1.0)).collect();
            let efficiencies: Vec<f64> = (0..n)
                .map(|_| if rng.gen_bool(0.2) { 0.0 } else { rng.gen_range(0.0..=1.0) })
                .collect();
            let allocation = allocate(&inputs(&weights, &efficiencies), pool);
            assert_eq!(allocation.values().sum::<u32>(), pool);
            assert_eq!(allocation.len(), n);
            if pool as usize >= n {
                assert!(allocation.values().all(|budget| *budget >= 1), "{allocation:?}");
            }
        }
    }

    #[test]
    fn higher_weight_never_gets_less() {
        let allocation = allocate(&inputs(&[0.1, 0.2, 0.3, 0.4], &[0.9, 0.9, 0.9, 0.9]), 17);
        let ordered: Vec<u32> = (1..=4).map(|i| allocation[&format!("bidder_{i}")]).collect();
        assert!(ordered.windows(2).all(|pair| pair[0] <= pair[1]), "{ordered:?}");
    }

    #[test]
    fn display_order_is_budget_then_id() {
        let allocation = allocate(&inputs(&[0.25, 0.5, 0.25], &[1.0, 1.0, 1.0]), 8);
        let rows = sorted_allocations(&allocation);
        assert_eq!(rows[0], ("bidder_2", 4));
        assert_eq!(rows[1], ("bidder_1", 2));
        assert_eq!(rows[2], ("bidder_3", 2));
    }
}
