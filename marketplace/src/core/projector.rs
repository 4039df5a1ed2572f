//! Pure fold of the event log into [`MarketplaceState`].
//!
//! Replay order is `(timestamp, record name, canonical JSON)`, a total order
//! over event content. Projecting any permutation of the same events, or the
//! union of independently written logs, yields identical output.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::core::invariants::check_state_invariants;
use crate::core::types::{CompetitorRecord, Event, MarketplaceState, OutcomeKind};
use crate::core::weights::{WeightConstraints, apply_delta};
use crate::error::MarketError;

/// Static inputs to the fold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectionConfig {
    pub num_bots: u32,
    pub base_budget_per_bot: u32,
    pub weight_constraints: WeightConstraints,
}

impl ProjectionConfig {
    pub fn total_budget_pool(&self) -> u32 {
        self.num_bots.saturating_mul(self.base_budget_per_bot)
    }
}

/// Projected state plus the event count it was computed from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Projection {
    pub staleness_token: usize,
    pub state: MarketplaceState,
}

/// Competitor id for baseline slot `index` (1-based).
pub fn competitor_id(index: u32) -> String {
    format!("bidder_{index}")
}

/// Equal-weight starting state: `weight = 1/N`, no history.
pub fn baseline(config: &ProjectionConfig) -> MarketplaceState {
    let n = config.num_bots.max(1);
    let weight = 1.0 / f64::from(n);
    let competitors = (1..=n)
        .map(|i| {
            let id = competitor_id(i);
            (id.clone(), CompetitorRecord::new(id, weight))
        })
        .collect();
    MarketplaceState {
        competitors,
        total_budget_pool: config.total_budget_pool(),
        rounds_completed: 0,
        last_updated: None,
    }
}

/// Sort events into replay order.
pub fn replay_order(events: &[Event]) -> Vec<&Event> {
    let mut ordered: Vec<&Event> = events.iter().collect();
    ordered.sort_by_cached_key(|event| {
        (
            event.timestamp,
            event.record_name(),
            serde_json::to_string(event).unwrap_or_default(),
        )
    });
    ordered
}

/// Fold `events` over the baseline.
///
/// Fails with [`MarketError::InvariantViolation`] if any fold step leaves the
/// state inconsistent; such a projection must not be persisted.
pub fn project(events: &[Event], config: &ProjectionConfig) -> Result<Projection, MarketError> {
    let mut state = baseline(config);
    let mut resolved_rounds: BTreeSet<&str> = BTreeSet::new();

    for event in replay_order(events) {
        fold_event(&mut state, event, config)?;
        if resolves_round(event) {
            resolved_rounds.insert(event.round_identifier.as_str());
        }
        state.rounds_completed = resolved_rounds.len() as u32;

        let errors =
            check_state_invariants(&state, config.total_budget_pool(), &config.weight_constraints);
        if !errors.is_empty() {
            return Err(MarketError::InvariantViolation(format!(
                "after {}: {}",
                event.record_name(),
                errors.join("; ")
            )));
        }
    }

    debug!(
        events = events.len(),
        rounds = state.rounds_completed,
        "projection computed"
    );
    Ok(Projection {
        staleness_token: events.len(),
        state,
    })
}

/// Whether `event` settles its round: a success or failure, or an
/// implemented unchanged resubmission.
fn resolves_round(event: &Event) -> bool {
    let kind = event.outcome_kind;
    kind.is_success()
        || kind.is_failure()
        || (kind == OutcomeKind::ReplanResubmittedSame && event.iteration_count > 0)
}

/// Apply one event: weight delta, outcome counters, efficiency, then
/// normalization across all competitors.
fn fold_event(
    state: &mut MarketplaceState,
    event: &Event,
    config: &ProjectionConfig,
) -> Result<(), MarketError> {
    if !state.competitors.contains_key(&event.competitor_id) {
        warn!(
            competitor = %event.competitor_id,
            outcome = event.outcome_kind.as_str(),
            "event for unknown competitor; initializing at baseline weight"
        );
        let weight = 1.0 / f64::from(config.num_bots.max(1));
        state.competitors.insert(
            event.competitor_id.clone(),
            CompetitorRecord::new(event.competitor_id.clone(), weight),
        );
    }

    let mut weights = state.weights();
    apply_delta(
        &mut weights,
        &event.competitor_id,
        event.weight_delta,
        &config.weight_constraints,
    )?;

    if let Some(record) = state.competitors.get_mut(&event.competitor_id) {
        if event.outcome_kind.is_success() {
            record.successes += 1;
        } else if event.outcome_kind.is_failure() {
            record.failures += 1;
        }
        if event.outcome_kind != OutcomeKind::Aborted {
            record.proposals_ranked += 1;
        }
        record.iterations_used += event.iteration_count;
        if let Some(accuracy) = event.accuracy {
            record.accuracy_history.push(accuracy);
        }
        let attempts = record.successes + record.failures;
        record.efficiency = if attempts > 0 {
            f64::from(record.successes) / f64::from(attempts)
        } else {
            1.0
        };
    }

    for (id, weight) in weights {
        if let Some(record) = state.competitors.get_mut(&id) {
            record.weight = weight;
        }
    }
    state.last_updated = Some(event.timestamp);
    Ok(())
}
