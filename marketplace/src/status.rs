//! Plain-text views of the projected marketplace state.

use std::fmt::Write as _;

use crate::core::budget::{AllocationInput, allocate, sorted_allocations};
use crate::core::types::{Event, MarketplaceState};
use crate::io::event_store::LoadWarning;

/// Events shown at the bottom of `status`.
pub const RECENT_EVENTS: usize = 5;
/// Default row count for `history`.
pub const DEFAULT_HISTORY: usize = 10;

/// Budget allocation implied by `state`.
pub fn current_allocation(state: &MarketplaceState) -> std::collections::BTreeMap<String, u32> {
    let inputs: Vec<AllocationInput> = state
        .competitors
        .values()
        .map(|record| AllocationInput::new(&record.id, record.weight, record.efficiency))
        .collect();
    allocate(&inputs, state.total_budget_pool)
}

/// Render the `status` report.
pub fn render_status(
    state: &MarketplaceState,
    events: &[Event],
    warnings: &[LoadWarning],
) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Marketplace state");
    let _ = writeln!(
        out,
        "  rounds completed: {}  events: {}  last updated: {}",
        state.rounds_completed,
        events.len(),
        state
            .last_updated
            .map(|ts| ts.to_rfc3339())
            .unwrap_or_else(|| "never".to_string())
    );
    out.push('\n');

    let mut records: Vec<_> = state.competitors.values().collect();
    records.sort_by(|a, b| b.weight.total_cmp(&a.weight).then_with(|| a.id.cmp(&b.id)));
    let _ = writeln!(
        out,
        "{:<14} {:>8} {:>10} {:>5} {:>5} {:>6} {:>9}",
        "competitor", "weight", "efficiency", "won", "lost", "ranked", "accuracy"
    );
    for record in records {
        let _ = writeln!(
            out,
            "{:<14} {:>8.4} {:>10.2} {:>5} {:>5} {:>6} {:>9.3}",
            record.id,
            record.weight,
            record.efficiency,
            record.successes,
            record.failures,
            record.proposals_ranked,
            record.average_accuracy()
        );
    }
    let _ = writeln!(out, "{:<14} {:>8.4}", "total", state.weight_sum());
    out.push('\n');

    let allocation = current_allocation(state);
    let allocated: u32 = allocation.values().sum();
    let _ = writeln!(out, "{:<14} {:>10}", "budget", "iterations");
    for (id, budget) in sorted_allocations(&allocation) {
        let _ = writeln!(out, "{id:<14} {budget:>10}");
    }
    let check = if allocated == state.total_budget_pool {
        "ok"
    } else {
        "MISMATCH"
    };
    let _ = writeln!(
        out,
        "{:<14} {:>10} of {} ({check})",
        "total", allocated, state.total_budget_pool
    );

    if !events.is_empty() {
        out.push('\n');
        let _ = writeln!(out, "Recent events");
        let start = events.len().saturating_sub(RECENT_EVENTS);
        for event in &events[start..] {
            let _ = writeln!(out, "  {}", event_line(event));
        }
    }

    if !warnings.is_empty() {
        out.push('\n');
        let _ = writeln!(out, "Skipped {} malformed event record(s)", warnings.len());
        for warning in warnings {
            let _ = writeln!(out, "  {}: {}", warning.record, warning.reason);
        }
    }
    out
}

/// Render the last `last` events of `competitor_id`, oldest first.
pub fn render_history(events: &[Event], competitor_id: &str, last: usize) -> String {
    let mine: Vec<&Event> = events
        .iter()
        .filter(|event| event.competitor_id == competitor_id)
        .collect();
    if mine.is_empty() {
        return format!("No events for {competitor_id}\n");
    }
    let mut out = String::new();
    let start = mine.len().saturating_sub(last);
    let _ = writeln!(
        out,
        "History for {competitor_id} ({} of {} events)",
        mine.len() - start,
        mine.len()
    );
    for event in &mine[start..] {
        let _ = writeln!(out, "  {}", event_line(event));
        let _ = writeln!(out, "      {}", event.outcome_kind.describe());
    }
    out
}

fn event_line(event: &Event) -> String {
    let accuracy = event
        .accuracy
        .map(|value| format!("{value:.3}"))
        .unwrap_or_else(|| "-".to_string());
    format!(
        "{} {} {} {} score={:.3} actual={:.3} accuracy={accuracy} delta={:+.3}",
        event.timestamp.format("%Y-%m-%d %H:%M:%S"),
        event.round_identifier,
        event.competitor_id,
        event.outcome_kind.as_str(),
        event.proposal_score,
        event.implementation_score,
        event.weight_delta
    )
}
