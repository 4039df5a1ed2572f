//! Multi-round driver for `marketplace loop <issue>`.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::{info, instrument, warn};

use crate::core::budget::AllocationInput;
use crate::core::outcome::{
    AttentionReason, NextStep, RoundKind, after_failure, after_success,
};
use crate::core::requirements::extract_requirements;
use crate::core::types::{FailureContext, ProposalBody};
use crate::io::attention::{AttentionReport, escalate};
use crate::io::competitor::Competitor;
use crate::io::config::MarketConfig;
use crate::io::event_store::EventStore;
use crate::io::implementer::Implementer;
use crate::io::paths::MarketPaths;
use crate::io::projection_cache::ProjectionCache;
use crate::io::spec_doc::SpecTracker;
use crate::round::{CancelToken, RoundEngine, RoundInput, RoundReport, RoundStatus};

/// Reason why `run_loop` stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopStop {
    /// Every explicit requirement is satisfied.
    Complete,
    /// Escalated; the report at `report_path` explains why.
    NeedsAttention {
        reason: AttentionReason,
        report_path: PathBuf,
    },
    /// Cancelled by the operator.
    Aborted,
}

/// Summary of a loop invocation.
#[derive(Debug, Clone)]
pub struct LoopOutcome {
    pub run_id: String,
    pub rounds: Vec<RoundReport>,
    pub stop: LoopStop,
}

#[derive(Debug, Clone)]
pub struct LoopOptions {
    pub issue: String,
    /// Branch holding work in progress, recorded in escalation reports.
    pub branch: Option<String>,
}

/// External collaborators for a loop.
pub struct LoopDeps<'a> {
    pub paths: &'a MarketPaths,
    pub config: &'a MarketConfig,
    pub competitors: Vec<Arc<dyn Competitor>>,
    pub implementer: Arc<dyn Implementer>,
    pub tracker: &'a dyn SpecTracker,
    pub cancel: CancelToken,
}

/// Run rounds for one issue until complete, escalated, or cancelled.
///
/// Each round splits the pool among its responders using the current
/// projection; each implementation consumes one iteration of the
/// implementing competitor's allocation.
#[instrument(skip_all, fields(issue = %options.issue))]
pub fn run_loop<F: FnMut(&RoundReport)>(
    deps: &LoopDeps<'_>,
    options: &LoopOptions,
    mut on_round: F,
) -> Result<LoopOutcome> {
    let run_id = Utc::now().format("%Y%m%dT%H%M%S%.3fZ").to_string();
    let store = EventStore::new(&deps.paths.events_dir);
    let cache = ProjectionCache::new(
        store.clone(),
        &deps.paths.cache_path,
        deps.config.projection(),
    );
    let engine = RoundEngine {
        config: deps.config,
        paths: deps.paths,
        store: &store,
        competitors: &deps.competitors,
        implementer: Arc::clone(&deps.implementer),
        tracker: deps.tracker,
        cancel: &deps.cancel,
    };

    let document = deps
        .tracker
        .fetch()
        .context("fetch specification document")?;
    if extract_requirements(&document, &deps.config.implicit_policies).all_satisfied() {
        info!("every requirement already satisfied");
        return Ok(LoopOutcome {
            run_id,
            rounds: Vec::new(),
            stop: LoopStop::Complete,
        });
    }

    let mut state = LoopState::default();
    let mut rounds: Vec<RoundReport> = Vec::new();
    loop {
        if deps.cancel.is_cancelled() {
            return Ok(LoopOutcome {
                run_id,
                rounds,
                stop: LoopStop::Aborted,
            });
        }

        let view = cache.get_state(false)?;
        let baseline = 1.0 / f64::from(deps.config.num_bots.max(1));
        let candidates: Vec<AllocationInput> = deps
            .competitors
            .iter()
            .map(|competitor| match view.state.competitors.get(competitor.id()) {
                Some(record) => AllocationInput::new(&record.id, record.weight, record.efficiency),
                None => AllocationInput::new(competitor.id(), baseline, 1.0),
            })
            .collect();
        let weights = view.state.weights();

        let round_number = rounds.len() as u32 + 1;
        let input = RoundInput {
            issue: &options.issue,
            run_id: &run_id,
            round: round_number,
            kind: state.kind,
            failure: state.failure.as_ref(),
            failed_competitor: state.failed_competitor.as_deref(),
            previous_proposals: &state.previous_proposals,
            candidates: &candidates,
            pool: deps.config.total_budget_pool(),
            usage: &state.usage,
            weights: &weights,
        };
        let report = engine.run(&input)?;
        on_round(&report);

        let next = match report.status {
            RoundStatus::Aborted { .. } => {
                rounds.push(report);
                return Ok(LoopOutcome {
                    run_id,
                    rounds,
                    stop: LoopStop::Aborted,
                });
            }
            RoundStatus::AllAbsent => NextStep::NeedsAttention(AttentionReason::AllCompetitorsAbsent),
            RoundStatus::BudgetExhausted => NextStep::NeedsAttention(AttentionReason::BudgetExhausted),
            RoundStatus::Succeeded => {
                state.consume(report.selected.as_deref());
                let document = deps
                    .tracker
                    .fetch()
                    .context("fetch specification document")?;
                let requirements =
                    extract_requirements(&document, &deps.config.implicit_policies);
                let budget_remaining = report.allocation.iter().any(|(id, budget)| {
                    *budget > state.usage.get(id).copied().unwrap_or(0)
                });
                state.after_success(&report);
                after_success(requirements.all_satisfied(), budget_remaining)
            }
            RoundStatus::Failed => {
                state.consume(report.selected.as_deref());
                let step = after_failure(state.replans_used, deps.config.max_replans);
                state.after_failure(&report, step == NextStep::Replan);
                step
            }
        };
        rounds.push(report);

        match next {
            NextStep::Continue | NextStep::Replan => {}
            NextStep::Complete => {
                info!(rounds = rounds.len(), "issue complete");
                return Ok(LoopOutcome {
                    run_id,
                    rounds,
                    stop: LoopStop::Complete,
                });
            }
            NextStep::NeedsAttention(reason) => {
                let report_path = deps.paths.attention_report(&options.issue);
                let report = attention_report(deps, options, &run_id, reason, &rounds, &state)?;
                escalate(&report_path, &report, deps.tracker)?;
                warn!(reason = reason.as_str(), "issue needs attention");
                return Ok(LoopOutcome {
                    run_id,
                    rounds,
                    stop: LoopStop::NeedsAttention {
                        reason,
                        report_path,
                    },
                });
            }
        }
    }
}

/// Loop-carried state between rounds.
#[derive(Debug, Default)]
struct LoopState {
    kind: RoundKind,
    failure: Option<FailureContext>,
    failed_competitor: Option<String>,
    replans_used: u32,
    previous_proposals: BTreeMap<String, ProposalBody>,
    usage: BTreeMap<String, u32>,
    /// Failures since the last success, oldest first.
    failures: Vec<FailureContext>,
}

impl LoopState {
    fn consume(&mut self, selected: Option<&str>) {
        if let Some(id) = selected {
            *self.usage.entry(id.to_string()).or_insert(0) += 1;
        }
    }

    fn after_success(&mut self, report: &RoundReport) {
        self.kind = RoundKind::Initial;
        self.failure = None;
        self.failed_competitor = None;
        self.replans_used = 0;
        self.failures.clear();
        self.previous_proposals = report.proposals.clone();
    }

    fn after_failure(&mut self, report: &RoundReport, replanning: bool) {
        if let Some(failure) = &report.failure {
            self.failures.push(failure.clone());
        }
        self.previous_proposals = report.proposals.clone();
        if replanning {
            self.kind = RoundKind::Replan;
            self.failure = report.failure.clone();
            self.failed_competitor = report.selected.clone();
            self.replans_used += 1;
        }
    }
}

fn attention_report(
    deps: &LoopDeps<'_>,
    options: &LoopOptions,
    run_id: &str,
    reason: AttentionReason,
    rounds: &[RoundReport],
    state: &LoopState,
) -> Result<AttentionReport> {
    let document = deps
        .tracker
        .fetch()
        .context("fetch specification document")?;
    let requirements = extract_requirements(&document, &deps.config.implicit_policies);
    let absent = rounds
        .last()
        .map(|round| {
            round
                .absent
                .iter()
                .map(|(id, why)| (id.clone(), why.clone()))
                .collect()
        })
        .unwrap_or_default();
    Ok(AttentionReport {
        issue: options.issue.clone(),
        run_id: run_id.to_string(),
        reason,
        branch: options.branch.clone(),
        created_at: Utc::now(),
        rounds_run: rounds.len() as u32,
        open_requirements: requirements
            .open_explicit()
            .map(|req| req.text.clone())
            .collect(),
        failures: state.failures.clone(),
        absent,
        rounds_dir: deps.paths.run_dir(&options.issue, run_id),
    })
}
