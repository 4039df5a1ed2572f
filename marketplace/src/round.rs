//! One marketplace round for an issue.
//!
//! Phases run in a fixed order: extracting requirements, collecting
//! proposals, blind scoring, implementing, then classifying the result as
//! succeeded or failed. Events are appended only once a round resolves, or
//! as a single `aborted` record if cancellation lands mid-implementation.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use chrono::Utc;
use tracing::{debug, info, instrument, warn};

use crate::core::budget::{AllocationInput, allocate};
use crate::core::fingerprint::is_materially_different;
use crate::core::outcome::{RoundKind, classify_selected, classify_unselected};
use crate::core::requirements::extract_requirements;
use crate::core::scoring::{
    RankedProposal, accuracy, actual_dimensions, anonymize, rank_proposals, score,
};
use crate::core::types::{
    AnonymousProposal, Event, EventMetrics, FailureContext, ImplementationReport, OutcomeKind,
    Proposal, ProposalBody, RequirementSet,
};
use crate::core::weights::{apply_delta, weight_delta};
use crate::io::competitor::{Competitor, ProposalRequest, ProposalResponse, collect_proposals};
use crate::io::config::MarketConfig;
use crate::io::event_store::EventStore;
use crate::io::implementer::{ImplementationRequest, Implementer};
use crate::io::paths::MarketPaths;
use crate::io::process::{Bounded, bounded_call};
use crate::io::round_log::{
    ImplementationRecord, RevealedRank, RoundLogRequest, RoundSummaryRecord, write_round_log,
};
use crate::io::spec_doc::SpecTracker;

/// Shared cancellation flag, set by the Ctrl-C listener.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundPhase {
    ExtractingRequirements,
    CollectingProposals,
    Scoring,
    Implementing,
    RoundSucceeded,
    RoundFailed,
}

impl RoundPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            RoundPhase::ExtractingRequirements => "extracting_requirements",
            RoundPhase::CollectingProposals => "collecting_proposals",
            RoundPhase::Scoring => "scoring",
            RoundPhase::Implementing => "implementing",
            RoundPhase::RoundSucceeded => "round_succeeded",
            RoundPhase::RoundFailed => "round_failed",
        }
    }
}

/// How a round ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundStatus {
    Succeeded,
    Failed,
    /// No competitor produced a usable proposal; the scorer never ran.
    AllAbsent,
    /// Every responder had used up its allocation.
    BudgetExhausted,
    /// Cancelled; `recorded` is true when an `aborted` event was appended.
    Aborted { recorded: bool },
}

impl RoundStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RoundStatus::Succeeded => "succeeded",
            RoundStatus::Failed => "failed",
            RoundStatus::AllAbsent => "all_absent",
            RoundStatus::BudgetExhausted => "budget_exhausted",
            RoundStatus::Aborted { .. } => "aborted",
        }
    }
}

/// What the implementer produced for the selected proposal.
#[derive(Debug, Clone, PartialEq)]
pub enum ImplementationOutcome {
    Completed {
        report: ImplementationReport,
        actual_score: f64,
        accuracy: f64,
    },
    Failed {
        reason: String,
    },
}

/// Everything observed in one round.
#[derive(Debug, Clone)]
pub struct RoundReport {
    pub round_identifier: String,
    pub status: RoundStatus,
    pub requirements: RequirementSet,
    /// Selected competitor (rank 1), once scoring ran.
    pub selected: Option<String>,
    /// Ranked responders with identities re-associated, rank order.
    pub ranking: Vec<(String, RankedProposal)>,
    pub absent: BTreeMap<String, String>,
    /// Pool split among this round's responders only.
    pub allocation: BTreeMap<String, u32>,
    /// Responders excluded because their allocation was used up.
    pub excluded_budget: Vec<String>,
    /// Every submitted proposal by competitor, including excluded ones.
    pub proposals: BTreeMap<String, ProposalBody>,
    /// For responders with a previous proposal: whether this one differs.
    pub distinct_from_previous: BTreeMap<String, bool>,
    pub implementation: Option<ImplementationOutcome>,
    pub events: Vec<Event>,
    /// Set on failed rounds; broadcast on the replan round.
    pub failure: Option<FailureContext>,
    /// Requirement ids checked off after a successful round.
    pub satisfied: Vec<String>,
    pub artifacts_dir: PathBuf,
}

impl RoundReport {
    fn new(round_identifier: String, artifacts_dir: PathBuf) -> Self {
        Self {
            round_identifier,
            status: RoundStatus::Aborted { recorded: false },
            requirements: RequirementSet::default(),
            selected: None,
            ranking: Vec::new(),
            absent: BTreeMap::new(),
            allocation: BTreeMap::new(),
            excluded_budget: Vec::new(),
            proposals: BTreeMap::new(),
            distinct_from_previous: BTreeMap::new(),
            implementation: None,
            events: Vec::new(),
            failure: None,
            satisfied: Vec::new(),
            artifacts_dir,
        }
    }
}

/// Collaborators shared by every round of a loop.
pub struct RoundEngine<'a> {
    pub config: &'a MarketConfig,
    pub paths: &'a MarketPaths,
    pub store: &'a EventStore,
    pub competitors: &'a [Arc<dyn Competitor>],
    pub implementer: Arc<dyn Implementer>,
    pub tracker: &'a dyn SpecTracker,
    pub cancel: &'a CancelToken,
}

/// Per-round inputs computed by the loop.
pub struct RoundInput<'a> {
    pub issue: &'a str,
    pub run_id: &'a str,
    pub round: u32,
    pub kind: RoundKind,
    pub failure: Option<&'a FailureContext>,
    /// Competitor implemented in the failed round being replanned.
    pub failed_competitor: Option<&'a str>,
    pub previous_proposals: &'a BTreeMap<String, ProposalBody>,
    /// Projected weight and efficiency of every invited competitor.
    pub candidates: &'a [AllocationInput],
    pub pool: u32,
    pub usage: &'a BTreeMap<String, u32>,
    /// Current weights, used to report each weight update.
    pub weights: &'a BTreeMap<String, f64>,
}

impl RoundInput<'_> {
    /// Split the pool among the candidates accepted by `keep`.
    fn allocate_among(&self, keep: impl Fn(&str) -> bool) -> BTreeMap<String, u32> {
        let inputs: Vec<AllocationInput> = self
            .candidates
            .iter()
            .filter(|candidate| keep(candidate.id.as_str()))
            .cloned()
            .collect();
        allocate(&inputs, self.pool)
    }

    fn remaining(&self, allocation: &BTreeMap<String, u32>, id: &str) -> u32 {
        allocation
            .get(id)
            .copied()
            .unwrap_or(0)
            .saturating_sub(self.usage.get(id).copied().unwrap_or(0))
    }

    /// The failed competitor owes a revised plan on a replan round.
    fn owes_replan(&self, id: &str) -> bool {
        self.kind == RoundKind::Replan && self.failed_competitor == Some(id)
    }
}

impl RoundEngine<'_> {
    #[instrument(skip_all, fields(issue = input.issue, round = input.round, replan = input.kind == RoundKind::Replan))]
    pub fn run(&self, input: &RoundInput<'_>) -> Result<RoundReport> {
        let round_identifier = format!("{}/{}/{}", input.issue, input.run_id, input.round);
        let artifacts_dir = self
            .paths
            .round_dir(input.issue, input.run_id, input.round);
        let mut report = RoundReport::new(round_identifier, artifacts_dir);

        enter(RoundPhase::ExtractingRequirements);
        let document = self
            .tracker
            .fetch()
            .context("fetch specification document")?;
        report.requirements = extract_requirements(&document, &self.config.implicit_policies);
        if self.cancel.is_cancelled() {
            return self.finish(report, RoundStatus::Aborted { recorded: false }, &[], input);
        }

        enter(RoundPhase::CollectingProposals);
        let requests = self.build_requests(input, &report);
        let should_stop = || self.cancel.is_cancelled();
        let responses = collect_proposals(
            self.competitors,
            &requests,
            self.config.timeouts.proposal(),
            &should_stop,
        );
        if self.cancel.is_cancelled() {
            return self.finish(report, RoundStatus::Aborted { recorded: false }, &[], input);
        }

        let mut submitted = Vec::new();
        for (id, response) in responses {
            match response {
                ProposalResponse::Submitted {
                    body,
                    submission_time,
                } => {
                    if let Some(previous) = input.previous_proposals.get(&id) {
                        report
                            .distinct_from_previous
                            .insert(id.clone(), is_materially_different(previous, &body));
                    }
                    report.proposals.insert(id.clone(), body.clone());
                    submitted.push(Proposal {
                        competitor_id: id,
                        submission_time,
                        body,
                    });
                }
                ProposalResponse::Absent { reason } => {
                    report.absent.insert(id, reason);
                }
            }
        }

        report.allocation = input.allocate_among(|id| report.proposals.contains_key(id));
        let mut eligible = Vec::new();
        for proposal in submitted {
            let id = proposal.competitor_id.as_str();
            if input.remaining(&report.allocation, id) == 0 && !input.owes_replan(id) {
                info!(competitor = %id, "allocation used up; proposal excluded");
                report.excluded_budget.push(proposal.competitor_id);
            } else {
                eligible.push(proposal);
            }
        }
        if report.proposals.is_empty() {
            warn!(absent = report.absent.len(), "every competitor absent; round fails");
            return self.finish(report, RoundStatus::AllAbsent, &[], input);
        }
        if eligible.is_empty() {
            warn!("no responder has allocation left");
            return self.finish(report, RoundStatus::BudgetExhausted, &[], input);
        }

        enter(RoundPhase::Scoring);
        let (anonymous, authors) = anonymize(eligible);
        let ranked = rank_proposals(&anonymous, &self.config.scoring_weights);
        report.ranking = ranked
            .into_iter()
            .filter_map(|entry| {
                authors
                    .get(&entry.label)
                    .map(|competitor| (competitor.clone(), entry))
            })
            .collect();
        let (selected_id, top) = report
            .ranking
            .first()
            .cloned()
            .ok_or_else(|| anyhow!("ranking lost every proposal"))?;
        let selected_body = report
            .proposals
            .get(&selected_id)
            .cloned()
            .ok_or_else(|| anyhow!("selected proposal missing for {selected_id}"))?;
        info!(label = %top.label, total = top.total, "proposal ranked first");
        report.selected = Some(selected_id.clone());
        if self.cancel.is_cancelled() {
            return self.finish(
                report,
                RoundStatus::Aborted { recorded: false },
                &anonymous,
                input,
            );
        }

        enter(RoundPhase::Implementing);
        let request = ImplementationRequest {
            issue: input.issue.to_string(),
            round_identifier: report.round_identifier.clone(),
            round: input.round,
            proposal: selected_body.clone(),
            requirements: report.requirements.clone(),
        };
        let implementer = Arc::clone(&self.implementer);
        let limit = self.implementation_limit();
        let outcome = bounded_call(limit, &should_stop, move || implementer.implement(&request));
        let implemented = match outcome {
            Bounded::Finished(Ok(result)) => Ok(result),
            Bounded::Finished(Err(err)) => Err(format!("{err:#}")),
            Bounded::TimedOut => Err(format!("implementation exceeded {}s", limit.as_secs())),
            Bounded::Lost => Err("implementer worker exited without a result".to_string()),
            Bounded::Stopped => Err("cancelled".to_string()),
        };
        if self.cancel.is_cancelled() {
            let event = Event {
                timestamp: Utc::now(),
                round_identifier: report.round_identifier.clone(),
                competitor_id: selected_id,
                outcome_kind: OutcomeKind::Aborted,
                proposal_score: top.total,
                implementation_score: 0.0,
                accuracy: None,
                weight_delta: 0.0,
                iteration_count: 1,
                metrics: EventMetrics::default(),
            };
            self.store.append(&event)?;
            report.events.push(event);
            warn!("round aborted during implementation");
            return self.finish(report, RoundStatus::Aborted { recorded: true }, &anonymous, input);
        }

        let succeeded = matches!(&implemented, Ok(result) if result.all_checks_passed());
        enter(if succeeded {
            RoundPhase::RoundSucceeded
        } else {
            RoundPhase::RoundFailed
        });

        let selected_kind = classify_selected(
            input.kind,
            input.failed_competitor == Some(selected_id.as_str()),
            !report
                .distinct_from_previous
                .get(&selected_id)
                .copied()
                .unwrap_or(true),
            succeeded,
        );
        let selected_event = match &implemented {
            Ok(result) => {
                let actual_dims =
                    actual_dimensions(&top.dimensions, result, &report.requirements);
                let actual_score = score(&actual_dims, &self.config.scoring_weights);
                let error = accuracy(top.total, actual_score);
                report.implementation = Some(ImplementationOutcome::Completed {
                    report: result.clone(),
                    actual_score,
                    accuracy: error,
                });
                Event {
                    timestamp: Utc::now(),
                    round_identifier: report.round_identifier.clone(),
                    competitor_id: selected_id.clone(),
                    outcome_kind: selected_kind,
                    proposal_score: top.total,
                    implementation_score: actual_score,
                    accuracy: Some(error),
                    weight_delta: weight_delta(selected_kind, Some(error)),
                    iteration_count: 1,
                    metrics: result.metrics(),
                }
            }
            Err(reason) => {
                warn!(reason = %reason, "implementation failed");
                report.implementation = Some(ImplementationOutcome::Failed {
                    reason: reason.clone(),
                });
                Event {
                    timestamp: Utc::now(),
                    round_identifier: report.round_identifier.clone(),
                    competitor_id: selected_id.clone(),
                    outcome_kind: selected_kind,
                    proposal_score: top.total,
                    implementation_score: 0.0,
                    accuracy: None,
                    weight_delta: weight_delta(selected_kind, None),
                    iteration_count: 1,
                    metrics: EventMetrics::default(),
                }
            }
        };
        let mut events = vec![selected_event];
        for (id, entry) in report.ranking.iter().skip(1) {
            let failed_previously = input.failed_competitor == Some(id.as_str());
            let resubmitted_same =
                failed_previously && !report.distinct_from_previous.get(id).copied().unwrap_or(true);
            if let Some(kind) = classify_unselected(succeeded, failed_previously, resubmitted_same)
            {
                events.push(Event {
                    timestamp: Utc::now(),
                    round_identifier: report.round_identifier.clone(),
                    competitor_id: id.clone(),
                    outcome_kind: kind,
                    proposal_score: entry.total,
                    implementation_score: 0.0,
                    accuracy: None,
                    weight_delta: weight_delta(kind, None),
                    iteration_count: 0,
                    metrics: EventMetrics::default(),
                });
            }
        }
        self.record(&events, input);
        for event in &events {
            self.store.append(event)?;
        }
        report.events = events;

        if succeeded {
            let open: Vec<String> = report
                .requirements
                .open_explicit()
                .map(|req| req.id.clone())
                .collect();
            let claimed = match &implemented {
                Ok(result) => result.requirements_satisfied.clone(),
                Err(_) => None,
            };
            report.satisfied = match claimed {
                Some(ids) => open.into_iter().filter(|id| ids.contains(id)).collect(),
                None => open,
            };
            self.tracker
                .check_off(&report.satisfied)
                .context("check off satisfied requirements")?;
            return self.finish(report, RoundStatus::Succeeded, &anonymous, input);
        }

        report.failure = Some(FailureContext {
            round_identifier: report.round_identifier.clone(),
            failed_approach: selected_body.approach_summary.clone(),
            failing_checks: match &implemented {
                Ok(result) => result.failing_checks(),
                Err(_) => Vec::new(),
            },
            reason: implemented.as_ref().err().cloned(),
        });
        self.finish(report, RoundStatus::Failed, &anonymous, input)
    }

    fn build_requests(
        &self,
        input: &RoundInput<'_>,
        report: &RoundReport,
    ) -> BTreeMap<String, ProposalRequest> {
        let invited = input.allocate_among(|_| true);
        self.competitors
            .iter()
            .map(|competitor| {
                let id = competitor.id().to_string();
                let request = ProposalRequest {
                    issue: input.issue.to_string(),
                    round_identifier: report.round_identifier.clone(),
                    round: input.round,
                    competitor_id: id.clone(),
                    requirements: report.requirements.clone(),
                    scoring_weights: self.config.scoring_weights.clone(),
                    allocated_iterations: invited.get(&id).copied().unwrap_or(0),
                    remaining_iterations: input.remaining(&invited, &id),
                    failure_context: input.failure.cloned(),
                    previous_proposal: input.previous_proposals.get(&id).cloned(),
                };
                (id, request)
            })
            .collect()
    }

    /// Implementation plus every verification check.
    fn implementation_limit(&self) -> Duration {
        let checks = self.config.checks.len().max(1) as u32;
        self.config.timeouts.implementation() + self.config.timeouts.verification() * checks
    }

    /// Log each weight update the round's events cause.
    fn record(&self, events: &[Event], input: &RoundInput<'_>) {
        let mut weights = input.weights.clone();
        let baseline = 1.0 / f64::from(self.config.num_bots.max(1));
        for event in events {
            let old = *weights
                .entry(event.competitor_id.clone())
                .or_insert(baseline);
            match apply_delta(
                &mut weights,
                &event.competitor_id,
                event.weight_delta,
                &self.config.weight_constraints,
            ) {
                Ok(()) => info!(
                    competitor = %event.competitor_id,
                    outcome = event.outcome_kind.as_str(),
                    old_weight = old,
                    delta = event.weight_delta,
                    new_weight = weights.get(&event.competitor_id).copied().unwrap_or(old),
                    "weight updated"
                ),
                Err(err) => warn!(err = %err, competitor = %event.competitor_id, "weight update not applicable"),
            }
        }
    }

    fn finish(
        &self,
        mut report: RoundReport,
        status: RoundStatus,
        proposals: &[AnonymousProposal],
        input: &RoundInput<'_>,
    ) -> Result<RoundReport> {
        report.status = status;
        let ranking: Vec<RevealedRank<'_>> = report
            .ranking
            .iter()
            .map(|(competitor_id, ranked)| RevealedRank {
                competitor_id,
                ranked,
            })
            .collect();
        let implementation = report.implementation.as_ref().map(|outcome| match outcome {
            ImplementationOutcome::Completed {
                report,
                actual_score,
                accuracy,
            } => ImplementationRecord::Completed {
                report,
                actual_score: *actual_score,
                accuracy: *accuracy,
            },
            ImplementationOutcome::Failed { reason } => ImplementationRecord::Failed { reason },
        });
        let kind = match input.kind {
            RoundKind::Initial => "initial",
            RoundKind::Replan => "replan",
        };
        write_round_log(
            report.artifacts_dir.clone(),
            &RoundLogRequest {
                summary: RoundSummaryRecord {
                    round_identifier: &report.round_identifier,
                    kind,
                    status: status.as_str(),
                    selected: report.selected.as_deref(),
                    absent: &report.absent,
                    excluded_budget: &report.excluded_budget,
                },
                requirements: &report.requirements,
                allocation: &report.allocation,
                proposals,
                ranking: &ranking,
                implementation,
                events: &report.events,
            },
        )?;
        info!(status = status.as_str(), events = report.events.len(), "round finished");
        Ok(report)
    }
}

fn enter(phase: RoundPhase) {
    debug!(phase = phase.as_str(), "round phase");
}
