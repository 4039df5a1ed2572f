//! Shared deterministic types for the marketplace core.
//!
//! These types define stable contracts between core components and the
//! on-disk records. They must not depend on external state or I/O.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Dimension name mapped to a value in `[0, 1]`.
pub type Dimensions = BTreeMap<String, f64>;

/// Dimension name mapped to its scoring weight. Weights sum to 1.0.
pub type ScoringWeights = BTreeMap<String, f64>;

/// Classified result of one competitor's participation in a round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeKind {
    /// Ranked #1 and implemented successfully.
    RankedFirstSuccess,
    /// Ranked #1 and the implementation failed verification.
    RankedFirstFailure,
    /// Ranked #2+ in a failed round, later tried and succeeded.
    RankedSecondPlusSuccess,
    /// Ranked #2+ in a failed round, later tried and failed.
    RankedSecondPlusFailure,
    /// Ranked but never tried because another proposal succeeded.
    RankedNotTried,
    /// Failed competitor's new replan proposal succeeded.
    ReplanNewSuccess,
    /// Failed competitor's replan proposal failed again.
    ReplanFailedAgain,
    /// Failed competitor resubmitted its prior proposal unchanged.
    ReplanResubmittedSame,
    /// Round was interrupted; not a resolution.
    Aborted,
}

impl OutcomeKind {
    pub const ALL: [OutcomeKind; 9] = [
        OutcomeKind::RankedFirstSuccess,
        OutcomeKind::RankedFirstFailure,
        OutcomeKind::RankedSecondPlusSuccess,
        OutcomeKind::RankedSecondPlusFailure,
        OutcomeKind::RankedNotTried,
        OutcomeKind::ReplanNewSuccess,
        OutcomeKind::ReplanFailedAgain,
        OutcomeKind::ReplanResubmittedSame,
        OutcomeKind::Aborted,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            OutcomeKind::RankedFirstSuccess => "ranked_first_success",
            OutcomeKind::RankedFirstFailure => "ranked_first_failure",
            OutcomeKind::RankedSecondPlusSuccess => "ranked_second_plus_success",
            OutcomeKind::RankedSecondPlusFailure => "ranked_second_plus_failure",
            OutcomeKind::RankedNotTried => "ranked_not_tried",
            OutcomeKind::ReplanNewSuccess => "replan_new_success",
            OutcomeKind::ReplanFailedAgain => "replan_failed_again",
            OutcomeKind::ReplanResubmittedSame => "replan_resubmitted_same",
            OutcomeKind::Aborted => "aborted",
        }
    }

    /// Human-readable summary for status output.
    pub fn describe(self) -> &'static str {
        match self {
            OutcomeKind::RankedFirstSuccess => "Ranked #1, implementation succeeded",
            OutcomeKind::RankedFirstFailure => "Ranked #1, implementation failed",
            OutcomeKind::RankedSecondPlusSuccess => "Ranked #2+, succeeded after higher rank failed",
            OutcomeKind::RankedSecondPlusFailure => "Ranked #2+, failed after higher rank failed",
            OutcomeKind::RankedNotTried => "Ranked but not tried (another succeeded)",
            OutcomeKind::ReplanNewSuccess => "Replan with new proposal succeeded",
            OutcomeKind::ReplanFailedAgain => "Replan failed again",
            OutcomeKind::ReplanResubmittedSame => "Replan resubmitted same proposal",
            OutcomeKind::Aborted => "Round aborted before resolution",
        }
    }

    pub fn is_success(self) -> bool {
        matches!(
            self,
            OutcomeKind::RankedFirstSuccess
                | OutcomeKind::RankedSecondPlusSuccess
                | OutcomeKind::ReplanNewSuccess
        )
    }

    pub fn is_failure(self) -> bool {
        matches!(
            self,
            OutcomeKind::RankedFirstFailure
                | OutcomeKind::RankedSecondPlusFailure
                | OutcomeKind::ReplanFailedAgain
        )
    }
}

/// Measured implementation metrics attached to an event.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventMetrics {
    pub tests_passed: bool,
    pub code_quality_passed: bool,
    pub coverage_delta: f64,
    pub lines_changed: u32,
    pub files_affected: u32,
}

/// Immutable fact describing one competitor's outcome in one round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub timestamp: DateTime<Utc>,
    #[serde(alias = "issue_number", deserialize_with = "string_or_number")]
    pub round_identifier: String,
    #[serde(rename = "bot_id")]
    pub competitor_id: String,
    #[serde(rename = "outcome")]
    pub outcome_kind: OutcomeKind,
    pub proposal_score: f64,
    pub implementation_score: f64,
    /// `|predicted - actual|`; absent when the proposal was not implemented.
    #[serde(default)]
    pub accuracy: Option<f64>,
    pub weight_delta: f64,
    #[serde(default)]
    pub iteration_count: u32,
    #[serde(default)]
    pub metrics: EventMetrics,
}

impl Event {
    /// Collision-resistant record name: `<timestamp>-<competitor>-<outcome>`.
    ///
    /// The timestamp uses fixed-width nanoseconds so lexical order matches
    /// chronological order.
    pub fn record_name(&self) -> String {
        format!(
            "{}-{}-{}",
            self.timestamp.format("%Y-%m-%dT%H-%M-%S-%9fZ"),
            sanitize_component(&self.competitor_id),
            self.outcome_kind.as_str()
        )
    }
}

/// Legacy records store the issue number as a JSON number.
fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        Number(u64),
    }
    Ok(match Raw::deserialize(deserializer)? {
        Raw::Text(text) => text,
        Raw::Number(number) => number.to_string(),
    })
}

/// Map an identifier to a single safe path component.
pub fn sanitize_component(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let trimmed = cleaned.trim_matches('.');
    if trimmed.is_empty() {
        "_".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Per-competitor state derived by folding events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompetitorRecord {
    pub id: String,
    pub weight: f64,
    /// `successes / (successes + failures)`; 1.0 before any attempt.
    pub efficiency: f64,
    pub successes: u32,
    pub failures: u32,
    pub proposals_ranked: u32,
    pub iterations_used: u32,
    pub accuracy_history: Vec<f64>,
}

impl CompetitorRecord {
    pub fn new(id: impl Into<String>, weight: f64) -> Self {
        Self {
            id: id.into(),
            weight,
            efficiency: 1.0,
            successes: 0,
            failures: 0,
            proposals_ranked: 0,
            iterations_used: 0,
            accuracy_history: Vec::new(),
        }
    }

    /// Mean prediction error; 0.0 with no history.
    pub fn average_accuracy(&self) -> f64 {
        if self.accuracy_history.is_empty() {
            return 0.0;
        }
        self.accuracy_history.iter().sum::<f64>() / self.accuracy_history.len() as f64
    }
}

/// Materialized marketplace state. A pure function of events and config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketplaceState {
    pub competitors: BTreeMap<String, CompetitorRecord>,
    pub total_budget_pool: u32,
    pub rounds_completed: u32,
    /// Timestamp of the last folded event.
    pub last_updated: Option<DateTime<Utc>>,
}

impl MarketplaceState {
    pub fn weights(&self) -> BTreeMap<String, f64> {
        self.competitors
            .iter()
            .map(|(id, record)| (id.clone(), record.weight))
            .collect()
    }

    pub fn weight_sum(&self) -> f64 {
        self.competitors.values().map(|record| record.weight).sum()
    }
}

/// Proposal content as produced by a competitor actor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProposalBody {
    pub approach_summary: String,
    #[serde(default)]
    pub pseudo_code: String,
    #[serde(default)]
    pub files_affected: Vec<String>,
    /// Self-estimated complexity in `[0, 1]` (higher is more complex).
    pub estimated_complexity: f64,
    /// Self-estimated risk in `[0, 1]` (higher is riskier).
    pub risk_assessment: f64,
    /// Self-estimated fraction of requirements covered, `[0, 1]`.
    pub spec_alignment_claim: f64,
    /// Additional self-scored dimensions (e.g. `innovation`).
    #[serde(default)]
    pub self_scores: Dimensions,
}

/// Round-scoped proposal with its author attached. Never persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct Proposal {
    pub competitor_id: String,
    pub submission_time: DateTime<Utc>,
    pub body: ProposalBody,
}

/// Proposal relabeled with an ordinal identifier for blind scoring.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnonymousProposal {
    pub label: String,
    pub fingerprint: String,
    pub submission_time: DateTime<Utc>,
    pub body: ProposalBody,
}

/// Single requirement extracted from a specification document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Requirement {
    pub id: String,
    pub text: String,
    pub satisfied: bool,
}

/// Requirements extracted at the start of a round.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequirementSet {
    pub explicit: Vec<Requirement>,
    pub implicit: Vec<Requirement>,
    /// True when implicit derivation failed and only explicit items apply.
    pub degraded: bool,
}

impl RequirementSet {
    pub fn open_explicit(&self) -> impl Iterator<Item = &Requirement> {
        self.explicit.iter().filter(|req| !req.satisfied)
    }

    pub fn all_satisfied(&self) -> bool {
        self.explicit.iter().all(|req| req.satisfied)
    }
}

/// Result of a single verification check (format, lint, types, tests).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckResult {
    pub name: String,
    pub passed: bool,
    #[serde(default)]
    pub output: String,
}

/// What an implementer reports after applying a proposal.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImplementationReport {
    pub files_changed: Vec<String>,
    pub lines_changed: u32,
    pub coverage_delta: f64,
    pub verification_results: Vec<CheckResult>,
    /// Measured dimension values; override derived ones.
    pub measured: Dimensions,
    /// Requirement ids satisfied. `None` means every open requirement.
    pub requirements_satisfied: Option<Vec<String>>,
}

impl ImplementationReport {
    pub fn all_checks_passed(&self) -> bool {
        self.verification_results.iter().all(|check| check.passed)
    }

    pub fn failing_checks(&self) -> Vec<CheckResult> {
        self.verification_results
            .iter()
            .filter(|check| !check.passed)
            .cloned()
            .collect()
    }

    pub fn metrics(&self) -> EventMetrics {
        let (tests, quality): (Vec<&CheckResult>, Vec<&CheckResult>) = self
            .verification_results
            .iter()
            .partition(|check| check.name.to_ascii_lowercase().contains("test"));
        EventMetrics {
            tests_passed: tests.iter().all(|check| check.passed),
            code_quality_passed: quality.iter().all(|check| check.passed),
            coverage_delta: self.coverage_delta,
            lines_changed: self.lines_changed,
            files_affected: self.files_changed.len() as u32,
        }
    }
}

/// Failure detail broadcast to competitors on a replan round.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureContext {
    pub round_identifier: String,
    pub failed_approach: String,
    pub failing_checks: Vec<CheckResult>,
    pub reason: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn record_names_sort_chronologically() {
        let early = Event {
            timestamp: Utc.with_ymd_and_hms(2025, 1, 2, 3, 4, 5).unwrap(),
            round_identifier: "7/1".to_string(),
            competitor_id: "bidder_1".to_string(),
            outcome_kind: OutcomeKind::RankedFirstSuccess,
            proposal_score: 0.5,
            implementation_score: 0.5,
            accuracy: Some(0.0),
            weight_delta: 0.15,
            iteration_count: 1,
            metrics: EventMetrics::default(),
        };
        let mut late = early.clone();
        late.timestamp = early.timestamp + chrono::Duration::nanoseconds(10);

        assert!(early.record_name() < late.record_name());
        assert_eq!(
            early.record_name(),
            "2025-01-02T03-04-05-000000000Z-bidder_1-ranked_first_success"
        );
    }

    #[test]
    fn outcome_serializes_snake_case_and_accepts_legacy_issue_key() {
        let raw = r#"{
            "timestamp": "2025-01-02T03:04:05Z",
            "issue_number": "42",
            "bot_id": "bidder_2",
            "outcome": "replan_failed_again",
            "proposal_score": 0.7,
            "implementation_score": 0.2,
            "weight_delta": -0.2
        }"#;
        let event: Event = serde_json::from_str(raw).expect("parse legacy event");
        assert_eq!(event.round_identifier, "42");
        assert_eq!(event.outcome_kind, OutcomeKind::ReplanFailedAgain);
        assert_eq!(event.accuracy, None);
        assert_eq!(event.metrics, EventMetrics::default());
    }

    #[test]
    fn success_and_failure_kinds_are_disjoint() {
        for kind in OutcomeKind::ALL {
            assert!(!(kind.is_success() && kind.is_failure()), "{kind:?}");
        }
        assert!(!OutcomeKind::Aborted.is_success());
        assert!(!OutcomeKind::Aborted.is_failure());
        assert!(!OutcomeKind::RankedNotTried.is_failure());
    }

    #[test]
    fn metrics_split_tests_from_quality_checks() {
        let report = ImplementationReport {
            files_changed: vec!["a.rs".to_string(), "b.rs".to_string()],
            lines_changed: 40,
            verification_results: vec![
                CheckResult {
                    name: "format".to_string(),
                    passed: true,
                    output: String::new(),
                },
                CheckResult {
                    name: "tests".to_string(),
                    passed: false,
                    output: "1 failed".to_string(),
                },
            ],
            ..ImplementationReport::default()
        };
        let metrics = report.metrics();
        assert!(!metrics.tests_passed);
        assert!(metrics.code_quality_passed);
        assert_eq!(metrics.files_affected, 2);
        assert_eq!(report.failing_checks().len(), 1);
    }
}
