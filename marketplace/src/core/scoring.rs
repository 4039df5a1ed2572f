//! Weighted multi-dimensional scoring and blind ranking.
//!
//! The dimension set is configuration, not code: `score` walks whatever
//! weights it is given. Predicted and actual scores use the same set so the
//! two are directly comparable.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::core::fingerprint::proposal_fingerprint;
use crate::core::types::{
    AnonymousProposal, Dimensions, ImplementationReport, Proposal, ProposalBody, RequirementSet,
    ScoringWeights,
};

pub const SPEC_ALIGNMENT: &str = "spec_alignment";
pub const TECHNICAL_QUALITY: &str = "technical_quality";
pub const INNOVATION: &str = "innovation";
pub const RISK: &str = "risk";
pub const EFFICIENCY: &str = "efficiency";

/// Tolerance for the scoring-weight sum.
pub const WEIGHT_SUM_TOLERANCE: f64 = 1e-6;

/// Default five-dimension weighting.
pub fn default_scoring_weights() -> ScoringWeights {
    [
        (SPEC_ALIGNMENT, 0.32),
        (TECHNICAL_QUALITY, 0.22),
        (INNOVATION, 0.15),
        (RISK, 0.21),
        (EFFICIENCY, 0.10),
    ]
    .into_iter()
    .map(|(name, weight)| (name.to_string(), weight))
    .collect()
}

/// Validate dimension weights. Runs at config load, not at score time.
pub fn validate_scoring_weights(weights: &ScoringWeights) -> Vec<String> {
    let mut errors = Vec::new();
    if weights.is_empty() {
        errors.push("scoring_weights must name at least one dimension".to_string());
        return errors;
    }
    for (name, weight) in weights {
        if name.trim().is_empty() {
            errors.push("scoring_weights contains an empty dimension name".to_string());
        }
        if !weight.is_finite() || !(0.0..=1.0).contains(weight) {
            errors.push(format!("scoring_weights.{name} must be in [0, 1] (got {weight})"));
        }
    }
    let sum: f64 = weights.values().sum();
    if (sum - 1.0).abs() > WEIGHT_SUM_TOLERANCE {
        errors.push(format!("scoring_weights must sum to 1.0 (got {sum:.6})"));
    }
    errors
}

/// `Σ value × weight`, each value clamped into `[0, 1]`.
///
/// Dimensions missing from `dimensions` score 0; dimensions without a weight
/// are ignored.
pub fn score(dimensions: &Dimensions, weights: &ScoringWeights) -> f64 {
    let total: f64 = weights
        .iter()
        .map(|(name, weight)| unit(dimensions.get(name).copied().unwrap_or(0.0)) * weight)
        .sum();
    total.clamp(0.0, 1.0)
}

/// Dimensions predicted from a proposal's self-reported estimates.
///
/// Explicit `self_scores` win; otherwise alignment comes from the claim,
/// risk from `1 - risk_assessment`, efficiency from `1 - complexity`.
pub fn predicted_dimensions(body: &ProposalBody) -> Dimensions {
    let mut dims: Dimensions = body
        .self_scores
        .iter()
        .map(|(name, value)| (name.clone(), unit(*value)))
        .collect();
    dims.entry(SPEC_ALIGNMENT.to_string())
        .or_insert_with(|| unit(body.spec_alignment_claim));
    dims.entry(RISK.to_string())
        .or_insert_with(|| unit(1.0 - body.risk_assessment));
    dims.entry(EFFICIENCY.to_string())
        .or_insert_with(|| unit(1.0 - body.estimated_complexity));
    dims
}

/// Dimensions measured after implementation, over the predicted key set.
///
/// Alignment is requirement coverage, technical quality is the passing-check
/// ratio, measured values override both; anything unmeasured keeps its
/// prediction so only observed dimensions move the accuracy signal.
pub fn actual_dimensions(
    predicted: &Dimensions,
    report: &ImplementationReport,
    requirements: &RequirementSet,
) -> Dimensions {
    let mut dims = predicted.clone();
    dims.insert(
        SPEC_ALIGNMENT.to_string(),
        requirement_coverage(report, requirements),
    );
    if !report.verification_results.is_empty() {
        let passed = report
            .verification_results
            .iter()
            .filter(|check| check.passed)
            .count();
        dims.insert(
            TECHNICAL_QUALITY.to_string(),
            passed as f64 / report.verification_results.len() as f64,
        );
    }
    for (name, value) in &report.measured {
        dims.insert(name.clone(), unit(*value));
    }
    dims
}

/// Fraction of open explicit requirements the report claims satisfied.
pub fn requirement_coverage(report: &ImplementationReport, requirements: &RequirementSet) -> f64 {
    let open: Vec<&str> = requirements.open_explicit().map(|r| r.id.as_str()).collect();
    if open.is_empty() {
        return 1.0;
    }
    match &report.requirements_satisfied {
        None => 1.0,
        Some(ids) => {
            let hit = open.iter().filter(|id| ids.iter().any(|s| s == *id)).count();
            hit as f64 / open.len() as f64
        }
    }
}

/// Prediction error between a proposal and its implementation.
pub fn accuracy(predicted_total: f64, actual_total: f64) -> f64 {
    (predicted_total - actual_total).abs()
}

/// Strip competitor identities and relabel with ordinals.
///
/// Labels are assigned in `(submission_time, fingerprint, competitor_id)`
/// order, so they do not depend on the order proposals arrived in. Returns
/// the anonymized proposals and the label → competitor mapping used to
/// re-associate outcomes.
pub fn anonymize(proposals: Vec<Proposal>) -> (Vec<AnonymousProposal>, BTreeMap<String, String>) {
    let mut keyed: Vec<(String, Proposal)> = proposals
        .into_iter()
        .map(|proposal| (proposal_fingerprint(&proposal.body), proposal))
        .collect();
    keyed.sort_by(|(fa, a), (fb, b)| {
        a.submission_time
            .cmp(&b.submission_time)
            .then_with(|| fa.cmp(fb))
            .then_with(|| a.competitor_id.cmp(&b.competitor_id))
    });

    let mut anonymous = Vec::with_capacity(keyed.len());
    let mut authors = BTreeMap::new();
    for (idx, (fingerprint, proposal)) in keyed.into_iter().enumerate() {
        let label = format!("proposal-{}", idx + 1);
        authors.insert(label.clone(), proposal.competitor_id);
        anonymous.push(AnonymousProposal {
            label,
            fingerprint,
            submission_time: proposal.submission_time,
            body: proposal.body,
        });
    }
    (anonymous, authors)
}

/// One ranked entry.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RankedProposal {
    pub rank: usize,
    pub label: String,
    pub total: f64,
    pub dimensions: Dimensions,
    pub submission_time: DateTime<Utc>,
    pub fingerprint: String,
}

/// Score and rank proposals: total descending, then earliest submission.
///
/// Remaining ties fall back to fingerprint and label, never to input order.
pub fn rank_proposals(
    proposals: &[AnonymousProposal],
    weights: &ScoringWeights,
) -> Vec<RankedProposal> {
    let mut ranked: Vec<RankedProposal> = proposals
        .iter()
        .map(|proposal| {
            let dimensions = predicted_dimensions(&proposal.body);
            RankedProposal {
                rank: 0,
                label: proposal.label.clone(),
                total: score(&dimensions, weights),
                dimensions,
                submission_time: proposal.submission_time,
                fingerprint: proposal.fingerprint.clone(),
            }
        })
        .collect();
    ranked.sort_by(compare_ranked);
    for (idx, entry) in ranked.iter_mut().enumerate() {
        entry.rank = idx + 1;
    }
    ranked
}

fn compare_ranked(a: &RankedProposal, b: &RankedProposal) -> Ordering {
    b.total
        .total_cmp(&a.total)
        .then_with(|| a.submission_time.cmp(&b.submission_time))
        .then_with(|| a.fingerprint.cmp(&b.fingerprint))
        .then_with(|| a.label.cmp(&b.label))
}

fn unit(value: f64) -> f64 {
    if value.is_finite() {
        value.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{CheckResult, Requirement};
    use chrono::TimeZone;

    fn body(summary: &str, alignment: f64) -> ProposalBody {
        ProposalBody {
            approach_summary: summary.to_string(),
            pseudo_code: String::new(),
            files_affected: Vec::new(),
            estimated_complexity: 0.5,
            risk_assessment: 0.5,
            spec_alignment_claim: alignment,
            self_scores: [
                (TECHNICAL_QUALITY.to_string(), 0.5),
                (INNOVATION.to_string(), 0.5),
            ]
            .into_iter()
            .collect(),
        }
    }

    fn at(secs: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, secs).unwrap()
    }

    fn proposal(id: &str, summary: &str, alignment: f64, secs: u32) -> Proposal {
        Proposal {
            competitor_id: id.to_string(),
            submission_time: at(secs),
            body: body(summary, alignment),
        }
    }

    #[test]
    fn default_weights_validate() {
        assert!(validate_scoring_weights(&default_scoring_weights()).is_empty());
    }

    #[test]
    fn weights_not_summing_to_one_are_reported() {
        let mut weights = default_scoring_weights();
        weights.insert("specialist".to_string(), 0.1);
        let errors = validate_scoring_weights(&weights);
        assert!(errors.iter().any(|err| err.contains("sum to 1.0")));
    }

    #[test]
    fn six_dimension_config_scores() {
        let weights: ScoringWeights = [
            (SPEC_ALIGNMENT, 0.3),
            (TECHNICAL_QUALITY, 0.2),
            (INNOVATION, 0.1),
            (RISK, 0.2),
            (EFFICIENCY, 0.1),
            ("specialist", 0.1),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();
        assert!(validate_scoring_weights(&weights).is_empty());
        let dims: Dimensions = weights.keys().map(|k| (k.clone(), 1.0)).collect();
        assert!((score(&dims, &weights) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn score_is_weighted_sum_with_clamping() {
        let weights: ScoringWeights = [("a".to_string(), 0.5), ("b".to_string(), 0.5)]
            .into_iter()
            .collect();
        let dims: Dimensions = [("a".to_string(), 1.4), ("b".to_string(), 0.2)]
            .into_iter()
            .collect();
        assert!((score(&dims, &weights) - 0.6).abs() < 1e-12);
    }

    #[test]
    fn predicted_dimensions_derive_from_estimates() {
        let mut b = body("x", 0.8);
        b.risk_assessment = 0.3;
        b.estimated_complexity = 0.4;
        let dims = predicted_dimensions(&b);
        assert!((dims[SPEC_ALIGNMENT] - 0.8).abs() < 1e-12);
        assert!((dims[RISK] - 0.7).abs() < 1e-12);
        assert!((dims[EFFICIENCY] - 0.6).abs() < 1e-12);
    }

    #[test]
    fn ties_break_by_earliest_submission_regardless_of_input_order() {
        let weights = default_scoring_weights();
        let forward = vec![
            proposal("bidder_1", "late idea", 0.9, 30),
            proposal("bidder_2", "early idea", 0.9, 10),
        ];
        let mut reversed = forward.clone();
        reversed.reverse();

        for input in [forward, reversed] {
            let (anonymous, authors) = anonymize(input);
            let ranked = rank_proposals(&anonymous, &weights);
            assert_eq!(ranked[0].total, ranked[1].total);
            assert_eq!(authors[&ranked[0].label], "bidder_2");
            assert_eq!(ranked[0].rank, 1);
        }
    }

    #[test]
    fn higher_total_outranks_earlier_submission() {
        let weights = default_scoring_weights();
        let (anonymous, authors) = anonymize(vec![
            proposal("bidder_1", "weak", 0.2, 1),
            proposal("bidder_2", "strong", 0.95, 50),
        ]);
        let ranked = rank_proposals(&anonymous, &weights);
        assert_eq!(authors[&ranked[0].label], "bidder_2");
    }

    #[test]
    fn anonymized_proposals_carry_no_identity() {
        let (anonymous, authors) = anonymize(vec![
            proposal("bidder_3", "a", 0.5, 5),
            proposal("bidder_1", "b", 0.5, 1),
        ]);
        let json = serde_json::to_string(&anonymous).expect("serialize");
        assert!(!json.contains("bidder_"));
        assert_eq!(authors["proposal-1"], "bidder_1");
        assert_eq!(authors["proposal-2"], "bidder_3");
    }

    #[test]
    fn actual_dimensions_use_coverage_and_checks() {
        let predicted = predicted_dimensions(&body("x", 0.9));
        let requirements = RequirementSet {
            explicit: vec![
                Requirement {
                    id: "req-1".to_string(),
                    text: "one".to_string(),
                    satisfied: false,
                },
                Requirement {
                    id: "req-2".to_string(),
                    text: "two".to_string(),
                    satisfied: false,
                },
            ],
            implicit: Vec::new(),
            degraded: false,
        };
        let report = ImplementationReport {
            verification_results: vec![
                CheckResult {
                    name: "lint".to_string(),
                    passed: true,
                    output: String::new(),
                },
                CheckResult {
                    name: "tests".to_string(),
                    passed: true,
                    output: String::new(),
                },
            ],
            requirements_satisfied: Some(vec!["req-1".to_string()]),
            measured: [(INNOVATION.to_string(), 0.2)].into_iter().collect(),
            ..ImplementationReport::default()
        };
        let actual = actual_dimensions(&predicted, &report, &requirements);
        assert!((actual[SPEC_ALIGNMENT] - 0.5).abs() < 1e-12);
        assert!((actual[TECHNICAL_QUALITY] - 1.0).abs() < 1e-12);
        assert!((actual[INNOVATION] - 0.2).abs() < 1e-12);
        assert_eq!(actual[RISK], predicted[RISK]);
        assert_eq!(
            actual.keys().collect::<Vec<_>>(),
            predicted.keys().collect::<Vec<_>>()
        );
    }
}
