//! Outcome classification and round transitions.
//!
//! Pure decision functions: the orchestrator supplies what happened and
//! receives the outcome kind to record and the next round-level step.

use serde::Serialize;

use crate::core::types::OutcomeKind;

/// Round attempt position within a loop for a single issue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RoundKind {
    #[default]
    Initial,
    /// Replan after a failed round.
    Replan,
}

/// Classify the selected competitor's implementation result.
///
/// A previously failed competitor that resubmitted unchanged is penalized
/// whatever the implementation result.
pub fn classify_selected(
    round: RoundKind,
    selected_failed_previously: bool,
    resubmitted_same: bool,
    succeeded: bool,
) -> OutcomeKind {
    if round == RoundKind::Replan && selected_failed_previously && resubmitted_same {
        return OutcomeKind::ReplanResubmittedSame;
    }
    match (round, selected_failed_previously, succeeded) {
        (RoundKind::Initial, _, true) => OutcomeKind::RankedFirstSuccess,
        (RoundKind::Initial, _, false) => OutcomeKind::RankedFirstFailure,
        (RoundKind::Replan, true, true) => OutcomeKind::ReplanNewSuccess,
        (RoundKind::Replan, true, false) => OutcomeKind::ReplanFailedAgain,
        (RoundKind::Replan, false, true) => OutcomeKind::RankedSecondPlusSuccess,
        (RoundKind::Replan, false, false) => OutcomeKind::RankedSecondPlusFailure,
    }
}

/// Outcome for a ranked responder that was not implemented this round.
///
/// Returns `None` when no event should be recorded for it.
pub fn classify_unselected(
    round_succeeded: bool,
    failed_previously: bool,
    resubmitted_same: bool,
) -> Option<OutcomeKind> {
    if failed_previously && resubmitted_same {
        return Some(OutcomeKind::ReplanResubmittedSame);
    }
    round_succeeded.then_some(OutcomeKind::RankedNotTried)
}

/// Why a loop stopped without completing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AttentionReason {
    /// Every invited competitor timed out or returned a malformed proposal.
    AllCompetitorsAbsent,
    /// Replan attempts used up after repeated verification failures.
    ReplanLimitReached,
    /// Requirements remain open but no responder has allocation left.
    BudgetExhausted,
}

impl AttentionReason {
    pub fn as_str(self) -> &'static str {
        match self {
            AttentionReason::AllCompetitorsAbsent => "all_competitors_absent",
            AttentionReason::ReplanLimitReached => "replan_limit_reached",
            AttentionReason::BudgetExhausted => "budget_exhausted",
        }
    }
}

/// Transition taken after a round resolves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextStep {
    /// Next round for the same issue with a fresh requirement diff.
    Continue,
    /// Replan round carrying failure context.
    Replan,
    Complete,
    NeedsAttention(AttentionReason),
}

/// Transition after a succeeded round.
pub fn after_success(all_requirements_satisfied: bool, budget_remaining: bool) -> NextStep {
    if all_requirements_satisfied {
        NextStep::Complete
    } else if budget_remaining {
        NextStep::Continue
    } else {
        NextStep::NeedsAttention(AttentionReason::BudgetExhausted)
    }
}

/// Transition after a failed round. `replans_used` counts replan rounds
/// already run since the last success.
pub fn after_failure(replans_used: u32, max_replans: u32) -> NextStep {
    if replans_used < max_replans {
        NextStep::Replan
    } else {
        NextStep::NeedsAttention(AttentionReason::ReplanLimitReached)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::weights::base_delta;

    #[test]
    fn selected_classification_covers_replan_paths() {
        assert_eq!(
            classify_selected(RoundKind::Initial, false, false, true),
            OutcomeKind::RankedFirstSuccess
        );
        assert_eq!(
            classify_selected(RoundKind::Initial, false, false, false),
            OutcomeKind::RankedFirstFailure
        );
        assert_eq!(
            classify_selected(RoundKind::Replan, true, false, false),
            OutcomeKind::ReplanFailedAgain
        );
        let second_ok = classify_selected(RoundKind::Replan, false, false, true);
        let second_bad = classify_selected(RoundKind::Replan, false, false, false);
        assert_eq!(second_ok, OutcomeKind::RankedSecondPlusSuccess);
        assert_eq!(second_bad, OutcomeKind::RankedSecondPlusFailure);
        assert!(base_delta(second_ok) > 0.0 && base_delta(second_bad) < 0.0);
        assert_ne!(base_delta(second_ok).abs(), base_delta(second_bad).abs());
    }

    #[test]
    fn unchanged_resubmission_is_penalized_even_when_it_passes() {
        for succeeded in [true, false] {
            assert_eq!(
                classify_selected(RoundKind::Replan, true, true, succeeded),
                OutcomeKind::ReplanResubmittedSame
            );
        }
        assert_eq!(
            classify_selected(RoundKind::Replan, true, false, true),
            OutcomeKind::ReplanNewSuccess
        );
        assert_eq!(
            classify_selected(RoundKind::Initial, true, true, true),
            OutcomeKind::RankedFirstSuccess
        );
    }

    #[test]
    fn unselected_penalties() {
        assert_eq!(
            classify_unselected(true, false, false),
            Some(OutcomeKind::RankedNotTried)
        );
        assert_eq!(classify_unselected(false, false, false), None);
        assert_eq!(
            classify_unselected(false, true, true),
            Some(OutcomeKind::ReplanResubmittedSame)
        );
        assert_eq!(
            classify_unselected(true, true, false),
            Some(OutcomeKind::RankedNotTried)
        );
    }

    #[test]
    fn transitions() {
        assert_eq!(after_success(true, false), NextStep::Complete);
        assert_eq!(after_success(false, true), NextStep::Continue);
        assert_eq!(
            after_success(false, false),
            NextStep::NeedsAttention(AttentionReason::BudgetExhausted)
        );
        assert_eq!(after_failure(0, 1), NextStep::Replan);
        assert_eq!(
            after_failure(1, 1),
            NextStep::NeedsAttention(AttentionReason::ReplanLimitReached)
        );
        assert_eq!(
            after_failure(0, 0),
            NextStep::NeedsAttention(AttentionReason::ReplanLimitReached)
        );
    }
}
