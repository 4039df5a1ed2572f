//! Durable needs-attention report written when a loop escalates.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use anyhow::Result;
use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::core::outcome::AttentionReason;
use crate::core::types::FailureContext;
use crate::io::config::write_atomic;
use crate::io::spec_doc::SpecTracker;

/// Everything a human needs to pick up an escalated issue.
#[derive(Debug, Clone)]
pub struct AttentionReport {
    pub issue: String,
    pub run_id: String,
    pub reason: AttentionReason,
    pub branch: Option<String>,
    pub created_at: DateTime<Utc>,
    pub rounds_run: u32,
    pub open_requirements: Vec<String>,
    /// Failed attempts in order (initial, then replans).
    pub failures: Vec<FailureContext>,
    /// Competitor id mapped to why it was absent in the last round.
    pub absent: Vec<(String, String)>,
    pub rounds_dir: PathBuf,
}

impl AttentionReport {
    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "# Needs attention: issue {}", self.issue);
        let _ = writeln!(out);
        let _ = writeln!(out, "- Reason: {}", self.reason.as_str());
        let _ = writeln!(out, "- Run: {}", self.run_id);
        let _ = writeln!(out, "- Rounds run: {}", self.rounds_run);
        let _ = writeln!(
            out,
            "- Branch: {}",
            self.branch.as_deref().unwrap_or("(current working tree)")
        );
        let _ = writeln!(out, "- Escalated at: {}", self.created_at.to_rfc3339());
        let _ = writeln!(out, "- Round artifacts: {}", self.rounds_dir.display());

        if !self.open_requirements.is_empty() {
            let _ = writeln!(out, "\n## Open requirements\n");
            for requirement in &self.open_requirements {
                let _ = writeln!(out, "- [ ] {requirement}");
            }
        }

        for (idx, failure) in self.failures.iter().enumerate() {
            let label = if idx == 0 {
                "Initial attempt".to_string()
            } else {
                format!("Replan attempt {idx}")
            };
            let _ = writeln!(out, "\n## {label} ({})\n", failure.round_identifier);
            let _ = writeln!(out, "Approach: {}", failure.failed_approach);
            if let Some(reason) = &failure.reason {
                let _ = writeln!(out, "\nImplementer error: {reason}");
            }
            for check in &failure.failing_checks {
                let _ = writeln!(out, "\n### Failing check: {}\n", check.name);
                let _ = writeln!(out, "```\n{}\n```", check.output.trim_end());
            }
        }

        if !self.absent.is_empty() {
            let _ = writeln!(out, "\n## Absent competitors\n");
            for (id, reason) in &self.absent {
                let _ = writeln!(out, "- {id}: {reason}");
            }
        }

        let _ = writeln!(out, "\n## Remediation\n");
        for step in self.remediation() {
            let _ = writeln!(out, "1. {step}");
        }
        out
    }

    fn remediation(&self) -> Vec<&'static str> {
        let mut steps = match self.reason {
            AttentionReason::ReplanLimitReached => vec![
                "Check out the branch above; partial work is kept in place.",
                "Fix the failing checks listed above, or narrow the open requirements.",
            ],
            AttentionReason::AllCompetitorsAbsent => vec![
                "Verify the competitor command in .marketplace/config.toml runs by hand.",
                "Raise timeouts.proposal_secs if competitors are timing out.",
            ],
            AttentionReason::BudgetExhausted => vec![
                "Review the per-round artifacts to see where iterations went.",
                "Split the issue or raise base_budget_per_bot before retrying.",
            ],
        };
        steps.push("Re-run `marketplace loop <issue>` once the blocker is resolved.");
        steps
    }
}

/// Write the report and annotate the specification document.
///
/// The report file is the primary signal; a failed annotation is logged and
/// does not fail escalation.
pub fn escalate(
    path: &Path,
    report: &AttentionReport,
    tracker: &dyn SpecTracker,
) -> Result<()> {
    write_atomic(path, &report.render())?;
    info!(path = %path.display(), reason = report.reason.as_str(), "needs-attention report written");
    let note = format!(
        "**marketplace: needs attention** ({}). Run {} stopped after {} round(s). See {}.",
        report.reason.as_str(),
        report.run_id,
        report.rounds_run,
        path.display()
    );
    if let Err(err) = tracker.annotate(&note) {
        warn!(err = %format!("{err:#}"), "failed to annotate specification document");
    }
    Ok(())
}
