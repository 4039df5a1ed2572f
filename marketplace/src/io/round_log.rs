//! Per-round audit artifacts under `.marketplace/rounds/<issue>/<run>/<round>/`.
//!
//! Written once per round in a fixed file order so a human can audit a round
//! without replaying the event log. Never read back by the engine.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;

use crate::core::scoring::RankedProposal;
use crate::core::types::{AnonymousProposal, Event, ImplementationReport, RequirementSet};

#[derive(Debug, Clone)]
pub struct RoundLogPaths {
    pub dir: PathBuf,
    pub summary_path: PathBuf,
    pub requirements_path: PathBuf,
    pub allocation_path: PathBuf,
    pub proposals_path: PathBuf,
    pub ranking_path: PathBuf,
    pub implementation_path: PathBuf,
    pub events_path: PathBuf,
}

impl RoundLogPaths {
    pub fn new(dir: PathBuf) -> Self {
        Self {
            summary_path: dir.join("summary.json"),
            requirements_path: dir.join("requirements.json"),
            allocation_path: dir.join("allocation.json"),
            proposals_path: dir.join("proposals.json"),
            ranking_path: dir.join("ranking.json"),
            implementation_path: dir.join("implementation.json"),
            events_path: dir.join("events.json"),
            dir,
        }
    }
}

/// Round-level summary.
#[derive(Debug, Clone, Serialize)]
pub struct RoundSummaryRecord<'a> {
    pub round_identifier: &'a str,
    pub kind: &'a str,
    pub status: &'a str,
    pub selected: Option<&'a str>,
    pub absent: &'a BTreeMap<String, String>,
    pub excluded_budget: &'a [String],
}

/// Ranked entry after identities are re-associated.
#[derive(Debug, Clone, Serialize)]
pub struct RevealedRank<'a> {
    pub competitor_id: &'a str,
    #[serde(flatten)]
    pub ranked: &'a RankedProposal,
}

/// Implementer result as recorded.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum ImplementationRecord<'a> {
    Completed {
        report: &'a ImplementationReport,
        actual_score: f64,
        accuracy: f64,
    },
    Failed {
        reason: &'a str,
    },
}

pub struct RoundLogRequest<'a> {
    pub summary: RoundSummaryRecord<'a>,
    pub requirements: &'a RequirementSet,
    /// Allocation over the round's responders only.
    pub allocation: &'a BTreeMap<String, u32>,
    pub proposals: &'a [AnonymousProposal],
    pub ranking: &'a [RevealedRank<'a>],
    pub implementation: Option<ImplementationRecord<'a>>,
    pub events: &'a [Event],
}

pub fn write_round_log(dir: PathBuf, request: &RoundLogRequest<'_>) -> Result<RoundLogPaths> {
    let paths = RoundLogPaths::new(dir);
    fs::create_dir_all(&paths.dir)
        .with_context(|| format!("create round dir {}", paths.dir.display()))?;

    write_json(&paths.summary_path, &request.summary)?;
    write_json(&paths.requirements_path, request.requirements)?;
    write_json(&paths.allocation_path, request.allocation)?;
    write_json(&paths.proposals_path, request.proposals)?;
    write_json(&paths.ranking_path, request.ranking)?;
    if let Some(implementation) = &request.implementation {
        write_json(&paths.implementation_path, implementation)?;
    }
    write_json(&paths.events_path, request.events)?;

    Ok(paths)
}

fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let mut buf = serde_json::to_string_pretty(value).context("serialize round artifact")?;
    buf.push('\n');
    fs::write(path, buf).with_context(|| format!("write {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_expected_files() {
        let temp = tempfile::tempdir().expect("tempdir");
        let absent = BTreeMap::from([("bidder_3".to_string(), "timed out".to_string())]);
        let allocation = BTreeMap::from([("bidder_1".to_string(), 30)]);
        let request = RoundLogRequest {
            summary: RoundSummaryRecord {
                round_identifier: "9/run/1",
                kind: "initial",
                status: "all_absent",
                selected: None,
                absent: &absent,
                excluded_budget: &[],
            },
            requirements: &RequirementSet::default(),
            allocation: &allocation,
            proposals: &[],
            ranking: &[],
            implementation: None,
            events: &[],
        };
        let paths = write_round_log(temp.path().join("r1"), &request).expect("write");
        assert!(paths.summary_path.exists());
        assert!(paths.events_path.exists());
        assert!(!paths.implementation_path.exists());
        let summary = fs::read_to_string(paths.summary_path).expect("read");
        assert!(summary.contains("\"bidder_3\": \"timed out\""));
    }
}
