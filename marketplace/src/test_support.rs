//! Test-only helpers: event builders, scripted actors, in-memory documents.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Result, anyhow};
use chrono::{DateTime, TimeZone, Utc};

use crate::core::requirements::check_off;
use crate::core::types::{
    CheckResult, Event, EventMetrics, ImplementationReport, OutcomeKind, ProposalBody,
};
use crate::core::weights::weight_delta;
use crate::io::competitor::{Competitor, ProposalRequest};
use crate::io::implementer::{ImplementationRequest, Implementer};
use crate::io::spec_doc::SpecTracker;

/// Fixed base instant for deterministic timestamps.
pub fn base_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0)
        .single()
        .unwrap_or_default()
}

/// Event `secs` seconds after [`base_time`] with the standard delta for `kind`.
pub fn event_at(secs: i64, competitor_id: &str, kind: OutcomeKind) -> Event {
    let accuracy = if kind.is_success() || kind.is_failure() {
        Some(0.5)
    } else {
        None
    };
    Event {
        timestamp: base_time() + chrono::Duration::seconds(secs),
        round_identifier: format!("42/test/{secs}"),
        competitor_id: competitor_id.to_string(),
        outcome_kind: kind,
        proposal_score: 0.7,
        implementation_score: if kind.is_success() { 0.6 } else { 0.0 },
        accuracy,
        weight_delta: weight_delta(kind, accuracy),
        iteration_count: u32::from(kind.is_success() || kind.is_failure()),
        metrics: EventMetrics::default(),
    }
}

/// Proposal with neutral self-estimates and the given summary.
pub fn proposal(summary: &str) -> ProposalBody {
    ProposalBody {
        approach_summary: summary.to_string(),
        pseudo_code: String::new(),
        files_affected: vec!["src/lib.rs".to_string()],
        estimated_complexity: 0.5,
        risk_assessment: 0.5,
        spec_alignment_claim: 0.5,
        self_scores: Default::default(),
    }
}

/// Proposal with explicit self-estimates.
pub fn proposal_with(
    summary: &str,
    complexity: f64,
    risk: f64,
    alignment: f64,
) -> ProposalBody {
    ProposalBody {
        estimated_complexity: complexity,
        risk_assessment: risk,
        spec_alignment_claim: alignment,
        ..proposal(summary)
    }
}

/// Implementation report whose checks all pass or all fail.
pub fn report(passed: bool) -> ImplementationReport {
    ImplementationReport {
        files_changed: vec!["src/lib.rs".to_string()],
        lines_changed: 40,
        coverage_delta: 0.0,
        verification_results: ["format", "lint", "types", "tests"]
            .into_iter()
            .map(|name| CheckResult {
                name: name.to_string(),
                passed: passed || name != "tests",
                output: if passed || name != "tests" {
                    String::new()
                } else {
                    "test result: FAILED".to_string()
                },
            })
            .collect(),
        measured: Default::default(),
        requirements_satisfied: None,
    }
}

/// How a scripted competitor answers one round.
#[derive(Debug, Clone)]
pub enum ScriptedReply {
    Propose(ProposalBody),
    Decline(String),
    /// Sleep before answering; used to exercise proposal timeouts.
    Slow(Duration, ProposalBody),
}

/// Competitor that replays a fixed script. The last reply repeats once the
/// script runs out.
pub struct ScriptedCompetitor {
    id: String,
    replies: Mutex<VecDeque<ScriptedReply>>,
    last: Mutex<Option<ScriptedReply>>,
    requests: Mutex<Vec<ProposalRequest>>,
}

impl ScriptedCompetitor {
    pub fn new(id: &str, replies: Vec<ScriptedReply>) -> Self {
        Self {
            id: id.to_string(),
            replies: Mutex::new(replies.into()),
            last: Mutex::new(None),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Competitor that always proposes `body`.
    pub fn always(id: &str, body: ProposalBody) -> Self {
        Self::new(id, vec![ScriptedReply::Propose(body)])
    }

    /// Every request received so far.
    pub fn requests(&self) -> Vec<ProposalRequest> {
        self.requests
            .lock()
            .map(|requests| requests.clone())
            .unwrap_or_default()
    }

    fn next_reply(&self) -> Option<ScriptedReply> {
        let mut replies = self.replies.lock().ok()?;
        let mut last = self.last.lock().ok()?;
        if let Some(reply) = replies.pop_front() {
            *last = Some(reply.clone());
            return Some(reply);
        }
        last.clone()
    }
}

impl Competitor for ScriptedCompetitor {
    fn id(&self) -> &str {
        &self.id
    }

    fn propose(&self, request: &ProposalRequest) -> Result<ProposalBody> {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request.clone());
        }
        match self.next_reply() {
            Some(ScriptedReply::Propose(body)) => Ok(body),
            Some(ScriptedReply::Decline(reason)) => Err(anyhow!(reason)),
            Some(ScriptedReply::Slow(delay, body)) => {
                std::thread::sleep(delay);
                Ok(body)
            }
            None => Err(anyhow!("script exhausted")),
        }
    }
}

/// Implementer that replays queued results; errors once the queue is empty.
pub struct ScriptedImplementer {
    results: Mutex<VecDeque<Result<ImplementationReport, String>>>,
    requests: Mutex<Vec<ImplementationRequest>>,
}

impl ScriptedImplementer {
    pub fn new(results: Vec<Result<ImplementationReport, String>>) -> Self {
        Self {
            results: Mutex::new(results.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn requests(&self) -> Vec<ImplementationRequest> {
        self.requests
            .lock()
            .map(|requests| requests.clone())
            .unwrap_or_default()
    }
}

impl Implementer for ScriptedImplementer {
    fn implement(&self, request: &ImplementationRequest) -> Result<ImplementationReport> {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request.clone());
        }
        let next = self
            .results
            .lock()
            .map_err(|_| anyhow!("implementer script poisoned"))?
            .pop_front();
        match next {
            Some(Ok(report)) => Ok(report),
            Some(Err(reason)) => Err(anyhow!(reason)),
            None => Err(anyhow!("implementer script exhausted")),
        }
    }
}

/// Specification document held in memory.
pub struct MemorySpecTracker {
    document: Mutex<String>,
    annotations: Mutex<Vec<String>>,
}

impl MemorySpecTracker {
    pub fn new(document: &str) -> Self {
        Self {
            document: Mutex::new(document.to_string()),
            annotations: Mutex::new(Vec::new()),
        }
    }

    pub fn document(&self) -> String {
        self.document
            .lock()
            .map(|doc| doc.clone())
            .unwrap_or_default()
    }

    pub fn annotations(&self) -> Vec<String> {
        self.annotations
            .lock()
            .map(|notes| notes.clone())
            .unwrap_or_default()
    }
}

impl SpecTracker for MemorySpecTracker {
    fn fetch(&self) -> Result<String> {
        Ok(self.document())
    }

    fn check_off(&self, satisfied_ids: &[String]) -> Result<()> {
        let mut document = self
            .document
            .lock()
            .map_err(|_| anyhow!("document lock poisoned"))?;
        *document = check_off(&document, satisfied_ids);
        Ok(())
    }

    fn annotate(&self, note: &str) -> Result<()> {
        self.annotations
            .lock()
            .map_err(|_| anyhow!("annotation lock poisoned"))?
            .push(note.to_string());
        Ok(())
    }
}
