//! Competitor actors: the `propose` boundary.
//!
//! The [`Competitor`] trait decouples the round orchestrator from how a
//! proposal is produced. [`CommandCompetitor`] spawns a configured command
//! with a rendered prompt on stdin; tests use scripted competitors.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, mpsc};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow, bail};
use chrono::{DateTime, Utc};
use jsonschema::Draft;
use minijinja::{Environment, context};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::core::types::{FailureContext, ProposalBody, RequirementSet, ScoringWeights};
use crate::io::process::{STOP_POLL_INTERVAL, command_from_argv, run_command_with_timeout};

const COMPETITOR_TEMPLATE: &str = include_str!("prompts/competitor.md");
const PROPOSAL_SCHEMA: &str = include_str!(concat!(
    env!("CARGO_MANIFEST_DIR"),
    "/schemas/proposal.v1.schema.json"
));

/// Everything a competitor sees when asked for a proposal.
#[derive(Debug, Clone, Serialize)]
pub struct ProposalRequest {
    pub issue: String,
    pub round_identifier: String,
    pub round: u32,
    pub competitor_id: String,
    pub requirements: RequirementSet,
    pub scoring_weights: ScoringWeights,
    pub allocated_iterations: u32,
    pub remaining_iterations: u32,
    /// Present on replan rounds.
    pub failure_context: Option<FailureContext>,
    /// This competitor's own proposal from the previous round, if any.
    pub previous_proposal: Option<ProposalBody>,
}

/// A competitor's contribution to one round.
#[derive(Debug, Clone, PartialEq)]
pub enum ProposalResponse {
    Submitted {
        body: ProposalBody,
        submission_time: DateTime<Utc>,
    },
    /// Timed out, failed, or returned a malformed proposal.
    Absent { reason: String },
}

/// Abstraction over proposal backends.
pub trait Competitor: Send + Sync {
    fn id(&self) -> &str;

    /// Produce a proposal. Errors mark the competitor absent for the round.
    fn propose(&self, request: &ProposalRequest) -> Result<ProposalBody>;
}

/// Invite every competitor in parallel and wait until all respond or the
/// deadline passes. Late responders are recorded as absent.
///
/// `requests` maps competitor id to its request; competitors without one are
/// not invited. Results are keyed by competitor id. Collection ends early
/// when `should_stop` turns true.
#[instrument(skip_all, fields(competitors = competitors.len(), timeout_secs = timeout.as_secs()))]
pub fn collect_proposals(
    competitors: &[Arc<dyn Competitor>],
    requests: &BTreeMap<String, ProposalRequest>,
    timeout: Duration,
    should_stop: &dyn Fn() -> bool,
) -> BTreeMap<String, ProposalResponse> {
    let deadline = Instant::now() + timeout;
    let (tx, rx) = mpsc::channel::<(String, Result<ProposalBody>, DateTime<Utc>)>();
    let mut pending: BTreeSet<String> = BTreeSet::new();

    for competitor in competitors {
        let Some(request) = requests.get(competitor.id()) else {
            continue;
        };
        let id = competitor.id().to_string();
        pending.insert(id.clone());
        let competitor = Arc::clone(competitor);
        let request = request.clone();
        let tx = tx.clone();
        thread::spawn(move || {
            let result = competitor.propose(&request);
            let _ = tx.send((id, result, Utc::now()));
        });
    }
    drop(tx);

    let mut responses = BTreeMap::new();
    let mut stopped = false;
    while !pending.is_empty() {
        if should_stop() {
            stopped = true;
            break;
        }
        let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
            break;
        };
        match rx.recv_timeout(remaining.min(STOP_POLL_INTERVAL)) {
            Ok((id, result, submission_time)) => {
                pending.remove(&id);
                let response = match result.and_then(validate_body) {
                    Ok(body) => {
                        debug!(competitor = %id, "proposal received");
                        ProposalResponse::Submitted {
                            body,
                            submission_time,
                        }
                    }
                    Err(err) => {
                        warn!(competitor = %id, err = %format!("{err:#}"), "competitor absent");
                        ProposalResponse::Absent {
                            reason: format!("{err:#}"),
                        }
                    }
                };
                responses.insert(id, response);
            }
            Err(mpsc::RecvTimeoutError::Timeout) => {}
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }

    for id in pending {
        let reason = if stopped {
            "collection cancelled".to_string()
        } else {
            format!("no response within {}s", timeout.as_secs())
        };
        warn!(competitor = %id, reason = %reason, "no proposal collected");
        responses.insert(id, ProposalResponse::Absent { reason });
    }
    info!(
        submitted = responses
            .values()
            .filter(|r| matches!(r, ProposalResponse::Submitted { .. }))
            .count(),
        "proposal collection finished"
    );
    responses
}

/// Structural checks on a deserialized proposal.
fn validate_body(body: ProposalBody) -> Result<ProposalBody> {
    if body.approach_summary.trim().is_empty() {
        bail!("proposal approach_summary is empty");
    }
    for (name, value) in [
        ("estimated_complexity", body.estimated_complexity),
        ("risk_assessment", body.risk_assessment),
        ("spec_alignment_claim", body.spec_alignment_claim),
    ] {
        if !value.is_finite() || !(0.0..=1.0).contains(&value) {
            bail!("proposal {name} must be in [0, 1] (got {value})");
        }
    }
    if let Some((name, value)) = body
        .self_scores
        .iter()
        .find(|(_, value)| !value.is_finite() || !(0.0..=1.0).contains(*value))
    {
        bail!("proposal self_scores.{name} must be in [0, 1] (got {value})");
    }
    Ok(body)
}

/// Competitor that spawns a command and parses the proposal from its stdout.
pub struct CommandCompetitor {
    id: String,
    command: Vec<String>,
    workdir: PathBuf,
    template: String,
    timeout: Duration,
    output_limit_bytes: usize,
}

impl CommandCompetitor {
    pub fn new(
        id: impl Into<String>,
        command: Vec<String>,
        workdir: impl Into<PathBuf>,
        timeout: Duration,
        output_limit_bytes: usize,
    ) -> Self {
        Self {
            id: id.into(),
            command,
            workdir: workdir.into(),
            template: COMPETITOR_TEMPLATE.to_string(),
            timeout,
            output_limit_bytes,
        }
    }

    /// Replace the embedded prompt with a template file.
    pub fn with_template_file(mut self, path: &Path) -> Result<Self> {
        self.template = fs::read_to_string(path)
            .with_context(|| format!("read prompt template {}", path.display()))?;
        Ok(self)
    }

    pub fn render_prompt(&self, request: &ProposalRequest) -> Result<String> {
        render_competitor_prompt(&self.template, request)
    }
}

impl Competitor for CommandCompetitor {
    fn id(&self) -> &str {
        &self.id
    }

    #[instrument(skip_all, fields(competitor = %self.id, round = %request.round_identifier))]
    fn propose(&self, request: &ProposalRequest) -> Result<ProposalBody> {
        let prompt = self.render_prompt(request)?;
        let mut cmd = command_from_argv(&self.command)?;
        cmd.current_dir(&self.workdir)
            .env("MARKETPLACE_COMPETITOR_ID", &self.id)
            .env("MARKETPLACE_ROUND", &request.round_identifier);

        let output = run_command_with_timeout(
            cmd,
            Some(prompt.as_bytes()),
            self.timeout,
            self.output_limit_bytes,
        )
        .context("run competitor command")?;
        if output.timed_out {
            bail!("competitor command timed out after {}s", self.timeout.as_secs());
        }
        if !output.status.success() {
            bail!(
                "competitor command failed with status {:?}",
                output.status.code()
            );
        }
        parse_proposal(&output.stdout_text())
    }
}

/// Render the competitor prompt for `request`.
pub fn render_competitor_prompt(template: &str, request: &ProposalRequest) -> Result<String> {
    let mut env = Environment::new();
    env.add_template("competitor", template)
        .context("compile competitor prompt template")?;
    let open: Vec<_> = request.requirements.open_explicit().collect();
    let rendered = env.get_template("competitor")?.render(context! {
        competitor_id => &request.competitor_id,
        issue => &request.issue,
        round => request.round,
        replan => request.failure_context.is_some(),
        scoring_weights => &request.scoring_weights,
        allocated_iterations => request.allocated_iterations,
        remaining_iterations => request.remaining_iterations,
        requirements => open,
        implicit => &request.requirements.implicit,
        failure => &request.failure_context,
        previous => &request.previous_proposal,
    })?;
    Ok(rendered)
}

/// Parse the last JSON object in `stdout` as a schema-valid proposal.
pub fn parse_proposal(stdout: &str) -> Result<ProposalBody> {
    let value = last_json_object(stdout)
        .ok_or_else(|| anyhow!("no JSON object in competitor output"))?;
    validate_against_schema(&value)?;
    serde_json::from_value(value).context("decode proposal")
}

/// Last top-level JSON object embedded in free-form text (e.g. a fenced block).
pub fn last_json_object(text: &str) -> Option<Value> {
    let mut found = None;
    let mut offset = 0;
    while let Some(start) = text[offset..].find('{').map(|idx| offset + idx) {
        let mut stream = serde_json::Deserializer::from_str(&text[start..]).into_iter::<Value>();
        match stream.next() {
            Some(Ok(value @ Value::Object(_))) => {
                offset = start + stream.byte_offset();
                found = Some(value);
            }
            _ => offset = start + 1,
        }
    }
    found
}

fn validate_against_schema(instance: &Value) -> Result<()> {
    let schema: Value = serde_json::from_str(PROPOSAL_SCHEMA).context("parse proposal schema")?;
    let compiled = jsonschema::options()
        .with_draft(Draft::Draft202012)
        .build(&schema)
        .context("compile proposal schema")?;
    let messages: Vec<String> = compiled
        .iter_errors(instance)
        .map(|err| err.to_string())
        .collect();
    if !messages.is_empty() {
        bail!("proposal schema validation failed:\n- {}", messages.join("\n- "));
    }
    Ok(())
}
