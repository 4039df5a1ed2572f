//! Implementer boundary: apply a selected proposal, then verify it.
//!
//! The engine never inspects how an implementation is produced. It only
//! consumes the [`ImplementationReport`]: changed files plus the results of
//! the configured verification checks.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use minijinja::{Environment, context};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::core::types::{
    CheckResult, Dimensions, ImplementationReport, ProposalBody, RequirementSet,
};
use crate::io::competitor::last_json_object;
use crate::io::config::CheckConfig;
use crate::io::process::{command_from_argv, run_command_with_timeout};

const IMPLEMENTER_TEMPLATE: &str = include_str!("prompts/implementer.md");

/// Bytes of check output kept in reports and failure context.
const CHECK_OUTPUT_TAIL_BYTES: usize = 4_000;

#[derive(Debug, Clone, Serialize)]
pub struct ImplementationRequest {
    pub issue: String,
    pub round_identifier: String,
    pub round: u32,
    pub proposal: ProposalBody,
    pub requirements: RequirementSet,
}

/// Abstraction over implementation backends.
pub trait Implementer: Send + Sync {
    /// Apply the proposal and run verification. `Err` is an implementation
    /// failure (the round fails); failed checks are reported in the result.
    fn implement(&self, request: &ImplementationRequest) -> Result<ImplementationReport>;
}

/// Summary the implementer command may print as its last JSON object.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ImplementerSummary {
    files_changed: Vec<String>,
    lines_changed: u32,
    coverage_delta: f64,
    requirements_satisfied: Option<Vec<String>>,
    measured: Dimensions,
}

pub struct CommandImplementer {
    command: Vec<String>,
    checks: Vec<CheckConfig>,
    workdir: PathBuf,
    implementation_timeout: Duration,
    verification_timeout: Duration,
    output_limit_bytes: usize,
}

impl CommandImplementer {
    pub fn new(
        command: Vec<String>,
        checks: Vec<CheckConfig>,
        workdir: impl Into<PathBuf>,
        implementation_timeout: Duration,
        verification_timeout: Duration,
        output_limit_bytes: usize,
    ) -> Self {
        Self {
            command,
            checks,
            workdir: workdir.into(),
            implementation_timeout,
            verification_timeout,
            output_limit_bytes,
        }
    }
}

impl Implementer for CommandImplementer {
    #[instrument(skip_all, fields(round = %request.round_identifier))]
    fn implement(&self, request: &ImplementationRequest) -> Result<ImplementationReport> {
        let check_names: Vec<&str> = self.checks.iter().map(|c| c.name.as_str()).collect();
        let prompt = render_implementer_prompt(request, &check_names)?;
        let mut cmd = command_from_argv(&self.command)?;
        cmd.current_dir(&self.workdir);
        let output = run_command_with_timeout(
            cmd,
            Some(prompt.as_bytes()),
            self.implementation_timeout,
            self.output_limit_bytes,
        )
        .context("run implementer command")?;
        if output.timed_out {
            bail!(
                "implementer timed out after {}s",
                self.implementation_timeout.as_secs()
            );
        }
        if !output.status.success() {
            bail!("implementer failed with status {:?}", output.status.code());
        }

        let summary = match last_json_object(&output.stdout_text()) {
            Some(value) => serde_json::from_value(value).unwrap_or_else(|err| {
                warn!(err = %err, "implementer summary malformed; using defaults");
                ImplementerSummary::default()
            }),
            None => ImplementerSummary::default(),
        };

        let verification_results = run_checks(
            &self.checks,
            &self.workdir,
            self.verification_timeout,
            self.output_limit_bytes,
        );
        Ok(ImplementationReport {
            files_changed: summary.files_changed,
            lines_changed: summary.lines_changed,
            coverage_delta: summary.coverage_delta,
            verification_results,
            measured: summary.measured,
            requirements_satisfied: summary.requirements_satisfied,
        })
    }
}

fn render_implementer_prompt(request: &ImplementationRequest, checks: &[&str]) -> Result<String> {
    let mut env = Environment::new();
    env.add_template("implementer", IMPLEMENTER_TEMPLATE)
        .context("compile implementer prompt template")?;
    let open: Vec<_> = request.requirements.open_explicit().collect();
    let rendered = env.get_template("implementer")?.render(context! {
        issue => &request.issue,
        round => request.round,
        proposal => &request.proposal,
        requirements => open,
        checks => checks,
    })?;
    Ok(rendered)
}

/// Run every check in order. A check that cannot be spawned or times out
/// counts as failed.
#[instrument(skip_all, fields(checks = checks.len()))]
pub fn run_checks(
    checks: &[CheckConfig],
    workdir: &Path,
    timeout: Duration,
    output_limit_bytes: usize,
) -> Vec<CheckResult> {
    checks
        .iter()
        .map(|check| {
            let outcome = command_from_argv(&check.command).and_then(|mut cmd| {
                cmd.current_dir(workdir);
                run_command_with_timeout(cmd, None, timeout, output_limit_bytes)
            });
            let result = match outcome {
                Ok(output) => CheckResult {
                    name: check.name.clone(),
                    passed: output.succeeded(),
                    output: tail(&output.log_text(&check.name), CHECK_OUTPUT_TAIL_BYTES),
                },
                Err(err) => CheckResult {
                    name: check.name.clone(),
                    passed: false,
                    output: format!("{err:#}"),
                },
            };
            info!(check = %result.name, passed = result.passed, "verification check finished");
            result
        })
        .collect()
}

/// Last `limit` bytes of `text`, cut on a char boundary.
fn tail(text: &str, limit: usize) -> String {
    if text.len() <= limit {
        return text.to_string();
    }
    let mut start = text.len() - limit;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    format!("[...]\n{}", &text[start..])
}
