//! Marketplace configuration stored under `.marketplace/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::core::projector::ProjectionConfig;
use crate::core::requirements::{ImplicitPolicy, default_policies};
use crate::core::scoring::{default_scoring_weights, validate_scoring_weights};
use crate::core::types::ScoringWeights;
use crate::core::weights::WeightConstraints;
use crate::error::MarketError;

/// Marketplace configuration (TOML).
///
/// Loaded once per command and static for the lifetime of a marketplace
/// instance. Missing fields take their defaults.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MarketConfig {
    pub num_bots: u32,
    pub base_budget_per_bot: u32,

    /// Replan rounds allowed after a failed round before escalation.
    pub max_replans: u32,

    /// Truncate child-process stdout/stderr beyond this many bytes.
    pub output_limit_bytes: usize,

    pub scoring_weights: ScoringWeights,
    pub weight_constraints: WeightConstraints,
    pub timeouts: TimeoutConfig,
    pub competitor: CompetitorConfig,
    pub implementer: ImplementerConfig,
    pub checks: Vec<CheckConfig>,
    pub implicit_policies: Vec<ImplicitPolicy>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Per-round deadline for collecting all proposals.
    pub proposal_secs: u64,
    pub implementation_secs: u64,
    /// Per-check wall-clock limit.
    pub verification_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            proposal_secs: 10 * 60,
            implementation_secs: 30 * 60,
            verification_secs: 30 * 60,
        }
    }
}

impl TimeoutConfig {
    pub fn proposal(&self) -> Duration {
        Duration::from_secs(self.proposal_secs)
    }

    pub fn implementation(&self) -> Duration {
        Duration::from_secs(self.implementation_secs)
    }

    pub fn verification(&self) -> Duration {
        Duration::from_secs(self.verification_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CompetitorConfig {
    /// Command spawned per competitor; the rendered prompt is fed on stdin.
    pub command: Vec<String>,
    /// Optional minijinja template overriding the embedded prompt.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt_template: Option<PathBuf>,
}

impl Default for CompetitorConfig {
    fn default() -> Self {
        Self {
            command: vec!["claude".to_string(), "-p".to_string()],
            prompt_template: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ImplementerConfig {
    pub command: Vec<String>,
}

impl Default for ImplementerConfig {
    fn default() -> Self {
        Self {
            command: vec!["claude".to_string(), "-p".to_string()],
        }
    }
}

/// One verification check run after implementation (e.g. `["just","test"]`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CheckConfig {
    pub name: String,
    pub command: Vec<String>,
}

impl CheckConfig {
    fn just(name: &str, recipe: &str) -> Self {
        Self {
            name: name.to_string(),
            command: vec!["just".to_string(), recipe.to_string()],
        }
    }
}

fn default_checks() -> Vec<CheckConfig> {
    vec![
        CheckConfig::just("format", "fmt-check"),
        CheckConfig::just("lint", "lint"),
        CheckConfig::just("types", "typecheck"),
        CheckConfig::just("tests", "test"),
    ]
}

impl Default for MarketConfig {
    fn default() -> Self {
        Self {
            num_bots: 3,
            base_budget_per_bot: 10,
            max_replans: 1,
            output_limit_bytes: 100_000,
            scoring_weights: default_scoring_weights(),
            weight_constraints: WeightConstraints::default(),
            timeouts: TimeoutConfig::default(),
            competitor: CompetitorConfig::default(),
            implementer: ImplementerConfig::default(),
            checks: default_checks(),
            implicit_policies: default_policies(),
        }
    }
}

impl MarketConfig {
    pub fn validate(&self) -> Result<(), MarketError> {
        let mut errors = Vec::new();
        if self.num_bots == 0 {
            errors.push("num_bots must be >= 1".to_string());
        }
        if self.base_budget_per_bot == 0 {
            errors.push("base_budget_per_bot must be >= 1".to_string());
        }
        if self.output_limit_bytes == 0 {
            errors.push("output_limit_bytes must be > 0".to_string());
        }
        errors.extend(validate_scoring_weights(&self.scoring_weights));

        let WeightConstraints {
            min_weight,
            max_weight,
        } = self.weight_constraints;
        if !(0.0..=1.0).contains(&min_weight)
            || !(0.0..=1.0).contains(&max_weight)
            || min_weight > max_weight
        {
            errors.push(format!(
                "weight_constraints must satisfy 0 <= min <= max <= 1 (got {min_weight}, {max_weight})"
            ));
        } else if self.num_bots > 0
            && let Err(err) = self
                .weight_constraints
                .check_feasible(self.num_bots as usize)
        {
            errors.push(err.to_string());
        }

        for (name, secs) in [
            ("timeouts.proposal_secs", self.timeouts.proposal_secs),
            (
                "timeouts.implementation_secs",
                self.timeouts.implementation_secs,
            ),
            ("timeouts.verification_secs", self.timeouts.verification_secs),
        ] {
            if secs == 0 {
                errors.push(format!("{name} must be > 0"));
            }
        }

        if !command_is_set(&self.competitor.command) {
            errors.push("competitor.command must be a non-empty array".to_string());
        }
        if !command_is_set(&self.implementer.command) {
            errors.push("implementer.command must be a non-empty array".to_string());
        }
        for check in &self.checks {
            if check.name.trim().is_empty() || !command_is_set(&check.command) {
                errors.push(format!(
                    "checks entry '{}' needs a name and a non-empty command",
                    check.name
                ));
            }
        }
        for policy in &self.implicit_policies {
            if policy.name.trim().is_empty() || policy.requirement.trim().is_empty() {
                errors.push("implicit_policies entries need a name and requirement".to_string());
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(MarketError::InvalidConfig(errors.join("; ")))
        }
    }

    pub fn projection(&self) -> ProjectionConfig {
        ProjectionConfig {
            num_bots: self.num_bots,
            base_budget_per_bot: self.base_budget_per_bot,
            weight_constraints: self.weight_constraints,
        }
    }

    pub fn total_budget_pool(&self) -> u32 {
        self.projection().total_budget_pool()
    }
}

fn command_is_set(command: &[String]) -> bool {
    command.first().is_some_and(|program| !program.trim().is_empty())
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `MarketConfig::default()`.
pub fn load_config(path: &Path) -> Result<MarketConfig> {
    if !path.exists() {
        let cfg = MarketConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: MarketConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("validate {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &MarketConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

pub(crate) fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let mut tmp_name = path
        .file_name()
        .with_context(|| format!("path missing file name {}", path.display()))?
        .to_os_string();
    tmp_name.push(".tmp");
    let tmp_path = path.with_file_name(tmp_name);
    fs::write(&tmp_path, contents).with_context(|| format!("write temp {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace {}", path.display()))?;
    Ok(())
}
