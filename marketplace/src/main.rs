//! Competitive planning marketplace CLI.
//!
//! Reads and writes `.marketplace/` in the current directory. The event log
//! is authoritative; `status` and `loop` always act on its projection.

use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use serde_json::json;
use tracing::warn;

use marketplace::core::projector::competitor_id;
use marketplace::exit_codes;
use marketplace::io::competitor::{CommandCompetitor, Competitor};
use marketplace::io::config::{MarketConfig, load_config};
use marketplace::io::event_store::EventStore;
use marketplace::io::implementer::{CommandImplementer, Implementer};
use marketplace::io::paths::MarketPaths;
use marketplace::io::projection_cache::ProjectionCache;
use marketplace::io::spec_doc::FileSpecTracker;
use marketplace::logging;
use marketplace::looping::{LoopDeps, LoopOptions, LoopStop, run_loop};
use marketplace::round::{CancelToken, RoundReport};
use marketplace::setup::{reset, setup};
use marketplace::status::{DEFAULT_HISTORY, current_allocation, render_history, render_status};

#[derive(Parser)]
#[command(
    name = "marketplace",
    version,
    about = "Competitive planning marketplace with an event-sourced reputation ledger"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create `.marketplace/` with default config and an empty event log.
    Setup {
        /// Overwrite an existing config.
        #[arg(short, long)]
        force: bool,
    },
    /// Print projected weights, budgets, and recent events.
    Status {
        /// Emit machine-readable JSON.
        #[arg(long)]
        json: bool,
        /// Ignore the cache and refold the event log.
        #[arg(long)]
        refresh: bool,
    },
    /// Print recent events for one competitor.
    History {
        /// Competitor id, e.g. `bidder_1`.
        bot: String,
        #[arg(long, default_value_t = DEFAULT_HISTORY)]
        last: usize,
    },
    /// Run rounds for an issue until complete or needs attention.
    Loop {
        issue: String,
        /// Specification document (default `.marketplace/issues/<issue>.md`).
        #[arg(long)]
        spec: Option<PathBuf>,
        /// Branch holding the work, recorded in escalation reports.
        #[arg(long)]
        branch: Option<String>,
    },
    /// Archive the event log and restore equal weights.
    Reset,
}

fn main() {
    logging::init();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{:#}", err);
            std::process::exit(exit_codes::INVALID);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let root = env::current_dir().context("resolve current directory")?;
    match cli.command {
        Command::Setup { force } => cmd_setup(&root, force),
        Command::Status { json, refresh } => cmd_status(&root, json, refresh),
        Command::History { bot, last } => cmd_history(&root, &bot, last),
        Command::Loop {
            issue,
            spec,
            branch,
        } => cmd_loop(&root, issue, spec, branch),
        Command::Reset => cmd_reset(&root),
    }
}

fn cmd_setup(root: &Path, force: bool) -> Result<i32> {
    let outcome = setup(root, force)?;
    if outcome.config_written {
        println!("wrote .marketplace/config.toml");
    } else {
        println!("kept existing .marketplace/config.toml");
    }
    for record in outcome.state.competitors.values() {
        println!("{:<14} {:.4}", record.id, record.weight);
    }
    println!("budget pool: {}", outcome.state.total_budget_pool);
    Ok(exit_codes::OK)
}

fn cmd_status(root: &Path, as_json: bool, refresh: bool) -> Result<i32> {
    let (_, _, cache) = open(root)?;
    let view = cache.get_state(refresh)?;
    if as_json {
        let allocation = current_allocation(&view.state);
        let payload = json!({
            "state": view.state,
            "allocation": allocation,
            "events": view.events.len(),
            "warnings": view.warnings,
        });
        println!(
            "{}",
            serde_json::to_string_pretty(&payload).context("serialize status json")?
        );
    } else {
        print!("{}", render_status(&view.state, &view.events, &view.warnings));
    }
    Ok(exit_codes::OK)
}

fn cmd_history(root: &Path, bot: &str, last: usize) -> Result<i32> {
    let (_, _, cache) = open(root)?;
    let loaded = cache.store().load_all()?;
    print!("{}", render_history(&loaded.events, bot, last));
    Ok(exit_codes::OK)
}

fn cmd_reset(root: &Path) -> Result<i32> {
    let outcome = reset(root)?;
    println!(
        "archived {} event(s) to {}",
        outcome.archived_events,
        outcome.archive_dir.display()
    );
    for record in outcome.state.competitors.values() {
        println!("{:<14} {:.4}", record.id, record.weight);
    }
    Ok(exit_codes::OK)
}

fn cmd_loop(
    root: &Path,
    issue: String,
    spec: Option<PathBuf>,
    branch: Option<String>,
) -> Result<i32> {
    let (paths, config, _) = open(root)?;
    let spec_path = match spec {
        Some(path) if path.is_absolute() => path,
        Some(path) => root.join(path),
        None => paths.issue_doc(&issue),
    };
    let tracker = FileSpecTracker::new(spec_path);
    let cancel = CancelToken::new();
    spawn_interrupt_listener(cancel.clone());

    let deps = LoopDeps {
        paths: &paths,
        config: &config,
        competitors: build_competitors(root, &config)?,
        implementer: build_implementer(root, &config),
        tracker: &tracker,
        cancel,
    };
    let options = LoopOptions { issue, branch };
    let outcome = run_loop(&deps, &options, print_round)?;

    let code = match &outcome.stop {
        LoopStop::Complete => {
            println!("complete after {} round(s)", outcome.rounds.len());
            exit_codes::OK
        }
        LoopStop::NeedsAttention {
            reason,
            report_path,
        } => {
            println!(
                "needs attention ({}): see {}",
                reason.as_str(),
                report_path.display()
            );
            exit_codes::NEEDS_ATTENTION
        }
        LoopStop::Aborted => {
            println!("aborted after {} round(s)", outcome.rounds.len());
            exit_codes::ABORTED
        }
    };
    Ok(code)
}

/// Resolve paths, load config, and open the projection cache.
fn open(root: &Path) -> Result<(MarketPaths, MarketConfig, ProjectionCache)> {
    let paths = MarketPaths::new(root);
    if !paths.is_initialized() {
        bail!("marketplace not initialized in {} (run `marketplace setup`)", root.display());
    }
    let config = load_config(&paths.config_path)?;
    let cache = ProjectionCache::new(
        EventStore::new(&paths.events_dir),
        &paths.cache_path,
        config.projection(),
    );
    Ok((paths, config, cache))
}

fn build_competitors(root: &Path, config: &MarketConfig) -> Result<Vec<Arc<dyn Competitor>>> {
    let template = config.competitor.prompt_template.as_ref().map(|path| {
        if path.is_absolute() {
            path.clone()
        } else {
            root.join(path)
        }
    });
    let mut competitors: Vec<Arc<dyn Competitor>> = Vec::new();
    for index in 1..=config.num_bots {
        let mut competitor = CommandCompetitor::new(
            competitor_id(index),
            config.competitor.command.clone(),
            root,
            config.timeouts.proposal(),
            config.output_limit_bytes,
        );
        if let Some(path) = &template {
            competitor = competitor.with_template_file(path)?;
        }
        competitors.push(Arc::new(competitor));
    }
    Ok(competitors)
}

fn build_implementer(root: &Path, config: &MarketConfig) -> Arc<dyn Implementer> {
    Arc::new(CommandImplementer::new(
        config.implementer.command.clone(),
        config.checks.clone(),
        root,
        config.timeouts.implementation(),
        config.timeouts.verification(),
        config.output_limit_bytes,
    ))
}

fn print_round(report: &RoundReport) {
    println!(
        "round {}: {}",
        report.round_identifier,
        report.status.as_str()
    );
    for (rank, (id, entry)) in report.ranking.iter().enumerate() {
        println!("  #{} {:<14} {:.3}", rank + 1, id, entry.total);
    }
    for (id, reason) in &report.absent {
        println!("  absent {id}: {reason}");
    }
    for id in &report.excluded_budget {
        println!("  excluded {id}: allocation used up");
    }
    for event in &report.events {
        println!(
            "  {} {} delta={:+.3}",
            event.competitor_id,
            event.outcome_kind.as_str(),
            event.weight_delta
        );
    }
    println!("  artifacts: {}", report.artifacts_dir.display());
}

/// First Ctrl-C cancels the loop cooperatively; a second one exits at once.
fn spawn_interrupt_listener(cancel: CancelToken) {
    std::thread::spawn(move || {
        let runtime = match tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
        {
            Ok(runtime) => runtime,
            Err(err) => {
                warn!(err = %err, "Ctrl-C handler unavailable");
                return;
            }
        };
        if runtime.block_on(tokio::signal::ctrl_c()).is_err() {
            return;
        }
        eprintln!("interrupt received; stopping after the current step");
        cancel.cancel();
        if runtime.block_on(tokio::signal::ctrl_c()).is_ok() {
            std::process::exit(exit_codes::ABORTED);
        }
    });
}
