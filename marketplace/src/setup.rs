//! `marketplace setup` and `marketplace reset`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use chrono::Utc;
use tracing::{info, instrument};

use crate::core::types::MarketplaceState;
use crate::io::config::{MarketConfig, load_config, write_config};
use crate::io::event_store::EventStore;
use crate::io::paths::MarketPaths;
use crate::io::projection_cache::ProjectionCache;

const MARKET_GITIGNORE: &str = "# Local projection cache; regenerated from events/.\nstate/\n";

#[derive(Debug, Clone)]
pub struct SetupOutcome {
    pub config_written: bool,
    pub state: MarketplaceState,
}

/// Create `.marketplace/` scaffolding in `root`.
///
/// An existing config is kept unless `force` is set. Events are never
/// touched.
#[instrument(skip_all, fields(root = %root.display(), force))]
pub fn setup(root: &Path, force: bool) -> Result<SetupOutcome> {
    let paths = MarketPaths::new(root);
    if paths.market_dir.exists() && !paths.market_dir.is_dir() {
        return Err(anyhow!(
            "marketplace setup: .marketplace exists but is not a directory"
        ));
    }
    for dir in [
        &paths.market_dir,
        &paths.events_dir,
        &paths.state_dir,
        &paths.issues_dir,
        &paths.rounds_dir,
        &paths.attention_dir,
    ] {
        fs::create_dir_all(dir).with_context(|| format!("create directory {}", dir.display()))?;
    }
    fs::write(paths.market_dir.join(".gitignore"), MARKET_GITIGNORE)
        .context("write .marketplace/.gitignore")?;

    let config_written = force || !paths.config_path.exists();
    let config = if config_written {
        let config = MarketConfig::default();
        write_config(&paths.config_path, &config)?;
        config
    } else {
        load_config(&paths.config_path)?
    };

    let cache = ProjectionCache::new(
        EventStore::new(&paths.events_dir),
        &paths.cache_path,
        config.projection(),
    );
    let state = cache.get_state(true)?.state;
    info!(config_written, competitors = state.competitors.len(), "marketplace initialized");
    Ok(SetupOutcome {
        config_written,
        state,
    })
}

#[derive(Debug, Clone)]
pub struct ResetOutcome {
    pub archive_dir: PathBuf,
    pub archived_events: usize,
    pub state: MarketplaceState,
}

/// Archive the event log and cache, then start over from equal weights.
#[instrument(skip_all, fields(root = %root.display()))]
pub fn reset(root: &Path) -> Result<ResetOutcome> {
    let paths = MarketPaths::new(root);
    if !paths.is_initialized() {
        return Err(anyhow!(
            "marketplace reset: not initialized (run `marketplace setup` first)"
        ));
    }
    let config = load_config(&paths.config_path)?;
    let archived_events = EventStore::new(&paths.events_dir).load_all()?.events.len();

    let mut archive_dir = paths
        .archive_dir
        .join(Utc::now().format("%Y%m%dT%H%M%SZ").to_string());
    let mut suffix = 1;
    while archive_dir.exists() {
        archive_dir = paths.archive_dir.join(format!(
            "{}-{suffix}",
            Utc::now().format("%Y%m%dT%H%M%SZ")
        ));
        suffix += 1;
    }
    fs::create_dir_all(&archive_dir)
        .with_context(|| format!("create archive dir {}", archive_dir.display()))?;

    fs::rename(&paths.events_dir, archive_dir.join("events"))
        .with_context(|| format!("archive {}", paths.events_dir.display()))?;
    if paths.cache_path.exists() {
        fs::rename(&paths.cache_path, archive_dir.join("marketplace.json"))
            .with_context(|| format!("archive {}", paths.cache_path.display()))?;
    }
    fs::create_dir_all(&paths.events_dir)
        .with_context(|| format!("recreate {}", paths.events_dir.display()))?;

    let cache = ProjectionCache::new(
        EventStore::new(&paths.events_dir),
        &paths.cache_path,
        config.projection(),
    );
    let state = cache.get_state(true)?.state;
    info!(archived_events, archive = %archive_dir.display(), "event log reset");
    Ok(ResetOutcome {
        archive_dir,
        archived_events,
        state,
    })
}
