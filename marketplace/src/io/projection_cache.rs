//! Local, expendable cache of the projected state.
//!
//! The cache is never authoritative: it is reused only when its staleness
//! token equals the current event count and it was computed under the same
//! projection config. Any other cache is discarded and the full log refolded.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::core::invariants::check_state_invariants;
use crate::core::projector::{Projection, ProjectionConfig, project};
use crate::core::types::{Event, MarketplaceState};
use crate::io::config::write_atomic;
use crate::io::event_store::{EventStore, LoadWarning};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CacheFile {
    staleness_token: usize,
    config: ProjectionConfig,
    state: MarketplaceState,
}

/// Current state plus what was read to produce it.
#[derive(Debug, Clone)]
pub struct StateView {
    pub state: MarketplaceState,
    pub events: Vec<Event>,
    pub warnings: Vec<LoadWarning>,
    /// True when the state was refolded rather than read from cache.
    pub recomputed: bool,
}

#[derive(Debug, Clone)]
pub struct ProjectionCache {
    store: EventStore,
    cache_path: PathBuf,
    config: ProjectionConfig,
}

impl ProjectionCache {
    pub fn new(store: EventStore, cache_path: impl Into<PathBuf>, config: ProjectionConfig) -> Self {
        Self {
            store,
            cache_path: cache_path.into(),
            config,
        }
    }

    pub fn store(&self) -> &EventStore {
        &self.store
    }

    pub fn config(&self) -> &ProjectionConfig {
        &self.config
    }

    /// Return current state, refolding the log unless the cache is fresh.
    #[instrument(skip_all, fields(force_refresh))]
    pub fn get_state(&self, force_refresh: bool) -> Result<StateView> {
        let loaded = self.store.load_all()?;
        let count = loaded.events.len();

        if !force_refresh && let Some(state) = self.read_fresh(count) {
            debug!(events = count, "projection cache hit");
            return Ok(StateView {
                state,
                events: loaded.events,
                warnings: loaded.warnings,
                recomputed: false,
            });
        }

        let projection = project(&loaded.events, &self.config)
            .context("project marketplace state from event log")?;
        self.write(&projection)?;
        info!(events = count, "projection recomputed");
        Ok(StateView {
            state: projection.state,
            events: loaded.events,
            warnings: loaded.warnings,
            recomputed: true,
        })
    }

    fn read_fresh(&self, count: usize) -> Option<MarketplaceState> {
        let cached = match read_cache(&self.cache_path) {
            Ok(Some(cached)) => cached,
            Ok(None) => return None,
            Err(err) => {
                warn!(err = %format!("{err:#}"), "unreadable projection cache; recomputing");
                return None;
            }
        };
        if cached.staleness_token != count {
            debug!(
                cached = cached.staleness_token,
                current = count,
                "projection cache stale"
            );
            return None;
        }
        if cached.config != self.config {
            debug!("projection cache computed under different config");
            return None;
        }
        let errors = check_state_invariants(
            &cached.state,
            self.config.total_budget_pool(),
            &self.config.weight_constraints,
        );
        if !errors.is_empty() {
            warn!(errors = %errors.join("; "), "cached projection violates invariants; recomputing");
            return None;
        }
        Some(cached.state)
    }

    fn write(&self, projection: &Projection) -> Result<()> {
        let cache = CacheFile {
            staleness_token: projection.staleness_token,
            config: self.config.clone(),
            state: projection.state.clone(),
        };
        let mut buf = serde_json::to_string_pretty(&cache).context("serialize projection cache")?;
        buf.push('\n');
        write_atomic(&self.cache_path, &buf)
    }
}

fn read_cache(path: &Path) -> Result<Option<CacheFile>> {
    if !path.exists() {
        return Ok(None);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cache = serde_json::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    Ok(Some(cache))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::weights::WeightConstraints;
    use crate::test_support::event_at;
    use crate::core::types::OutcomeKind;

    fn cache_in(dir: &Path) -> ProjectionCache {
        ProjectionCache::new(
            EventStore::new(dir.join("events")),
            dir.join("state").join("marketplace.json"),
            ProjectionConfig {
                num_bots: 3,
                base_budget_per_bot: 10,
                weight_constraints: WeightConstraints::default(),
            },
        )
    }

    #[test]
    fn fresh_cache_is_reused_and_growth_invalidates() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cache = cache_in(temp.path());
        cache
            .store()
            .append(&event_at(1, "bidder_1", OutcomeKind::RankedFirstSuccess))
            .expect("append");

        let first = cache.get_state(false).expect("first");
        assert!(first.recomputed);
        let second = cache.get_state(false).expect("second");
        assert!(!second.recomputed);
        assert_eq!(first.state, second.state);

        cache
            .store()
            .append(&event_at(2, "bidder_2", OutcomeKind::RankedFirstFailure))
            .expect("append");
        let third = cache.get_state(false).expect("third");
        assert!(third.recomputed);
        assert_eq!(third.events.len(), 2);
    }

    #[test]
    fn shrinking_log_recomputes_from_baseline() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cache = cache_in(temp.path());
        let id = cache
            .store()
            .append(&event_at(1, "bidder_1", OutcomeKind::RankedFirstSuccess))
            .expect("append");
        cache
            .store()
            .append(&event_at(2, "bidder_1", OutcomeKind::RankedFirstSuccess))
            .expect("append");
        cache.get_state(false).expect("warm");

        fs::remove_file(cache.store().dir().join(id)).expect("prune");
        let view = cache.get_state(false).expect("after prune");
        assert!(view.recomputed);
        let expected = project(&view.events, cache.config()).expect("project");
        assert_eq!(view.state, expected.state);
        assert_eq!(view.state.competitors["bidder_1"].successes, 1);
    }

    #[test]
    fn corrupt_cache_is_discarded() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cache = cache_in(temp.path());
        cache.get_state(false).expect("warm");
        fs::write(temp.path().join("state").join("marketplace.json"), "{").expect("corrupt");
        let view = cache.get_state(false).expect("recover");
        assert!(view.recomputed);
    }

    #[test]
    fn tampered_cache_failing_invariants_is_recomputed() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cache = cache_in(temp.path());
        cache.get_state(false).expect("warm");
        let path = temp.path().join("state").join("marketplace.json");
        let mut raw: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&path).expect("read")).expect("parse");
        raw["state"]["competitors"]["bidder_1"]["weight"] = serde_json::json!(0.9);
        fs::write(&path, raw.to_string()).expect("write");

        let view = cache.get_state(false).expect("state");
        assert!(view.recomputed);
        assert!((view.state.competitors["bidder_1"].weight - 1.0 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn force_refresh_always_recomputes() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cache = cache_in(temp.path());
        cache.get_state(false).expect("warm");
        assert!(cache.get_state(true).expect("forced").recomputed);
    }
}
