//! Append-only event log: one self-contained JSON record per file.
//!
//! Appends never overwrite: a record is written to a temp file and then
//! hard-linked to its final name, which fails if the name is taken. Readers
//! only ever see complete records.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use serde::Serialize;
use tracing::{debug, instrument, warn};

use crate::core::types::Event;

/// Highest collision suffix tried before giving up on an append.
const MAX_NAME_SUFFIX: u32 = 1000;

/// Name of a stored record (file name without directory).
pub type EventId = String;

/// A record skipped at load time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LoadWarning {
    pub record: String,
    pub reason: String,
}

/// Result of reading the whole log.
#[derive(Debug, Clone, Default)]
pub struct LoadedEvents {
    /// Sorted by `(timestamp, record name)`.
    pub events: Vec<Event>,
    pub warnings: Vec<LoadWarning>,
}

#[derive(Debug, Clone)]
pub struct EventStore {
    dir: PathBuf,
}

impl EventStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Persist `event` under a fresh, unique record name.
    #[instrument(skip_all, fields(competitor = %event.competitor_id, outcome = event.outcome_kind.as_str()))]
    pub fn append(&self, event: &Event) -> Result<EventId> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("create events dir {}", self.dir.display()))?;
        let mut payload = serde_json::to_string_pretty(event).context("serialize event")?;
        payload.push('\n');

        let base = event.record_name();
        let tmp = tempfile::Builder::new()
            .prefix(".pending-")
            .suffix(".tmp")
            .tempfile_in(&self.dir)
            .with_context(|| format!("create temp record in {}", self.dir.display()))?;
        fs::write(tmp.path(), payload)
            .with_context(|| format!("write temp record {}", tmp.path().display()))?;

        for suffix in 0..MAX_NAME_SUFFIX {
            let name = if suffix == 0 {
                format!("{base}.json")
            } else {
                format!("{base}-{suffix}.json")
            };
            let target = self.dir.join(&name);
            match fs::hard_link(tmp.path(), &target) {
                Ok(()) => {
                    debug!(record = %name, "event appended");
                    return Ok(name);
                }
                Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                    debug!(record = %name, "record name taken, trying next suffix");
                }
                Err(err) => {
                    return Err(err).with_context(|| format!("link {}", target.display()));
                }
            }
        }
        Err(anyhow!(
            "no free record name for {base} after {MAX_NAME_SUFFIX} attempts"
        ))
    }

    /// Read every record. Malformed or unreadable records are skipped with a
    /// warning; a missing directory is an empty log.
    #[instrument(skip_all, fields(dir = %self.dir.display()))]
    pub fn load_all(&self) -> Result<LoadedEvents> {
        let mut loaded = LoadedEvents::default();
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(loaded),
            Err(err) => {
                return Err(err).with_context(|| format!("read dir {}", self.dir.display()));
            }
        };

        let mut records: Vec<(Event, String)> = Vec::new();
        for entry in entries {
            let entry = entry.with_context(|| format!("read dir entry in {}", self.dir.display()))?;
            let path = entry.path();
            let Some(name) = record_file_name(&path) else {
                continue;
            };
            match read_record(&path) {
                Ok(event) => records.push((event, name)),
                Err(err) => {
                    warn!(record = %name, err = %format!("{err:#}"), "skipping malformed event record");
                    loaded.warnings.push(LoadWarning {
                        record: name,
                        reason: format!("{err:#}"),
                    });
                }
            }
        }

        records.sort_by(|(a, a_name), (b, b_name)| {
            a.timestamp.cmp(&b.timestamp).then_with(|| a_name.cmp(b_name))
        });
        loaded.warnings.sort_by(|a, b| a.record.cmp(&b.record));
        loaded.events = records.into_iter().map(|(event, _)| event).collect();
        debug!(
            events = loaded.events.len(),
            skipped = loaded.warnings.len(),
            "event log loaded"
        );
        Ok(loaded)
    }
}

/// `Some(file name)` for visible `*.json` files.
fn record_file_name(path: &Path) -> Option<String> {
    if !path.is_file() || path.extension().and_then(|ext| ext.to_str()) != Some("json") {
        return None;
    }
    let name = path.file_name()?.to_str()?;
    if name.starts_with('.') {
        return None;
    }
    Some(name.to_string())
}

fn read_record(path: &Path) -> Result<Event> {
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let event: Event =
        serde_json::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    if !event.weight_delta.is_finite()
        || !event.proposal_score.is_finite()
        || !event.implementation_score.is_finite()
    {
        return Err(anyhow!("non-finite score or delta in {}", path.display()));
    }
    Ok(event)
}
