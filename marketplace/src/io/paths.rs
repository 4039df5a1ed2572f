//! Canonical paths within `.marketplace/` for a project root.

use std::path::PathBuf;

use crate::core::types::sanitize_component;

#[derive(Debug, Clone)]
pub struct MarketPaths {
    pub root: PathBuf,
    pub market_dir: PathBuf,
    pub config_path: PathBuf,
    pub events_dir: PathBuf,
    pub state_dir: PathBuf,
    pub cache_path: PathBuf,
    pub issues_dir: PathBuf,
    pub rounds_dir: PathBuf,
    pub attention_dir: PathBuf,
    pub archive_dir: PathBuf,
}

impl MarketPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let market_dir = root.join(".marketplace");
        let state_dir = market_dir.join("state");
        Self {
            root: root.clone(),
            config_path: market_dir.join("config.toml"),
            events_dir: market_dir.join("events"),
            cache_path: state_dir.join("marketplace.json"),
            state_dir,
            issues_dir: market_dir.join("issues"),
            rounds_dir: market_dir.join("rounds"),
            attention_dir: market_dir.join("attention"),
            archive_dir: market_dir.join("archive"),
            market_dir,
        }
    }

    /// Default file-backed specification document for `issue`.
    pub fn issue_doc(&self, issue: &str) -> PathBuf {
        self.issues_dir.join(format!("{}.md", sanitize_component(issue)))
    }

    /// Artifacts for every round of loop run `run_id` on `issue`.
    pub fn run_dir(&self, issue: &str, run_id: &str) -> PathBuf {
        self.rounds_dir
            .join(sanitize_component(issue))
            .join(sanitize_component(run_id))
    }

    pub fn round_dir(&self, issue: &str, run_id: &str, round: u32) -> PathBuf {
        self.run_dir(issue, run_id).join(round.to_string())
    }

    pub fn attention_report(&self, issue: &str) -> PathBuf {
        self.attention_dir
            .join(format!("{}.md", sanitize_component(issue)))
    }

    pub fn is_initialized(&self) -> bool {
        self.config_path.is_file() && self.events_dir.is_dir()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn layout_is_rooted_in_marketplace_dir() {
        let paths = MarketPaths::new("/repo");
        assert_eq!(paths.config_path, Path::new("/repo/.marketplace/config.toml"));
        assert_eq!(
            paths.cache_path,
            Path::new("/repo/.marketplace/state/marketplace.json")
        );
        assert_eq!(
            paths.round_dir("42", "20250301T120000Z", 2),
            Path::new("/repo/.marketplace/rounds/42/20250301T120000Z/2")
        );
        assert!(paths.issue_doc("42").starts_with(&paths.market_dir));
    }

    #[test]
    fn sanitize_blocks_traversal() {
        assert_eq!(sanitize_component("../etc/passwd"), "_etc_passwd");
        assert_eq!(sanitize_component("owner/repo#12"), "owner_repo_12");
        assert_eq!(sanitize_component(".."), "_");
    }
}
