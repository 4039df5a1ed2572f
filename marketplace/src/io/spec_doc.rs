//! Specification document access (the issue-tracker boundary).
//!
//! The engine reads a checklist document, checks off satisfied items after a
//! successful round, and appends annotations when escalating.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument};

use crate::core::requirements::check_off;
use crate::io::config::write_atomic;

/// One specification document bound to an issue.
pub trait SpecTracker {
    fn fetch(&self) -> Result<String>;

    /// Mark the named checklist items satisfied.
    fn check_off(&self, satisfied_ids: &[String]) -> Result<()>;

    /// Append a note visible to humans reading the document.
    fn annotate(&self, note: &str) -> Result<()>;
}

/// Markdown file on disk.
#[derive(Debug, Clone)]
pub struct FileSpecTracker {
    path: PathBuf,
}

impl FileSpecTracker {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SpecTracker for FileSpecTracker {
    fn fetch(&self) -> Result<String> {
        if !self.path.exists() {
            return Err(anyhow!(
                "specification document {} not found",
                self.path.display()
            ));
        }
        fs::read_to_string(&self.path).with_context(|| format!("read {}", self.path.display()))
    }

    #[instrument(skip_all, fields(path = %self.path.display(), items = satisfied_ids.len()))]
    fn check_off(&self, satisfied_ids: &[String]) -> Result<()> {
        if satisfied_ids.is_empty() {
            return Ok(());
        }
        let document = self.fetch()?;
        let updated = check_off(&document, satisfied_ids);
        if updated != document {
            write_atomic(&self.path, &updated)?;
            debug!("checklist updated");
        }
        Ok(())
    }

    fn annotate(&self, note: &str) -> Result<()> {
        let mut document = self.fetch()?;
        document.push_str(&format_annotation(&document, note));
        write_atomic(&self.path, &document)
    }
}

/// Blockquote appended to a document, separated by a blank line.
pub fn format_annotation(document: &str, note: &str) -> String {
    let mut out = String::new();
    if !document.is_empty() && !document.ends_with("\n\n") {
        out.push_str(if document.ends_with('\n') { "\n" } else { "\n\n" });
    }
    for line in note.trim_end().lines() {
        if line.is_empty() {
            out.push_str(">\n");
        } else {
            out.push_str("> ");
            out.push_str(line);
            out.push('\n');
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn check_off_rewrites_named_items_only() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("12.md");
        fs::write(&path, "# Issue\n- [ ] parse input\n- [ ] write output\n").expect("write");
        let tracker = FileSpecTracker::new(&path);
        tracker.check_off(&["req-2".to_string()]).expect("check off");
        let doc = tracker.fetch().expect("fetch");
        assert_eq!(doc, "# Issue\n- [ ] parse input\n- [x] write output\n");
    }

    #[test]
    fn annotate_appends_blockquote() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("12.md");
        fs::write(&path, "- [ ] a\n").expect("write");
        let tracker = FileSpecTracker::new(&path);
        tracker
            .annotate("Needs attention\n\nsee report")
            .expect("annotate");
        assert_eq!(
            tracker.fetch().expect("fetch"),
            "- [ ] a\n\n> Needs attention\n>\n> see report\n"
        );
    }

    #[test]
    fn missing_document_is_an_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let tracker = FileSpecTracker::new(temp.path().join("absent.md"));
        let err = tracker.fetch().unwrap_err();
        assert!(err.to_string().contains("not found"));
    }
}
