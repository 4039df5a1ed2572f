//! Content fingerprints for resubmission detection.

use sha2::{Digest, Sha256};

use crate::core::types::ProposalBody;

/// SHA-256 over whitespace-normalized approach, pseudo code, and sorted files.
///
/// Formatting-only edits keep the same fingerprint; any change in substance
/// produces a new one.
pub fn proposal_fingerprint(body: &ProposalBody) -> String {
    let mut files: Vec<String> = body
        .files_affected
        .iter()
        .map(|file| file.trim().to_string())
        .collect();
    files.sort();
    files.dedup();

    let mut hasher = Sha256::new();
    hasher.update(normalize_text(&body.approach_summary).as_bytes());
    hasher.update([0u8]);
    hasher.update(normalize_text(&body.pseudo_code).as_bytes());
    hasher.update([0u8]);
    hasher.update(files.join("\n").as_bytes());
    hex::encode(hasher.finalize())
}

/// True when `current` changes the substance of `previous`.
pub fn is_materially_different(previous: &ProposalBody, current: &ProposalBody) -> bool {
    proposal_fingerprint(previous) != proposal_fingerprint(current)
}

fn normalize_text(raw: &str) -> String {
    raw.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::Dimensions;

    fn body(summary: &str, files: &[&str]) -> ProposalBody {
        ProposalBody {
            approach_summary: summary.to_string(),
            pseudo_code: "fn main() {}".to_string(),
            files_affected: files.iter().map(|f| f.to_string()).collect(),
            estimated_complexity: 0.3,
            risk_assessment: 0.2,
            spec_alignment_claim: 0.9,
            self_scores: Dimensions::new(),
        }
    }

    #[test]
    fn whitespace_and_file_order_do_not_matter() {
        let a = body("Add a  cache\nlayer", &["src/a.rs", "src/b.rs"]);
        let b = body("add a cache layer", &["src/b.rs", "src/a.rs"]);
        assert_eq!(proposal_fingerprint(&a), proposal_fingerprint(&b));
        assert!(!is_materially_different(&a, &b));
    }

    #[test]
    fn changed_approach_is_material() {
        let a = body("add a cache layer", &["src/a.rs"]);
        let b = body("rewrite the parser", &["src/a.rs"]);
        assert!(is_materially_different(&a, &b));
    }

    #[test]
    fn estimates_alone_are_not_material() {
        let a = body("add a cache layer", &["src/a.rs"]);
        let mut b = a.clone();
        b.risk_assessment = 0.9;
        assert!(!is_materially_different(&a, &b));
    }
}
