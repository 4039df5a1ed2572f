//! Requirement extraction from checklist-style specification documents.
//!
//! Explicit requirements are `- [ ]` / `- [x]` items. Implicit requirements
//! come from a fixed policy set matched against the explicit items.

use regex::RegexBuilder;
use serde::{Deserialize, Serialize};

use crate::core::types::{Requirement, RequirementSet};

/// A parsed `- [ ] text` line: byte offset of the mark, checked flag, text.
struct ChecklistLine<'a> {
    mark_offset: usize,
    checked: bool,
    text: &'a str,
}

fn parse_checklist_line(line: &str) -> Option<ChecklistLine<'_>> {
    let indent = line.len() - line.trim_start().len();
    let rest = &line[indent..];
    let rest = rest.strip_prefix(|c: char| matches!(c, '-' | '*' | '+'))?;
    let after_bullet = rest.trim_start();
    if after_bullet.len() == rest.len() {
        return None;
    }
    let after_open = after_bullet.strip_prefix('[')?;
    let mut chars = after_open.chars();
    let mark = chars.next()?;
    if !matches!(mark, ' ' | 'x' | 'X') {
        return None;
    }
    let after_close = chars.as_str().strip_prefix(']')?;
    let text = after_close.trim_start();
    if text.len() == after_close.len() {
        return None;
    }
    let text = text.trim_end();
    if text.is_empty() {
        return None;
    }
    Some(ChecklistLine {
        mark_offset: line.len() - after_open.len(),
        checked: mark != ' ',
        text,
    })
}

/// Policy deriving one implicit requirement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImplicitPolicy {
    pub name: String,
    /// Case-insensitive regex matched against explicit items. Empty matches always.
    #[serde(default)]
    pub pattern: String,
    pub requirement: String,
}

impl ImplicitPolicy {
    fn new(name: &str, pattern: &str, requirement: &str) -> Self {
        Self {
            name: name.to_string(),
            pattern: pattern.to_string(),
            requirement: requirement.to_string(),
        }
    }
}

pub fn default_policies() -> Vec<ImplicitPolicy> {
    vec![
        ImplicitPolicy::new(
            "security-tests",
            r"\b(auth\w*|security|secret|token|password|credential|permission|encrypt\w*)\b",
            "Security-sensitive changes require tests",
        ),
        ImplicitPolicy::new(
            "public-api-docs",
            r"\b(api|endpoint|public|interface|cli|command)\b",
            "Public interface changes require documentation",
        ),
        ImplicitPolicy::new(
            "schema-migration",
            r"\b(schema|migration|database|table|column)\b",
            "Data shape changes require a migration or compatibility note",
        ),
        ImplicitPolicy::new(
            "checks-stay-green",
            "",
            "Existing format, lint, type, and test checks keep passing",
        ),
    ]
}

/// Parse explicit checklist items. Ids follow document order (`req-1`, ...).
pub fn parse_checklist(document: &str) -> Vec<Requirement> {
    document
        .lines()
        .filter_map(parse_checklist_line)
        .enumerate()
        .map(|(idx, item)| Requirement {
            id: format!("req-{}", idx + 1),
            text: item.text.to_string(),
            satisfied: item.checked,
        })
        .collect()
}

/// Derive implicit requirements; fails if any policy pattern is invalid.
pub fn derive_implicit(
    explicit: &[Requirement],
    policies: &[ImplicitPolicy],
) -> Result<Vec<Requirement>, regex::Error> {
    let mut derived = Vec::new();
    for policy in policies {
        let applies = if policy.pattern.trim().is_empty() {
            true
        } else {
            let re = RegexBuilder::new(&policy.pattern)
                .case_insensitive(true)
                .build()?;
            explicit.iter().any(|req| re.is_match(&req.text))
        };
        if applies {
            derived.push(Requirement {
                id: format!("implicit-{}", policy.name),
                text: policy.requirement.clone(),
                satisfied: false,
            });
        }
    }
    Ok(derived)
}

/// Extract the full requirement set.
///
/// If implicit derivation fails the set is marked `degraded` and carries only
/// explicit items, so scoring falls back to checklist coverage.
pub fn extract_requirements(document: &str, policies: &[ImplicitPolicy]) -> RequirementSet {
    let explicit = parse_checklist(document);
    match derive_implicit(&explicit, policies) {
        Ok(implicit) => RequirementSet {
            explicit,
            implicit,
            degraded: false,
        },
        Err(err) => {
            tracing::warn!(err = %err, "implicit requirement derivation failed; using checklist only");
            RequirementSet {
                explicit,
                implicit: Vec::new(),
                degraded: true,
            }
        }
    }
}

/// Rewrite the document with the given requirement ids checked off.
///
/// Lines that are not checklist items, and items not named, are untouched.
pub fn check_off(document: &str, satisfied_ids: &[String]) -> String {
    let mut index = 0usize;
    let mut out = String::with_capacity(document.len());
    for line in document.split_inclusive('\n') {
        let (body, newline) = match line.strip_suffix('\n') {
            Some(body) => (body, "\n"),
            None => (line, ""),
        };
        let mut rewritten = None;
        if let Some(item) = parse_checklist_line(body) {
            index += 1;
            let id = format!("req-{index}");
            if !item.checked && satisfied_ids.contains(&id) {
                let mut updated = body.to_string();
                updated.replace_range(item.mark_offset..item.mark_offset + 1, "x");
                rewritten = Some(updated);
            }
        }
        out.push_str(rewritten.as_deref().unwrap_or(body));
        out.push_str(newline);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOC: &str = "# Add login\n\nSome prose.\n\n- [ ] Add password reset endpoint\n- [x] Write design note\n  * [ ] Update CLI help\n- [ ]\nnot - [ ] an item\n";

    #[test]
    fn parses_checked_and_unchecked_items() {
        let items = parse_checklist(DOC);
        let texts: Vec<&str> = items.iter().map(|r| r.text.as_str()).collect();
        assert_eq!(
            texts,
            vec![
                "Add password reset endpoint",
                "Write design note",
                "Update CLI help"
            ]
        );
        assert!(!items[0].satisfied);
        assert!(items[1].satisfied);
        assert_eq!(items[2].id, "req-3");
    }

    #[test]
    fn security_items_imply_tests() {
        let set = extract_requirements(DOC, &default_policies());
        let ids: Vec<&str> = set.implicit.iter().map(|r| r.id.as_str()).collect();
        assert!(ids.contains(&"implicit-security-tests"));
        assert!(ids.contains(&"implicit-public-api-docs"));
        assert!(ids.contains(&"implicit-checks-stay-green"));
        assert!(!ids.contains(&"implicit-schema-migration"));
        assert!(!set.degraded);
    }

    #[test]
    fn invalid_policy_degrades_to_explicit_only() {
        let policies = vec![ImplicitPolicy::new("broken", "(unclosed", "never")];
        let set = extract_requirements(DOC, &policies);
        assert!(set.degraded);
        assert!(set.implicit.is_empty());
        assert_eq!(set.explicit.len(), 3);
    }

    #[test]
    fn check_off_marks_only_named_items() {
        let updated = check_off(DOC, &["req-1".to_string(), "req-3".to_string()]);
        assert!(updated.contains("- [x] Add password reset endpoint"));
        assert!(updated.contains("  * [x] Update CLI help"));
        assert!(updated.contains("- [x] Write design note"));
        assert!(updated.contains("not - [ ] an item"));
        assert!(updated.ends_with('\n'));
        let reparsed = parse_checklist(&updated);
        assert!(reparsed.iter().all(|r| r.satisfied));
    }
}
