//! Output Interpreter & Validation (§4.3): schema checks for worker-produced
//! implementation plans and review artifacts, plus mode-dependent repo-change
//! validation against the task's allowlist.

use crate::types::{ExpansionRequest, ImplementationPlan, Phase, ReviewArtifact, Severity};

const DOCS_KEYWORDS: &[&str] = &["doc", "docs", "readme", "documentation"];

/// A phase counts as docs-only when its name or acceptance criteria read like
/// documentation work. Mirrors the original's keyword match on name/description;
/// this crate's `Phase` carries no separate description field, so acceptance
/// criteria stand in for it.
pub fn is_docs_only_phase(phase: &Phase) -> bool {
    let haystack = std::iter::once(phase.name.as_str())
        .chain(phase.acceptance_criteria.iter().map(|s| s.as_str()))
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase();
    DOCS_KEYWORDS.iter().any(|kw| haystack.contains(kw))
}

fn normalize_path(path: &str) -> String {
    path.trim().trim_start_matches("./").to_string()
}

/// Validates a worker-produced implementation plan against the step-specific
/// schema in §4.3. `expansion_request`, when present, is the pending request
/// from a prior allowlist violation or verify failure; every path it names
/// must be covered by the plan's allowlist.
pub fn validate_implementation_plan(
    plan: &ImplementationPlan,
    phase: &Phase,
    expansion_request: Option<&ExpansionRequest>,
) -> Result<(), String> {
    if plan.phase_id != phase.id {
        return Err(format!(
            "plan phase_id '{}' does not match expected phase '{}'",
            plan.phase_id, phase.id
        ));
    }

    if plan.spec_summary.iter().any(|s| s.trim().is_empty()) {
        return Err("spec_summary must not contain blank entries".to_string());
    }

    let has_technical_approach = plan
        .technical_approach
        .as_ref()
        .map(|s| !s.trim().is_empty())
        .unwrap_or(false);
    if !has_technical_approach && plan.steps.is_empty() {
        return Err("plan must include either a technical_approach or a non-empty steps list".to_string());
    }

    let docs_only = is_docs_only_phase(phase);
    if plan.files_to_change.is_empty() && !docs_only {
        return Err("files_to_change must be non-empty for a non-docs-only phase".to_string());
    }
    if plan.files_to_change.iter().any(|p| p.trim().is_empty()) {
        return Err("files_to_change must not contain blank entries".to_string());
    }

    if let Some(request) = expansion_request {
        let covered: std::collections::BTreeSet<String> = plan
            .files_to_change
            .iter()
            .chain(plan.new_files.iter())
            .map(|p| normalize_path(p))
            .collect();
        let missing: Vec<String> = request
            .paths
            .iter()
            .map(|p| normalize_path(p))
            .filter(|p| !covered.contains(p))
            .collect();
        if !missing.is_empty() {
            let shown: Vec<&String> = missing.iter().take(5).collect();
            return Err(format!(
                "plan does not cover requested expansion paths: {}",
                shown.iter().map(|s| s.as_str()).collect::<Vec<_>>().join(", ")
            ));
        }
    }

    Ok(())
}

/// Minimum evidence items a full-mode review must cite, tied to concrete
/// file/diff references. Matches the original runner's prompt, which asks
/// for "at least two concrete observations with file/diff references".
pub const REVIEW_MIN_EVIDENCE_ITEMS: u32 = 2;

/// Validates a full-mode review artifact.
pub fn validate_review(
    review: &ReviewArtifact,
    phase: &Phase,
    prd_has_content: bool,
    min_evidence_items: u32,
) -> Result<(), String> {
    if review.phase_id != phase.id {
        return Err(format!(
            "review phase_id '{}' does not match expected phase '{}'",
            review.phase_id, phase.id
        ));
    }

    for (i, issue) in review.issues.iter().enumerate() {
        if issue.summary.trim().is_empty() {
            return Err(format!("issues[{i}].summary must not be blank"));
        }
        if issue.rationale.trim().is_empty() {
            return Err(format!("issues[{i}].rationale must not be blank"));
        }
        if issue.files.is_empty() || issue.files.iter().any(|f| f.trim().is_empty()) {
            return Err(format!("issues[{i}].files must be a non-empty list of non-blank paths"));
        }
        if issue.suggested_fix.trim().is_empty() {
            return Err(format!("issues[{i}].suggested_fix must not be blank"));
        }
    }

    if !prd_has_content {
        let flags_missing_prd = review.issues.iter().any(|issue| {
            issue.severity.is_blocking() && issue.summary.to_lowercase().contains("prd")
        });
        if !flags_missing_prd {
            return Err(
                "PRD content was unavailable this run; a critical/high issue must flag it".to_string(),
            );
        }
    }

    if review.evidence_count < min_evidence_items {
        return Err(format!(
            "evidence must include at least {min_evidence_items} items, found {}",
            review.evidence_count
        ));
    }

    Ok(())
}

/// Severities accepted by the simple review mode. Excludes `critical` --
/// simple review is a lighter-weight pass that never blocks on its own.
pub fn simple_review_severity_allowed(severity: Severity) -> bool {
    matches!(severity, Severity::High | Severity::Medium | Severity::Low)
}

/// Validates a simple-mode review artifact: only `mergeable` and a list of
/// `{severity, summary}` issues are required (§4.3).
pub fn validate_simple_review(review: &ReviewArtifact) -> Result<(), String> {
    for (i, issue) in review.issues.iter().enumerate() {
        if !simple_review_severity_allowed(issue.severity) {
            return Err(format!("issues[{i}].severity must be one of: high, medium, low"));
        }
        if issue.summary.trim().is_empty() {
            return Err(format!("issues[{i}].text must not be blank"));
        }
    }
    Ok(())
}

/// The mode a worker run was dispatched under, for repo-change validation.
#[derive(Debug, Clone)]
pub enum ChangeMode {
    /// `plan_impl` and `review` steps: no repo changes outside the state dir.
    StateOnly,
    /// `implement` step: changes must fall within the plan's allowlist.
    Implement { allowlist: Vec<String> },
}

/// Whether `path` matches one of `allowed_patterns`: exact-file match, or
/// directory-prefix match when a pattern ends in `/`. Shared with
/// `verify.rs`'s allowlist-expansion check.
pub fn path_is_allowed(path: &str, allowed_patterns: &[String]) -> bool {
    for pattern in allowed_patterns {
        let pattern = pattern.trim();
        if pattern.is_empty() {
            continue;
        }
        let normalized = pattern.trim_end_matches('/');
        if pattern.ends_with('/') {
            let prefix = format!("{normalized}/");
            if path == normalized || path.starts_with(&prefix) {
                return true;
            }
        }
        if path == normalized {
            return true;
        }
    }
    false
}

fn is_state_dir_change(path: &str, state_dir_name: &str) -> bool {
    path == state_dir_name || path.starts_with(&format!("{state_dir_name}/"))
}

/// Validates the set of repo changes a worker run introduced against its
/// dispatch mode. `gitignore_change_is_state_only` should come from
/// `crate::git::gitignore_change_is_state_dir_only` when `.gitignore` is
/// among the introduced changes -- the one repo-file exception every mode
/// tolerates, since it's how the state directory gets ignored in the first
/// place. Returns the disallowed paths on failure.
pub fn validate_changes_for_mode(
    mode: &ChangeMode,
    introduced_changes: &[String],
    state_dir_name: &str,
    gitignore_change_is_state_only: bool,
) -> Result<(), Vec<String>> {
    let filter_gitignore_exception = |paths: Vec<String>| -> Vec<String> {
        if gitignore_change_is_state_only {
            paths.into_iter().filter(|p| p != ".gitignore").collect()
        } else {
            paths
        }
    };

    match mode {
        ChangeMode::StateOnly => {
            let outside: Vec<String> = introduced_changes
                .iter()
                .filter(|p| !is_state_dir_change(p, state_dir_name))
                .cloned()
                .collect();
            let outside = filter_gitignore_exception(outside);
            if outside.is_empty() {
                Ok(())
            } else {
                Err(outside)
            }
        }
        ChangeMode::Implement { allowlist } => {
            if allowlist.is_empty() {
                return Err(introduced_changes.to_vec());
            }
            let disallowed: Vec<String> = introduced_changes
                .iter()
                .filter(|p| !is_state_dir_change(p, state_dir_name) && !path_is_allowed(p, allowlist))
                .cloned()
                .collect();
            let disallowed = filter_gitignore_exception(disallowed);
            if disallowed.is_empty() {
                Ok(())
            } else {
                Err(disallowed)
            }
        }
    }
}
