//! Prompt construction for each worker step (§4.2/§4.3). One builder per
//! step; all share a preamble (task/phase framing) and a structured-output
//! suffix describing the exact JSON shape a non-agentic worker must return.
//! Agentic workers receive the same prompt text but are instructed to write
//! the JSON to a run-scoped artifact file instead of returning it inline.

use crate::types::{ExpansionRequest, ImplementationPlan, Phase, ReviewIssue, Task};

const PRD_EXCERPT_CHARS: usize = 6000;

/// Build the prompt for a `plan` task: decompose a PRD into phases and
/// per-phase implement tasks.
pub fn build_plan_prompt(prd_text: &str) -> String {
    let prd = excerpt(prd_text, PRD_EXCERPT_CHARS);

    format!(
        "# Autonomous Planning Agent\n\n\
        You are decomposing a product requirements document into an ordered set of phases. \
        No human is available for questions — use your judgment and document assumptions in \
        `spec_summary` fields as you go.\n\n\
        ## PRD\n\n{prd}\n\n\
        ## Task\n\n\
        Break this PRD into phases. Each phase should be independently verifiable and mergeable: \
        small enough to implement, verify, review, and commit in one pass. Declare dependency ids \
        between phases where one phase's work requires another's to land first; phases with no \
        shared dependency may run concurrently. For each phase, also emit exactly one implement \
        task.\n\n\
        If you are writing your output directly to disk rather than returning it inline, write two \
        files in the run directory: `phase_plan.json` (`{{\"schema_version\": 1, \"phases\": [...]}}`) \
        and `task_queue.json` (`{{\"schema_version\": 1, \"tasks\": [...]}}`). Otherwise include both \
        objects inline in your JSON response.\n\n\
        {output_suffix}",
        output_suffix = build_output_suffix(
            "phase_plan` and `task_queue",
            "{\n  \"phase_plan\": {\"schema_version\": 1, \"phases\": [\n    {\"id\": \"phase-1\", \"name\": \"...\", \"depends_on\": [], \"branch\": \"feature/phase-1\", \"acceptance_criteria\": [\"...\"]}\n  ]},\n  \"task_queue\": {\"schema_version\": 1, \"tasks\": [\n    {\"id\": \"phase-1-impl\", \"type\": \"implement\", \"phase_id\": \"phase-1\"}\n  ]}\n}",
        ),
    )
}

/// Build the prompt for a `plan_impl` step: produce an implementation plan
/// whose `files_to_change` ∪ `new_files` becomes the implement step's
/// allowlist.
pub fn build_plan_impl_prompt(
    task: &Task,
    phase: &Phase,
    prd_text: &str,
    expansion_request: Option<&ExpansionRequest>,
) -> String {
    let mut sections = vec![build_preamble(task, phase, prd_text)];

    sections.push(
        "## Task\n\n\
        Produce an implementation plan for this phase. List every file you intend to change \
        (`files_to_change`) and every file you intend to create (`new_files`) — together these \
        become the allowlist the implement step is bound to; anything not listed here cannot be \
        touched later without another planning pass. Include either a `technical_approach` \
        paragraph or an ordered `steps` list, plus a `spec_summary` restating the phase's \
        acceptance criteria in your own words."
            .to_string(),
    );

    if let Some(req) = expansion_request {
        if !req.paths.is_empty() {
            sections.push(format!(
                "## Allowlist Expansion Required\n\n\
                A previous attempt touched files outside the plan's allowlist, or a test failure \
                implicated files the plan did not cover. Your new plan's `files_to_change` ∪ \
                `new_files` MUST include every one of these paths:\n\n{}",
                bullet_list(&req.paths)
            ));
        }
    }

    sections.push(build_output_suffix(
        "impl_plan",
        "{\n  \"impl_plan\": {\n    \"phase_id\": \"phase-1\",\n    \"files_to_change\": [\"src/foo.rs\"],\n    \"new_files\": [],\n    \"technical_approach\": \"...\",\n    \"steps\": [\"...\"],\n    \"spec_summary\": [\"...\"]\n  }\n}",
    ));

    sections.join("\n\n")
}

/// Build the prompt for an `implement` step. `task.mode` determines which
/// extra context section, if any, is appended: a fresh implement run gets
/// only the plan, while fix_tests/address_review/expand_allowlist runs get
/// the relevant failure context appended.
pub fn build_implement_prompt(
    task: &Task,
    phase: &Phase,
    prd_text: &str,
    plan: Option<&ImplementationPlan>,
    diff_text: &str,
) -> String {
    let mut sections = vec![build_preamble(task, phase, prd_text)];

    if let Some(plan) = plan {
        sections.push(format!(
            "## Implementation Plan\n\n\
            **Allowed files:** {}\n\n\
            **Approach:** {}\n\n\
            **Steps:**\n{}",
            bullet_list(&plan.allowlist()),
            plan.technical_approach.as_deref().unwrap_or("(see steps)"),
            bullet_list(&plan.steps),
        ));
    }

    match task.mode {
        Some(crate::types::PromptMode::FixTests) => {
            if let Some(v) = &task.last_verification {
                sections.push(format!(
                    "## Failing Verification\n\n\
                    The last run of `{}` exited {} with this output:\n\n```\n{}\n```\n\n\
                    Fix the failing tests without expanding scope beyond the allowed files above.",
                    v.command, v.exit_code, v.log_tail,
                ));
            }
        }
        Some(crate::types::PromptMode::AddressReview) => {
            sections.push(format!(
                "## Review Blockers\n\n\
                The reviewer flagged the following blocking issues. Address each one:\n\n{}",
                format_review_issues(&task.review_blockers),
            ));
        }
        Some(crate::types::PromptMode::ExpandAllowlist) => {
            sections.push(
                "## Note\n\nA new plan with an expanded allowlist has just been accepted. Proceed \
                with the implementation using the allowed files listed above."
                    .to_string(),
            );
        }
        _ => {}
    }

    if !diff_text.trim().is_empty() {
        sections.push(format!("## Current Diff\n\n```diff\n{}\n```", excerpt(diff_text, 4000)));
    }

    sections.push(build_output_suffix(
        "patch",
        "{\n  \"patch\": \"diff --git a/src/foo.rs b/src/foo.rs\\n...\"\n}",
    ));
    sections.push(
        "Agentic workers: apply the change directly to the working tree instead of returning a \
        patch string."
            .to_string(),
    );

    sections.join("\n\n")
}

/// Build the prompt for a `review` step.
#[allow(clippy::too_many_arguments)]
pub fn build_review_prompt(
    task: &Task,
    phase: &Phase,
    prd_text: &str,
    plan: Option<&ImplementationPlan>,
    diff_text: &str,
    diff_stat: &str,
    status_porcelain: &str,
    min_evidence_items: u32,
) -> String {
    let mut sections = vec![build_preamble(task, phase, prd_text)];

    if let Some(plan) = plan {
        sections.push(format!(
            "## Implementation Plan\n\n{}",
            plan.technical_approach.as_deref().unwrap_or("(no technical approach recorded)"),
        ));
    }

    sections.push(format!(
        "## Diffstat\n\n```\n{}\n```\n\n## Status\n\n```\n{}\n```\n\n## Diff\n\n```diff\n{}\n```",
        excerpt(diff_stat, 2000),
        excerpt(status_porcelain, 2000),
        excerpt(diff_text, 8000),
    ));

    sections.push(format!(
        "## Task\n\n\
        Review this diff against the phase's acceptance criteria and the PRD. Flag anything \
        incorrect, incomplete, or risky as an issue with `severity` ∈ {{critical, high, medium, \
        low}}, a `summary`, a `rationale`, the implicated `files`, and a `suggested_fix`. Set \
        `mergeable` to true only if there is nothing of critical or high severity. Provide at \
        least {min_evidence_items} concrete evidence items tied to files or diff hunks. If the PRD \
        content above is empty, you must raise a critical or high issue that says so explicitly.",
    ));

    sections.push(build_output_suffix(
        "review",
        "{\n  \"review\": {\n    \"phase_id\": \"phase-1\",\n    \"mergeable\": true,\n    \"issues\": [],\n    \"evidence_count\": 2\n  }\n}",
    ));

    sections.join("\n\n")
}

// --- shared helpers ---

fn build_preamble(task: &Task, phase: &Phase, prd_text: &str) -> String {
    let mut preamble = format!(
        "# Autonomous Implementation Worker\n\n\
        You are running autonomously as part of an unattended phase pipeline. No human is \
        available for questions — use your best judgment and proceed.\n\n\
        ## Task\n\n\
        - **ID:** {task_id}\n\
        - **Phase:** {phase_id} — {phase_name}\n\
        - **Branch:** {branch}\n\
        - **Step:** {step}",
        task_id = task.id,
        phase_id = phase.id,
        phase_name = phase.name,
        branch = phase.branch,
        step = task.step,
    );

    if !phase.acceptance_criteria.is_empty() {
        preamble.push_str(&format!(
            "\n\n## Acceptance Criteria\n\n{}",
            bullet_list(&phase.acceptance_criteria)
        ));
    }

    let prd = excerpt(prd_text, PRD_EXCERPT_CHARS);
    if !prd.trim().is_empty() {
        preamble.push_str(&format!("\n\n## PRD\n\n{prd}"));
    }

    preamble
}

fn build_output_suffix(field_hint: &str, schema_example: &str) -> String {
    format!(
        "## Structured Output\n\n\
        Return a single JSON object on stdout (or write it to the artifact file named in your \
        run instructions) containing the `{field_hint}` field shown below. The JSON must be valid \
        — no comments, no trailing commas. If you are blocked on a decision only a human can make, \
        instead return `{{\"human_blocking_issues\": [\"...\"], \"human_next_steps\": [\"...\"]}}`.\n\n\
        ```json\n{schema_example}\n```",
    )
}

fn bullet_list(items: &[String]) -> String {
    if items.is_empty() {
        "(none)".to_string()
    } else {
        items.iter().map(|s| format!("- {s}")).collect::<Vec<_>>().join("\n")
    }
}

fn format_review_issues(issues: &[ReviewIssue]) -> String {
    if issues.is_empty() {
        return "(none recorded)".to_string();
    }
    issues
        .iter()
        .map(|i| {
            format!(
                "- **{:?}** ({}): {} — {}",
                i.severity,
                i.files.join(", "),
                i.summary,
                i.suggested_fix
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn excerpt(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        text.to_string()
    } else {
        let head: String = text.chars().take(max_chars).collect();
        format!("{head}\n... [truncated]")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Lifecycle, PromptMode, Step, VerificationSnapshot};

    fn phase() -> Phase {
        Phase {
            id: "phase-1".into(),
            name: "Add widgets".into(),
            depends_on: vec![],
            branch: "feature/phase-1".into(),
            acceptance_criteria: vec!["widgets render".into()],
        }
    }

    fn task(step: Step) -> Task {
        let mut t = Task::new_implement("phase-1-impl", "phase-1", 0);
        t.step = step;
        t.lifecycle = Lifecycle::Running;
        t
    }

    #[test]
    fn plan_impl_prompt_includes_expansion_paths() {
        let t = task(Step::PlanImpl);
        let req = ExpansionRequest { paths: vec!["src/rogue.rs".into()] };
        let prompt = build_plan_impl_prompt(&t, &phase(), "PRD text", Some(&req));
        assert!(prompt.contains("src/rogue.rs"));
        assert!(prompt.contains("impl_plan"));
    }

    #[test]
    fn implement_prompt_includes_fix_tests_context() {
        let mut t = task(Step::Implement);
        t.mode = Some(PromptMode::FixTests);
        t.last_verification = Some(VerificationSnapshot {
            command: "pytest".into(),
            exit_code: 1,
            log_tail: "FAILED tests/test_x.py".into(),
            captured_at: "2026-01-01T00:00:00Z".into(),
        });
        let plan = ImplementationPlan {
            phase_id: "phase-1".into(),
            files_to_change: vec!["src/x.rs".into()],
            ..Default::default()
        };
        let prompt = build_implement_prompt(&t, &phase(), "", Some(&plan), "");
        assert!(prompt.contains("Failing Verification"));
        assert!(prompt.contains("FAILED tests/test_x.py"));
    }

    #[test]
    fn review_prompt_states_minimum_evidence() {
        let t = task(Step::Review);
        let prompt = build_review_prompt(&t, &phase(), "", None, "", "", "", 2);
        assert!(prompt.contains("at least 2 concrete evidence items"));
    }

    #[test]
    fn plan_prompt_describes_both_artifacts() {
        let prompt = build_plan_prompt("Build a widget store.");
        assert!(prompt.contains("phase_plan.json"));
        assert!(prompt.contains("task_queue.json"));
    }
}
