use taskforge::prompt::{build_implement_prompt, build_plan_impl_prompt, build_plan_prompt, build_review_prompt};
use taskforge::types::{
    ExpansionRequest, ImplementationPlan, Lifecycle, Phase, PromptMode, ReviewIssue, Severity, Step, Task,
    VerificationSnapshot,
};

fn phase() -> Phase {
    Phase {
        id: "phase-1".into(),
        name: "Add widgets".into(),
        depends_on: vec![],
        branch: "feature/phase-1".into(),
        acceptance_criteria: vec!["widgets render on the dashboard".into()],
    }
}

fn task(step: Step) -> Task {
    let mut t = Task::new_implement("phase-1-impl", "phase-1", 0);
    t.step = step;
    t.lifecycle = Lifecycle::Running;
    t
}

#[test]
fn plan_prompt_carries_the_prd_and_asks_for_both_artifacts() {
    let prompt = build_plan_prompt("Build a dashboard with widgets.");
    assert!(prompt.contains("Build a dashboard with widgets."));
    assert!(prompt.contains("phase_plan"));
    assert!(prompt.contains("task_queue"));
}

#[test]
fn plan_prompt_excerpts_an_overlong_prd() {
    let long_prd = "x".repeat(10_000);
    let prompt = build_plan_prompt(&long_prd);
    assert!(prompt.contains("[truncated]"));
}

#[test]
fn plan_impl_prompt_names_the_phase_and_acceptance_criteria() {
    let prompt = build_plan_impl_prompt(&task(Step::PlanImpl), &phase(), "PRD text", None);
    assert!(prompt.contains("Add widgets"));
    assert!(prompt.contains("widgets render on the dashboard"));
    assert!(prompt.contains("impl_plan"));
}

#[test]
fn plan_impl_prompt_surfaces_required_expansion_paths() {
    let req = ExpansionRequest { paths: vec!["src/rogue.rs".into()] };
    let prompt = build_plan_impl_prompt(&task(Step::PlanImpl), &phase(), "PRD text", Some(&req));
    assert!(prompt.contains("Allowlist Expansion Required"));
    assert!(prompt.contains("src/rogue.rs"));
}

#[test]
fn plan_impl_prompt_omits_expansion_section_when_request_is_empty() {
    let req = ExpansionRequest::default();
    let prompt = build_plan_impl_prompt(&task(Step::PlanImpl), &phase(), "PRD text", Some(&req));
    assert!(!prompt.contains("Allowlist Expansion Required"));
}

#[test]
fn implement_prompt_lists_the_plans_allowlist() {
    let plan = ImplementationPlan {
        phase_id: "phase-1".into(),
        files_to_change: vec!["src/widget.rs".into()],
        new_files: vec!["src/widget_tests.rs".into()],
        technical_approach: Some("Add a Widget struct".into()),
        ..Default::default()
    };
    let prompt = build_implement_prompt(&task(Step::Implement), &phase(), "", Some(&plan), "");
    assert!(prompt.contains("src/widget.rs"));
    assert!(prompt.contains("src/widget_tests.rs"));
    assert!(prompt.contains("README.md"));
    assert!(prompt.contains("Add a Widget struct"));
}

#[test]
fn implement_prompt_in_fix_tests_mode_includes_the_failing_log_tail() {
    let mut t = task(Step::Implement);
    t.mode = Some(PromptMode::FixTests);
    t.last_verification = Some(VerificationSnapshot {
        command: "cargo test".into(),
        exit_code: 1,
        log_tail: "FAILED widget::tests::renders".into(),
        captured_at: "2026-01-01T00:00:00Z".into(),
    });
    let prompt = build_implement_prompt(&t, &phase(), "", None, "");
    assert!(prompt.contains("Failing Verification"));
    assert!(prompt.contains("FAILED widget::tests::renders"));
}

#[test]
fn implement_prompt_in_address_review_mode_lists_blocking_issues() {
    let mut t = task(Step::Implement);
    t.mode = Some(PromptMode::AddressReview);
    t.review_blockers = vec![ReviewIssue {
        severity: Severity::Critical,
        summary: "missing null check".into(),
        ..Default::default()
    }];
    let prompt = build_implement_prompt(&t, &phase(), "", None, "");
    assert!(prompt.contains("Review Blockers"));
    assert!(prompt.contains("missing null check"));
}

#[test]
fn implement_prompt_includes_the_current_diff_when_present() {
    let prompt = build_implement_prompt(
        &task(Step::Implement),
        &phase(),
        "",
        None,
        "diff --git a/src/widget.rs b/src/widget.rs\n+struct Widget;",
    );
    assert!(prompt.contains("Current Diff"));
    assert!(prompt.contains("struct Widget;"));
}

#[test]
fn review_prompt_requests_the_configured_minimum_evidence_count() {
    let prompt = build_review_prompt(
        &task(Step::Review),
        &phase(),
        "PRD text",
        None,
        "diff --git a/src/widget.rs b/src/widget.rs",
        "1 file changed, 4 insertions(+)",
        "M src/widget.rs",
        3,
    );
    assert!(prompt.contains("at least 3 concrete evidence items"));
    assert!(prompt.contains("1 file changed, 4 insertions(+)"));
}

#[test]
fn review_prompt_demands_a_blocking_issue_for_an_empty_prd() {
    let prompt = build_review_prompt(&task(Step::Review), &phase(), "", None, "", "", "", 2);
    assert!(prompt.contains("must raise a critical or high issue"));
}
