use taskforge::types::*;

#[test]
fn lifecycle_displays_snake_case() {
    assert_eq!(Lifecycle::WaitingHuman.to_string(), "waiting_human");
    assert_eq!(Lifecycle::Ready.to_string(), "ready");
}

#[test]
fn step_displays_snake_case() {
    assert_eq!(Step::PlanImpl.to_string(), "plan_impl");
    assert_eq!(Step::Commit.to_string(), "commit");
}

#[test]
fn attempt_caps_default_matches_spec_budget() {
    let caps = AttemptCaps::default();
    assert_eq!(caps.worker, 3);
    assert_eq!(caps.plan, 3);
    assert_eq!(caps.review_gen, 2);
    assert_eq!(caps.allowlist_expansion, 2);
}

#[test]
fn new_plan_task_starts_ready_at_plan_impl() {
    let task = Task::new_plan("plan", 0);
    assert_eq!(task.task_type, TaskType::Plan);
    assert_eq!(task.lifecycle, Lifecycle::Ready);
    assert_eq!(task.step, Step::PlanImpl);
    assert_eq!(task.mode, Some(PromptMode::Implement));
    assert!(task.phase_id.is_none());
    assert!(task.depends_on.is_empty());
}

#[test]
fn new_implement_task_is_scoped_to_a_phase() {
    let task = Task::new_implement("impl-1", "phase-1", 3);
    assert_eq!(task.task_type, TaskType::Implement);
    assert_eq!(task.phase_id, Some("phase-1".to_string()));
    assert_eq!(task.created_order, 3);
}

#[test]
fn capture_blocked_intent_snapshots_step_and_mode() {
    let mut task = Task::new_implement("t", "p", 0);
    task.step = Step::Review;
    task.mode = Some(PromptMode::AddressReview);
    task.capture_blocked_intent();

    let intent = task.blocked_intent.expect("intent captured");
    assert_eq!(intent.step, Step::Review);
    assert_eq!(intent.mode, Some(PromptMode::AddressReview));
}

#[test]
fn allowlist_always_includes_readme_exactly_once() {
    let mut plan = ImplementationPlan::default();
    plan.files_to_change = vec!["src/lib.rs".to_string(), "README.md".to_string()];
    plan.new_files = vec!["src/new.rs".to_string()];

    let allowlist = plan.allowlist();
    assert_eq!(
        allowlist,
        vec!["README.md".to_string(), "src/lib.rs".to_string(), "src/new.rs".to_string()]
    );
}

#[test]
fn allowlist_with_only_readme_is_trivial() {
    let plan = ImplementationPlan::default();
    assert!(!plan.has_nontrivial_allowlist());

    let mut nontrivial = ImplementationPlan::default();
    nontrivial.new_files.push("src/feature.rs".to_string());
    assert!(nontrivial.has_nontrivial_allowlist());
}

#[test]
fn severity_blocking_is_critical_and_high_only() {
    assert!(Severity::Critical.is_blocking());
    assert!(Severity::High.is_blocking());
    assert!(!Severity::Medium.is_blocking());
    assert!(!Severity::Low.is_blocking());
}

#[test]
fn review_artifact_reports_blocking_issues() {
    let artifact = ReviewArtifact {
        phase_id: "phase-1".to_string(),
        mergeable: false,
        issues: vec![
            ReviewIssue { severity: Severity::Low, summary: "nit".to_string(), ..Default::default() },
            ReviewIssue { severity: Severity::Critical, summary: "bug".to_string(), ..Default::default() },
        ],
        evidence_count: 2,
    };

    assert!(artifact.has_blocking());
    assert_eq!(artifact.blocking_issues().len(), 1);
    assert_eq!(artifact.blocking_issues()[0].summary, "bug");
}

#[test]
fn run_state_defaults_to_idle_with_no_active_task() {
    let state = RunState::default();
    assert_eq!(state.status, RunStatus::Idle);
    assert!(state.current_task_id.is_none());
    assert!(state.coordinator_pid.is_none());
}

#[test]
fn task_queue_round_trips_through_yaml() {
    let mut queue = TaskQueue::default();
    queue.tasks.push(Task::new_plan("plan", 0));
    queue.next_task_ordinal = 1;

    let yaml = serde_yaml_ng::to_string(&queue).expect("serialize");
    let restored: TaskQueue = serde_yaml_ng::from_str(&yaml).expect("deserialize");
    assert_eq!(restored.tasks.len(), 1);
    assert_eq!(restored.tasks[0].id, "plan");
    assert_eq!(restored.next_task_ordinal, 1);
}

#[test]
fn event_tags_are_distinguishable_after_a_round_trip() {
    let event = Event::WorkerFailed {
        error_kind: ErrorKind::NoProgress,
        message: "no diff produced".to_string(),
    };
    let json = serde_json::to_string(&event).expect("serialize");
    assert!(json.contains("\"kind\":\"worker_failed\""));

    let restored: Event = serde_json::from_str(&json).expect("deserialize");
    match restored {
        Event::WorkerFailed { error_kind, message } => {
            assert_eq!(error_kind, ErrorKind::NoProgress);
            assert_eq!(message, "no diff produced");
        }
        other => panic!("unexpected event variant: {other:?}"),
    }
}
