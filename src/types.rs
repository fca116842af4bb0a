use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle of a task. See `SPEC_FULL.md` §3.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Lifecycle {
    Ready,
    Running,
    WaitingHuman,
    Done,
    Cancelled,
}

impl fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Lifecycle::Ready => "ready",
            Lifecycle::Running => "running",
            Lifecycle::WaitingHuman => "waiting_human",
            Lifecycle::Done => "done",
            Lifecycle::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// A task's current step within the plan/implement/verify/review/commit lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    PlanImpl,
    Implement,
    Verify,
    Review,
    Commit,
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Step::PlanImpl => "plan_impl",
            Step::Implement => "implement",
            Step::Verify => "verify",
            Step::Review => "review",
            Step::Commit => "commit",
        };
        f.write_str(s)
    }
}

/// Why the implement step is running this time. Informs prompt construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromptMode {
    Implement,
    FixTests,
    AddressReview,
    ExpandAllowlist,
}

impl fmt::Display for PromptMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PromptMode::Implement => "implement",
            PromptMode::FixTests => "fix_tests",
            PromptMode::AddressReview => "address_review",
            PromptMode::ExpandAllowlist => "expand_allowlist",
        };
        f.write_str(s)
    }
}

/// Worker provider tag. The dispatcher branches on this rather than using
/// dynamic dispatch (SPEC_FULL.md §9).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WorkerKind {
    #[default]
    CodexSubprocess,
    OllamaHttp,
}

/// Structured block reason attached to a `waiting_human` task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BlockReason {
    AllowlistExpansionExhausted,
    PlanStuck,
    TestsStuck,
    ReviewStuck,
    ReviewInvalid,
    NoProgress,
    GitPushFailed,
    GitCheckoutFailed,
    HumanRequired,
    PlanMissing,
    MaxIterationsExceeded,
}

/// Event-level error tag (§7). Not an exception type — every subsystem
/// returns one of these instead of throwing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    WorkerExit,
    HeartbeatTimeout,
    ShiftTimeout,
    PatchApplyFailed,
    OutputParseFailed,
    InvalidReview,
    PlanInvalid,
    AllowlistViolation,
    NoProgress,
    TestsFailed,
    TestTimeout,
    ReviewBlockers,
    GitCheckoutFailed,
    GitPushFailed,
    BlockingIssues,
    PlanMissing,
    ActionException,
}

/// Per-dimension attempt counters. A successful step resets exactly one of
/// these to zero; every other counter is left untouched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptCounters {
    pub worker: u32,
    pub plan: u32,
    pub no_progress: u32,
    pub test_fail: u32,
    pub review_gen: u32,
    pub review_fix: u32,
    pub allowlist_expansion: u32,
}

/// Caps for each attempt dimension. Configuration-level (see `config.rs`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AttemptCaps {
    pub worker: u32,
    pub plan: u32,
    pub no_progress: u32,
    pub test_fail: u32,
    pub review_gen: u32,
    pub review_fix: u32,
    pub allowlist_expansion: u32,
}

impl Default for AttemptCaps {
    fn default() -> Self {
        Self {
            worker: 3,
            plan: 3,
            no_progress: 3,
            test_fail: 3,
            review_gen: 2,
            review_fix: 2,
            allowlist_expansion: 2,
        }
    }
}

/// Snapshot of step + mode captured the instant a task transitions to
/// `waiting_human`, so manual/auto-resume can restore it exactly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockedIntent {
    pub step: Step,
    pub mode: Option<PromptMode>,
}

/// Bounded snapshot of the most recent verification run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationSnapshot {
    pub command: String,
    pub exit_code: i32,
    pub log_tail: String,
    pub captured_at: String,
}

/// A pending request to widen the allowlist, produced by an `AllowlistViolation`
/// or a verify failure with `needs_allowlist_expansion=true`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpansionRequest {
    pub paths: Vec<String>,
}

/// The primary unit of work (SPEC_FULL.md §3).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    #[serde(rename = "type")]
    pub task_type: TaskType,
    pub phase_id: Option<String>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    pub lifecycle: Lifecycle,
    pub step: Step,
    pub mode: Option<PromptMode>,
    #[serde(default)]
    pub attempts: AttemptCounters,
    pub last_error: Option<String>,
    pub last_error_kind: Option<ErrorKind>,
    pub last_verification: Option<VerificationSnapshot>,
    pub plan_path: Option<String>,
    pub plan_hash: Option<String>,
    #[serde(default)]
    pub review_blockers: Vec<ReviewIssue>,
    pub blocked_intent: Option<BlockedIntent>,
    pub block_reason: Option<BlockReason>,
    pub branch: Option<String>,
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
    pub test_command: Option<String>,
    pub expansion_request: Option<ExpansionRequest>,
    #[serde(default)]
    pub human_blocking_issues: Vec<String>,
    pub created_order: u64,
    #[serde(default)]
    pub priority: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Plan,
    Implement,
}

impl Task {
    pub fn new_plan(id: impl Into<String>, created_order: u64) -> Self {
        Self {
            id: id.into(),
            task_type: TaskType::Plan,
            phase_id: None,
            depends_on: Vec::new(),
            lifecycle: Lifecycle::Ready,
            step: Step::PlanImpl,
            mode: Some(PromptMode::Implement),
            attempts: AttemptCounters::default(),
            last_error: None,
            last_error_kind: None,
            last_verification: None,
            plan_path: None,
            plan_hash: None,
            review_blockers: Vec::new(),
            blocked_intent: None,
            block_reason: None,
            branch: None,
            acceptance_criteria: Vec::new(),
            test_command: None,
            expansion_request: None,
            human_blocking_issues: Vec::new(),
            created_order,
            priority: 0,
        }
    }

    pub fn new_implement(
        id: impl Into<String>,
        phase_id: impl Into<String>,
        created_order: u64,
    ) -> Self {
        Self {
            id: id.into(),
            task_type: TaskType::Implement,
            phase_id: Some(phase_id.into()),
            depends_on: Vec::new(),
            lifecycle: Lifecycle::Ready,
            step: Step::PlanImpl,
            mode: Some(PromptMode::Implement),
            attempts: AttemptCounters::default(),
            last_error: None,
            last_error_kind: None,
            last_verification: None,
            plan_path: None,
            plan_hash: None,
            review_blockers: Vec::new(),
            blocked_intent: None,
            block_reason: None,
            branch: None,
            acceptance_criteria: Vec::new(),
            test_command: None,
            expansion_request: None,
            human_blocking_issues: Vec::new(),
            created_order,
            priority: 0,
        }
    }

    pub fn capture_blocked_intent(&mut self) {
        self.blocked_intent = Some(BlockedIntent {
            step: self.step,
            mode: self.mode,
        });
    }
}

/// A dependency-scoped group of related tasks sharing a branch and test command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Phase {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
    pub branch: String,
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
}

/// Derived, not stored: a phase's status follows its task(s).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseStatus {
    Pending,
    Running,
    Blocked,
    Done,
}

/// The worker-produced contract for a phase (§3). `files_to_change` ∪
/// `new_files` form the allowlist for the subsequent implement step.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImplementationPlan {
    pub phase_id: String,
    #[serde(default)]
    pub files_to_change: Vec<String>,
    #[serde(default)]
    pub new_files: Vec<String>,
    pub technical_approach: Option<String>,
    #[serde(default)]
    pub steps: Vec<String>,
    #[serde(default)]
    pub spec_summary: Vec<String>,
}

impl ImplementationPlan {
    /// The set of paths an implement worker may modify: `files_to_change` ∪
    /// `new_files` ∪ `{README.md}`.
    pub fn allowlist(&self) -> Vec<String> {
        let mut set: Vec<String> = self
            .files_to_change
            .iter()
            .chain(self.new_files.iter())
            .cloned()
            .collect();
        if !set.iter().any(|p| p == "README.md") {
            set.push("README.md".to_string());
        }
        set.sort();
        set.dedup();
        set
    }

    /// An allowlist is "trivial" when it carries nothing beyond the
    /// always-allowed `README.md` entry and blanks.
    pub fn has_nontrivial_allowlist(&self) -> bool {
        self.files_to_change
            .iter()
            .chain(self.new_files.iter())
            .any(|p| !p.trim().is_empty() && p != "README.md")
    }
}

/// Result of a verification run (§4.4).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VerificationResult {
    pub command: String,
    pub exit_code: i32,
    pub log_path: String,
    pub passed: bool,
    pub failing_paths: Vec<String>,
    pub needs_allowlist_expansion: bool,
    #[serde(default)]
    pub log_tail: String,
    #[serde(default)]
    pub captured_at: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Critical,
    High,
    Medium,
    #[default]
    Low,
}

impl Severity {
    pub fn is_blocking(self) -> bool {
        matches!(self, Severity::Critical | Severity::High)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReviewIssue {
    pub severity: Severity,
    pub summary: String,
    #[serde(default)]
    pub rationale: String,
    #[serde(default)]
    pub files: Vec<String>,
    #[serde(default)]
    pub suggested_fix: String,
}

/// Worker-produced review output (§3). `mergeable` is explicit, not inferred
/// solely from the absence of blocking issues, to allow a worker to flag a
/// merge-blocking non-severity concern.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReviewArtifact {
    pub phase_id: String,
    pub mergeable: bool,
    #[serde(default)]
    pub issues: Vec<ReviewIssue>,
    #[serde(default)]
    pub evidence_count: u32,
}

impl ReviewArtifact {
    pub fn blocking_issues(&self) -> Vec<&ReviewIssue> {
        self.issues.iter().filter(|i| i.severity.is_blocking()).collect()
    }

    pub fn has_blocking(&self) -> bool {
        self.issues.iter().any(|i| i.severity.is_blocking())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Idle,
    Running,
    Blocked,
}

/// Singleton run state (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunState {
    pub status: RunStatus,
    pub current_task_id: Option<String>,
    pub current_phase_id: Option<String>,
    pub current_run_id: Option<String>,
    pub last_run_id: Option<String>,
    pub coordinator_pid: Option<u32>,
    pub last_heartbeat: Option<String>,
    pub prd_path: Option<String>,
    pub prd_content_hash: Option<String>,
}

impl Default for RunState {
    fn default() -> Self {
        Self {
            status: RunStatus::Idle,
            current_task_id: None,
            current_phase_id: None,
            current_run_id: None,
            last_run_id: None,
            coordinator_pid: None,
            last_heartbeat: None,
            prd_path: None,
            prd_content_hash: None,
        }
    }
}

/// Event produced by a subsystem and folded through the FSM (§4.6).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Event {
    WorkerSucceeded {
        step: Step,
        plan_valid: Option<bool>,
        introduced_changes: Vec<String>,
        plan: Option<ImplementationPlan>,
        commit_summary: Option<String>,
    },
    NoIntroducedChanges {
        repo_dirty: bool,
    },
    AllowlistViolation {
        disallowed_paths: Vec<String>,
    },
    VerificationResult {
        result: VerificationResult,
    },
    ReviewResultEvent {
        review: ReviewArtifact,
        valid: bool,
    },
    CommitResult {
        ok: bool,
        sha: Option<String>,
        error: Option<String>,
    },
    WorkerFailed {
        error_kind: ErrorKind,
        message: String,
    },
    ProgressHumanBlockers {
        issues: Vec<String>,
    },
}

/// Top-level container persisted as `task_queue.yaml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskQueue {
    pub schema_version: u32,
    pub tasks: Vec<Task>,
    pub next_task_ordinal: u64,
}

/// Top-level container persisted as `phase_plan.yaml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PhasePlan {
    pub schema_version: u32,
    pub phases: Vec<Phase>,
}

/// Summary written to `runner_blocked.json` when the orchestrator halts on
/// blocking issues.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerBlockedReport {
    pub blocked_task_ids: Vec<String>,
    pub reasons: HashMap<String, String>,
    pub generated_at: String,
}
