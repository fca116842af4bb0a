//! Phase Executor (§4.7): drives a single phase's task(s) through dispatch,
//! interpretation, verification, and git coordination, folding every outcome
//! through [`crate::fsm::reduce`] until the task reaches `done` or
//! `waiting_human`, or an iteration safety cap is exceeded.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use crate::agent::{self, CodexSubprocessDispatcher, DispatchOutcome, MockWorkerDispatcher, OllamaHttpDispatcher, WorkerDispatcher};
use crate::config::RunnerConfig;
use crate::fsm;
use crate::git::{self, GitCoordinator};
use crate::interpret::{self, ChangeMode};
use crate::prompt;
use crate::store::StateStore;
use crate::types::{
    BlockReason, Event, ImplementationPlan, Lifecycle, Phase, ReviewArtifact, Step, Task, TaskType,
};
use crate::{log_info, log_warn};

/// Tags the worker implementation a [`PhaseExecutor`] dispatches to. A plain
/// `Box<dyn WorkerDispatcher>` isn't an option: `WorkerDispatcher::dispatch`
/// returns `impl Future`, which is not object-safe (§9).
pub enum Worker {
    Codex(CodexSubprocessDispatcher),
    Ollama(OllamaHttpDispatcher),
    Mock(MockWorkerDispatcher, bool),
}

impl Worker {
    #[allow(clippy::too_many_arguments)]
    pub async fn dispatch(
        &self,
        prompt: &str,
        run_id: &str,
        run_dir: &Path,
        progress_path: &Path,
        timeout: Duration,
        heartbeat_seconds: u64,
        heartbeat_grace_seconds: u64,
    ) -> Result<DispatchOutcome, String> {
        match self {
            Worker::Codex(d) => {
                d.dispatch(prompt, run_id, run_dir, progress_path, timeout, heartbeat_seconds, heartbeat_grace_seconds)
                    .await
            }
            Worker::Ollama(d) => {
                d.dispatch(prompt, run_id, run_dir, progress_path, timeout, heartbeat_seconds, heartbeat_grace_seconds)
                    .await
            }
            Worker::Mock(d, _) => {
                d.dispatch(prompt, run_id, run_dir, progress_path, timeout, heartbeat_seconds, heartbeat_grace_seconds)
                    .await
            }
        }
    }

    /// Agentic workers write repository changes and structured output
    /// directly; non-agentic workers return everything inline and must be
    /// interpreted from `response_text`.
    fn is_agentic(&self) -> bool {
        match self {
            Worker::Codex(_) => true,
            Worker::Ollama(_) => false,
            Worker::Mock(_, is_agentic) => *is_agentic,
        }
    }
}

/// Outcome of driving one task to a terminal state.
pub struct PhaseResult {
    pub phase_id: String,
    pub success: bool,
    pub error: Option<String>,
}

/// Drives the tasks of one phase, sequentially, to completion. Mirrors the
/// original's `phase_executor.execute_phase`: the first task that ends in
/// `waiting_human` or error stops the phase early.
pub struct PhaseExecutor {
    pub store: Arc<StateStore>,
    pub git: GitCoordinator,
    pub worker: Worker,
    pub config: RunnerConfig,
    pub project_dir: PathBuf,
}

enum Loaded {
    Terminal(bool, Option<String>),
    Ready(Task),
}

impl PhaseExecutor {
    pub fn new(
        store: Arc<StateStore>,
        git: GitCoordinator,
        worker: Worker,
        config: RunnerConfig,
        project_dir: PathBuf,
    ) -> Self {
        Self { store, git, worker, config, project_dir }
    }

    pub async fn execute_phase(&self, phase_id: &str) -> PhaseResult {
        let task_ids: Vec<String> = match self.store.read_task_queue() {
            Ok(q) => q
                .tasks
                .iter()
                .filter(|t| t.phase_id.as_deref() == Some(phase_id))
                .map(|t| t.id.clone())
                .collect(),
            Err(e) => {
                return PhaseResult { phase_id: phase_id.to_string(), success: false, error: Some(e.to_string()) };
            }
        };

        for task_id in task_ids {
            match self.execute_task(&task_id).await {
                Ok((true, _)) => continue,
                Ok((false, error)) => {
                    return PhaseResult { phase_id: phase_id.to_string(), success: false, error };
                }
                Err(e) => {
                    return PhaseResult { phase_id: phase_id.to_string(), success: false, error: Some(e) };
                }
            }
        }

        log_info!("[fsm_executor] phase {} completed", phase_id);
        PhaseResult { phase_id: phase_id.to_string(), success: true, error: None }
    }

    /// Drives a single task through FSM steps until it reaches `done` or
    /// `waiting_human`, or the iteration safety cap is exceeded (§4.7).
    pub async fn execute_task(&self, task_id: &str) -> Result<(bool, Option<String>), String> {
        let max_iterations = self.config.execution.phase_iteration_cap;

        for _ in 0..max_iterations {
            let task = match self.load_and_prepare(task_id)? {
                Loaded::Terminal(done, err) => return Ok((done, err)),
                Loaded::Ready(t) => t,
            };

            if task.task_type == TaskType::Plan {
                return self.execute_plan_task(&task).await;
            }

            let phase_id = task
                .phase_id
                .clone()
                .ok_or_else(|| format!("task {task_id} has no phase_id"))?;

            if let Some(branch) = &task.branch {
                if let Err(e) = self.git.checkout_or_create_branch(&self.project_dir, branch).await {
                    self.block_task(&task.id, BlockReason::GitCheckoutFailed, &e)?;
                    return Ok((false, Some(e)));
                }
            }

            let run_id = self.new_run_id(&task);
            let run_dir = self.store.run_dir(&run_id);
            let progress_path = run_dir.join("progress.json");

            let event = self
                .dispatch_step(&task, &phase_id, &run_id, &run_dir, &progress_path)
                .await;

            self.store
                .append_event(&task.id, &event, Utc::now())
                .map_err(|e| e.to_string())?;

            let (lifecycle, last_error) = self.store.task_queue_transaction(|q| {
                let caps = self.config.attempt_caps;
                if let Some(slot) = q.tasks.iter_mut().find(|t| t.id == task.id) {
                    let next = fsm::reduce(slot, event, &caps);
                    *slot = next;
                    (slot.lifecycle, slot.last_error.clone())
                } else {
                    (Lifecycle::Cancelled, Some(format!("task {} disappeared mid-run", task.id)))
                }
            })?;

            match lifecycle {
                Lifecycle::Done => return Ok((true, None)),
                Lifecycle::WaitingHuman | Lifecycle::Cancelled => return Ok((false, last_error)),
                _ => continue,
            }
        }

        self.block_task(
            task_id,
            BlockReason::MaxIterationsExceeded,
            &format!("exceeded {max_iterations} step transitions without reaching done"),
        )?;
        Ok((false, Some(format!("task {task_id} exceeded its iteration safety cap"))))
    }

    fn load_and_prepare(&self, task_id: &str) -> Result<Loaded, String> {
        self.store
            .task_queue_transaction(|q| {
                let Some(task) = q.tasks.iter_mut().find(|t| t.id == task_id) else {
                    return Loaded::Terminal(false, Some(format!("task {task_id} not found")));
                };
                match task.lifecycle {
                    Lifecycle::Done => Loaded::Terminal(true, None),
                    Lifecycle::WaitingHuman => Loaded::Terminal(false, task.last_error.clone()),
                    Lifecycle::Cancelled => {
                        Loaded::Terminal(false, Some("task cancelled".to_string()))
                    }
                    Lifecycle::Ready | Lifecycle::Running => {
                        task.lifecycle = Lifecycle::Running;
                        Loaded::Ready(task.clone())
                    }
                }
            })
            .map_err(|e| e.to_string())
    }

    fn block_task(&self, task_id: &str, reason: BlockReason, message: &str) -> Result<(), String> {
        self.store
            .task_queue_transaction(|q| {
                if let Some(task) = q.tasks.iter_mut().find(|t| t.id == task_id) {
                    task.capture_blocked_intent();
                    task.lifecycle = Lifecycle::WaitingHuman;
                    task.block_reason = Some(reason);
                    task.last_error = Some(message.to_string());
                }
            })
            .map_err(|e| e.to_string())
    }

    fn new_run_id(&self, task: &Task) -> String {
        format!("{}-{}-{}", task.id, task.step, Utc::now().format("%Y%m%dT%H%M%S%.3f"))
    }

    async fn dispatch_step(
        &self,
        task: &Task,
        phase_id: &str,
        run_id: &str,
        run_dir: &Path,
        progress_path: &Path,
    ) -> Event {
        let result = match task.step {
            Step::Verify => self.run_verify_step(task, run_dir).await,
            Step::Commit => self.run_commit_step(task, phase_id).await,
            Step::PlanImpl | Step::Implement | Step::Review => {
                self.run_worker_step(task, phase_id, run_id, run_dir, progress_path).await
            }
        };

        result.unwrap_or_else(|message| {
            log_warn!("[fsm_executor] step {} failed for {}: {}", task.step, task.id, message);
            Event::WorkerFailed { error_kind: crate::types::ErrorKind::ActionException, message }
        })
    }

    // -- verify ----------------------------------------------------------

    async fn run_verify_step(&self, task: &Task, run_dir: &Path) -> Result<Event, String> {
        let plan = self.load_plan(task)?;
        let allowlist = plan.map(|p| p.allowlist()).unwrap_or_default();
        let test_command = task
            .test_command
            .clone()
            .unwrap_or_else(|| self.config.guardrails.test_command.clone());
        let timeout = Duration::from_secs(self.config.execution.shift_minutes * 60);

        let result = crate::verify::run_verification(
            &self.project_dir,
            run_dir,
            &test_command,
            &allowlist,
            timeout,
            &self.config.project.state_dir,
        )
        .await?;
        Ok(Event::VerificationResult { result })
    }

    fn load_plan(&self, task: &Task) -> Result<Option<ImplementationPlan>, String> {
        match &task.plan_path {
            None => Ok(None),
            Some(path) => {
                let text = std::fs::read_to_string(path).map_err(|e| format!("read plan {path}: {e}"))?;
                serde_json::from_str(&text)
                    .map(Some)
                    .map_err(|e| format!("parse plan {path}: {e}"))
            }
        }
    }

    // -- commit ------------------------------------------------------------

    async fn run_commit_step(&self, task: &Task, phase_id: &str) -> Result<Event, String> {
        let branch = task
            .branch
            .clone()
            .ok_or_else(|| "task has no branch for commit".to_string())?;

        if !git::has_changes(&self.project_dir)? {
            return Ok(Event::CommitResult { ok: true, sha: None, error: None });
        }

        let name = self.phase_name(phase_id).unwrap_or_else(|| phase_id.to_string());
        let message = format!("{phase_id}: {name}");

        match self
            .git
            .commit_all_and_push(&self.project_dir, &self.config.project.state_dir, &branch, &message)
            .await
        {
            Ok(sha) => Ok(Event::CommitResult { ok: true, sha: Some(sha), error: None }),
            Err(e) => Ok(Event::CommitResult { ok: false, sha: None, error: Some(e) }),
        }
    }

    fn phase_name(&self, phase_id: &str) -> Option<String> {
        self.store
            .read_phase_plan()
            .ok()
            .and_then(|p| p.phases.into_iter().find(|ph| ph.id == phase_id).map(|ph| ph.name))
    }

    fn load_phase(&self, phase_id: &str) -> Result<Phase, String> {
        self.store
            .read_phase_plan()
            .map_err(|e| e.to_string())?
            .phases
            .into_iter()
            .find(|p| p.id == phase_id)
            .ok_or_else(|| format!("phase {phase_id} not found in phase plan"))
    }

    fn prd_text(&self) -> String {
        std::fs::read_to_string(self.project_dir.join(&self.config.project.prd_path)).unwrap_or_default()
    }

    // -- plan (seed) task ----------------------------------------------------

    async fn execute_plan_task(&self, task: &Task) -> Result<(bool, Option<String>), String> {
        let caps = self.config.attempt_caps.plan;

        for attempt in 0..caps {
            let run_id = self.new_run_id(task);
            let run_dir = self.store.run_dir(&run_id);
            let progress_path = run_dir.join("progress.json");

            match self.run_plan_worker(&run_id, &run_dir, &progress_path).await {
                Ok((phase_plan, mut new_tasks)) => {
                    self.store.phase_plan_transaction(|p| *p = phase_plan).map_err(|e| e.to_string())?;
                    self.store
                        .task_queue_transaction(|q| {
                            if let Some(t) = q.tasks.iter_mut().find(|t| t.id == task.id) {
                                t.lifecycle = Lifecycle::Done;
                            }
                            q.tasks.append(&mut new_tasks);
                        })
                        .map_err(|e| e.to_string())?;
                    return Ok((true, None));
                }
                Err(e) if attempt + 1 >= caps => {
                    self.block_task(&task.id, BlockReason::PlanMissing, &e)?;
                    return Ok((false, Some(e)));
                }
                Err(e) => {
                    log_warn!("[fsm_executor] plan attempt {} failed for {}: {}", attempt + 1, task.id, e);
                }
            }
        }

        unreachable!("loop always returns before exhausting its bound")
    }

    async fn run_plan_worker(
        &self,
        run_id: &str,
        run_dir: &Path,
        progress_path: &Path,
    ) -> Result<(crate::types::PhasePlan, Vec<Task>), String> {
        let prd_text = self.prd_text();
        let prompt_text = prompt::build_plan_prompt(&prd_text);
        tokio::fs::create_dir_all(run_dir).await.map_err(|e| e.to_string())?;
        tokio::fs::write(run_dir.join("prompt.txt"), &prompt_text).await.ok();

        let timeout = Duration::from_secs(self.config.execution.shift_minutes * 60);
        let outcome = self
            .worker
            .dispatch(
                &prompt_text,
                run_id,
                run_dir,
                progress_path,
                timeout,
                self.config.execution.heartbeat_seconds,
                self.config.execution.heartbeat_grace_seconds,
            )
            .await?;

        if !outcome.succeeded() {
            return Err(format!("plan worker did not succeed (exit_code={})", outcome.exit_code));
        }

        let parsed = if self.worker.is_agentic() {
            None
        } else {
            Some(agent::extract_json(&outcome.response_text).ok_or("plan worker output was not JSON")?)
        };

        let phase_plan_value = self.read_artifact_json(parsed.as_ref(), "phase_plan", run_dir, "phase_plan.json")?;
        let task_queue_value = self.read_artifact_json(parsed.as_ref(), "task_queue", run_dir, "task_queue.json")?;

        let phase_plan: crate::types::PhasePlan =
            serde_json::from_value(phase_plan_value).map_err(|e| format!("invalid phase_plan: {e}"))?;
        let task_queue: crate::types::TaskQueue =
            serde_json::from_value(task_queue_value).map_err(|e| format!("invalid task_queue: {e}"))?;

        if phase_plan.phases.is_empty() {
            return Err("phase_plan must contain at least one phase".to_string());
        }

        Ok((phase_plan, task_queue.tasks))
    }

    // -- worker-dispatched steps: plan_impl, implement, review --------------

    async fn run_worker_step(
        &self,
        task: &Task,
        phase_id: &str,
        run_id: &str,
        run_dir: &Path,
        progress_path: &Path,
    ) -> Result<Event, String> {
        let phase = self.load_phase(phase_id)?;
        let pre_changes = self.git.changed_files(&self.project_dir).await?;
        let repo_dirty_before = !pre_changes.is_empty();

        let prompt_text = self.build_prompt(task, &phase)?;
        tokio::fs::create_dir_all(run_dir).await.map_err(|e| e.to_string())?;
        tokio::fs::write(run_dir.join("prompt.txt"), &prompt_text).await.ok();

        let timeout = Duration::from_secs(self.config.execution.shift_minutes * 60);
        let outcome = self
            .worker
            .dispatch(
                &prompt_text,
                run_id,
                run_dir,
                progress_path,
                timeout,
                self.config.execution.heartbeat_seconds,
                self.config.execution.heartbeat_grace_seconds,
            )
            .await?;

        if self.worker.is_agentic() {
            if let Some(issues) = read_progress_human_blockers(progress_path, run_id) {
                return Ok(Event::ProgressHumanBlockers { issues });
            }
        }

        if !outcome.succeeded() {
            return Ok(classify_failure(&outcome));
        }

        let parsed = if self.worker.is_agentic() {
            None
        } else {
            match agent::extract_json(&outcome.response_text) {
                Some(v) => Some(v),
                None => {
                    return Ok(Event::WorkerFailed {
                        error_kind: crate::types::ErrorKind::OutputParseFailed,
                        message: "worker output did not contain a JSON object".to_string(),
                    });
                }
            }
        };

        if let Some(issues) = parsed.as_ref().and_then(extract_human_blockers) {
            return Ok(Event::ProgressHumanBlockers { issues });
        }

        if task.step == Step::Implement {
            return self
                .interpret_implement(task, parsed, &pre_changes, repo_dirty_before)
                .await;
        }

        // plan_impl / review: the worker must not touch the working tree
        // outside the state directory.
        let post_changes = self.git.changed_files(&self.project_dir).await?;
        let (introduced, _removed) = git::diff_file_sets(&pre_changes, &post_changes);
        let gitignore_ok = git::gitignore_change_is_state_dir_only(&self.project_dir, &self.config.project.state_dir);
        if let Err(outside) =
            interpret::validate_changes_for_mode(&ChangeMode::StateOnly, &introduced, &self.config.project.state_dir, gitignore_ok)
        {
            return Ok(Event::WorkerFailed {
                error_kind: crate::types::ErrorKind::AllowlistViolation,
                message: format!("changes outside the state directory: {}", outside.join(", ")),
            });
        }

        match task.step {
            Step::PlanImpl => self.interpret_plan_impl(task, phase_id, run_dir, parsed.as_ref(), &phase),
            Step::Review => self.interpret_review(task, phase_id, run_dir, parsed.as_ref(), &phase),
            _ => unreachable!("handled above"),
        }
    }

    fn build_prompt(&self, task: &Task, phase: &Phase) -> Result<String, String> {
        let prd_text = self.prd_text();
        match task.step {
            Step::PlanImpl => Ok(prompt::build_plan_impl_prompt(task, phase, &prd_text, task.expansion_request.as_ref())),
            Step::Implement => {
                let plan = self.load_plan(task)?;
                let (diff, _truncated) = git::diff_text(&self.project_dir, 8000).unwrap_or_default();
                Ok(prompt::build_implement_prompt(task, phase, &prd_text, plan.as_ref(), &diff))
            }
            Step::Review => {
                let plan = self.load_plan(task)?;
                let (diff, _) = git::diff_text(&self.project_dir, 12000).unwrap_or_default();
                let (stat, _) = git::diff_stat(&self.project_dir, 4000).unwrap_or_default();
                let (status, _) = git::status_porcelain(&self.project_dir, 4000).unwrap_or_default();
                Ok(prompt::build_review_prompt(
                    task,
                    phase,
                    &prd_text,
                    plan.as_ref(),
                    &diff,
                    &stat,
                    &status,
                    self.config.guardrails.review_min_evidence,
                ))
            }
            other => Err(format!("no prompt builder for step {other}")),
        }
    }

    fn read_artifact_json(
        &self,
        parsed: Option<&serde_json::Value>,
        field: &str,
        run_dir: &Path,
        filename: &str,
    ) -> Result<serde_json::Value, String> {
        if let Some(value) = parsed {
            return value
                .get(field)
                .cloned()
                .ok_or_else(|| format!("worker output missing '{field}' field"));
        }
        let path = run_dir.join(filename);
        let text = std::fs::read_to_string(&path)
            .map_err(|e| format!("agentic worker did not write {}: {e}", path.display()))?;
        serde_json::from_str(&text).map_err(|e| format!("failed to parse {}: {e}", path.display()))
    }

    fn interpret_plan_impl(
        &self,
        task: &Task,
        phase_id: &str,
        run_dir: &Path,
        parsed: Option<&serde_json::Value>,
        phase: &Phase,
    ) -> Result<Event, String> {
        let plan_value = match self.read_artifact_json(parsed, "impl_plan", run_dir, "impl_plan.json") {
            Ok(v) => v,
            Err(e) => {
                log_warn!("[fsm_executor] impl_plan artifact missing for {}: {}", task.id, e);
                return Ok(Event::WorkerSucceeded {
                    step: Step::PlanImpl,
                    plan_valid: Some(false),
                    introduced_changes: vec![],
                    plan: None,
                    commit_summary: None,
                });
            }
        };

        let plan: ImplementationPlan = match serde_json::from_value(plan_value) {
            Ok(p) => p,
            Err(e) => {
                log_warn!("[fsm_executor] impl_plan malformed for {}: {}", task.id, e);
                return Ok(Event::WorkerSucceeded {
                    step: Step::PlanImpl,
                    plan_valid: Some(false),
                    introduced_changes: vec![],
                    plan: None,
                    commit_summary: None,
                });
            }
        };

        match interpret::validate_implementation_plan(&plan, phase, task.expansion_request.as_ref()) {
            Ok(()) => {
                let artifact_path = self.store.artifacts_dir().join(format!("impl_plan_{phase_id}.json"));
                let text = serde_json::to_string_pretty(&plan).map_err(|e| e.to_string())?;
                std::fs::write(&artifact_path, text).map_err(|e| e.to_string())?;
                self.set_plan_path(&task.id, &artifact_path)?;
                Ok(Event::WorkerSucceeded {
                    step: Step::PlanImpl,
                    plan_valid: Some(true),
                    introduced_changes: vec![],
                    plan: Some(plan),
                    commit_summary: None,
                })
            }
            Err(e) => {
                log_warn!("[fsm_executor] impl_plan invalid for {}: {}", task.id, e);
                Ok(Event::WorkerSucceeded {
                    step: Step::PlanImpl,
                    plan_valid: Some(false),
                    introduced_changes: vec![],
                    plan: None,
                    commit_summary: None,
                })
            }
        }
    }

    fn set_plan_path(&self, task_id: &str, path: &Path) -> Result<(), String> {
        self.store
            .task_queue_transaction(|q| {
                if let Some(t) = q.tasks.iter_mut().find(|t| t.id == task_id) {
                    t.plan_path = Some(path.display().to_string());
                }
            })
            .map_err(|e| e.to_string())
    }

    fn interpret_review(
        &self,
        task: &Task,
        phase_id: &str,
        run_dir: &Path,
        parsed: Option<&serde_json::Value>,
        phase: &Phase,
    ) -> Result<Event, String> {
        let review_result = self
            .read_artifact_json(parsed, "review", run_dir, "review.json")
            .and_then(|v| serde_json::from_value::<ReviewArtifact>(v).map_err(|e| e.to_string()));

        let review = match review_result {
            Ok(r) => r,
            Err(e) => {
                log_warn!("[fsm_executor] review artifact invalid for {}: {}", task.id, e);
                return Ok(Event::ReviewResultEvent { review: ReviewArtifact::default(), valid: false });
            }
        };

        let prd_has_content = !self.prd_text().trim().is_empty();
        match interpret::validate_review(&review, phase, prd_has_content, self.config.guardrails.review_min_evidence) {
            Ok(()) => {
                let artifact_path = self.store.artifacts_dir().join(format!("review_{phase_id}.json"));
                let text = serde_json::to_string_pretty(&review).map_err(|e| e.to_string())?;
                std::fs::write(&artifact_path, text).map_err(|e| e.to_string())?;
                Ok(Event::ReviewResultEvent { review, valid: true })
            }
            Err(e) => {
                log_warn!("[fsm_executor] review schema invalid for {}: {}", task.id, e);
                Ok(Event::ReviewResultEvent { review: ReviewArtifact::default(), valid: false })
            }
        }
    }

    async fn interpret_implement(
        &self,
        task: &Task,
        parsed: Option<serde_json::Value>,
        pre_changes: &[String],
        repo_dirty_before: bool,
    ) -> Result<Event, String> {
        let plan = self.load_plan(task)?;
        let allowlist = plan.map(|p| p.allowlist()).unwrap_or_default();

        if !self.worker.is_agentic() {
            let patch = parsed.as_ref().and_then(|v| v.get("patch")).and_then(|v| v.as_str());
            let patch = match patch {
                Some(p) if !p.trim().is_empty() => p,
                _ => return Ok(Event::NoIntroducedChanges { repo_dirty: repo_dirty_before }),
            };

            let patch_paths = agent::extract_diff_paths(patch);
            let disallowed: Vec<String> = patch_paths
                .iter()
                .filter(|p| !interpret::path_is_allowed(p, &allowlist))
                .cloned()
                .collect();
            if !disallowed.is_empty() {
                return Ok(Event::AllowlistViolation { disallowed_paths: disallowed });
            }

            if let Err(e) = agent::apply_patch(&self.project_dir, patch) {
                return Ok(Event::WorkerFailed { error_kind: crate::types::ErrorKind::PatchApplyFailed, message: e });
            }
        }

        let post_changes = self.git.changed_files(&self.project_dir).await?;
        let (introduced, _removed) = git::diff_file_sets(pre_changes, &post_changes);
        let gitignore_ok = git::gitignore_change_is_state_dir_only(&self.project_dir, &self.config.project.state_dir);
        let mode = ChangeMode::Implement { allowlist };
        if let Err(disallowed) =
            interpret::validate_changes_for_mode(&mode, &introduced, &self.config.project.state_dir, gitignore_ok)
        {
            return Ok(Event::AllowlistViolation { disallowed_paths: disallowed });
        }

        if introduced.is_empty() {
            return Ok(Event::NoIntroducedChanges { repo_dirty: repo_dirty_before });
        }

        Ok(Event::WorkerSucceeded {
            step: Step::Implement,
            plan_valid: None,
            introduced_changes: introduced,
            plan: None,
            commit_summary: None,
        })
    }
}

fn read_progress_human_blockers(progress_path: &Path, expected_run_id: &str) -> Option<Vec<String>> {
    let text = std::fs::read_to_string(progress_path).ok()?;
    let value: serde_json::Value = serde_json::from_str(&text).ok()?;
    if value.get("run_id").and_then(|v| v.as_str()) != Some(expected_run_id) {
        return None;
    }
    extract_human_blockers(&value)
}

fn extract_human_blockers(value: &serde_json::Value) -> Option<Vec<String>> {
    let issues: Vec<String> = value
        .get("human_blocking_issues")?
        .as_array()?
        .iter()
        .filter_map(|v| v.as_str().map(|s| s.to_string()))
        .collect();
    if issues.is_empty() {
        None
    } else {
        Some(issues)
    }
}

fn classify_failure(outcome: &DispatchOutcome) -> Event {
    if outcome.no_heartbeat {
        return Event::WorkerFailed {
            error_kind: crate::types::ErrorKind::HeartbeatTimeout,
            message: "worker produced no heartbeat within the grace window".to_string(),
        };
    }
    if outcome.timed_out {
        return Event::WorkerFailed {
            error_kind: crate::types::ErrorKind::ShiftTimeout,
            message: format!("worker exceeded the shift timeout ({}s elapsed)", outcome.runtime_seconds),
        };
    }
    let tail = crate::store::read_text_tail(&outcome.stderr_path, 2000).unwrap_or_default();
    Event::WorkerFailed {
        error_kind: crate::types::ErrorKind::WorkerExit,
        message: format!("worker exited with code {}: {}", outcome.exit_code, tail.trim()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RunnerConfig;
    use crate::types::{Phase, PhasePlan, Severity, TaskQueue};

    fn setup() -> (tempfile::TempDir, Arc<StateStore>, RunnerConfig) {
        let project = tempfile::tempdir().unwrap();
        std::process::Command::new("git").arg("init").arg("-q").current_dir(project.path()).output().unwrap();
        std::process::Command::new("git")
            .args(["config", "user.email", "test@example.com"])
            .current_dir(project.path())
            .output()
            .unwrap();
        std::process::Command::new("git")
            .args(["config", "user.name", "Test"])
            .current_dir(project.path())
            .output()
            .unwrap();
        std::fs::write(project.path().join("README.md"), "hello\n").unwrap();
        std::process::Command::new("git").arg("add").arg(".").current_dir(project.path()).output().unwrap();
        std::process::Command::new("git")
            .args(["commit", "-q", "-m", "init"])
            .current_dir(project.path())
            .output()
            .unwrap();

        let state_dir = project.path().join(".taskforge");
        let store = Arc::new(StateStore::new(state_dir.as_path()));
        store.init().unwrap();

        let mut config = RunnerConfig::default();
        config.project.state_dir = ".taskforge".to_string();
        config.guardrails.test_command = String::new();

        (project, store, config)
    }

    fn executor(store: Arc<StateStore>, config: RunnerConfig, project_dir: PathBuf, outcomes: Vec<Result<DispatchOutcome, String>>, agentic: bool) -> PhaseExecutor {
        PhaseExecutor::new(
            store,
            GitCoordinator::new(),
            Worker::Mock(MockWorkerDispatcher::new(outcomes), agentic),
            config,
            project_dir,
        )
    }

    fn success_outcome(response_text: &str) -> DispatchOutcome {
        DispatchOutcome { exit_code: 0, response_text: response_text.to_string(), ..Default::default() }
    }

    #[tokio::test]
    async fn commit_step_is_success_when_repo_is_clean() {
        let (project, store, config) = setup();
        store
            .phase_plan_transaction(|p| {
                *p = PhasePlan {
                    schema_version: 1,
                    phases: vec![Phase {
                        id: "phase-1".into(),
                        name: "Phase One".into(),
                        depends_on: vec![],
                        branch: "feature/phase-1".into(),
                        acceptance_criteria: vec![],
                    }],
                };
            })
            .unwrap();

        let mut task = Task::new_implement("phase-1-impl", "phase-1", 0);
        task.step = Step::Commit;
        task.branch = Some("feature/phase-1".to_string());
        store.task_queue_transaction(|q| q.tasks.push(task.clone())).unwrap();

        let exec = executor(store.clone(), config, project.path().to_path_buf(), vec![], true);
        let event = exec.run_commit_step(&task, "phase-1").await.unwrap();
        assert_eq!(event, Event::CommitResult { ok: true, sha: None, error: None });
    }

    #[tokio::test]
    async fn plan_impl_step_rejects_empty_allowlist() {
        let (project, store, config) = setup();
        store
            .phase_plan_transaction(|p| {
                *p = PhasePlan {
                    schema_version: 1,
                    phases: vec![Phase {
                        id: "phase-1".into(),
                        name: "Phase One".into(),
                        depends_on: vec![],
                        branch: "feature/phase-1".into(),
                        acceptance_criteria: vec!["thing works".into()],
                    }],
                };
            })
            .unwrap();

        let task = Task::new_implement("phase-1-impl", "phase-1", 0);
        store.task_queue_transaction(|q| q.tasks.push(task.clone())).unwrap();

        let response = serde_json::json!({
            "impl_plan": {
                "phase_id": "phase-1",
                "files_to_change": [],
                "new_files": [],
                "technical_approach": "do it",
                "steps": [],
                "spec_summary": []
            }
        })
        .to_string();

        let exec = executor(store.clone(), config, project.path().to_path_buf(), vec![Ok(success_outcome(&response))], false);
        let phase = exec.load_phase("phase-1").unwrap();
        let parsed = agent::extract_json(&response);
        let event = exec
            .interpret_plan_impl(&task, "phase-1", &project.path().join("run"), parsed.as_ref(), &phase)
            .unwrap();
        match event {
            Event::WorkerSucceeded { plan_valid: Some(false), .. } => {}
            other => panic!("expected invalid plan, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn review_step_requires_evidence_count() {
        let (project, store, mut config) = setup();
        config.guardrails.review_min_evidence = 2;
        let phase = Phase {
            id: "phase-1".into(),
            name: "Phase One".into(),
            depends_on: vec![],
            branch: "feature/phase-1".into(),
            acceptance_criteria: vec![],
        };
        store.phase_plan_transaction(|p| p.phases.push(phase.clone())).unwrap();

        let mut task = Task::new_implement("phase-1-impl", "phase-1", 0);
        task.step = Step::Review;
        store.task_queue_transaction(|q| q.tasks.push(task.clone())).unwrap();

        let review = crate::types::ReviewArtifact {
            phase_id: "phase-1".into(),
            mergeable: true,
            issues: vec![],
            evidence_count: 1,
        };
        let response = serde_json::json!({ "review": review }).to_string();

        let exec = executor(store.clone(), config, project.path().to_path_buf(), vec![], false);
        let parsed = agent::extract_json(&response);
        let event = exec
            .interpret_review(&task, "phase-1", &project.path().join("run"), parsed.as_ref(), &phase)
            .unwrap();
        match event {
            Event::ReviewResultEvent { valid: false, .. } => {}
            other => panic!("expected invalid review, got {other:?}"),
        }
    }

    #[test]
    fn severity_variants_serialize_snake_case() {
        let value = serde_json::to_string(&Severity::Critical).unwrap();
        assert_eq!(value, "\"critical\"");
    }

    #[tokio::test]
    async fn plan_task_with_no_phases_is_rejected() {
        let (project, store, config) = setup();
        let task = Task::new_plan("plan-1", 0);
        store.task_queue_transaction(|q| q.tasks.push(task.clone())).unwrap();

        let response = serde_json::json!({
            "phase_plan": { "schema_version": 1, "phases": [] },
            "task_queue": { "schema_version": 1, "tasks": [] }
        })
        .to_string();

        let exec = executor(store.clone(), config, project.path().to_path_buf(), vec![Ok(success_outcome(&response))], false);
        let err = exec.run_plan_worker("run-1", &project.path().join("runs/run-1"), &project.path().join("runs/run-1/progress.json")).await;
        assert!(err.is_err());
    }

    #[test]
    fn task_queue_default_has_no_tasks() {
        assert!(TaskQueue::default().tasks.is_empty());
    }
}
