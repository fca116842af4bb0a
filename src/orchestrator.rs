//! Orchestrator Loop (§4.8): single-threaded scheduler for serial mode. In
//! parallel mode the phase scheduler (`scheduler.rs`) replaces this
//! component entirely; the two never run together against the same state
//! directory.
//!
//! Each iteration: recover stale run state, bounded-auto-resume transient
//! blocks, honor `stop_on_blocking_issues`, select the next runnable task
//! across the whole queue (not scoped to one phase), and drive it to
//! completion via [`PhaseExecutor::execute_task`]. State mutation is safe
//! across iterations and across any concurrently running phase scheduler
//! because every read-modify-write goes through `StateStore`'s own
//! cross-process file lock plus in-process mutex -- there is no shared
//! mutable state here that needs an actor/mailbox to protect, since this
//! loop is itself the only writer in serial mode.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use crate::fsm;
use crate::fsm_executor::PhaseExecutor;
use crate::store::StateStore;
use crate::types::{BlockReason, Lifecycle, RunStatus, RunnerBlockedReport, Task};
use crate::{log_info, log_warn};

/// Block reasons transient enough that one bounded auto-resume attempt is
/// worth spending before surfacing the task to an operator. Everything else
/// (`PlanStuck`, `TestsStuck`, `ReviewStuck`, `NoProgress`, ...) already
/// means the relevant attempt cap was exhausted, so handing it straight
/// back into the FSM would just burn the same cap again for no new
/// information -- those stay `waiting_human` until a human or `resume`
/// acts on them.
fn is_auto_resumable(reason: BlockReason) -> bool {
    matches!(reason, BlockReason::GitCheckoutFailed)
}

pub enum IterationOutcome {
    /// A task was selected, driven to completion (or its iteration cap),
    /// and the loop should continue immediately.
    Ran { task_id: String, success: bool, error: Option<String> },
    /// No runnable task and nothing blocked: the run is caught up.
    Idle,
    /// `stop_on_blocking_issues` is set and at least one task is
    /// `waiting_human`; the loop should stop.
    Blocked { blocked_task_ids: Vec<String> },
}

pub struct Orchestrator {
    pub executor: PhaseExecutor,
    auto_resumed: std::sync::atomic::AtomicU32,
}

impl Orchestrator {
    pub fn new(executor: PhaseExecutor) -> Self {
        Self { executor, auto_resumed: std::sync::atomic::AtomicU32::new(0) }
    }

    fn store(&self) -> &Arc<StateStore> {
        &self.executor.store
    }

    /// Runs until idle, blocked, or `max_iterations` is reached.
    pub async fn run(&self, max_iterations: Option<u32>, resume_blocked: bool) -> Result<(), String> {
        let mut iteration: u32 = 0;
        if resume_blocked {
            self.resume_most_recently_blocked()?;
        }

        loop {
            if let Some(max) = max_iterations {
                if iteration >= max {
                    log_info!("[orchestrator] reached max iterations ({})", max);
                    break;
                }
            }

            self.recover_stale_run()?;
            self.auto_resume_transient_blocks()?;

            match self.prepare_next_task().await? {
                IterationOutcome::Blocked { blocked_task_ids } => {
                    self.write_blocked_report(&blocked_task_ids)?;
                    log_warn!("[orchestrator] stopping: {} task(s) waiting on a human", blocked_task_ids.len());
                    return Ok(());
                }
                IterationOutcome::Idle => {
                    log_info!("[orchestrator] no runnable tasks; idle");
                    break;
                }
                IterationOutcome::Ran { task_id, success, error } => {
                    iteration += 1;
                    if success {
                        log_info!("[orchestrator] task {} reached a terminal state", task_id);
                    } else {
                        log_warn!(
                            "[orchestrator] task {} did not complete: {}",
                            task_id,
                            error.as_deref().unwrap_or("unknown error")
                        );
                    }
                }
            }

            tokio::time::sleep(Duration::from_secs(1)).await;
        }

        Ok(())
    }

    fn recover_stale_run(&self) -> Result<(), String> {
        let now = Utc::now();
        let grace = self.executor.config.execution.stale_run_grace_seconds();
        let run_state = self.store().read_run_state().map_err(|e| e.to_string())?;

        if run_state.status != RunStatus::Running {
            return Ok(());
        }
        if self.store().detect_stale_run(&run_state, grace, now).is_some() {
            log_warn!("[orchestrator] previous run marked stale; resuming");
            self.store().reset_stale_run().map_err(|e| e.to_string())?;
            self.store().recover_running_tasks().map_err(|e| e.to_string())?;
        }
        Ok(())
    }

    fn auto_resume_transient_blocks(&self) -> Result<(), String> {
        let cap = self.executor.config.execution.max_auto_resumes;
        if self.auto_resumed.load(std::sync::atomic::Ordering::Relaxed) >= cap {
            return Ok(());
        }

        self.store()
            .task_queue_transaction(|queue| {
                for task in &mut queue.tasks {
                    if self.auto_resumed.load(std::sync::atomic::Ordering::Relaxed) >= cap {
                        break;
                    }
                    if task.lifecycle != Lifecycle::WaitingHuman {
                        continue;
                    }
                    let Some(reason) = task.block_reason else { continue };
                    if !is_auto_resumable(reason) {
                        continue;
                    }
                    match fsm::resume(task) {
                        Ok(resumed) => {
                            log_info!("[orchestrator] auto-resuming task {} (reason={:?})", task.id, reason);
                            *task = resumed;
                            self.auto_resumed.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                        }
                        Err(e) => log_warn!("[orchestrator] could not auto-resume {}: {}", task.id, e),
                    }
                }
            })
            .map_err(|e| e.to_string())
    }

    fn resume_most_recently_blocked(&self) -> Result<(), String> {
        let outcome = self
            .store()
            .task_queue_transaction(|queue| -> Result<(), String> {
                let target = queue
                    .tasks
                    .iter()
                    .filter(|t| t.lifecycle == Lifecycle::WaitingHuman)
                    .map(|t| t.id.clone())
                    .last();
                let Some(task_id) = target else { return Ok(()) };
                let idx = queue.tasks.iter().position(|t| t.id == task_id).unwrap();
                let resumed = fsm::resume(&queue.tasks[idx])?;
                log_info!("[orchestrator] resuming most recently blocked task {}", task_id);
                queue.tasks[idx] = resumed;
                Ok(())
            })
            .map_err(|e| e.to_string())?;
        outcome
    }

    async fn prepare_next_task(&self) -> Result<IterationOutcome, String> {
        self.ensure_seed_plan_task()?;

        if self.executor.config.execution.stop_on_blocking_issues {
            let blocked = self
                .store()
                .read_task_queue()
                .map_err(|e| e.to_string())?
                .tasks
                .iter()
                .filter(|t| t.lifecycle == Lifecycle::WaitingHuman)
                .map(|t| t.id.clone())
                .collect::<Vec<_>>();
            if !blocked.is_empty() {
                return Ok(IterationOutcome::Blocked { blocked_task_ids: blocked });
            }
        }

        let queue = self.store().read_task_queue().map_err(|e| e.to_string())?;
        let Some(task_id) = select_next_task(&queue.tasks) else {
            return Ok(IterationOutcome::Idle);
        };

        let (success, error) = self.executor.execute_task(&task_id).await?;
        Ok(IterationOutcome::Ran { task_id, success, error })
    }

    fn ensure_seed_plan_task(&self) -> Result<(), String> {
        self.store()
            .task_queue_transaction(|queue| {
                if queue.tasks.is_empty() {
                    let seed = Task::new_plan("plan", queue.next_task_ordinal);
                    queue.next_task_ordinal += 1;
                    queue.tasks.push(seed);
                }
            })
            .map_err(|e| e.to_string())
    }

    fn write_blocked_report(&self, blocked_task_ids: &[String]) -> Result<(), String> {
        let queue = self.store().read_task_queue().map_err(|e| e.to_string())?;
        let reasons = blocked_task_ids
            .iter()
            .filter_map(|id| {
                let task = queue.tasks.iter().find(|t| &t.id == id)?;
                let reason = task.last_error.clone().unwrap_or_else(|| "blocked".to_string());
                Some((id.clone(), reason))
            })
            .collect();

        let report = RunnerBlockedReport {
            blocked_task_ids: blocked_task_ids.to_vec(),
            reasons,
            generated_at: Utc::now().to_rfc3339(),
        };
        self.store().write_runner_blocked(&report).map_err(|e| e.to_string())
    }
}

/// Filters to `ready` tasks whose dependencies are all `done`, then sorts by
/// priority (descending) then creation order (ascending), picking the
/// first. Tasks naming a dependency id absent from the queue are treated
/// as having that dependency satisfied.
pub fn select_next_task(tasks: &[Task]) -> Option<String> {
    let done: std::collections::HashSet<&str> = tasks
        .iter()
        .filter(|t| t.lifecycle == Lifecycle::Done)
        .map(|t| t.id.as_str())
        .collect();

    let mut ready: Vec<&Task> = tasks
        .iter()
        .filter(|t| t.lifecycle == Lifecycle::Ready)
        .filter(|t| t.depends_on.iter().all(|dep| done.contains(dep.as_str())))
        .collect();

    ready.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.created_order.cmp(&b.created_order)));
    ready.first().map(|t| t.id.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Step;

    fn ready(id: &str, deps: &[&str], priority: i32, order: u64) -> Task {
        let mut t = Task::new_implement(id, "phase-1", order);
        t.depends_on = deps.iter().map(|s| s.to_string()).collect();
        t.priority = priority;
        t.step = Step::PlanImpl;
        t
    }

    #[test]
    fn selects_highest_priority_ready_task() {
        let tasks = vec![ready("a", &[], 0, 0), ready("b", &[], 5, 1)];
        assert_eq!(select_next_task(&tasks), Some("b".to_string()));
    }

    #[test]
    fn skips_tasks_with_unmet_dependencies() {
        let mut blocked = ready("b", &["a"], 0, 1);
        blocked.lifecycle = Lifecycle::Ready;
        let tasks = vec![ready("a", &[], 0, 0), blocked];
        assert_eq!(select_next_task(&tasks), Some("a".to_string()));
    }

    #[test]
    fn ties_broken_by_creation_order() {
        let tasks = vec![ready("later", &[], 0, 2), ready("earlier", &[], 0, 1)];
        assert_eq!(select_next_task(&tasks), Some("earlier".to_string()));
    }

    #[test]
    fn no_ready_tasks_returns_none() {
        let mut done = ready("a", &[], 0, 0);
        done.lifecycle = Lifecycle::Done;
        assert_eq!(select_next_task(&[done]), None);
    }

    #[test]
    fn dangling_dependency_does_not_block_selection() {
        let tasks = vec![ready("a", &["ghost"], 0, 0)];
        assert_eq!(select_next_task(&tasks), Some("a".to_string()));
    }

    #[test]
    fn git_checkout_failed_is_the_only_auto_resumable_reason() {
        assert!(is_auto_resumable(BlockReason::GitCheckoutFailed));
        assert!(!is_auto_resumable(BlockReason::PlanStuck));
        assert!(!is_auto_resumable(BlockReason::NoProgress));
    }
}
