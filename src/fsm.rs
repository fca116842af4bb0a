//! Pure, side-effect-free task reducer: `(task, event, caps) -> task'`.
//!
//! Every transition here is total and deterministic. No I/O, no clocks besides
//! what the caller stamps onto the event beforehand. See `SPEC_FULL.md` §4.6.

use crate::types::{
    AttemptCaps, BlockReason, Event, ExpansionRequest, Lifecycle, PromptMode, Step, Task,
};

/// Fold one event into a task, producing the next task state.
pub fn reduce(task: &Task, event: Event, caps: &AttemptCaps) -> Task {
    let mut next = task.clone();
    next.lifecycle = Lifecycle::Running;

    match event {
        Event::WorkerSucceeded {
            step: Step::PlanImpl,
            plan_valid: Some(true),
            plan,
            ..
        } => {
            next.attempts.worker = 0;
            next.attempts.plan = 0;
            next.expansion_request = None;
            if let Some(p) = plan {
                next.plan_hash = Some(plan_hash(&p));
            }
            next.step = Step::Implement;
            next.mode = Some(PromptMode::Implement);
            next.lifecycle = Lifecycle::Ready;
        }
        Event::WorkerSucceeded {
            step: Step::PlanImpl,
            plan_valid: Some(false),
            ..
        } => {
            next.attempts.worker = 0;
            next.attempts.plan += 1;
            if next.attempts.plan >= caps.plan {
                block(&mut next, BlockReason::PlanStuck);
            } else {
                next.step = Step::PlanImpl;
                next.mode = if next.expansion_request.is_some() {
                    Some(PromptMode::ExpandAllowlist)
                } else {
                    None
                };
                next.lifecycle = Lifecycle::Ready;
            }
        }
        Event::WorkerSucceeded {
            step: Step::Implement,
            introduced_changes,
            ..
        } if !introduced_changes.is_empty() => {
            next.attempts.worker = 0;
            next.attempts.no_progress = 0;
            next.step = Step::Verify;
            next.lifecycle = Lifecycle::Ready;
        }
        Event::WorkerSucceeded { step, .. } => {
            // A worker can report success without introduced_changes (e.g.
            // implement with nothing left to do) or for any other step with
            // no special-cased handling above: stay at the same step, ready
            // to be re-dispatched. No attempt counter is spent here -- only
            // the dedicated `NoIntroducedChanges` event (from the repo
            // snapshot diff) penalizes lack of progress.
            next.attempts.worker = 0;
            next.step = step;
            next.lifecycle = Lifecycle::Ready;
        }
        Event::NoIntroducedChanges { repo_dirty: false } => {
            next.attempts.no_progress += 1;
            if next.attempts.no_progress >= caps.no_progress {
                block(&mut next, BlockReason::NoProgress);
            } else {
                next.step = Step::Implement;
                next.mode = Some(PromptMode::Implement);
                next.lifecycle = Lifecycle::Ready;
            }
        }
        Event::NoIntroducedChanges { repo_dirty: true } => {
            next.attempts.no_progress = 0;
            next.step = Step::Verify;
            next.lifecycle = Lifecycle::Ready;
        }
        Event::AllowlistViolation { disallowed_paths } => {
            next.attempts.allowlist_expansion += 1;
            next.expansion_request = Some(ExpansionRequest { paths: disallowed_paths });
            if next.attempts.allowlist_expansion >= caps.allowlist_expansion {
                block(&mut next, BlockReason::AllowlistExpansionExhausted);
            } else {
                next.step = Step::PlanImpl;
                next.mode = Some(PromptMode::ExpandAllowlist);
                next.lifecycle = Lifecycle::Ready;
            }
        }
        Event::VerificationResult { result } => {
            next.last_verification = Some(crate::types::VerificationSnapshot {
                command: result.command.clone(),
                exit_code: result.exit_code,
                log_tail: result.log_tail.clone(),
                captured_at: result.captured_at.clone(),
            });

            if result.passed {
                next.attempts.test_fail = 0;
                next.step = Step::Review;
                next.lifecycle = Lifecycle::Ready;
            } else if result.needs_allowlist_expansion {
                next.expansion_request = Some(ExpansionRequest {
                    paths: result.failing_paths,
                });
                next.attempts.allowlist_expansion += 1;
                if next.attempts.allowlist_expansion >= caps.allowlist_expansion {
                    block(&mut next, BlockReason::AllowlistExpansionExhausted);
                } else {
                    next.step = Step::PlanImpl;
                    next.mode = Some(PromptMode::ExpandAllowlist);
                    next.lifecycle = Lifecycle::Ready;
                }
            } else {
                next.attempts.test_fail += 1;
                if next.attempts.test_fail >= caps.test_fail {
                    block(&mut next, BlockReason::TestsStuck);
                } else {
                    next.step = Step::Implement;
                    next.mode = Some(PromptMode::FixTests);
                    next.lifecycle = Lifecycle::Ready;
                }
            }
        }
        Event::ReviewResultEvent { valid: false, .. } => {
            next.attempts.review_gen += 1;
            if next.attempts.review_gen >= caps.review_gen {
                block(&mut next, BlockReason::ReviewInvalid);
            } else {
                next.step = Step::Review;
                next.lifecycle = Lifecycle::Ready;
            }
        }
        Event::ReviewResultEvent { review, .. } if review.has_blocking() => {
            next.attempts.review_fix += 1;
            next.review_blockers = review.issues;
            if next.attempts.review_fix >= caps.review_fix {
                block(&mut next, BlockReason::ReviewStuck);
            } else {
                next.step = Step::Implement;
                next.mode = Some(PromptMode::AddressReview);
                next.lifecycle = Lifecycle::Ready;
            }
        }
        Event::ReviewResultEvent { .. } => {
            next.step = Step::Commit;
            next.lifecycle = Lifecycle::Ready;
        }
        Event::CommitResult { ok: true, .. } => {
            next.lifecycle = Lifecycle::Done;
        }
        Event::CommitResult { ok: false, error, .. } => {
            next.last_error = error;
            block(&mut next, BlockReason::GitPushFailed);
        }
        Event::WorkerFailed { error_kind, message } => {
            next.last_error = Some(message);
            next.last_error_kind = Some(error_kind);
            if next.step == Step::Review {
                next.attempts.review_gen += 1;
                if next.attempts.review_gen >= caps.review_gen {
                    block(&mut next, BlockReason::ReviewInvalid);
                    return next;
                }
            } else {
                next.attempts.worker += 1;
                if next.attempts.worker >= caps.worker {
                    block(&mut next, BlockReason::HumanRequired);
                    return next;
                }
            }
            next.lifecycle = Lifecycle::Ready;
        }
        Event::ProgressHumanBlockers { issues } => {
            next.human_blocking_issues = issues;
            block(&mut next, BlockReason::HumanRequired);
        }
    }

    next
}

fn block(task: &mut Task, reason: BlockReason) {
    task.capture_blocked_intent();
    task.block_reason = Some(reason);
    task.lifecycle = Lifecycle::WaitingHuman;
}

fn plan_hash(plan: &crate::types::ImplementationPlan) -> String {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};

    let mut hasher = DefaultHasher::new();
    plan.phase_id.hash(&mut hasher);
    plan.files_to_change.hash(&mut hasher);
    plan.new_files.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

/// Restore a `waiting_human` task to `ready` at its blocked step/mode, clearing
/// the block reason. Used by manual resume (`resume <task>`) and bounded
/// auto-resume in the Orchestrator Loop.
pub fn resume(task: &Task) -> Result<Task, String> {
    let mut next = task.clone();
    if next.lifecycle != Lifecycle::WaitingHuman {
        return Err(format!("task {} is not waiting_human", task.id));
    }
    let intent = next
        .blocked_intent
        .clone()
        .ok_or_else(|| format!("task {} has no blocked_intent to resume from", task.id))?;
    next.step = intent.step;
    next.mode = intent.mode;
    next.block_reason = None;
    next.blocked_intent = None;
    next.lifecycle = Lifecycle::Ready;
    Ok(next)
}
