//! Phase Scheduler (§4.7): cycle detection, topological batching, and
//! bounded-parallelism execution of a phase plan's batches. Each phase
//! thread owns one [`PhaseExecutor`] walking its task(s) sequentially
//! through the FSM; batches run concurrently up to `execution.max_concurrent`,
//! with git access serialized underneath by the shared [`GitCoordinator`].

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;

use tokio::task::JoinSet;

use crate::config::RunnerConfig;
use crate::fsm_executor::{PhaseExecutor, PhaseResult, Worker};
use crate::git::GitCoordinator;
use crate::store::StateStore;
use crate::types::Phase;
use crate::{log_info, log_warn};

/// Phases batched for topological execution: phases in the same batch share
/// no dependency edge and may run concurrently; batch N+1 only starts once
/// every phase in batch N has been scheduled (not necessarily finished --
/// see [`ExecutionPlan::batches`]).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionPlan {
    pub batches: Vec<Vec<String>>,
    pub total_phases: usize,
    pub max_parallelism: usize,
}

/// Detects a dependency cycle via three-color DFS (0=unvisited, 1=visiting,
/// 2=done). Returns the cycle as a list of phase ids, start repeated at the
/// end, or `None` if the graph is acyclic.
pub fn check_circular_deps(phases: &[Phase]) -> Option<Vec<String>> {
    let mut graph: HashMap<&str, Vec<&str>> = HashMap::new();
    for phase in phases {
        for dep in &phase.depends_on {
            graph.entry(dep.as_str()).or_default().push(phase.id.as_str());
        }
    }

    let mut state: HashMap<&str, u8> = phases.iter().map(|p| (p.id.as_str(), 0u8)).collect();

    fn dfs<'a>(
        node: &'a str,
        graph: &HashMap<&'a str, Vec<&'a str>>,
        state: &mut HashMap<&'a str, u8>,
        path: &mut Vec<&'a str>,
    ) -> Option<Vec<String>> {
        match state.get(node) {
            Some(1) => {
                let start = path.iter().position(|p| *p == node).unwrap_or(0);
                let mut cycle: Vec<String> = path[start..].iter().map(|s| s.to_string()).collect();
                cycle.push(node.to_string());
                return Some(cycle);
            }
            Some(2) => return None,
            _ => {}
        }

        state.insert(node, 1);
        path.push(node);

        if let Some(neighbors) = graph.get(node) {
            for neighbor in neighbors {
                if let Some(cycle) = dfs(neighbor, graph, state, path) {
                    return Some(cycle);
                }
            }
        }

        path.pop();
        state.insert(node, 2);
        None
    }

    for phase in phases {
        if state.get(phase.id.as_str()) == Some(&0) {
            let mut path = Vec::new();
            if let Some(cycle) = dfs(phase.id.as_str(), &graph, &mut state, &mut path) {
                return Some(cycle);
            }
        }
    }

    None
}

/// Batches phases into topological layers via Kahn's algorithm, after first
/// rejecting a cyclic graph. Phases naming a dependency id absent from
/// `phases` are treated as having that dependency already satisfied (the
/// original's dangling-dependency tolerance).
pub fn resolve_execution_order(phases: &[Phase]) -> Result<ExecutionPlan, String> {
    if let Some(cycle) = check_circular_deps(phases) {
        return Err(format!("circular dependency detected: {}", cycle.join(" -> ")));
    }

    let known_ids: HashSet<&str> = phases.iter().map(|p| p.id.as_str()).collect();
    let mut in_degree: HashMap<&str, usize> = HashMap::new();
    let mut graph: HashMap<&str, Vec<&str>> = HashMap::new();

    for phase in phases {
        let live_deps = phase.depends_on.iter().filter(|d| known_ids.contains(d.as_str())).count();
        in_degree.insert(phase.id.as_str(), live_deps);
        for dep in &phase.depends_on {
            if known_ids.contains(dep.as_str()) {
                graph.entry(dep.as_str()).or_default().push(phase.id.as_str());
            }
        }
    }

    let order_index: HashMap<&str, usize> = phases.iter().enumerate().map(|(i, p)| (p.id.as_str(), i)).collect();
    let mut queue_vec: Vec<&str> = in_degree.iter().filter(|(_, &deg)| deg == 0).map(|(&id, _)| id).collect();
    queue_vec.sort_by_key(|id| order_index[id]);

    let mut batches: Vec<Vec<String>> = Vec::new();
    while !queue_vec.is_empty() {
        let batch: Vec<String> = queue_vec.iter().map(|s| s.to_string()).collect();
        let mut next: Vec<&str> = Vec::new();
        for &phase_id in &queue_vec {
            if let Some(dependents) = graph.get(phase_id) {
                for &dependent in dependents {
                    let deg = in_degree.get_mut(dependent).unwrap();
                    *deg -= 1;
                    if *deg == 0 {
                        next.push(dependent);
                    }
                }
            }
        }
        next.sort_by_key(|id| order_index[id]);
        batches.push(batch);
        queue_vec = next;
    }

    let scheduled: usize = batches.iter().map(|b| b.len()).sum();
    if scheduled != phases.len() {
        let scheduled_ids: HashSet<&str> = batches.iter().flatten().map(|s| s.as_str()).collect();
        let missing: Vec<&str> = phases.iter().map(|p| p.id.as_str()).filter(|id| !scheduled_ids.contains(id)).collect();
        return Err(format!("failed to schedule all phases, missing: {}", missing.join(", ")));
    }

    let max_parallelism = batches.iter().map(|b| b.len()).max().unwrap_or(0);
    Ok(ExecutionPlan { batches, total_phases: phases.len(), max_parallelism })
}

/// Drives every phase in a plan to completion, batch by batch. A batch's
/// phases run concurrently (bounded by `max_concurrent` via [`JoinSet`]);
/// the scheduler does not stop the whole run on a batch failure -- it
/// records the failure and proceeds to the next batch, since later batches
/// may contain phases with no dependency on the failed one that are still
/// worth attempting. A phase that depended on a failed one will itself
/// fail fast once its task's preconditions go unmet inside the FSM.
pub struct PhaseScheduler {
    store: Arc<StateStore>,
    git: GitCoordinator,
    config: RunnerConfig,
    project_dir: PathBuf,
}

impl PhaseScheduler {
    pub fn new(store: Arc<StateStore>, git: GitCoordinator, config: RunnerConfig, project_dir: PathBuf) -> Self {
        Self { store, git, config, project_dir }
    }

    pub async fn run(&self, make_worker: impl Fn() -> Worker) -> Result<Vec<PhaseResult>, String> {
        let plan_doc = self.store.read_phase_plan().map_err(|e| e.to_string())?;
        let plan = resolve_execution_order(&plan_doc.phases)?;

        log_info!(
            "[scheduler] execution plan: {} batches, max parallelism {}",
            plan.batches.len(),
            plan.max_parallelism
        );

        let max_concurrent = self.config.execution.max_concurrent.max(1) as usize;
        let mut results = Vec::new();

        for (batch_idx, batch) in plan.batches.iter().enumerate() {
            log_info!("[scheduler] executing batch {}/{} with {} phase(s)", batch_idx + 1, plan.batches.len(), batch.len());

            let batch_results = self.execute_batch(batch, max_concurrent, &make_worker).await;

            let failures: Vec<&PhaseResult> = batch_results.iter().filter(|r| !r.success).collect();
            if !failures.is_empty() {
                log_warn!("[scheduler] batch {} had {} failure(s)", batch_idx + 1, failures.len());
                for failure in &failures {
                    log_warn!("[scheduler]   - phase {} failed: {}", failure.phase_id, failure.error.as_deref().unwrap_or("unknown error"));
                }
            }

            results.extend(batch_results);
        }

        Ok(results)
    }

    async fn execute_batch(
        &self,
        batch: &[String],
        max_concurrent: usize,
        make_worker: &impl Fn() -> Worker,
    ) -> Vec<PhaseResult> {
        if batch.len() == 1 {
            let executor = self.executor_for(make_worker());
            return vec![executor.execute_phase(&batch[0]).await];
        }

        let mut join_set: JoinSet<PhaseResult> = JoinSet::new();
        let mut pending: VecDeque<String> = batch.iter().cloned().collect();
        let mut results = Vec::new();

        while !pending.is_empty() || !join_set.is_empty() {
            while join_set.len() < max_concurrent {
                let Some(phase_id) = pending.pop_front() else { break };
                let executor = self.executor_for(make_worker());
                join_set.spawn(async move { executor.execute_phase(&phase_id).await });
            }

            match join_set.join_next().await {
                Some(Ok(result)) => results.push(result),
                Some(Err(join_error)) => {
                    log_warn!("[scheduler] phase task panicked: {}", join_error);
                }
                None => break,
            }
        }

        results
    }

    fn executor_for(&self, worker: Worker) -> PhaseExecutor {
        PhaseExecutor::new(self.store.clone(), self.git.clone(), worker, self.config.clone(), self.project_dir.clone())
    }
}
