//! Topology executor (C12): runs an approved Plan under its declared
//! topology, aggregating results in Plan-declared order regardless of
//! completion order.
//!
//! The layered `FuturesUnordered` concurrency idiom generalizes
//! `dispatcher.rs`'s `dispatch_turn` `join_all` + `zip` shape (itself
//! grounded on `gateway/src/runtime/turn.rs`) one level up, at the
//! granularity of whole tasks instead of tool calls. `FuturesUnordered`
//! replaces `join_all` here (rather than there) because this executor
//! needs to react to the *first* sibling failure in a chunk while others
//! are still in flight, to cancel them per §4.12's
//! `cancel_siblings_on_failure`; `dispatch_turn` has no such knob and
//! keeps the simpler `join_all`.

use std::collections::{HashMap, HashSet};

use futures_util::stream::FuturesUnordered;
use futures_util::StreamExt;

use crate::cancel::CancelToken;
use crate::error::{KernelError, Result};
use crate::model::{Plan, Task, TaskStatus, TopologyHint};

/// One task's outcome, keyed by task id, in the order `execute` hands
/// them back (always Plan-declared order, per §4.12).
#[derive(Debug, Clone)]
pub struct TaskOutcome {
    pub task_id: String,
    pub status: TaskStatus,
    pub result: Option<String>,
    pub error: Option<String>,
}

/// Delegate that actually runs a single task (the Agent Kernel, C13).
/// Kept as a trait here so the topology executor's layering/ordering
/// logic can be tested without spinning up a real think-act-observe loop.
#[async_trait::async_trait]
pub trait TaskRunner: Send + Sync {
    async fn run(&self, task: &Task, cancel: &CancelToken) -> Result<String>;

    /// `Centralized` topology's defining behavior (§4.12): once the
    /// coordinator layer (the plan's dependency-free tasks) finishes,
    /// the runner gets exactly one chance to rewrite the remaining DAG
    /// before it executes — add, drop, or reorder tasks that still have
    /// `Pending` status. Bounded to this single call; it is never
    /// invoked again for the rest of the run.
    ///
    /// Default: no rewrite, so a runner that doesn't need coordinator-led
    /// re-planning behaves exactly like `Hybrid`.
    fn rewrite_after_coordinator(&self, _plan: &mut Plan, _coordinator_outcomes: &[TaskOutcome]) {}
}

/// Partition a Plan's tasks into dependency layers (Kahn's algorithm):
/// layer 0 has no dependencies, layer N depends only on layers < N.
/// Assumes `plan.validate_dag()` already passed.
fn layers(plan: &Plan) -> Vec<Vec<usize>> {
    let mut remaining: HashSet<usize> = (0..plan.tasks.len()).collect();
    let mut done: HashSet<&str> = HashSet::new();
    let mut out = Vec::new();

    while !remaining.is_empty() {
        let ready: Vec<usize> = remaining
            .iter()
            .copied()
            .filter(|&i| plan.tasks[i].dependencies.iter().all(|d| done.contains(d.as_str())))
            .collect();
        if ready.is_empty() {
            // Shouldn't happen on a validated DAG; guard against infinite
            // loop by dumping the rest into one final layer.
            out.push(remaining.iter().copied().collect());
            break;
        }
        for &i in &ready {
            remaining.remove(&i);
            done.insert(plan.tasks[i].id.as_str());
        }
        out.push(ready);
    }
    out
}

fn layer_groups_for(plan: &Plan, topology: TopologyHint) -> Vec<Vec<usize>> {
    match topology {
        TopologyHint::Sequential => plan.tasks.iter().enumerate().map(|(i, _)| vec![i]).collect(),
        TopologyHint::Parallel => vec![(0..plan.tasks.len()).collect()],
        TopologyHint::Hybrid | TopologyHint::Centralized => layers(plan),
    }
}

/// Should downstream tasks be skipped when an upstream dependency fails?
/// True for every topology except `parallel`, where independent tasks'
/// failures don't cascade — siblings keep running (or get cancelled
/// in-flight via `cancel_siblings_on_failure`, a distinct knob from
/// downstream skipping).
fn cascades_failure(topology: TopologyHint) -> bool {
    !matches!(topology, TopologyHint::Parallel)
}

pub struct TopologyExecutor {
    max_parallel_tasks: usize,
    cancel_siblings_on_failure: bool,
}

impl TopologyExecutor {
    pub fn new(max_parallel_tasks: usize, cancel_siblings_on_failure: bool) -> Self {
        Self {
            max_parallel_tasks,
            cancel_siblings_on_failure,
        }
    }

    /// Run every task in `plan` under `topology`, returning outcomes in
    /// Plan-declared order. `cancel` is the run-level cancellation token;
    /// each concurrent chunk derives its own child from it so a sibling
    /// failure can cancel the chunk without affecting tasks outside it.
    pub async fn execute(
        &self,
        plan: &mut Plan,
        topology: TopologyHint,
        runner: &dyn TaskRunner,
        cancel: &CancelToken,
    ) -> Vec<TaskOutcome> {
        let mut skipped: HashSet<String> = HashSet::new();
        let mut outcomes_by_id: HashMap<String, TaskOutcome> = HashMap::new();

        if matches!(topology, TopologyHint::Centralized) {
            self.execute_centralized(plan, runner, cancel, &mut outcomes_by_id, &mut skipped)
                .await;
        } else {
            for layer in layer_groups_for(plan, topology) {
                self.run_layer(plan, &layer, topology, runner, cancel, &mut outcomes_by_id, &mut skipped)
                    .await;
            }
        }

        plan.tasks
            .iter()
            .map(|t| {
                outcomes_by_id.remove(&t.id).unwrap_or(TaskOutcome {
                    task_id: t.id.clone(),
                    status: t.status,
                    result: t.result.clone(),
                    error: t.error.clone(),
                })
            })
            .collect()
    }

    /// Two-phase `Centralized` execution: run the coordinator layer (the
    /// plan's dependency-free tasks), hand the runner its one-shot
    /// opportunity to rewrite what's left via `rewrite_after_coordinator`,
    /// then lay out and run whatever remains — which may be a DAG the
    /// coordinator reshaped, not the one the plan started with.
    async fn execute_centralized(
        &self,
        plan: &mut Plan,
        runner: &dyn TaskRunner,
        cancel: &CancelToken,
        outcomes_by_id: &mut HashMap<String, TaskOutcome>,
        skipped: &mut HashSet<String>,
    ) {
        let Some(coordinator_layer) = layers(plan).into_iter().next() else {
            return;
        };

        self.run_layer(
            plan,
            &coordinator_layer,
            TopologyHint::Centralized,
            runner,
            cancel,
            outcomes_by_id,
            skipped,
        )
        .await;

        let coordinator_outcomes: Vec<TaskOutcome> = coordinator_layer
            .iter()
            .filter_map(|&idx| outcomes_by_id.get(&plan.tasks[idx].id))
            .cloned()
            .collect();

        runner.rewrite_after_coordinator(plan, &coordinator_outcomes);

        // Re-derive layers over whatever the coordinator left behind: a
        // rewrite may have added, dropped, or reordered tasks, so the
        // original `coordinator_layer` indices/DAG no longer apply.
        let done: HashSet<String> = outcomes_by_id.keys().cloned().collect();
        for layer in layers(plan) {
            let remaining: Vec<usize> = layer
                .into_iter()
                .filter(|&i| !done.contains(&plan.tasks[i].id))
                .collect();
            if remaining.is_empty() {
                continue;
            }
            self.run_layer(plan, &remaining, TopologyHint::Centralized, runner, cancel, outcomes_by_id, skipped)
                .await;
        }
    }

    /// Run one dependency layer, capped at `max_parallel_tasks` concurrent
    /// tasks per chunk. Within a chunk, tasks race via `FuturesUnordered`
    /// rather than `join_all` so the first failure can flip
    /// `chunk_cancel` — observed cooperatively by any sibling still
    /// in-flight — before the rest finish.
    async fn run_layer(
        &self,
        plan: &mut Plan,
        layer: &[usize],
        topology: TopologyHint,
        runner: &dyn TaskRunner,
        cancel: &CancelToken,
        outcomes_by_id: &mut HashMap<String, TaskOutcome>,
        skipped: &mut HashSet<String>,
    ) {
        let capped_chunks: Vec<Vec<usize>> = layer
            .chunks(self.max_parallel_tasks.max(1))
            .map(|c| c.to_vec())
            .collect();

        for chunk in capped_chunks {
            let chunk_cancel = cancel.child();
            let mut futures = FuturesUnordered::new();

            for &idx in &chunk {
                let task_id = plan.tasks[idx].id.clone();
                if skipped.contains(&task_id) {
                    continue;
                }
                plan.tasks[idx].start();
                let snapshot = plan.tasks[idx].clone();
                let task_cancel = chunk_cancel.clone();
                futures.push(async move {
                    let result = runner.run(&snapshot, &task_cancel).await;
                    (snapshot.id, result)
                });
            }

            let mut chunk_failed = false;
            while let Some((task_id, result)) = futures.next().await {
                match result {
                    Ok(text) => {
                        if let Some(task) = plan.task_mut(&task_id) {
                            task.succeed(text.clone());
                        }
                        outcomes_by_id.insert(
                            task_id.clone(),
                            TaskOutcome { task_id, status: TaskStatus::Succeeded, result: Some(text), error: None },
                        );
                    }
                    Err(e) => {
                        if let Some(task) = plan.task_mut(&task_id) {
                            task.fail(e.to_string());
                        }
                        if cascades_failure(topology) {
                            mark_downstream_skipped(plan, &task_id, skipped);
                        }
                        if self.cancel_siblings_on_failure && !chunk_failed {
                            chunk_cancel.cancel();
                        }
                        chunk_failed = true;
                        outcomes_by_id.insert(
                            task_id.clone(),
                            TaskOutcome { task_id, status: TaskStatus::Failed, result: None, error: Some(e.to_string()) },
                        );
                    }
                }
            }

            for task_id in skipped.iter() {
                if outcomes_by_id.contains_key(task_id) {
                    continue;
                }
                if let Some(task) = plan.task_mut(task_id) {
                    if task.status == TaskStatus::Pending {
                        task.skip();
                    }
                }
                outcomes_by_id.insert(
                    task_id.clone(),
                    TaskOutcome { task_id: task_id.clone(), status: TaskStatus::Skipped, result: None, error: None },
                );
            }
        }
    }
}

fn mark_downstream_skipped(plan: &Plan, failed_id: &str, skipped: &mut HashSet<String>) {
    let mut frontier = vec![failed_id.to_string()];
    while let Some(id) = frontier.pop() {
        for task in &plan.tasks {
            if task.dependencies.contains(&id) && !skipped.contains(&task.id) {
                skipped.insert(task.id.clone());
                frontier.push(task.id.clone());
            }
        }
    }
}

pub fn aggregate_summary(outcomes: &[TaskOutcome]) -> String {
    let succeeded = outcomes.iter().filter(|o| o.status == TaskStatus::Succeeded).count();
    let failed = outcomes.iter().filter(|o| o.status == TaskStatus::Failed).count();
    let skipped = outcomes.iter().filter(|o| o.status == TaskStatus::Skipped).count();
    format!("{succeeded} succeeded, {failed} failed, {skipped} skipped")
}
