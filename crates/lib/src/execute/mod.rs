//! Task execution.
//!
//! The executor runs the dependency closure of the requested targets on a
//! bounded worker pool. A task is dispatched as soon as all of its
//! dependencies have succeeded; failures skip every transitive dependent
//! while independent work continues.

pub mod actions;
pub mod cancel;
pub mod types;

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::cache::{Fingerprint, Freshness, IncrementalCache};
use crate::graph::{CachePolicy, TaskGraph, TaskId, TaskSpec};

pub use cancel::CancellationFlag;
pub use types::{ExecuteConfig, RunReport, TaskError, TaskOutcome};

/// How a dispatched task finished without error.
enum Completed {
  Executed(Duration),
  UpToDate,
}

/// Execute `targets` and everything they depend on.
///
/// Never returns an error: per-task failures, skips and cancellations are
/// recorded in the [`RunReport`].
pub async fn execute(
  graph: &TaskGraph,
  targets: &[TaskId],
  cache: Arc<IncrementalCache>,
  config: &ExecuteConfig,
  cancel: &CancellationFlag,
) -> RunReport {
  let started = Instant::now();
  let subset = graph.closure(targets);
  info!(targets = targets.len(), tasks = subset.len(), parallelism = config.parallelism, "starting task execution");

  let mut report = RunReport::default();

  // Unfinished dependency count per task, restricted to the closure
  let mut pending: HashMap<TaskId, usize> = subset
    .iter()
    .map(|id| {
      let count = graph.dependencies(id).iter().filter(|d| subset.contains(*d)).count();
      (id.clone(), count)
    })
    .collect();
  let mut ready: BTreeSet<TaskId> = pending
    .iter()
    .filter(|(_, count)| **count == 0)
    .map(|(id, _)| id.clone())
    .collect();

  let semaphore = Arc::new(Semaphore::new(config.parallelism.max(1)));
  let mut join_set: JoinSet<(TaskId, Result<Completed, TaskError>)> = JoinSet::new();
  let mut in_flight: HashMap<tokio::task::Id, TaskId> = HashMap::new();
  let mut dispatched_at: HashMap<TaskId, Instant> = HashMap::new();

  loop {
    // Dispatch while permits are free
    while !cancel.is_cancelled() {
      let Some(id) = ready.first().cloned() else {
        break;
      };
      let Ok(permit) = Arc::clone(&semaphore).try_acquire_owned() else {
        break;
      };
      ready.remove(&id);

      let Some(spec) = graph.task(&id).cloned() else {
        continue;
      };
      let cache = Arc::clone(&cache);
      debug!(task = %id, "dispatching task");

      let handle = join_set.spawn(async move {
        let task_id = spec.id.clone();
        let result = tokio::task::spawn_blocking(move || {
          let _permit = permit;
          run_task(&spec, &cache)
        })
        .await
        .unwrap_or_else(|e| Err(TaskError::Panicked(e.to_string())));
        (task_id, result)
      });
      dispatched_at.insert(id.clone(), Instant::now());
      in_flight.insert(handle.id(), id);
    }

    let Some(joined) = join_set.join_next_with_id().await else {
      break;
    };

    let (id, result) = match joined {
      Ok((task_id, (id, result))) => {
        in_flight.remove(&task_id);
        (id, result)
      }
      Err(e) => {
        let Some(id) = in_flight.remove(&e.id()) else {
          error!(error = %e, "task join failed");
          continue;
        };
        (id, Err(TaskError::Panicked(e.to_string())))
      }
    };

    match result {
      Ok(completed) => {
        let outcome = match completed {
          Completed::Executed(duration) => {
            info!(task = %id, duration = ?duration, "task succeeded");
            TaskOutcome::Executed { duration }
          }
          Completed::UpToDate => {
            info!(task = %id, "task up to date");
            TaskOutcome::UpToDate
          }
        };
        report.outcomes.insert(id.clone(), outcome);

        for dependent in graph.dependents(&id) {
          if let Some(count) = pending.get_mut(&dependent) {
            *count = count.saturating_sub(1);
            if *count == 0 && !report.outcomes.contains_key(&dependent) {
              ready.insert(dependent);
            }
          }
        }
      }
      Err(e) => {
        error!(task = %id, error = %e, "task failed");
        skip_dependents(graph, &subset, &id, &mut report);
        let duration = dispatched_at.get(&id).map(Instant::elapsed).unwrap_or_default();
        report.outcomes.insert(id, TaskOutcome::Failed { error: e, duration });
      }
    }
  }

  if cancel.is_cancelled() {
    report.cancelled = true;
    warn!("execution cancelled; undispatched tasks will not run");
  }
  for id in &subset {
    report.outcomes.entry(id.clone()).or_insert(TaskOutcome::NotRun);
  }

  report.elapsed = started.elapsed();
  info!(
    executed = report.count("executed"),
    up_to_date = report.count("up-to-date"),
    failed = report.count("failed"),
    skipped = report.count("skipped"),
    not_run = report.count("not-run"),
    "task execution complete"
  );
  report
}

/// Mark every transitive dependent of `failed` inside `subset` as skipped,
/// remembering the direct dependency each was reached through.
fn skip_dependents(graph: &TaskGraph, subset: &BTreeSet<TaskId>, failed: &TaskId, report: &mut RunReport) {
  let mut queue: VecDeque<(TaskId, TaskId)> = graph
    .dependents(failed)
    .into_iter()
    .map(|d| (d, failed.clone()))
    .collect();

  while let Some((id, via)) = queue.pop_front() {
    if !subset.contains(&id) || report.outcomes.contains_key(&id) {
      continue;
    }
    warn!(task = %id, failed = %failed, via = %via, "skipping task due to failed dependency");
    for next in graph.dependents(&id) {
      queue.push_back((next, id.clone()));
    }
    report.outcomes.insert(
      id,
      TaskOutcome::Skipped {
        failed_root: failed.clone(),
        via,
      },
    );
  }
}

/// Run one task on a blocking thread: cache check, action, cache update.
fn run_task(spec: &TaskSpec, cache: &IncrementalCache) -> Result<Completed, TaskError> {
  match cache.freshness(spec) {
    Freshness::UpToDate => return Ok(Completed::UpToDate),
    Freshness::Stale(reason) => debug!(task = %spec.id, reason = ?reason, "task is stale"),
  }

  let inputs = Fingerprint::of_inputs(spec, cache.mode())?;
  for output in &spec.outputs {
    if let Some(parent) = output.parent() {
      std::fs::create_dir_all(parent).map_err(crate::graph::ActionError::Io)?;
    }
  }

  let started = Instant::now();
  if let Err(e) = spec.action.run(&spec.action_context()) {
    // Partial outputs of a failed run must never be trusted
    if let Err(invalidate_err) = cache.invalidate(&spec.id) {
      warn!(task = %spec.id, error = %invalidate_err, "failed to invalidate cache entry");
    }
    return Err(e.into());
  }
  let duration = started.elapsed();

  if spec.cache == CachePolicy::Default && !spec.outputs.is_empty() {
    let outputs = Fingerprint::of_outputs(spec, cache.mode())?;
    cache.record_success(&spec.id, inputs, outputs)?;
  }

  Ok(Completed::Executed(duration))
}
