//! Types for task execution: outcomes, the run report and configuration.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::time::Duration;

use thiserror::Error;

use crate::cache::CacheError;
use crate::config::BuildConfig;
use crate::graph::{ActionError, TaskId};
use crate::util::hash::HashError;

/// Why a single task failed.
#[derive(Debug, Error)]
pub enum TaskError {
  #[error(transparent)]
  Action(#[from] ActionError),

  #[error("failed to fingerprint task: {0}")]
  Fingerprint(#[from] HashError),

  #[error("failed to record cache entry: {0}")]
  Cache(#[from] CacheError),

  #[error("task panicked: {0}")]
  Panicked(String),
}

/// Final state of one task in a run.
#[derive(Debug)]
pub enum TaskOutcome {
  /// The action ran and succeeded.
  Executed { duration: Duration },
  /// Inputs and outputs matched the cache; the action was not invoked.
  UpToDate,
  Failed { error: TaskError, duration: Duration },
  /// Not run because `failed_root` failed; `via` is the direct dependency
  /// through which the failure reached this task.
  Skipped { failed_root: TaskId, via: TaskId },
  /// Never dispatched because the run was cancelled.
  NotRun,
}

impl TaskOutcome {
  pub fn label(&self) -> &'static str {
    match self {
      TaskOutcome::Executed { .. } => "executed",
      TaskOutcome::UpToDate => "up-to-date",
      TaskOutcome::Failed { .. } => "failed",
      TaskOutcome::Skipped { .. } => "skipped",
      TaskOutcome::NotRun => "not-run",
    }
  }

  pub fn is_ok(&self) -> bool {
    matches!(self, TaskOutcome::Executed { .. } | TaskOutcome::UpToDate)
  }
}

/// Result of executing a set of targets.
#[derive(Debug, Default)]
pub struct RunReport {
  pub outcomes: BTreeMap<TaskId, TaskOutcome>,
  pub cancelled: bool,
  pub elapsed: Duration,
}

impl RunReport {
  /// True when every task either executed or was up to date.
  pub fn is_success(&self) -> bool {
    self.outcomes.values().all(TaskOutcome::is_ok)
  }

  pub fn outcome(&self, id: &TaskId) -> Option<&TaskOutcome> {
    self.outcomes.get(id)
  }

  /// Number of tasks whose outcome carries `label`.
  pub fn count(&self, label: &str) -> usize {
    self.outcomes.values().filter(|o| o.label() == label).count()
  }

  pub fn failed(&self) -> impl Iterator<Item = (&TaskId, &TaskError)> {
    self.outcomes.iter().filter_map(|(id, outcome)| match outcome {
      TaskOutcome::Failed { error, .. } => Some((id, error)),
      _ => None,
    })
  }

  /// Tasks skipped because `root` failed, with the dependency they were reached through.
  pub fn skipped_because_of<'a>(&'a self, root: &'a TaskId) -> impl Iterator<Item = (&'a TaskId, &'a TaskId)> + 'a {
    self.outcomes.iter().filter_map(move |(id, outcome)| match outcome {
      TaskOutcome::Skipped { failed_root, via } if failed_root == root => Some((id, via)),
      _ => None,
    })
  }

  /// One block per failure: the failed task, its error, and what it took down.
  pub fn summary(&self) -> String {
    let mut out = String::new();
    let _ = writeln!(
      out,
      "{} executed, {} up-to-date, {} failed, {} skipped, {} not run",
      self.count("executed"),
      self.count("up-to-date"),
      self.count("failed"),
      self.count("skipped"),
      self.count("not-run"),
    );

    for (id, error) in self.failed() {
      let _ = writeln!(out, "task {} failed: {}", id, error);
      for (skipped, via) in self.skipped_because_of(id) {
        let _ = writeln!(out, "  skipped {} (depends on {})", skipped, via);
      }
    }

    if self.cancelled {
      let _ = writeln!(out, "run cancelled; {} task(s) not run", self.count("not-run"));
    }
    out
  }
}

/// Configuration for task execution.
#[derive(Debug, Clone)]
pub struct ExecuteConfig {
  /// Maximum number of actions running at once.
  pub parallelism: usize,
}

impl Default for ExecuteConfig {
  fn default() -> Self {
    Self {
      parallelism: std::thread::available_parallelism().map(|p| p.get()).unwrap_or(4),
    }
  }
}

impl From<&BuildConfig> for ExecuteConfig {
  fn from(config: &BuildConfig) -> Self {
    Self {
      parallelism: config.parallelism.max(1),
    }
  }
}
