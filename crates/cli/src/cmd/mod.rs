//! Command implementations and the plumbing they share.

mod build;
mod clean;
mod graph;
mod publish;
mod status;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use tracing::warn;

use strata_lib::cache::IncrementalCache;
use strata_lib::execute::{CancellationFlag, ExecuteConfig, RunReport, execute};
use strata_lib::graph::TaskId;
use strata_lib::load::{Workspace, find_build_file, load_workspace};

use crate::output::print_report;

pub use build::{cmd_assemble, cmd_run, cmd_test};
pub use clean::cmd_clean;
pub use graph::cmd_graph;
pub use publish::cmd_publish;
pub use status::cmd_status;

/// Flags accepted by every command.
pub struct GlobalOptions {
  pub dir: Option<PathBuf>,
  pub verbose: bool,
  pub jobs: Option<usize>,
}

/// Locate and load the workspace, applying `-j`.
pub fn load(opts: &GlobalOptions) -> Result<Workspace> {
  let start = match &opts.dir {
    Some(dir) => dir.clone(),
    None => std::env::current_dir().context("Failed to determine the current directory")?,
  };
  let build_file = find_build_file(&start)?;
  let mut workspace =
    load_workspace(&build_file).with_context(|| format!("Failed to load {}", build_file.display()))?;

  if let Some(jobs) = opts.jobs {
    workspace.config.parallelism = jobs.max(1);
  }
  Ok(workspace)
}

/// Resolve selectors to task ids, keeping the first occurrence of each.
pub fn select(workspace: &Workspace, selectors: &[String]) -> Result<Vec<TaskId>> {
  let mut targets = Vec::new();
  for selector in selectors {
    for id in workspace.graph.select(selector)? {
      if !targets.contains(&id) {
        targets.push(id);
      }
    }
  }
  Ok(targets)
}

/// Cancel `flag` on Ctrl-C. Must be called from within a runtime.
fn watch_interrupt(flag: CancellationFlag) -> tokio::task::JoinHandle<()> {
  tokio::spawn(async move {
    if tokio::signal::ctrl_c().await.is_ok() {
      warn!("interrupted; waiting for running tasks to finish");
      flag.cancel();
    }
  })
}

/// Execute `targets` with the workspace cache and print the report.
///
/// Fails unless every task in the closure executed or was up to date.
pub fn run_targets(workspace: &Workspace, targets: &[TaskId], verbose: bool) -> Result<RunReport> {
  let cache = Arc::new(IncrementalCache::open(&workspace.config).context("Failed to open the task cache")?);
  let config = ExecuteConfig::from(&workspace.config);
  let cancel = CancellationFlag::new();

  let rt = tokio::runtime::Runtime::new().context("Failed to create async runtime")?;
  let report = rt.block_on(async {
    let watcher = watch_interrupt(cancel.clone());
    let report = execute(&workspace.graph, targets, cache, &config, &cancel).await;
    watcher.abort();
    report
  });

  print_report(&report, verbose);

  if report.cancelled {
    bail!("Build cancelled");
  }
  if !report.is_success() {
    bail!("Build failed");
  }
  Ok(report)
}
