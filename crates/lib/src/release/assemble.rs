//! The assemble stage's bridge into the task executor.

use std::io;
use std::sync::Arc;

use thiserror::Error;
use tracing::info;

use crate::cache::IncrementalCache;
use crate::distribution::DistributionArtifacts;
use crate::execute::{CancellationFlag, ExecuteConfig, execute};
use crate::graph::{TaskGraph, TaskId};

#[derive(Debug, Error)]
pub enum AssembleError {
  #[error("the build defines no {0} task")]
  MissingTask(TaskId),

  #[error("failed to start the task runtime: {0}")]
  Runtime(#[source] io::Error),

  #[error("distribution assembly failed:\n{0}")]
  Failed(String),
}

/// Produces the distribution archives for the assemble stage.
pub trait Assembler {
  fn assemble(&self) -> Result<DistributionArtifacts, AssembleError>;
}

/// Runs the distribution task and its dependency closure through the executor.
pub struct GraphAssembler {
  pub graph: Arc<TaskGraph>,
  pub cache: Arc<IncrementalCache>,
  pub execute: ExecuteConfig,
  pub cancel: CancellationFlag,
  pub target: TaskId,
  /// What the target task writes.
  pub artifacts: DistributionArtifacts,
}

impl Assembler for GraphAssembler {
  fn assemble(&self) -> Result<DistributionArtifacts, AssembleError> {
    if self.graph.task(&self.target).is_none() {
      return Err(AssembleError::MissingTask(self.target.clone()));
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
      .enable_all()
      .build()
      .map_err(AssembleError::Runtime)?;
    let report = runtime.block_on(execute(
      &self.graph,
      std::slice::from_ref(&self.target),
      Arc::clone(&self.cache),
      &self.execute,
      &self.cancel,
    ));

    if !report.is_success() {
      return Err(AssembleError::Failed(report.summary()));
    }
    info!(
      task = %self.target,
      executed = report.count("executed"),
      up_to_date = report.count("up-to-date"),
      "distribution task finished"
    );
    Ok(self.artifacts.clone())
  }
}
