//! Task definitions: identity, declared inputs/outputs, and the action.
//!
//! There is a single task representation. What a task does is a value (the
//! [`TaskAction`]), not a subtype.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Identifies a task: owning project path plus task name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId {
  pub project: String,
  pub name: String,
}

impl TaskId {
  pub fn new(project: &str, name: &str) -> Self {
    Self {
      project: crate::project::normalize_path(project),
      name: name.to_string(),
    }
  }

  /// Parse `:project:task`, `project:task` or `:task` (root project).
  pub fn parse(spec: &str) -> Option<Self> {
    let trimmed = spec.trim();
    let (project, name) = trimmed.rsplit_once(':')?;
    if name.is_empty() {
      return None;
    }
    Some(Self::new(project, name))
  }
}

impl fmt::Display for TaskId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    if self.project == crate::project::ROOT_PATH {
      write!(f, ":{}", self.name)
    } else {
      write!(f, "{}:{}", self.project, self.name)
    }
  }
}

/// Whether the incremental cache may skip a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CachePolicy {
  /// Skip when inputs and outputs are unchanged.
  #[default]
  Default,
  /// Always run (non-deterministic or side-effecting work).
  Never,
}

/// Errors raised by a task action.
#[derive(Debug, Error)]
pub enum ActionError {
  /// Command exited unsuccessfully.
  #[error("command failed with exit code {code:?}: {cmd}")]
  CmdFailed { cmd: String, code: Option<i32> },

  /// Action exceeded its timeout and was stopped.
  #[error("timed out after {after:?}")]
  TimedOut { after: Duration },

  #[error("io error: {0}")]
  Io(#[from] std::io::Error),

  #[error("{0}")]
  Failed(String),
}

/// What an action sees of its task when it runs.
#[derive(Debug, Clone)]
pub struct ActionContext {
  pub task: TaskId,
  pub working_dir: PathBuf,
  pub inputs: Vec<PathBuf>,
  pub outputs: Vec<PathBuf>,
  pub properties: BTreeMap<String, String>,
  pub timeout: Option<Duration>,
}

type ActionFn = dyn Fn(&ActionContext) -> Result<(), ActionError> + Send + Sync;

/// The executable part of a task.
///
/// Actions are plain blocking functions; the executor runs them on a
/// blocking thread. The description is folded into the task's input
/// fingerprint, so two actions that behave differently must describe
/// themselves differently.
#[derive(Clone)]
pub struct TaskAction {
  description: String,
  run: Arc<ActionFn>,
}

impl TaskAction {
  pub fn new<F>(description: impl Into<String>, run: F) -> Self
  where
    F: Fn(&ActionContext) -> Result<(), ActionError> + Send + Sync + 'static,
  {
    Self {
      description: description.into(),
      run: Arc::new(run),
    }
  }

  /// An action that does nothing; used for lifecycle tasks such as `build`.
  pub fn noop() -> Self {
    Self::new("noop", |_| Ok(()))
  }

  pub fn description(&self) -> &str {
    &self.description
  }

  pub fn run(&self, ctx: &ActionContext) -> Result<(), ActionError> {
    (self.run)(ctx)
  }
}

impl fmt::Debug for TaskAction {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("TaskAction").field("description", &self.description).finish()
  }
}

/// Everything declared about a task before graph construction.
#[derive(Debug, Clone)]
pub struct TaskSpec {
  pub id: TaskId,
  pub working_dir: PathBuf,
  pub inputs: Vec<PathBuf>,
  pub properties: BTreeMap<String, String>,
  pub outputs: Vec<PathBuf>,
  pub depends_on: Vec<TaskId>,
  pub cache: CachePolicy,
  pub timeout: Option<Duration>,
  pub action: TaskAction,
}

impl TaskSpec {
  pub fn new(id: TaskId, action: TaskAction) -> Self {
    Self {
      id,
      working_dir: PathBuf::from("."),
      inputs: Vec::new(),
      properties: BTreeMap::new(),
      outputs: Vec::new(),
      depends_on: Vec::new(),
      cache: CachePolicy::Default,
      timeout: None,
      action,
    }
  }

  pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
    self.working_dir = dir.into();
    self
  }

  pub fn input(mut self, path: impl Into<PathBuf>) -> Self {
    self.inputs.push(path.into());
    self
  }

  pub fn output(mut self, path: impl Into<PathBuf>) -> Self {
    self.outputs.push(path.into());
    self
  }

  pub fn property(mut self, key: &str, value: &str) -> Self {
    self.properties.insert(key.to_string(), value.to_string());
    self
  }

  pub fn depends_on(mut self, dep: TaskId) -> Self {
    self.depends_on.push(dep);
    self
  }

  pub fn never_up_to_date(mut self) -> Self {
    self.cache = CachePolicy::Never;
    self
  }

  pub fn timeout(mut self, timeout: Duration) -> Self {
    self.timeout = Some(timeout);
    self
  }

  /// Context handed to the action when the task runs.
  pub fn action_context(&self) -> ActionContext {
    ActionContext {
      task: self.id.clone(),
      working_dir: self.working_dir.clone(),
      inputs: self.inputs.clone(),
      outputs: self.outputs.clone(),
      properties: self.properties.clone(),
      timeout: self.timeout,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn task_id_display_and_parse() {
    let id = TaskId::new("javatools", "jar");
    assert_eq!(id.to_string(), ":javatools:jar");
    assert_eq!(TaskId::parse(":javatools:jar"), Some(id));

    let root = TaskId::new(":", "assembleDist");
    assert_eq!(root.to_string(), ":assembleDist");
    assert_eq!(TaskId::parse(":assembleDist"), Some(root));

    assert_eq!(TaskId::parse("nocolon"), None);
    assert_eq!(TaskId::parse(":lib:"), None);
  }

  #[test]
  fn action_runs_with_context() {
    let action = TaskAction::new("check-props", |ctx| {
      if ctx.properties.get("mode").map(String::as_str) == Some("fast") {
        Ok(())
      } else {
        Err(ActionError::Failed("missing mode".to_string()))
      }
    });
    let spec = TaskSpec::new(TaskId::new("a", "t"), action).property("mode", "fast");
    spec.action.run(&spec.action_context()).unwrap();
    assert_eq!(spec.action.description(), "check-props");
  }
}
