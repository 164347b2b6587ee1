//! Test helpers shared across strata-lib modules.

use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};

use crate::graph::{ActionError, TaskAction};

/// Write `contents` to `path`, creating parent directories.
pub fn write_file(path: &Path, contents: &str) {
  if let Some(parent) = path.parent() {
    fs::create_dir_all(parent).unwrap();
  }
  fs::write(path, contents).unwrap();
}

/// An action that appends `name` to `log` when run.
pub fn recording_action(log: &Arc<Mutex<Vec<String>>>, name: &str) -> TaskAction {
  let log = Arc::clone(log);
  let name = name.to_string();
  TaskAction::new(format!("record {}", name), move |_| {
    log.lock().unwrap().push(name.clone());
    Ok(())
  })
}

/// An action that always fails with `message`.
pub fn failing_action(message: &str) -> TaskAction {
  let message = message.to_string();
  TaskAction::new(format!("fail: {}", message), move |_| Err(ActionError::Failed(message.clone())))
}

/// A shell snippet that creates `filename` in the working directory.
#[cfg(unix)]
pub fn touch_command(filename: &str) -> String {
  format!("touch {}", filename)
}

#[cfg(windows)]
pub fn touch_command(filename: &str) -> String {
  format!("type nul > {}", filename)
}

/// A shell snippet that prints the environment variable `var`.
#[cfg(unix)]
pub fn echo_env_command(var: &str) -> String {
  format!("echo ${}", var)
}

#[cfg(windows)]
pub fn echo_env_command(var: &str) -> String {
  format!("echo %{}%", var)
}
