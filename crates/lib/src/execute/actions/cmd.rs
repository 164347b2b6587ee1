//! Shell command actions.
//!
//! A command runs through the platform shell in the task's working directory.
//! It inherits the caller's environment (build tools need `PATH`) with the
//! task's declared variables layered on top.

use std::collections::BTreeMap;
use std::io::Read;
use std::path::Path;
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::graph::{ActionContext, ActionError, TaskAction};

/// 315532800 = January 1, 1980 00:00:00 UTC (ZIP epoch).
const SOURCE_DATE_EPOCH: &str = "315532800";

const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Build a [`TaskAction`] that runs `cmd`.
///
/// The description is the command line plus its environment and shell
/// override, so editing any of them invalidates the task's cache entry.
pub fn command_action(cmd: &str, env: BTreeMap<String, String>, shell: Option<String>) -> TaskAction {
  let mut description = format!("cmd: {}", cmd);
  for (key, value) in &env {
    description.push_str(&format!("\nenv: {}={}", key, value));
  }
  if let Some(shell) = &shell {
    description.push_str(&format!("\nshell: {}", shell));
  }

  let cmd = cmd.to_string();
  TaskAction::new(description, move |ctx: &ActionContext| {
    let mut vars = env.clone();
    vars.insert("STRATA_TASK".to_string(), ctx.task.to_string());
    run_command(&cmd, &vars, &ctx.working_dir, shell.as_deref(), ctx.timeout).map(|_| ())
  })
}

/// Run a command to completion, killing it once `timeout` elapses.
///
/// Returns the trimmed stdout on success.
pub fn run_command(
  cmd: &str,
  env: &BTreeMap<String, String>,
  working_dir: &Path,
  shell: Option<&str>,
  timeout: Option<Duration>,
) -> Result<String, ActionError> {
  info!(cmd = %cmd, dir = %working_dir.display(), "executing command");

  let (shell_cmd, shell_args) = get_shell(shell);

  let mut command = Command::new(&shell_cmd);
  command
    .args(&shell_args)
    .arg(cmd)
    .current_dir(working_dir)
    .stdin(Stdio::null())
    .stdout(Stdio::piped())
    .stderr(Stdio::piped())
    .env("LANG", "C")
    .env("LC_ALL", "C")
    .env("SOURCE_DATE_EPOCH", SOURCE_DATE_EPOCH)
    .envs(env);

  debug!(shell = %shell_cmd, "spawning process");
  let mut child = command.spawn()?;

  // Drain both pipes on their own threads so a chatty child cannot block on a full pipe
  let stdout = child.stdout.take().map(drain);
  let stderr = child.stderr.take().map(drain);

  let started = Instant::now();
  let status = loop {
    if let Some(status) = child.try_wait()? {
      break status;
    }
    if let Some(limit) = timeout
      && started.elapsed() >= limit
    {
      warn!(cmd = %cmd, timeout = ?limit, "command timed out; killing");
      let _ = child.kill();
      let _ = child.wait();
      return Err(ActionError::TimedOut { after: limit });
    }
    thread::sleep(POLL_INTERVAL);
  };

  let stdout = stdout.and_then(|h| h.join().ok()).unwrap_or_default();
  let stderr = stderr.and_then(|h| h.join().ok()).unwrap_or_default();

  if !status.success() {
    if !stderr.is_empty() {
      debug!(stderr = %stderr, "command stderr");
    }
    if !stdout.is_empty() {
      debug!(stdout = %stdout, "command stdout");
    }
    return Err(ActionError::CmdFailed {
      cmd: cmd.to_string(),
      code: status.code(),
    });
  }

  let stdout = stdout.trim().to_string();
  if !stdout.is_empty() {
    debug!(stdout = %stdout, "command output");
  }
  Ok(stdout)
}

fn drain<R: Read + Send + 'static>(mut pipe: R) -> thread::JoinHandle<String> {
  thread::spawn(move || {
    let mut buf = Vec::new();
    let _ = pipe.read_to_end(&mut buf);
    String::from_utf8_lossy(&buf).into_owned()
  })
}

/// Shell command and the argument that introduces the script.
///
/// Defaults to `/bin/sh` (Unix) or PowerShell (Windows) rather than the
/// user's `$SHELL`, which may source profile files.
fn get_shell(override_shell: Option<&str>) -> (String, Vec<String>) {
  if let Some(shell) = override_shell {
    let args = if shell.contains("powershell") || shell.contains("pwsh") {
      vec!["-NoProfile".to_string(), "-Command".to_string()]
    } else if shell.contains("cmd") {
      vec!["/C".to_string()]
    } else {
      vec!["-c".to_string()]
    };
    return (shell.to_string(), args);
  }

  #[cfg(unix)]
  {
    ("/bin/sh".to_string(), vec!["-c".to_string()])
  }

  #[cfg(windows)]
  {
    (
      "powershell.exe".to_string(),
      vec![
        "-NoProfile".to_string(),
        "-ExecutionPolicy".to_string(),
        "Bypass".to_string(),
        "-Command".to_string(),
      ],
    )
  }
}

#[cfg(all(test, unix))]
mod tests {
  use super::*;
  use crate::graph::{TaskId, TaskSpec};
  use crate::util::testutil::{echo_env_command, touch_command};
  use tempfile::TempDir;

  fn run(cmd: &str, dir: &Path) -> Result<String, ActionError> {
    run_command(cmd, &BTreeMap::new(), dir, None, None)
  }

  #[test]
  fn simple_command() {
    let temp = TempDir::new().unwrap();
    assert_eq!(run("echo hello", temp.path()).unwrap(), "hello");
  }

  #[test]
  fn user_env_and_source_date_epoch() {
    let temp = TempDir::new().unwrap();
    let mut env = BTreeMap::new();
    env.insert("MY_VAR".to_string(), "my_value".to_string());

    let out = run_command("echo $MY_VAR $SOURCE_DATE_EPOCH", &env, temp.path(), None, None).unwrap();
    assert_eq!(out, "my_value 315532800");
  }

  #[test]
  fn failure_carries_exit_code() {
    let temp = TempDir::new().unwrap();
    let result = run("exit 3", temp.path());
    assert!(matches!(result, Err(ActionError::CmdFailed { code: Some(3), .. })));
  }

  #[test]
  fn runs_in_working_directory() {
    let temp = TempDir::new().unwrap();
    let sub = temp.path().join("subdir");
    std::fs::create_dir(&sub).unwrap();
    run(&touch_command("cwd_marker"), &sub).unwrap();
    assert!(sub.join("cwd_marker").exists());
  }

  #[test]
  fn timeout_kills_the_child() {
    let temp = TempDir::new().unwrap();
    let started = Instant::now();
    let result = run_command(
      "sleep 5",
      &BTreeMap::new(),
      temp.path(),
      None,
      Some(Duration::from_millis(200)),
    );
    assert!(matches!(result, Err(ActionError::TimedOut { .. })));
    assert!(started.elapsed() < Duration::from_secs(4));
  }

  #[test]
  fn large_output_does_not_block() {
    let temp = TempDir::new().unwrap();
    let out = run("i=0; while [ $i -lt 20000 ]; do echo line$i; i=$((i+1)); done", temp.path()).unwrap();
    assert!(out.ends_with("line19999"));
  }

  #[test]
  fn locale_is_pinned() {
    let temp = TempDir::new().unwrap();
    assert_eq!(run(&echo_env_command("LC_ALL"), temp.path()).unwrap(), "C");
  }

  #[test]
  fn action_exports_task_name() {
    let temp = TempDir::new().unwrap();
    let action = command_action("echo $STRATA_TASK > task.txt", BTreeMap::new(), None);
    let spec = TaskSpec::new(TaskId::new("lib", "jar"), action).working_dir(temp.path());
    spec.action.run(&spec.action_context()).unwrap();

    let written = std::fs::read_to_string(temp.path().join("task.txt")).unwrap();
    assert_eq!(written.trim(), ":lib:jar");
  }

  #[test]
  fn description_tracks_command_and_env() {
    let mut env = BTreeMap::new();
    env.insert("K".to_string(), "v".to_string());
    let a = command_action("make", BTreeMap::new(), None);
    let b = command_action("make", env, None);
    assert_ne!(a.description(), b.description());
  }

  #[test]
  fn description_tracks_shell_override() {
    let default = command_action("make", BTreeMap::new(), None);
    let bash = command_action("make", BTreeMap::new(), Some("/bin/bash".to_string()));
    let zsh = command_action("make", BTreeMap::new(), Some("/bin/zsh".to_string()));
    assert_ne!(default.description(), bash.description());
    assert_ne!(bash.description(), zsh.description());
    assert!(bash.description().ends_with("shell: /bin/bash"));
  }

  #[test]
  fn get_shell_overrides() {
    assert_eq!(get_shell(Some("/usr/bin/bash")).1, vec!["-c"]);
    assert_eq!(get_shell(Some("cmd.exe")).1, vec!["/C"]);
    assert_eq!(get_shell(None).0, "/bin/sh");
  }
}
