//! `strata status`: the persisted release state of the current version.

use anyhow::{Context, Result};

use strata_lib::release::pipeline::lock_path;
use strata_lib::release::{ReleaseLock, ReleaseState};

use super::{GlobalOptions, load};
use crate::output::{
  OutputFormat, format_age, format_unix, print_info, print_json, print_stat, print_success, print_warning,
};

pub fn cmd_status(opts: &GlobalOptions, format: OutputFormat) -> Result<()> {
  let workspace = load(opts)?;
  let distribution = workspace
    .distribution
    .as_ref()
    .with_context(|| format!("No [distribution] declared in {}", workspace.build_file.display()))?;
  let version = workspace.version.to_string();

  let state_path = ReleaseState::path(&workspace.config.release_dir(), &distribution.name, &version);
  let state = ReleaseState::load(&state_path)
    .with_context(|| format!("Failed to read release state {}", state_path.display()))?;
  let lock = ReleaseLock::inspect(&lock_path(&workspace.config, &distribution.name));

  if format.is_json() {
    return print_json(&serde_json::json!({
      "distribution": distribution.name,
      "version": version,
      "state": state,
      "lock": lock,
    }));
  }

  let Some(state) = state else {
    print_info(&format!(
      "{} {} has not been released. Run 'strata publish' to start.",
      distribution.name, version
    ));
    return print_lock(lock);
  };

  if state.is_released() {
    print_success(&format!("{} {} is released", distribution.name, version));
  } else {
    print_info(&format!("{} {}: {}", distribution.name, version, state.status));
  }
  print_stat("Status", &state.status.to_string());
  if let Some(stage) = state.last_completed {
    print_stat("Last completed", &stage.to_string());
  }
  if let Some(next) = state.resume_stage()
    && !state.is_released()
  {
    print_stat("Resumes at", &next.to_string());
  }
  print_stat("Attempts", &state.attempts.to_string());
  print_stat("Updated", &format_unix(state.updated_at_unix));
  if let Some(tag) = &state.artifacts.tag {
    print_stat("Tag", tag);
  }

  if opts.verbose {
    for coordinate in &state.artifacts.published {
      print_stat("Published", &coordinate.to_string());
    }
    for signature in &state.artifacts.signatures {
      print_stat("Signature", &signature.display().to_string());
    }
  }

  print_lock(lock)
}

fn print_lock(lock: Option<strata_lib::release::LockMetadata>) -> Result<()> {
  if let Some(lock) = lock {
    print_warning(&format!(
      "Release in progress: {} (PID {} on {}, started {} ago)",
      lock.command,
      lock.pid,
      lock.host,
      format_age(lock.started_at_unix)
    ));
  }
  Ok(())
}
