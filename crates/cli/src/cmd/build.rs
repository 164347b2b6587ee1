//! `strata assemble`, `strata test` and `strata run`.

use anyhow::{Context, Result};

use super::{GlobalOptions, load, run_targets, select};
use crate::output::{print_stat, print_success};

/// Name of the task `strata test` selects in every project.
const TEST_TASK: &str = "test";

pub fn cmd_assemble(opts: &GlobalOptions) -> Result<()> {
  let workspace = load(opts)?;
  let target = workspace
    .assemble_task()
    .with_context(|| format!("No [distribution] declared in {}", workspace.build_file.display()))?;

  run_targets(&workspace, &[target], opts.verbose)?;

  if let Some(distribution) = &workspace.distribution {
    let artifacts = distribution.artifacts();
    println!();
    print_success(&format!("Assembled {}", distribution.base_name()));
    print_stat("zip", &artifacts.zip.display().to_string());
    print_stat("tar.gz", &artifacts.tar_gz.display().to_string());
    print_stat("checksums", &artifacts.checksums.display().to_string());
  }
  Ok(())
}

pub fn cmd_test(opts: &GlobalOptions) -> Result<()> {
  let workspace = load(opts)?;
  let targets = select(&workspace, &[TEST_TASK.to_string()])?;
  run_targets(&workspace, &targets, opts.verbose)?;
  Ok(())
}

pub fn cmd_run(opts: &GlobalOptions, selectors: &[String]) -> Result<()> {
  let workspace = load(opts)?;
  let targets = select(&workspace, selectors)?;
  run_targets(&workspace, &targets, opts.verbose)?;
  Ok(())
}
