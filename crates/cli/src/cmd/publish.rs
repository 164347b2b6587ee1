//! `strata publish`: run the release pipeline to `TAGGED`.
//!
//! Progress is persisted after every stage, so rerunning after a failure
//! resumes from the stage that failed.

use std::sync::Arc;

use anyhow::{Context, Result};

use strata_lib::cache::IncrementalCache;
use strata_lib::execute::{CancellationFlag, ExecuteConfig};
use strata_lib::release::{GitRepository, GpgSigner, GraphAssembler, ReleaseError, ReleasePipeline};

use super::{GlobalOptions, load, watch_interrupt};
use crate::output::{print_info, print_stat, print_success, print_warning};

pub fn cmd_publish(opts: &GlobalOptions) -> Result<()> {
  let workspace = load(opts)?;
  let build_file = workspace.build_file.display().to_string();

  let distribution = workspace
    .distribution
    .as_ref()
    .with_context(|| format!("No [distribution] declared in {}", build_file))?;
  let target = workspace
    .assemble_task()
    .with_context(|| format!("No [distribution] declared in {}", build_file))?;
  let repository = workspace
    .publish_repository
    .as_deref()
    .with_context(|| format!("No [publish] repository configured in {}", build_file))?;
  let remote = workspace
    .resolver
    .repository(repository)
    .with_context(|| format!("Unknown publish repository '{}'", repository))?;

  let scm = GitRepository::discover(&workspace.config.root_dir).context("Publishing requires a git repository")?;
  let cancel = CancellationFlag::new();
  let assembler = GraphAssembler {
    graph: Arc::clone(&workspace.graph),
    cache: Arc::new(IncrementalCache::open(&workspace.config).context("Failed to open the task cache")?),
    execute: ExecuteConfig::from(&workspace.config),
    cancel: cancel.clone(),
    target,
    artifacts: distribution.artifacts(),
  };
  let signer = GpgSigner::default();

  let pipeline = ReleasePipeline {
    config: &workspace.config,
    group: workspace.group.clone(),
    distribution: distribution.name.clone(),
    version: workspace.version.clone(),
    metadata: workspace.distribution_metadata(),
    assembler: &assembler,
    signer: &signer,
    remote: remote.as_ref(),
    scm: &scm,
  };

  // The pipeline is synchronous; this runtime only listens for Ctrl-C
  let rt = tokio::runtime::Runtime::new().context("Failed to create async runtime")?;
  let watcher = rt.block_on(async { watch_interrupt(cancel.clone()) });

  print_info(&format!(
    "Releasing {} {} to '{}'",
    distribution.name, workspace.version, repository
  ));
  let result = pipeline.run("strata publish");
  watcher.abort();

  let state = match result {
    Ok(state) => state,
    Err(e) => {
      if let Some(stage) = e.stage() {
        print_warning(&format!(
          "Release stopped at stage '{}'; rerun `strata publish` to resume",
          stage
        ));
        print_stat("State", &pipeline.state_path().display().to_string());
      }
      if matches!(e, ReleaseError::Lock(_)) {
        print_stat("Lock", &pipeline.lock_path().display().to_string());
      }
      return Err(anyhow::Error::new(e).context("Release failed"));
    }
  };

  print_success(&format!("Released {} {}", distribution.name, state.version));
  print_stat("Status", &state.status.to_string());
  if let Some(tag) = &state.artifacts.tag {
    print_stat("Tag", tag);
  }
  print_stat("Published", &state.artifacts.published.len().to_string());
  print_stat("Signatures", &state.artifacts.signatures.len().to_string());
  print_stat("Attempts", &state.attempts.to_string());
  Ok(())
}
