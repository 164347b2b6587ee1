//! `strata clean`: delete declared outputs and forget cached fingerprints.

use std::fs;
use std::io;
use std::path::Path;

use anyhow::{Context, Result};
use tracing::debug;

use strata_lib::cache::IncrementalCache;

use super::{GlobalOptions, load};
use crate::output::{print_stat, print_success};

pub fn cmd_clean(opts: &GlobalOptions) -> Result<()> {
  let workspace = load(opts)?;

  let mut removed = 0;
  for output in workspace.declared_outputs() {
    if remove_path(&output).with_context(|| format!("Failed to remove {}", output.display()))? {
      debug!(path = %output.display(), "removed output");
      removed += 1;
    }
  }

  IncrementalCache::open(&workspace.config)
    .and_then(|cache| cache.clear())
    .context("Failed to clear the task cache")?;

  print_success("Clean complete");
  print_stat("Outputs removed", &removed.to_string());
  Ok(())
}

/// Remove a file or directory tree; `false` when it did not exist.
fn remove_path(path: &Path) -> io::Result<bool> {
  let result = match fs::symlink_metadata(path) {
    Ok(meta) if meta.is_dir() => fs::remove_dir_all(path),
    Ok(_) => fs::remove_file(path),
    Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
    Err(e) => return Err(e),
  };
  result.map(|()| true)
}

#[cfg(test)]
mod tests {
  use super::*;
  use tempfile::tempdir;

  #[test]
  fn remove_path_handles_files_dirs_and_missing() {
    let temp = tempdir().unwrap();
    let file = temp.path().join("out.txt");
    let dir = temp.path().join("classes");
    fs::write(&file, "x").unwrap();
    fs::create_dir_all(dir.join("nested")).unwrap();
    fs::write(dir.join("nested/A.class"), "x").unwrap();

    assert!(remove_path(&file).unwrap());
    assert!(remove_path(&dir).unwrap());
    assert!(!remove_path(&temp.path().join("missing")).unwrap());
    assert!(!file.exists());
    assert!(!dir.exists());
  }
}
