//! Filesystem helpers.

use std::io::{self, Write};
use std::path::Path;

/// Write `contents` to `path` so that readers observe either the old file or
/// the complete new one.
///
/// The data is written to a temporary file in the destination directory,
/// flushed to disk, then renamed over the target.
pub fn write_atomic(path: &Path, contents: &[u8]) -> io::Result<()> {
  let parent = path
    .parent()
    .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no parent directory"))?;
  std::fs::create_dir_all(parent)?;

  let mut temp = tempfile::NamedTempFile::new_in(parent)?;
  temp.write_all(contents)?;
  temp.as_file().sync_all()?;
  temp.persist(path).map_err(|e| e.error)?;
  Ok(())
}

/// Turn an identifier like `:lib/json` into something safe to use as a
/// single path component.
pub fn sanitize_component(name: &str) -> String {
  let trimmed = name.trim_matches(':');
  if trimmed.is_empty() {
    return "_root".to_string();
  }
  trimmed
    .chars()
    .map(|c| {
      if c.is_alphanumeric() || c == '-' || c == '_' || c == '.' {
        c
      } else {
        '_'
      }
    })
    .collect()
}

#[cfg(test)]
mod tests {
  use super::*;
  use tempfile::tempdir;

  #[test]
  fn write_atomic_creates_parent_and_replaces() {
    let temp = tempdir().unwrap();
    let path = temp.path().join("nested/state.json");

    write_atomic(&path, b"first").unwrap();
    write_atomic(&path, b"second").unwrap();

    assert_eq!(std::fs::read_to_string(&path).unwrap(), "second");
    let leftovers: Vec<_> = std::fs::read_dir(path.parent().unwrap()).unwrap().collect();
    assert_eq!(leftovers.len(), 1);
  }

  #[test]
  fn sanitize_component_handles_root_and_separators() {
    assert_eq!(sanitize_component(":"), "_root");
    assert_eq!(sanitize_component(":lib_json"), "lib_json");
    assert_eq!(sanitize_component(":tools:launcher"), "tools_launcher");
  }
}
