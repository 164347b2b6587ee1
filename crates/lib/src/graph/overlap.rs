//! Implicit dependency inference from declared paths.
//!
//! A producer/consumer relation exists when something a task writes is
//! something another task reads. Paths are compared component-wise after
//! lexical normalization; there is no string prefix matching, so
//! `build/lib` never matches `build/library`.

use std::path::{Component, Path, PathBuf};

/// Returns true if any of `outputs` overlaps any of `inputs`.
///
/// Two paths overlap when they are equal or one is an ancestor directory of
/// the other: a consumer of `build/classes/Foo.class` depends on the producer
/// of `build/classes`, and a consumer of all of `build/classes` depends on a
/// producer of any file inside it.
pub fn produces_input(outputs: &[PathBuf], inputs: &[PathBuf]) -> bool {
  outputs.iter().any(|output| {
    let output = normalize(output);
    inputs.iter().any(|input| {
      let input = normalize(input);
      input.starts_with(&output) || output.starts_with(&input)
    })
  })
}

/// Lexically normalize a path: drop `.` components and fold `..` into the
/// preceding component. The filesystem is not consulted.
pub fn normalize(path: &Path) -> PathBuf {
  let mut out = PathBuf::new();
  for component in path.components() {
    match component {
      Component::CurDir => {}
      Component::ParentDir => {
        if !out.pop() {
          out.push("..");
        }
      }
      other => out.push(other.as_os_str()),
    }
  }
  out
}
