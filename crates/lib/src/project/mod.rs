//! Project model: the static tree of modules a workspace is built from.
//!
//! Projects are created at configuration time and never change once the
//! task graph has been built.

pub mod coordinate;

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use semver::Version;

pub use coordinate::{ArtifactCoordinate, CoordinateError, DEFAULT_EXTENSION, ModuleKey};

/// Path of the root project.
pub const ROOT_PATH: &str = ":";

/// Returns true for in-progress versions such as `1.2.3-SNAPSHOT`.
pub fn is_snapshot(version: &Version) -> bool {
  version.pre.as_str().ends_with("SNAPSHOT")
}

/// Normalize a user-written project path (`lib_json`, `:lib_json`, ``) to
/// its canonical colon-prefixed form.
pub fn normalize_path(path: &str) -> String {
  let trimmed = path.trim().trim_matches(':');
  if trimmed.is_empty() {
    ROOT_PATH.to_string()
  } else {
    format!(":{}", trimmed.replace('/', ":"))
  }
}

/// One module of the workspace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Project {
  /// Canonical path, e.g. `:javatools` (`:` for the root).
  pub path: String,
  /// Logical name, used as the default artifact name.
  pub name: String,
  /// Directory that relative task paths are resolved against.
  pub dir: PathBuf,
  pub group: String,
  /// Inherited from the workspace unless overridden.
  pub version: Version,
}

impl Project {
  pub fn is_root(&self) -> bool {
    self.path == ROOT_PATH
  }

  /// Resolve a path declared by this project.
  pub fn resolve_path(&self, path: &Path) -> PathBuf {
    if path.is_absolute() {
      path.to_path_buf()
    } else {
      self.dir.join(path)
    }
  }
}

impl fmt::Display for Project {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "project '{}'", self.path)
  }
}

/// All projects of a workspace, keyed by path.
#[derive(Debug, Clone)]
pub struct ProjectTree {
  projects: BTreeMap<String, Project>,
}

impl ProjectTree {
  /// Create a tree holding only the root project.
  pub fn new(root: Project) -> Self {
    let mut projects = BTreeMap::new();
    projects.insert(root.path.clone(), root);
    Self { projects }
  }

  /// Add a project. Returns false if the path is already taken.
  pub fn insert(&mut self, project: Project) -> bool {
    if self.projects.contains_key(&project.path) {
      return false;
    }
    self.projects.insert(project.path.clone(), project);
    true
  }

  pub fn get(&self, path: &str) -> Option<&Project> {
    self.projects.get(path)
  }

  pub fn root(&self) -> Option<&Project> {
    self.projects.get(ROOT_PATH)
  }

  pub fn iter(&self) -> impl Iterator<Item = &Project> {
    self.projects.values()
  }

  pub fn len(&self) -> usize {
    self.projects.len()
  }

  pub fn is_empty(&self) -> bool {
    self.projects.is_empty()
  }
}
