//! Artifact coordinate resolution.
//!
//! A coordinate resolves to the workspace project that produces it when one
//! does, whatever version was requested, and otherwise to the first
//! configured remote repository that has it.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, warn};

use crate::graph::TaskId;
use crate::project::{ArtifactCoordinate, ModuleKey};
use crate::repository::RepositoryClient;

/// An artifact some workspace task produces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalArtifact {
  pub coordinate: ArtifactCoordinate,
  pub project: String,
  pub task: TaskId,
  pub path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
  /// Produced in this workspace; depend on `artifact.task`.
  Local(LocalArtifact),
  /// Available from the named remote repository.
  Remote {
    coordinate: ArtifactCoordinate,
    repository: String,
  },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ResolveError {
  #[error("cannot resolve {coordinate}: not produced locally and not found in [{}]", .probed.join(", "))]
  Unresolved {
    coordinate: ArtifactCoordinate,
    probed: Vec<String>,
  },

  #[error("{key} is produced by both {first} and {second}")]
  Ambiguous { key: String, first: String, second: String },
}

pub struct CoordinateResolver {
  local: BTreeMap<ModuleKey, LocalArtifact>,
  remotes: Vec<Arc<dyn RepositoryClient>>,
}

impl CoordinateResolver {
  /// `remotes` are probed in the given order.
  pub fn new(remotes: Vec<Arc<dyn RepositoryClient>>) -> Self {
    Self {
      local: BTreeMap::new(),
      remotes,
    }
  }

  /// Record that `project` produces `coordinate` at `path` via `task`.
  ///
  /// # Errors
  ///
  /// `Ambiguous` if a different project already claims the same module.
  pub fn register_local(
    &mut self,
    coordinate: ArtifactCoordinate,
    project: &str,
    task: TaskId,
    path: PathBuf,
  ) -> Result<(), ResolveError> {
    let key = coordinate.module_key();
    if let Some(existing) = self.local.get(&key)
      && existing.project != project
    {
      return Err(ResolveError::Ambiguous {
        key: key.to_string(),
        first: existing.project.clone(),
        second: project.to_string(),
      });
    }

    debug!(artifact = %coordinate, project = %project, task = %task, "registered local artifact");
    self.local.insert(
      key,
      LocalArtifact {
        coordinate,
        project: project.to_string(),
        task,
        path,
      },
    );
    Ok(())
  }

  pub fn local_artifacts(&self) -> impl Iterator<Item = &LocalArtifact> {
    self.local.values()
  }

  pub fn repository(&self, name: &str) -> Option<Arc<dyn RepositoryClient>> {
    self.remotes.iter().find(|r| r.name() == name).cloned()
  }

  /// Resolve a coordinate; local producers always win.
  pub fn resolve(&self, coordinate: &ArtifactCoordinate) -> Result<Resolution, ResolveError> {
    if let Some(local) = self.local.get(&coordinate.module_key()) {
      if local.coordinate.version != coordinate.version {
        debug!(
          requested = %coordinate,
          substituted = %local.coordinate,
          "substituting local project for requested version"
        );
      }
      return Ok(Resolution::Local(local.clone()));
    }

    let mut probed = Vec::new();
    for remote in &self.remotes {
      probed.push(remote.name().to_string());
      match remote.contains(coordinate) {
        Ok(true) => {
          debug!(artifact = %coordinate, repository = %remote.name(), "resolved remotely");
          return Ok(Resolution::Remote {
            coordinate: coordinate.clone(),
            repository: remote.name().to_string(),
          });
        }
        Ok(false) => {}
        Err(e) => warn!(artifact = %coordinate, repository = %remote.name(), error = %e, "repository probe failed"),
      }
    }

    Err(ResolveError::Unresolved {
      coordinate: coordinate.clone(),
      probed,
    })
  }
}
