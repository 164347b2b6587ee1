//! Filesystem repository in Maven layout, used for staging.

use std::path::{Path, PathBuf};

use tracing::{debug, info};

use super::{ArtifactMetadata, RepositoryClient, RepositoryError, publication_files};
use crate::project::ArtifactCoordinate;
use crate::util::fs::write_atomic;

#[derive(Debug, Clone)]
pub struct LocalRepository {
  name: String,
  root: PathBuf,
}

impl LocalRepository {
  pub fn new(name: &str, root: &Path) -> Self {
    Self {
      name: name.to_string(),
      root: root.to_path_buf(),
    }
  }

  pub fn root(&self) -> &Path {
    &self.root
  }

  /// Location of `coordinate` on disk.
  pub fn path_of(&self, coordinate: &ArtifactCoordinate) -> PathBuf {
    self.root.join(coordinate.repository_path())
  }
}

impl RepositoryClient for LocalRepository {
  fn name(&self) -> &str {
    &self.name
  }

  fn contains(&self, coordinate: &ArtifactCoordinate) -> Result<bool, RepositoryError> {
    Ok(self.path_of(coordinate).is_file())
  }

  fn push(
    &self,
    coordinate: &ArtifactCoordinate,
    file: &Path,
    metadata: &ArtifactMetadata,
  ) -> Result<(), RepositoryError> {
    for (relative, bytes) in publication_files(coordinate, file, metadata)? {
      let dest = self.root.join(&relative);
      write_atomic(&dest, &bytes).map_err(|source| RepositoryError::Io {
        path: dest.clone(),
        source,
      })?;
      debug!(repository = %self.name, path = %relative, "wrote repository file");
    }
    info!(repository = %self.name, artifact = %coordinate, "pushed artifact");
    Ok(())
  }

  fn pull(&self, coordinate: &ArtifactCoordinate, dest: &Path) -> Result<(), RepositoryError> {
    let source = self.path_of(coordinate);
    let bytes = match std::fs::read(&source) {
      Ok(bytes) => bytes,
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
        return Err(RepositoryError::NotFound {
          repository: self.name.clone(),
          coordinate: coordinate.to_string(),
        });
      }
      Err(source_err) => {
        return Err(RepositoryError::Io {
          path: source,
          source: source_err,
        });
      }
    };
    write_atomic(dest, &bytes).map_err(|source| RepositoryError::Io {
      path: dest.to_path_buf(),
      source,
    })?;
    debug!(repository = %self.name, artifact = %coordinate, dest = %dest.display(), "pulled artifact");
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use tempfile::tempdir;

  #[test]
  fn push_then_pull() {
    let temp = tempdir().unwrap();
    let repo = LocalRepository::new("staging", &temp.path().join("repo"));
    let coord = ArtifactCoordinate::new("org.xtclang", "javatools", "0.4.3");

    let file = temp.path().join("javatools.jar");
    std::fs::write(&file, "classes").unwrap();

    assert!(!repo.contains(&coord).unwrap());
    repo.push(&coord, &file, &ArtifactMetadata::default()).unwrap();
    assert!(repo.contains(&coord).unwrap());
    assert!(repo.contains(&coord.pom()).unwrap());
    assert!(
      temp
        .path()
        .join("repo/org/xtclang/javatools/0.4.3/javatools-0.4.3.jar.sha256")
        .is_file()
    );

    let dest = temp.path().join("out/javatools.jar");
    repo.pull(&coord, &dest).unwrap();
    assert_eq!(std::fs::read_to_string(dest).unwrap(), "classes");
  }

  #[test]
  fn pull_missing_is_not_found() {
    let temp = tempdir().unwrap();
    let repo = LocalRepository::new("staging", temp.path());
    let err = repo
      .pull(&ArtifactCoordinate::new("g", "missing", "1"), &temp.path().join("x"))
      .unwrap_err();
    assert!(matches!(err, RepositoryError::NotFound { .. }));
  }
}
