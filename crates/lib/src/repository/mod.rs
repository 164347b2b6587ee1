//! Artifact repositories in Maven layout.
//!
//! A [`RepositoryClient`] stores and retrieves files addressed by
//! [`ArtifactCoordinate`]. Every pushed file is followed by a `.sha256`
//! sidecar; pushing a module's primary artifact also pushes a minimal POM.

pub mod local;
pub mod remote;

use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::project::ArtifactCoordinate;
use crate::util::hash::hash_bytes;

pub use local::LocalRepository;
pub use remote::{RemoteAuth, RemoteRepository};

#[derive(Debug, Error)]
pub enum RepositoryError {
  #[error("I/O error at {path}: {source}")]
  Io {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("request to {url} failed: {message}")]
  Transport { url: String, message: String },

  #[error("{url} rejected credentials (HTTP {status})")]
  Unauthorized { url: String, status: u16 },

  #[error("{url} returned HTTP {status}")]
  Status { url: String, status: u16 },

  #[error("artifact {coordinate} not found in repository '{repository}'")]
  NotFound { repository: String, coordinate: String },

  #[error("checksum mismatch for {url}: expected {expected}, got {actual}")]
  ChecksumMismatch { url: String, expected: String, actual: String },
}

/// Publication metadata for a pushed artifact.
#[derive(Debug, Clone)]
pub struct ArtifactMetadata {
  pub description: Option<String>,
  /// Extension of the module's primary artifact; the POM accompanies it.
  pub packaging: String,
}

impl Default for ArtifactMetadata {
  fn default() -> Self {
    Self {
      description: None,
      packaging: crate::project::DEFAULT_EXTENSION.to_string(),
    }
  }
}

/// A store of artifacts.
///
/// Implementations are synchronous; callers on an async runtime should move
/// calls onto a blocking thread.
pub trait RepositoryClient: Send + Sync {
  /// Display name used in logs and errors.
  fn name(&self) -> &str;

  fn contains(&self, coordinate: &ArtifactCoordinate) -> Result<bool, RepositoryError>;

  /// Upload `file` as `coordinate`, plus its checksum (and POM for a primary artifact).
  fn push(&self, coordinate: &ArtifactCoordinate, file: &Path, metadata: &ArtifactMetadata)
  -> Result<(), RepositoryError>;

  /// Download `coordinate` to `dest`.
  fn pull(&self, coordinate: &ArtifactCoordinate, dest: &Path) -> Result<(), RepositoryError>;
}

/// Every file a push writes, as `(repository path, bytes)`, in upload order.
pub(crate) fn publication_files(
  coordinate: &ArtifactCoordinate,
  file: &Path,
  metadata: &ArtifactMetadata,
) -> Result<Vec<(String, Vec<u8>)>, RepositoryError> {
  let bytes = std::fs::read(file).map_err(|source| RepositoryError::Io {
    path: file.to_path_buf(),
    source,
  })?;

  let mut files = Vec::new();
  push_with_checksum(&mut files, coordinate.repository_path(), bytes);

  if coordinate.classifier.is_none() && coordinate.extension == metadata.packaging {
    let pom = coordinate.pom();
    push_with_checksum(&mut files, pom.repository_path(), render_pom(coordinate, metadata).into_bytes());
  }

  Ok(files)
}

fn push_with_checksum(files: &mut Vec<(String, Vec<u8>)>, path: String, bytes: Vec<u8>) {
  let checksum = hash_bytes(&bytes).0.into_bytes();
  let checksum_path = format!("{}.sha256", path);
  files.push((path, bytes));
  files.push((checksum_path, checksum));
}

/// A minimal POM naming the module.
pub fn render_pom(coordinate: &ArtifactCoordinate, metadata: &ArtifactMetadata) -> String {
  let mut pom = String::new();
  pom.push_str("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
  pom.push_str("<project xmlns=\"http://maven.apache.org/POM/4.0.0\">\n");
  pom.push_str("  <modelVersion>4.0.0</modelVersion>\n");
  pom.push_str(&format!("  <groupId>{}</groupId>\n", xml_escape(&coordinate.group)));
  pom.push_str(&format!("  <artifactId>{}</artifactId>\n", xml_escape(&coordinate.name)));
  pom.push_str(&format!("  <version>{}</version>\n", xml_escape(&coordinate.version)));
  pom.push_str(&format!("  <packaging>{}</packaging>\n", xml_escape(&metadata.packaging)));
  if let Some(description) = &metadata.description {
    pom.push_str(&format!("  <description>{}</description>\n", xml_escape(description)));
  }
  pom.push_str("</project>\n");
  pom
}

fn xml_escape(value: &str) -> String {
  value
    .replace('&', "&amp;")
    .replace('<', "&lt;")
    .replace('>', "&gt;")
    .replace('"', "&quot;")
}
