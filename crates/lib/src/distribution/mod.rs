//! Distribution assembly.
//!
//! A distribution is staged as a directory tree
//!
//! ```text
//! <name>-<version>/
//! ├── VERSION
//! ├── bin/        launchers (plus their configured aliases)
//! ├── lib/        libraries, named by logical artifact name
//! └── javatools/  tool jars
//! ```
//!
//! and then archived as `.zip` and `.tar.gz` with identical contents, plus a
//! checksum listing of both archives.

pub mod archive;

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::consts::{ASSEMBLE_TASK, CHECKSUMS_FILE, VERSION_FILE};
use crate::graph::{ActionError, TaskAction, TaskId, TaskSpec};

#[derive(Debug, Error)]
pub enum DistributionError {
  #[error("I/O error at {path}: {source}")]
  Io {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("failed to write archive {path}: {message}")]
  Archive { path: PathBuf, message: String },

  #[error("distribution content {0} does not exist")]
  MissingSource(PathBuf),

  #[error("two distribution entries would be written to {0}")]
  DuplicateEntry(String),
}

/// Where an entry lands in the staged tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
  Launcher,
  Library,
  Tool,
}

impl EntryKind {
  /// Tools are recognised by name; anything else is a library.
  pub fn infer(file_name: &str) -> Self {
    if file_name.starts_with("javatools") {
      EntryKind::Tool
    } else {
      EntryKind::Library
    }
  }

  pub fn dir(self) -> &'static str {
    match self {
      EntryKind::Launcher => "bin",
      EntryKind::Library => "lib",
      EntryKind::Tool => "javatools",
    }
  }
}

/// One source file or directory placed into the distribution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DistributionEntry {
  pub source: PathBuf,
  pub kind: EntryKind,
  /// File name inside the kind directory.
  pub name: String,
}

impl DistributionEntry {
  /// `name` defaults to the source's file name and `kind` is inferred from it.
  pub fn new(source: PathBuf, kind: Option<EntryKind>, name: Option<String>) -> Self {
    let name = name.unwrap_or_else(|| {
      source
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
    });
    let kind = kind.unwrap_or_else(|| EntryKind::infer(&name));
    Self { source, kind, name }
  }

  pub fn dest(&self) -> String {
    format!("{}/{}", self.kind.dir(), self.name)
  }
}

/// Files produced by assembly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DistributionArtifacts {
  pub staging_dir: PathBuf,
  pub zip: PathBuf,
  pub tar_gz: PathBuf,
  pub checksums: PathBuf,
}

impl DistributionArtifacts {
  /// The archives and their checksum listing, in publication order.
  pub fn files(&self) -> Vec<&Path> {
    vec![self.zip.as_path(), self.tar_gz.as_path(), self.checksums.as_path()]
  }
}

/// Everything needed to assemble one distribution.
#[derive(Debug, Clone)]
pub struct Distribution {
  pub name: String,
  pub version: String,
  pub build_number: Option<String>,
  pub entries: Vec<DistributionEntry>,
  /// Extra names every launcher is copied under.
  pub launcher_names: Vec<String>,
  /// Directory receiving the staging tree and archives.
  pub output_dir: PathBuf,
}

impl Distribution {
  pub fn base_name(&self) -> String {
    format!("{}-{}", self.name, self.version)
  }

  pub fn artifacts(&self) -> DistributionArtifacts {
    let base = self.base_name();
    DistributionArtifacts {
      staging_dir: self.output_dir.join(&base),
      zip: self.output_dir.join(format!("{}.zip", base)),
      tar_gz: self.output_dir.join(format!("{}.tar.gz", base)),
      checksums: self.output_dir.join(format!("{}-{}", base, CHECKSUMS_FILE)),
    }
  }

  /// Contents of the `VERSION` file.
  pub fn version_stamp(&self) -> String {
    let mut stamp = format!("version={}\n", self.version);
    if let Some(build) = &self.build_number {
      stamp.push_str(&format!("build={}\n", build));
    }
    stamp
  }

  /// Build the staging tree from scratch.
  pub fn stage(&self) -> Result<PathBuf, DistributionError> {
    let staging_dir = self.artifacts().staging_dir;
    match fs::remove_dir_all(&staging_dir) {
      Ok(()) => {}
      Err(e) if e.kind() == io::ErrorKind::NotFound => {}
      Err(source) => {
        return Err(DistributionError::Io {
          path: staging_dir,
          source,
        });
      }
    }
    create_dir(&staging_dir)?;
    for kind in [EntryKind::Launcher, EntryKind::Library, EntryKind::Tool] {
      create_dir(&staging_dir.join(kind.dir()))?;
    }

    let mut written = std::collections::BTreeSet::new();
    let mut claim = |dest: String| {
      if written.insert(dest.clone()) {
        Ok(dest)
      } else {
        Err(DistributionError::DuplicateEntry(dest))
      }
    };

    for entry in &self.entries {
      if !entry.source.exists() {
        return Err(DistributionError::MissingSource(entry.source.clone()));
      }

      let dest = claim(entry.dest())?;
      copy_entry(&entry.source, &staging_dir.join(&dest))?;
      debug!(source = %entry.source.display(), dest = %dest, "staged distribution entry");

      if entry.kind == EntryKind::Launcher {
        set_executable(&staging_dir.join(&dest))?;
        for alias in &self.launcher_names {
          let alias_dest = claim(format!("{}/{}", EntryKind::Launcher.dir(), alias))?;
          let target = staging_dir.join(&alias_dest);
          copy_entry(&entry.source, &target)?;
          set_executable(&target)?;
        }
      }
    }

    let version_path = staging_dir.join(VERSION_FILE);
    fs::write(&version_path, self.version_stamp()).map_err(|source| DistributionError::Io {
      path: version_path,
      source,
    })?;

    Ok(staging_dir)
  }

  /// Stage, archive and checksum the distribution.
  pub fn assemble(&self) -> Result<DistributionArtifacts, DistributionError> {
    let artifacts = self.artifacts();
    info!(distribution = %self.base_name(), "assembling distribution");

    let staging_dir = self.stage()?;
    let entries = archive::collect_entries(&staging_dir, &self.base_name())?;
    archive::write_zip(&entries, &artifacts.zip)?;
    archive::write_tar_gz(&entries, &artifacts.tar_gz)?;
    archive::write_checksums(&[&artifacts.zip, &artifacts.tar_gz], &artifacts.checksums)?;

    info!(
      zip = %artifacts.zip.display(),
      tar_gz = %artifacts.tar_gz.display(),
      entries = entries.len(),
      "distribution assembled"
    );
    Ok(artifacts)
  }

  /// The `:assembleDist` task on `project`.
  ///
  /// Entry sources are its inputs, so tasks producing them are ordered first
  /// by edge inference.
  pub fn into_task(self, project: &str) -> TaskSpec {
    let artifacts = self.artifacts();

    let mut description = format!("assemble {}", self.base_name());
    for entry in &self.entries {
      description.push_str(&format!("\n{} <- {}", entry.dest(), entry.source.display()));
    }
    for alias in &self.launcher_names {
      description.push_str(&format!("\nalias {}", alias));
    }
    if let Some(build) = &self.build_number {
      description.push_str(&format!("\nbuild {}", build));
    }

    let mut spec = TaskSpec::new(TaskId::new(project, ASSEMBLE_TASK), TaskAction::noop());
    for entry in &self.entries {
      spec = spec.input(entry.source.clone());
    }
    spec = spec
      .output(artifacts.staging_dir)
      .output(artifacts.zip)
      .output(artifacts.tar_gz)
      .output(artifacts.checksums);

    let distribution = self;
    spec.action = TaskAction::new(description, move |_| {
      distribution
        .assemble()
        .map(|_| ())
        .map_err(|e| ActionError::Failed(e.to_string()))
    });
    spec
  }
}

fn create_dir(path: &Path) -> Result<(), DistributionError> {
  fs::create_dir_all(path).map_err(|source| DistributionError::Io {
    path: path.to_path_buf(),
    source,
  })
}

/// Copy a file, or a directory tree, to `dest`.
fn copy_entry(source: &Path, dest: &Path) -> Result<(), DistributionError> {
  let io_err = |path: &Path| {
    let path = path.to_path_buf();
    move |source: io::Error| DistributionError::Io { path, source }
  };

  if source.is_file() {
    if let Some(parent) = dest.parent() {
      create_dir(parent)?;
    }
    fs::copy(source, dest).map_err(io_err(dest))?;
    return Ok(());
  }

  for entry in WalkDir::new(source).sort_by_file_name() {
    let entry = entry.map_err(|e| DistributionError::Io {
      path: source.to_path_buf(),
      source: e.into(),
    })?;
    let rel = entry.path().strip_prefix(source).unwrap_or(entry.path());
    let target = dest.join(rel);
    if entry.file_type().is_dir() {
      create_dir(&target)?;
    } else {
      fs::copy(entry.path(), &target).map_err(io_err(&target))?;
    }
  }
  Ok(())
}

#[cfg(unix)]
fn set_executable(path: &Path) -> Result<(), DistributionError> {
  use std::os::unix::fs::PermissionsExt;
  if path.is_dir() {
    return Ok(());
  }
  fs::set_permissions(path, fs::Permissions::from_mode(0o755)).map_err(|source| DistributionError::Io {
    path: path.to_path_buf(),
    source,
  })
}

#[cfg(not(unix))]
fn set_executable(_path: &Path) -> Result<(), DistributionError> {
  Ok(())
}
