//! Persistent release state.
//!
//! One JSON document per `(distribution, version)` records how far the
//! release has progressed. It is rewritten atomically after every
//! transition, so a crashed run leaves either the previous or the new state.
//!
//! # Storage Layout
//!
//! ```text
//! <output>/.strata/release/
//! ├── <distribution>.lock
//! └── <distribution>/
//!     └── <version>.json
//! ```

use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::distribution::DistributionArtifacts;
use crate::project::ArtifactCoordinate;
use crate::util::fs::{sanitize_component, write_atomic};

const STATE_FORMAT: u32 = 1;

/// Release stages, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
  Assemble,
  Sign,
  Stage,
  Publish,
  Tag,
}

impl Stage {
  pub const ALL: [Stage; 5] = [Stage::Assemble, Stage::Sign, Stage::Stage, Stage::Publish, Stage::Tag];

  pub fn next(self) -> Option<Stage> {
    let idx = Self::ALL.iter().position(|s| *s == self)?;
    Self::ALL.get(idx + 1).copied()
  }

  pub fn in_progress(self) -> ReleaseStatus {
    match self {
      Stage::Assemble => ReleaseStatus::Assembling,
      Stage::Sign => ReleaseStatus::Signing,
      Stage::Stage => ReleaseStatus::Staging,
      Stage::Publish => ReleaseStatus::Publishing,
      Stage::Tag => ReleaseStatus::Tagging,
    }
  }

  pub fn completed(self) -> ReleaseStatus {
    match self {
      Stage::Assemble => ReleaseStatus::Assembled,
      Stage::Sign => ReleaseStatus::Signed,
      Stage::Stage => ReleaseStatus::Staged,
      Stage::Publish => ReleaseStatus::Published,
      Stage::Tag => ReleaseStatus::Tagged,
    }
  }
}

impl fmt::Display for Stage {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      Stage::Assemble => "assemble",
      Stage::Sign => "sign",
      Stage::Stage => "stage",
      Stage::Publish => "publish",
      Stage::Tag => "tag",
    };
    f.write_str(name)
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReleaseStatus {
  NotStarted,
  Assembling,
  Assembled,
  Signing,
  Signed,
  Staging,
  Staged,
  Publishing,
  Published,
  Tagging,
  Tagged,
  Failed { stage: Stage, error: String },
}

impl ReleaseStatus {
  /// The stage this status says is running.
  pub fn running(&self) -> Option<Stage> {
    Stage::ALL.into_iter().find(|s| s.in_progress() == *self)
  }

  /// The stage this status says has just completed.
  pub fn completed(&self) -> Option<Stage> {
    Stage::ALL.into_iter().find(|s| s.completed() == *self)
  }
}

impl fmt::Display for ReleaseStatus {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      ReleaseStatus::Failed { stage, error } => write!(f, "FAILED({}): {}", stage, error),
      other => {
        let json = serde_json::to_value(other).ok();
        let name = json
          .as_ref()
          .and_then(|v| v.get("status"))
          .and_then(|v| v.as_str())
          .unwrap_or("UNKNOWN");
        f.write_str(name)
      }
    }
  }
}

#[derive(Debug, Error)]
pub enum StateError {
  #[error("invalid release transition from {from} to {to}")]
  InvalidTransition { from: String, to: String },

  #[error("failed to read release state {path}: {source}")]
  Read {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("failed to write release state {path}: {source}")]
  Write {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("release state {path} is unreadable: {message}")]
  Parse { path: PathBuf, message: String },
}

/// What each completed stage produced.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseArtifacts {
  pub distribution: Option<DistributionArtifacts>,
  pub signatures: Vec<PathBuf>,
  pub staged: Vec<ArtifactCoordinate>,
  pub published: Vec<ArtifactCoordinate>,
  pub tag: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseState {
  pub format: u32,
  pub distribution: String,
  pub version: String,
  #[serde(flatten)]
  pub status: ReleaseStatus,
  pub last_completed: Option<Stage>,
  pub artifacts: ReleaseArtifacts,
  /// Number of pipeline runs for this release, including the current one.
  pub attempts: u32,
  pub created_at_unix: u64,
  pub updated_at_unix: u64,
}

impl ReleaseState {
  pub fn new(distribution: &str, version: &str) -> Self {
    let now = now_unix();
    Self {
      format: STATE_FORMAT,
      distribution: distribution.to_string(),
      version: version.to_string(),
      status: ReleaseStatus::NotStarted,
      last_completed: None,
      artifacts: ReleaseArtifacts::default(),
      attempts: 0,
      created_at_unix: now,
      updated_at_unix: now,
    }
  }

  /// `<release_dir>/<distribution>/<version>.json`
  pub fn path(release_dir: &Path, distribution: &str, version: &str) -> PathBuf {
    release_dir
      .join(sanitize_component(distribution))
      .join(format!("{}.json", sanitize_component(version)))
  }

  /// Load a state file; `None` if the release was never started.
  pub fn load(path: &Path) -> Result<Option<Self>, StateError> {
    let content = match fs::read(path) {
      Ok(content) => content,
      Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
      Err(source) => {
        return Err(StateError::Read {
          path: path.to_path_buf(),
          source,
        });
      }
    };

    let state: Self = serde_json::from_slice(&content).map_err(|e| StateError::Parse {
      path: path.to_path_buf(),
      message: e.to_string(),
    })?;
    if state.format != STATE_FORMAT {
      return Err(StateError::Parse {
        path: path.to_path_buf(),
        message: format!("unsupported format {}", state.format),
      });
    }
    Ok(Some(state))
  }

  pub fn save(&self, path: &Path) -> Result<(), StateError> {
    let content = serde_json::to_vec_pretty(self).map_err(|e| StateError::Write {
      path: path.to_path_buf(),
      source: io::Error::other(e),
    })?;
    write_atomic(path, &content).map_err(|source| StateError::Write {
      path: path.to_path_buf(),
      source,
    })?;
    debug!(path = %path.display(), status = %self.status, "saved release state");
    Ok(())
  }

  /// The stage a run should start with, or `None` once tagged.
  ///
  /// This is the stage after the last completed one; a stage left running
  /// by a crashed process is therefore restarted.
  pub fn resume_stage(&self) -> Option<Stage> {
    match self.last_completed {
      None => Some(Stage::Assemble),
      Some(stage) => stage.next(),
    }
  }

  pub fn is_released(&self) -> bool {
    self.status == ReleaseStatus::Tagged
  }

  /// Move to `stage`'s in-progress status.
  ///
  /// Allowed when `stage` is the one [`Self::resume_stage`] names, whatever
  /// the current status (completed predecessor, same stage left running, or
  /// the same stage failed).
  pub fn begin(&mut self, stage: Stage) -> Result<(), StateError> {
    if self.resume_stage() != Some(stage) {
      return Err(self.invalid(stage.in_progress()));
    }
    let resumable = match &self.status {
      ReleaseStatus::NotStarted => stage == Stage::Assemble,
      ReleaseStatus::Failed { stage: failed, .. } => *failed == stage,
      status => status.running() == Some(stage) || status.completed().and_then(Stage::next) == Some(stage),
    };
    if !resumable {
      return Err(self.invalid(stage.in_progress()));
    }
    self.set(stage.in_progress());
    Ok(())
  }

  /// Record `stage` as completed. Completed stages are never rolled back.
  pub fn complete(&mut self, stage: Stage) -> Result<(), StateError> {
    if self.status.running() != Some(stage) {
      return Err(self.invalid(stage.completed()));
    }
    self.last_completed = Some(stage);
    self.set(stage.completed());
    Ok(())
  }

  pub fn fail(&mut self, stage: Stage, error: &str) -> Result<(), StateError> {
    let failed = ReleaseStatus::Failed {
      stage,
      error: error.to_string(),
    };
    if self.status.running() != Some(stage) {
      return Err(self.invalid(failed));
    }
    self.set(failed);
    Ok(())
  }

  fn set(&mut self, status: ReleaseStatus) {
    self.status = status;
    self.updated_at_unix = now_unix();
  }

  fn invalid(&self, to: ReleaseStatus) -> StateError {
    StateError::InvalidTransition {
      from: self.status.to_string(),
      to: to.to_string(),
    }
  }
}

fn now_unix() -> u64 {
  SystemTime::now()
    .duration_since(UNIX_EPOCH)
    .map(|d| d.as_secs())
    .unwrap_or(0)
}
