//! Incremental build cache.
//!
//! One JSON entry per task records the input and output fingerprints of its
//! last successful run.
//!
//! # Storage Layout
//!
//! ```text
//! <output>/.strata/cache/
//! └── <project-id>/
//!     └── <task>.json
//! ```
//!
//! Entries are loaded into a snapshot when the cache is opened and all reads
//! go through it. Writes are atomic and serialized per task.

pub mod fingerprint;

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::config::{BuildConfig, FingerprintMode};
use crate::graph::{CachePolicy, TaskId, TaskSpec};
use crate::util::fs::{sanitize_component, write_atomic};
use crate::util::hash::HashError;

pub use fingerprint::Fingerprint;

/// Bumped whenever the entry layout changes; other versions read as corrupt.
pub const CACHE_FORMAT: u32 = 1;

#[derive(Debug, Error)]
pub enum CacheError {
  #[error("cache I/O error at {path}: {source}")]
  Io {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("failed to serialize cache entry: {0}")]
  Serialize(#[source] serde_json::Error),

  #[error(transparent)]
  Hash(#[from] HashError),
}

/// Persisted record of a task's last successful run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
  pub format: u32,
  pub task: TaskId,
  pub inputs: Fingerprint,
  pub outputs: Fingerprint,
  pub recorded_at_unix: u64,
}

#[derive(Debug, Clone)]
enum Slot {
  Valid(Box<CacheEntry>),
  Corrupt(String),
}

/// Why a task has to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StaleReason {
  OptedOut,
  NoOutputs,
  NoEntry,
  Corrupt,
  MissingOutput(PathBuf),
  InputsChanged(Vec<String>),
  OutputsChanged(Vec<String>),
  Unreadable(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Freshness {
  UpToDate,
  Stale(StaleReason),
}

/// Task-level incremental cache.
#[derive(Debug)]
pub struct IncrementalCache {
  dir: PathBuf,
  mode: FingerprintMode,
  snapshot: RwLock<HashMap<PathBuf, Slot>>,
  writers: Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>,
}

impl IncrementalCache {
  /// Open the cache under the configured output directory.
  pub fn open(config: &BuildConfig) -> Result<Self, CacheError> {
    Self::open_at(&config.cache_dir(), config.fingerprint)
  }

  pub fn open_at(dir: &Path, mode: FingerprintMode) -> Result<Self, CacheError> {
    let snapshot = load_snapshot(dir)?;
    debug!(dir = %dir.display(), entries = snapshot.len(), "opened incremental cache");
    Ok(Self {
      dir: dir.to_path_buf(),
      mode,
      snapshot: RwLock::new(snapshot),
      writers: Mutex::new(HashMap::new()),
    })
  }

  pub fn mode(&self) -> FingerprintMode {
    self.mode
  }

  pub fn entry_path(&self, task: &TaskId) -> PathBuf {
    self
      .dir
      .join(sanitize_component(&task.project))
      .join(format!("{}.json", sanitize_component(&task.name)))
  }

  /// Whether `spec` can be skipped.
  pub fn is_up_to_date(&self, spec: &TaskSpec) -> bool {
    matches!(self.freshness(spec), Freshness::UpToDate)
  }

  /// Compare the task's current state with its recorded entry.
  pub fn freshness(&self, spec: &TaskSpec) -> Freshness {
    if spec.cache == CachePolicy::Never {
      return Freshness::Stale(StaleReason::OptedOut);
    }
    if spec.outputs.is_empty() {
      return Freshness::Stale(StaleReason::NoOutputs);
    }

    let path = self.entry_path(&spec.id);
    let entry = {
      let snapshot = match self.snapshot.read() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
      };
      match snapshot.get(&path) {
        None => return Freshness::Stale(StaleReason::NoEntry),
        Some(Slot::Corrupt(reason)) => {
          warn!(task = %spec.id, path = %path.display(), reason = %reason, "cache entry is corrupt; treating as a miss");
          return Freshness::Stale(StaleReason::Corrupt);
        }
        Some(Slot::Valid(entry)) => entry.clone(),
      }
    };

    if let Some(missing) = spec.outputs.iter().find(|p| !p.exists()) {
      return Freshness::Stale(StaleReason::MissingOutput(missing.clone()));
    }

    let inputs = match Fingerprint::of_inputs(spec, self.mode) {
      Ok(fp) => fp,
      Err(e) => return Freshness::Stale(StaleReason::Unreadable(e.to_string())),
    };
    if inputs.combined != entry.inputs.combined {
      return Freshness::Stale(StaleReason::InputsChanged(entry.inputs.changed_entries(&inputs)));
    }

    let outputs = match Fingerprint::of_outputs(spec, self.mode) {
      Ok(fp) => fp,
      Err(e) => return Freshness::Stale(StaleReason::Unreadable(e.to_string())),
    };
    if outputs.combined != entry.outputs.combined {
      return Freshness::Stale(StaleReason::OutputsChanged(entry.outputs.changed_entries(&outputs)));
    }

    Freshness::UpToDate
  }

  /// Record a successful run of `task`.
  pub fn record_success(&self, task: &TaskId, inputs: Fingerprint, outputs: Fingerprint) -> Result<(), CacheError> {
    let path = self.entry_path(task);
    let lock = self.writer_for(&path);
    let _guard = match lock.lock() {
      Ok(guard) => guard,
      Err(poisoned) => poisoned.into_inner(),
    };

    let entry = CacheEntry {
      format: CACHE_FORMAT,
      task: task.clone(),
      inputs,
      outputs,
      recorded_at_unix: SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0),
    };
    let content = serde_json::to_vec_pretty(&entry).map_err(CacheError::Serialize)?;
    write_atomic(&path, &content).map_err(|source| CacheError::Io {
      path: path.clone(),
      source,
    })?;
    debug!(task = %task, input = %entry.inputs.combined.short(), "recorded cache entry");

    let mut snapshot = match self.snapshot.write() {
      Ok(guard) => guard,
      Err(poisoned) => poisoned.into_inner(),
    };
    snapshot.insert(path, Slot::Valid(Box::new(entry)));
    Ok(())
  }

  /// Forget any entry for `task`.
  pub fn invalidate(&self, task: &TaskId) -> Result<(), CacheError> {
    let path = self.entry_path(task);
    let lock = self.writer_for(&path);
    let _guard = match lock.lock() {
      Ok(guard) => guard,
      Err(poisoned) => poisoned.into_inner(),
    };

    match fs::remove_file(&path) {
      Ok(()) => info!(task = %task, "invalidated cache entry"),
      Err(e) if e.kind() == io::ErrorKind::NotFound => {}
      Err(source) => return Err(CacheError::Io { path, source }),
    }

    let mut snapshot = match self.snapshot.write() {
      Ok(guard) => guard,
      Err(poisoned) => poisoned.into_inner(),
    };
    snapshot.remove(&path);
    Ok(())
  }

  /// Delete every entry on disk.
  pub fn clear(&self) -> Result<(), CacheError> {
    match fs::remove_dir_all(&self.dir) {
      Ok(()) => {}
      Err(e) if e.kind() == io::ErrorKind::NotFound => {}
      Err(source) => {
        return Err(CacheError::Io {
          path: self.dir.clone(),
          source,
        });
      }
    }
    let mut snapshot = match self.snapshot.write() {
      Ok(guard) => guard,
      Err(poisoned) => poisoned.into_inner(),
    };
    snapshot.clear();
    Ok(())
  }

  fn writer_for(&self, path: &Path) -> Arc<Mutex<()>> {
    let mut writers = match self.writers.lock() {
      Ok(guard) => guard,
      Err(poisoned) => poisoned.into_inner(),
    };
    writers.entry(path.to_path_buf()).or_default().clone()
  }
}

fn load_snapshot(dir: &Path) -> Result<HashMap<PathBuf, Slot>, CacheError> {
  let mut snapshot = HashMap::new();
  if !dir.exists() {
    return Ok(snapshot);
  }

  for entry in WalkDir::new(dir).min_depth(2).max_depth(2) {
    let entry = entry.map_err(|e| CacheError::Io {
      path: dir.to_path_buf(),
      source: e.into(),
    })?;
    let path = entry.path();
    if !entry.file_type().is_file() || path.extension().is_none_or(|ext| ext != "json") {
      continue;
    }

    let slot = match fs::read(path) {
      Ok(bytes) => match serde_json::from_slice::<CacheEntry>(&bytes) {
        Ok(parsed) if parsed.format == CACHE_FORMAT => Slot::Valid(Box::new(parsed)),
        Ok(parsed) => Slot::Corrupt(format!("unsupported format {}", parsed.format)),
        Err(e) => Slot::Corrupt(e.to_string()),
      },
      Err(e) => Slot::Corrupt(e.to_string()),
    };
    snapshot.insert(path.to_path_buf(), slot);
  }

  Ok(snapshot)
}
