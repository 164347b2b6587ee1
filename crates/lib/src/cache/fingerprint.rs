//! Fingerprints of a task's declared inputs and outputs.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::config::FingerprintMode;
use crate::graph::TaskSpec;
use crate::util::hash::{ContentHash, HashError, hash_bytes, hash_directory, hash_file, metadata_digest};

/// Marker recorded for a declared path that does not exist.
const MISSING: &str = "missing";

/// Entry key for the action description, outside the `prop:` namespace.
pub const ACTION_KEY: &str = "action";

/// Combined digest plus the per-entry detail it was computed from.
///
/// Entry keys are `path:<path>`, `prop:<name>` and `action`; the detail is kept so a
/// stale entry can report what changed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fingerprint {
  pub combined: ContentHash,
  pub entries: BTreeMap<String, String>,
}

impl Fingerprint {
  fn from_entries(entries: BTreeMap<String, String>) -> Self {
    let mut material = String::new();
    for (key, value) in &entries {
      material.push_str(key);
      material.push('=');
      material.push_str(value);
      material.push('\n');
    }
    Self {
      combined: hash_bytes(material.as_bytes()),
      entries,
    }
  }

  /// Input paths, input properties and the action description.
  pub fn of_inputs(spec: &TaskSpec, mode: FingerprintMode) -> Result<Self, HashError> {
    let mut entries = fingerprint_paths(&spec.inputs, mode)?;
    for (key, value) in &spec.properties {
      entries.insert(format!("prop:{}", key), value.clone());
    }
    entries.insert(ACTION_KEY.to_string(), spec.action.description().to_string());
    Ok(Self::from_entries(entries))
  }

  /// Output paths only.
  pub fn of_outputs(spec: &TaskSpec, mode: FingerprintMode) -> Result<Self, HashError> {
    Ok(Self::from_entries(fingerprint_paths(&spec.outputs, mode)?))
  }

  /// Keys whose value differs between the two fingerprints, sorted.
  pub fn changed_entries(&self, other: &Fingerprint) -> Vec<String> {
    let mut changed: Vec<String> = self
      .entries
      .iter()
      .filter(|(k, v)| other.entries.get(*k) != Some(*v))
      .map(|(k, _)| k.clone())
      .collect();
    for key in other.entries.keys() {
      if !self.entries.contains_key(key) {
        changed.push(key.clone());
      }
    }
    changed.sort();
    changed
  }
}

/// Digest each path in parallel.
fn fingerprint_paths(paths: &[PathBuf], mode: FingerprintMode) -> Result<BTreeMap<String, String>, HashError> {
  paths
    .par_iter()
    .map(|path| {
      let digest = digest_path(path, mode)?;
      Ok((format!("path:{}", path.display()), digest))
    })
    .collect()
}

fn digest_path(path: &Path, mode: FingerprintMode) -> Result<String, HashError> {
  let Ok(meta) = std::fs::symlink_metadata(path) else {
    return Ok(MISSING.to_string());
  };
  let hash = match mode {
    FingerprintMode::Timestamp => metadata_digest(path)?,
    FingerprintMode::Content if meta.is_dir() => hash_directory(path, &[])?,
    FingerprintMode::Content => hash_file(path)?,
  };
  Ok(hash.0)
}
