//! The release pipeline: assemble, sign, stage, publish, tag.
//!
//! Progress is persisted after every transition so an interrupted or failed
//! release resumes at the first stage that has not completed. A lock file per
//! distribution keeps two runs from interleaving.

use std::io;
use std::path::{Path, PathBuf};

use semver::Version;
use thiserror::Error;
use tracing::{debug, error, info};

use super::assemble::{AssembleError, Assembler};
use super::lock::{LockError, ReleaseLock};
use super::signing::{SigningError, SigningPolicy, Signer, resolve_signing, sign_files, signature_path};
use super::state::{ReleaseArtifacts, ReleaseState, Stage, StateError};
use super::tagging::{SourceControl, TagError, TagOutcome, apply_tag};
use crate::config::BuildConfig;
use crate::project::{ArtifactCoordinate, is_snapshot};
use crate::repository::{ArtifactMetadata, LocalRepository, RepositoryClient, RepositoryError};
use crate::util::fs::sanitize_component;

/// Classifier of the published checksum listing.
pub const CHECKSUMS_CLASSIFIER: &str = "checksums";

#[derive(Debug, Error)]
pub enum ReleaseError {
  #[error(transparent)]
  Lock(#[from] LockError),

  #[error(transparent)]
  State(#[from] StateError),

  #[error(transparent)]
  Assemble(#[from] AssembleError),

  #[error(transparent)]
  Signing(#[from] SigningError),

  #[error(transparent)]
  Repository(#[from] RepositoryError),

  #[error(transparent)]
  Tag(#[from] TagError),

  #[error("the {0} stage has no recorded distribution artifacts")]
  MissingArtifacts(Stage),

  #[error("failed to create scratch directory: {0}")]
  Scratch(#[source] io::Error),

  #[error("release stage '{stage}' failed: {source}")]
  StageFailed {
    stage: Stage,
    #[source]
    source: Box<ReleaseError>,
  },
}

impl ReleaseError {
  /// The stage a failed run stopped at, if it got that far.
  pub fn stage(&self) -> Option<Stage> {
    match self {
      ReleaseError::StageFailed { stage, .. } => Some(*stage),
      _ => None,
    }
  }
}

/// Lock file guarding releases of `distribution`.
pub fn lock_path(config: &BuildConfig, distribution: &str) -> PathBuf {
  config
    .release_dir()
    .join(format!("{}.lock", sanitize_component(distribution)))
}

/// One release of one distribution.
pub struct ReleasePipeline<'a> {
  pub config: &'a BuildConfig,
  pub group: String,
  pub distribution: String,
  pub version: Version,
  /// Packaging recorded in the POM; pushed alongside the matching archive.
  pub metadata: ArtifactMetadata,
  pub assembler: &'a dyn Assembler,
  pub signer: &'a dyn Signer,
  pub remote: &'a dyn RepositoryClient,
  pub scm: &'a dyn SourceControl,
}

impl ReleasePipeline<'_> {
  pub fn lock_path(&self) -> PathBuf {
    lock_path(self.config, &self.distribution)
  }

  pub fn state_path(&self) -> PathBuf {
    ReleaseState::path(&self.config.release_dir(), &self.distribution, &self.version.to_string())
  }

  pub fn tag_name(&self) -> String {
    format!("{}{}", self.config.tag_prefix, self.version)
  }

  fn snapshot(&self) -> bool {
    is_snapshot(&self.version)
  }

  fn staging(&self) -> LocalRepository {
    LocalRepository::new("staging", &self.config.staging_repo_dir())
  }

  /// Run the pipeline to `TAGGED`, starting after the last completed stage.
  ///
  /// `command` is recorded in the lock file for contention diagnostics.
  pub fn run(&self, command: &str) -> Result<ReleaseState, ReleaseError> {
    let _lock = ReleaseLock::acquire(&self.lock_path(), command, self.config.stale_lock_after)?;

    let state_path = self.state_path();
    let version = self.version.to_string();
    let mut state = ReleaseState::load(&state_path)?.unwrap_or_else(|| ReleaseState::new(&self.distribution, &version));

    if state.is_released() {
      info!(distribution = %self.distribution, version = %version, "release already tagged; nothing to do");
      return Ok(state);
    }

    state.attempts += 1;
    state.save(&state_path)?;
    if let Some(stage) = state.resume_stage()
      && stage != Stage::Assemble
    {
      info!(stage = %stage, attempt = state.attempts, "resuming release");
    }

    while let Some(stage) = state.resume_stage() {
      state.begin(stage)?;
      state.save(&state_path)?;
      info!(stage = %stage, distribution = %self.distribution, version = %version, "release stage started");

      match self.run_stage(stage, &mut state, &state_path) {
        Ok(()) => {
          state.complete(stage)?;
          state.save(&state_path)?;
          info!(stage = %stage, "release stage completed");
        }
        Err(e) => {
          error!(stage = %stage, error = %e, "release stage failed");
          state.fail(stage, &e.to_string())?;
          state.save(&state_path)?;
          return Err(ReleaseError::StageFailed {
            stage,
            source: Box::new(e),
          });
        }
      }
    }

    Ok(state)
  }

  fn run_stage(&self, stage: Stage, state: &mut ReleaseState, state_path: &Path) -> Result<(), ReleaseError> {
    match stage {
      Stage::Assemble => {
        let artifacts = self.assembler.assemble()?;
        state.artifacts = ReleaseArtifacts {
          distribution: Some(artifacts),
          ..ReleaseArtifacts::default()
        };
      }
      Stage::Sign => {
        let artifacts = state
          .artifacts
          .distribution
          .as_ref()
          .ok_or(ReleaseError::MissingArtifacts(stage))?;
        state.artifacts.signatures = match resolve_signing(&self.config.signing, self.config.ci, self.snapshot())? {
          SigningPolicy::Skip { reason } => {
            info!(reason = %reason, "skipping signing");
            Vec::new()
          }
          SigningPolicy::Sign { key, passphrase } => {
            sign_files(self.signer, &artifacts.files(), &key, passphrase.as_deref())?
          }
        };
      }
      Stage::Stage => {
        let staging = self.staging();
        let mut staged = Vec::new();
        for (coordinate, file) in self.publications(&state.artifacts, stage)? {
          staging.push(&coordinate, &file, &self.metadata)?;
          debug!(coordinate = %coordinate, "staged artifact");
          staged.push(coordinate);
        }
        state.artifacts.staged = staged;
      }
      Stage::Publish => {
        let staging = self.staging();
        let scratch = tempfile::tempdir().map_err(ReleaseError::Scratch)?;
        for coordinate in state.artifacts.staged.clone() {
          if state.artifacts.published.contains(&coordinate) {
            debug!(coordinate = %coordinate, "already published");
            continue;
          }
          let file = scratch.path().join(coordinate.file_name());
          staging.pull(&coordinate, &file)?;
          self.remote.push(&coordinate, &file, &self.metadata)?;
          info!(coordinate = %coordinate, repository = self.remote.name(), "published artifact");

          state.artifacts.published.push(coordinate);
          state.save(state_path)?;
        }
      }
      Stage::Tag => {
        let tag = self.tag_name();
        match apply_tag(self.scm, &tag, self.snapshot())? {
          TagOutcome::Created { commit } | TagOutcome::Unchanged { commit } => {
            debug!(tag = %tag, commit = %commit, "release tag in place");
          }
          TagOutcome::Moved { from, to } => debug!(tag = %tag, from = %from, to = %to, "release tag moved"),
        }
        state.artifacts.tag = Some(tag);
      }
    }
    Ok(())
  }

  /// Every file to stage, with its coordinate: the archives, the checksum
  /// listing, and a signature for each of those that was signed.
  fn publications(
    &self,
    artifacts: &ReleaseArtifacts,
    stage: Stage,
  ) -> Result<Vec<(ArtifactCoordinate, PathBuf)>, ReleaseError> {
    let dist = artifacts
      .distribution
      .as_ref()
      .ok_or(ReleaseError::MissingArtifacts(stage))?;
    let base = ArtifactCoordinate::new(&self.group, &self.distribution, &self.version.to_string());

    let primary = vec![
      (base.clone().with_extension("zip"), dist.zip.clone()),
      (base.clone().with_extension("tar.gz"), dist.tar_gz.clone()),
      (
        base.with_classifier(Some(CHECKSUMS_CLASSIFIER)).with_extension("txt"),
        dist.checksums.clone(),
      ),
    ];

    let mut publications = primary.clone();
    for (coordinate, file) in primary {
      let signature = signature_path(&file);
      if artifacts.signatures.contains(&signature) {
        let extension = format!("{}.asc", coordinate.extension);
        publications.push((coordinate.with_extension(&extension), signature));
      }
    }
    Ok(publications)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::cell::Cell;
  use std::fs;
  use std::sync::atomic::{AtomicBool, Ordering};

  use crate::config::{BuildSettings, SigningSettings};
  use crate::distribution::{Distribution, DistributionArtifacts, DistributionEntry, EntryKind};
  use crate::release::signing::tests::FakeSigner;
  use crate::release::state::ReleaseStatus;
  use crate::release::tagging::tests::FakeScm;

  struct CountingAssembler {
    distribution: Distribution,
    calls: Cell<usize>,
  }

  impl Assembler for CountingAssembler {
    fn assemble(&self) -> Result<DistributionArtifacts, AssembleError> {
      self.calls.set(self.calls.get() + 1);
      self
        .distribution
        .assemble()
        .map_err(|e| AssembleError::Failed(e.to_string()))
    }
  }

  /// A local repository that can be told to reject uploads.
  struct FlakyRepository {
    inner: LocalRepository,
    failing: AtomicBool,
  }

  impl RepositoryClient for FlakyRepository {
    fn name(&self) -> &str {
      "remote"
    }

    fn contains(&self, coordinate: &ArtifactCoordinate) -> Result<bool, RepositoryError> {
      self.inner.contains(coordinate)
    }

    fn push(
      &self,
      coordinate: &ArtifactCoordinate,
      file: &Path,
      metadata: &ArtifactMetadata,
    ) -> Result<(), RepositoryError> {
      if self.failing.load(Ordering::SeqCst) {
        return Err(RepositoryError::Status {
          url: format!("https://repo.example/{}", coordinate.repository_path()),
          status: 503,
        });
      }
      self.inner.push(coordinate, file, metadata)
    }

    fn pull(&self, coordinate: &ArtifactCoordinate, dest: &Path) -> Result<(), RepositoryError> {
      self.inner.pull(coordinate, dest)
    }
  }

  struct Fixture {
    _temp: tempfile::TempDir,
    config: BuildConfig,
    assembler: CountingAssembler,
    remote: FlakyRepository,
    scm: FakeScm,
  }

  fn fixture(version: &str, key: Option<&str>) -> Fixture {
    let temp = tempfile::tempdir().unwrap();
    let root = temp.path().to_path_buf();

    let launcher = root.join("launcher");
    fs::write(&launcher, b"#!/bin/sh\n").unwrap();

    let build = BuildSettings {
      output_dir: Some(PathBuf::from("out")),
      ..BuildSettings::default()
    };
    let signing = SigningSettings {
      key: key.map(str::to_string),
      ..SigningSettings::default()
    };
    let config = BuildConfig::resolve_with(&root, &build, &signing, |_| None).unwrap();

    let distribution = Distribution {
      name: "xdk".to_string(),
      version: version.to_string(),
      build_number: None,
      entries: vec![DistributionEntry::new(launcher, Some(EntryKind::Launcher), None)],
      launcher_names: vec!["xec".to_string()],
      output_dir: config.distributions_dir(),
    };

    Fixture {
      config,
      assembler: CountingAssembler {
        distribution,
        calls: Cell::new(0),
      },
      remote: FlakyRepository {
        inner: LocalRepository::new("remote", &root.join("remote-repo")),
        failing: AtomicBool::new(false),
      },
      scm: FakeScm::at("c0ffee"),
      _temp: temp,
    }
  }

  fn pipeline<'a>(f: &'a Fixture, version: &str) -> ReleasePipeline<'a> {
    ReleasePipeline {
      config: &f.config,
      group: "org.xtclang".to_string(),
      distribution: "xdk".to_string(),
      version: Version::parse(version).unwrap(),
      metadata: ArtifactMetadata {
        description: Some("XDK".to_string()),
        packaging: "zip".to_string(),
      },
      assembler: &f.assembler,
      signer: &FakeSigner,
      remote: &f.remote,
      scm: &f.scm,
    }
  }

  fn coordinate(extension: &str) -> ArtifactCoordinate {
    ArtifactCoordinate::new("org.xtclang", "xdk", "0.4.3").with_extension(extension)
  }

  #[test]
  fn final_release_runs_every_stage() {
    let f = fixture("0.4.3", Some("KEY"));
    let pipeline = pipeline(&f, "0.4.3");

    let state = pipeline.run("strata publish").unwrap();
    assert_eq!(state.status, ReleaseStatus::Tagged);
    assert_eq!(state.last_completed, Some(Stage::Tag));
    assert_eq!(state.attempts, 1);
    assert_eq!(state.artifacts.signatures.len(), 3);
    assert_eq!(state.artifacts.tag.as_deref(), Some("v0.4.3"));

    for extension in ["zip", "zip.asc", "tar.gz", "tar.gz.asc", "pom"] {
      assert!(f.remote.inner.contains(&coordinate(extension)).unwrap(), "missing {}", extension);
    }
    let checksums = coordinate("txt").with_classifier(Some(CHECKSUMS_CLASSIFIER));
    assert!(f.remote.inner.contains(&checksums).unwrap());

    assert_eq!(f.scm.tags.borrow()["v0.4.3"], "c0ffee");
    assert!(!pipeline.lock_path().exists());

    let persisted = ReleaseState::load(&pipeline.state_path()).unwrap().unwrap();
    assert_eq!(persisted, state);
  }

  #[test]
  fn resumes_after_last_completed_stage() {
    let f = fixture("0.4.3", Some("KEY"));
    let pipeline = pipeline(&f, "0.4.3");

    // A previous run assembled and signed, then died
    let artifacts = f.assembler.distribution.assemble().unwrap();
    let mut state = ReleaseState::new("xdk", "0.4.3");
    state.begin(Stage::Assemble).unwrap();
    state.complete(Stage::Assemble).unwrap();
    state.artifacts.distribution = Some(artifacts);
    state.begin(Stage::Sign).unwrap();
    state.complete(Stage::Sign).unwrap();
    state.attempts = 1;
    state.save(&pipeline.state_path()).unwrap();

    let state = pipeline.run("strata publish").unwrap();
    assert_eq!(f.assembler.calls.get(), 0);
    assert_eq!(state.status, ReleaseStatus::Tagged);
    assert_eq!(state.attempts, 2);
    // Nothing was signed in this run
    assert!(!f.remote.inner.contains(&coordinate("zip.asc")).unwrap());
    assert!(f.remote.inner.contains(&coordinate("zip")).unwrap());
  }

  #[test]
  fn failure_records_stage_and_rerun_resumes_there() {
    let f = fixture("0.4.3", Some("KEY"));
    let pipeline = pipeline(&f, "0.4.3");
    f.remote.failing.store(true, Ordering::SeqCst);

    let err = pipeline.run("strata publish").unwrap_err();
    assert_eq!(err.stage(), Some(Stage::Publish));
    assert!(err.to_string().contains("503"));

    let state = ReleaseState::load(&pipeline.state_path()).unwrap().unwrap();
    assert!(matches!(state.status, ReleaseStatus::Failed { stage: Stage::Publish, .. }));
    assert_eq!(state.last_completed, Some(Stage::Stage));
    assert!(!pipeline.lock_path().exists());

    f.remote.failing.store(false, Ordering::SeqCst);
    let state = pipeline.run("strata publish").unwrap();
    assert_eq!(state.status, ReleaseStatus::Tagged);
    assert_eq!(f.assembler.calls.get(), 1);
  }

  #[test]
  fn existing_final_tag_fails_without_moving_it() {
    let f = fixture("0.4.3", Some("KEY"));
    f.scm.tags.borrow_mut().insert("v0.4.3".into(), "0ld".into());

    let err = pipeline(&f, "0.4.3").run("strata publish").unwrap_err();
    assert_eq!(err.stage(), Some(Stage::Tag));
    assert_eq!(f.scm.tags.borrow()["v0.4.3"], "0ld");
  }

  #[test]
  fn snapshot_skips_signing_and_moves_tag() {
    let f = fixture("0.5.0-SNAPSHOT", None);
    f.scm.tags.borrow_mut().insert("v0.5.0-SNAPSHOT".into(), "0ld".into());

    let state = pipeline(&f, "0.5.0-SNAPSHOT").run("strata publish").unwrap();
    assert!(state.artifacts.signatures.is_empty());
    assert_eq!(f.scm.tags.borrow()["v0.5.0-SNAPSHOT"], "c0ffee");
  }

  #[test]
  fn released_version_is_not_rerun() {
    let f = fixture("0.4.3", Some("KEY"));
    let pipeline = pipeline(&f, "0.4.3");
    pipeline.run("strata publish").unwrap();
    let again = pipeline.run("strata publish").unwrap();
    assert_eq!(again.attempts, 1);
    assert_eq!(f.assembler.calls.get(), 1);
  }

  #[test]
  fn concurrent_release_is_refused() {
    let f = fixture("0.4.3", Some("KEY"));
    let pipeline = pipeline(&f, "0.4.3");
    let _held = ReleaseLock::acquire(&pipeline.lock_path(), "other", f.config.stale_lock_after).unwrap();

    let err = pipeline.run("strata publish").unwrap_err();
    assert!(matches!(err, ReleaseError::Lock(_)));
    assert!(ReleaseState::load(&pipeline.state_path()).unwrap().is_none());
  }
}
