//! Typed build configuration.
//!
//! Every recognized option is enumerated here and resolved exactly once, from
//! the build file's `[build]`/`[signing]` tables and the process environment.
//! The resulting [`BuildConfig`] is passed explicitly to each component.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::consts::{
  APP_NAME, CACHE_DIR, DISTRIBUTIONS_DIR, RELEASE_DIR, SIGNING_KEY_FILE, STAGING_REPO_DIR, STATE_DIR,
};

/// `true` enables CI mode (signing keys become mandatory).
pub const ENV_CI: &str = "CI";
pub const ENV_BUILD_NUMBER: &str = "BUILD_NUMBER";
pub const ENV_SIGNING_KEY: &str = "STRATA_SIGNING_KEY";
pub const ENV_SIGNING_PASSWORD: &str = "STRATA_SIGNING_PASSWORD";
pub const ENV_REPOSITORY_TOKEN: &str = "STRATA_REPOSITORY_TOKEN";
/// Fallback for [`ENV_REPOSITORY_TOKEN`], as set by GitHub Actions.
pub const ENV_GITHUB_TOKEN: &str = "GITHUB_TOKEN";
pub const ENV_PARALLELISM: &str = "STRATA_PARALLELISM";
pub const ENV_OUTPUT_DIR: &str = "STRATA_OUTPUT_DIR";

const DEFAULT_TAG_PREFIX: &str = "v";
const DEFAULT_STALE_LOCK_SECS: u64 = 6 * 60 * 60;

/// How input and output paths are summarized into fingerprints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FingerprintMode {
  /// SHA-256 of file contents.
  #[default]
  Content,
  /// Modification time and size only.
  Timestamp,
}

/// The `[build]` table of a build file.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BuildSettings {
  pub parallelism: Option<usize>,
  pub fingerprint: Option<FingerprintMode>,
  pub tag_prefix: Option<String>,
  pub stale_lock_secs: Option<u64>,
  /// Relative paths are resolved against the workspace root.
  pub output_dir: Option<PathBuf>,
}

/// The `[signing]` table of a build file.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SigningSettings {
  pub enabled: Option<bool>,
  pub key: Option<String>,
  pub passphrase: Option<String>,
  pub key_file: Option<PathBuf>,
}

/// Signing inputs, kept per source so precedence can be applied later.
#[derive(Debug, Clone, Default)]
pub struct SigningConfig {
  /// Explicit on/off switch. `None` means "sign final releases only".
  pub enabled: Option<bool>,
  pub key_property: Option<String>,
  pub key_env: Option<String>,
  pub passphrase_property: Option<String>,
  pub passphrase_env: Option<String>,
  pub key_file: Option<PathBuf>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
  #[error("invalid parallelism {value:?}: expected a positive integer")]
  InvalidParallelism { value: String },

  #[error("invalid tag prefix {0:?}: must not contain whitespace")]
  InvalidTagPrefix(String),
}

/// Fully resolved configuration for one invocation.
#[derive(Debug, Clone)]
pub struct BuildConfig {
  /// Workspace root (the directory holding the build file).
  pub root_dir: PathBuf,
  /// Root of all build output and persisted state.
  pub output_dir: PathBuf,
  /// Maximum number of task actions running at once.
  pub parallelism: usize,
  pub fingerprint: FingerprintMode,
  pub ci: bool,
  pub build_number: Option<String>,
  pub signing: SigningConfig,
  pub repository_token: Option<String>,
  pub tag_prefix: String,
  /// Age after which a release lock is considered abandoned.
  pub stale_lock_after: Duration,
}

impl BuildConfig {
  /// Resolve configuration against the real process environment.
  pub fn resolve(root_dir: &Path, build: &BuildSettings, signing: &SigningSettings) -> Result<Self, ConfigError> {
    Self::resolve_with(root_dir, build, signing, |key| std::env::var(key).ok())
  }

  /// Resolve configuration using `lookup` for environment variables.
  pub fn resolve_with<F>(
    root_dir: &Path,
    build: &BuildSettings,
    signing: &SigningSettings,
    lookup: F,
  ) -> Result<Self, ConfigError>
  where
    F: Fn(&str) -> Option<String>,
  {
    let env = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

    let parallelism = match env(ENV_PARALLELISM) {
      Some(raw) => parse_parallelism(&raw)?,
      None => match build.parallelism {
        Some(0) => {
          return Err(ConfigError::InvalidParallelism { value: "0".to_string() });
        }
        Some(n) => n,
        None => default_parallelism(),
      },
    };

    let output_dir = match env(ENV_OUTPUT_DIR) {
      Some(dir) => PathBuf::from(dir),
      None => match &build.output_dir {
        Some(dir) if dir.is_absolute() => dir.clone(),
        Some(dir) => root_dir.join(dir),
        None => root_dir.join("build"),
      },
    };

    let tag_prefix = build.tag_prefix.clone().unwrap_or_else(|| DEFAULT_TAG_PREFIX.to_string());
    if tag_prefix.chars().any(char::is_whitespace) {
      return Err(ConfigError::InvalidTagPrefix(tag_prefix));
    }

    let home = env("HOME").or_else(|| env("USERPROFILE")).map(PathBuf::from);
    let key_file = signing
      .key_file
      .clone()
      .or_else(|| home.map(|h| h.join(format!(".{}", APP_NAME)).join(SIGNING_KEY_FILE)));

    Ok(Self {
      root_dir: root_dir.to_path_buf(),
      output_dir,
      parallelism,
      fingerprint: build.fingerprint.unwrap_or_default(),
      ci: env(ENV_CI).is_some_and(|v| v.eq_ignore_ascii_case("true")),
      build_number: env(ENV_BUILD_NUMBER),
      signing: SigningConfig {
        enabled: signing.enabled,
        key_property: signing.key.clone(),
        key_env: env(ENV_SIGNING_KEY),
        passphrase_property: signing.passphrase.clone(),
        passphrase_env: env(ENV_SIGNING_PASSWORD),
        key_file,
      },
      repository_token: env(ENV_REPOSITORY_TOKEN).or_else(|| env(ENV_GITHUB_TOKEN)),
      tag_prefix,
      stale_lock_after: Duration::from_secs(build.stale_lock_secs.unwrap_or(DEFAULT_STALE_LOCK_SECS)),
    })
  }

  /// Directory holding cache and release state.
  pub fn state_dir(&self) -> PathBuf {
    self.output_dir.join(STATE_DIR)
  }

  pub fn cache_dir(&self) -> PathBuf {
    self.state_dir().join(CACHE_DIR)
  }

  pub fn release_dir(&self) -> PathBuf {
    self.state_dir().join(RELEASE_DIR)
  }

  pub fn distributions_dir(&self) -> PathBuf {
    self.output_dir.join(DISTRIBUTIONS_DIR)
  }

  pub fn staging_repo_dir(&self) -> PathBuf {
    self.output_dir.join(STAGING_REPO_DIR)
  }
}

fn parse_parallelism(raw: &str) -> Result<usize, ConfigError> {
  match raw.trim().parse::<usize>() {
    Ok(n) if n > 0 => Ok(n),
    _ => Err(ConfigError::InvalidParallelism { value: raw.to_string() }),
  }
}

/// Get the number of CPUs for default parallelism.
fn default_parallelism() -> usize {
  std::thread::available_parallelism().map(|p| p.get()).unwrap_or(4)
}

#[cfg(test)]
mod tests {
  use super::*;
  use serial_test::serial;
  use std::collections::HashMap;

  fn lookup_from(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
    let map: HashMap<String, String> = vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
    move |key| map.get(key).cloned()
  }

  #[test]
  fn defaults_without_environment() {
    let root = Path::new("/work/xvm");
    let config =
      BuildConfig::resolve_with(root, &BuildSettings::default(), &SigningSettings::default(), lookup_from(&[]))
        .unwrap();

    assert!(config.parallelism >= 1);
    assert_eq!(config.output_dir, root.join("build"));
    assert_eq!(config.fingerprint, FingerprintMode::Content);
    assert!(!config.ci);
    assert_eq!(config.tag_prefix, "v");
    assert!(config.repository_token.is_none());
    assert_eq!(config.cache_dir(), root.join("build/.strata/cache"));
  }

  #[test]
  fn environment_overrides_build_file() {
    let settings = BuildSettings {
      parallelism: Some(2),
      output_dir: Some(PathBuf::from("out")),
      ..Default::default()
    };
    let config = BuildConfig::resolve_with(
      Path::new("/work"),
      &settings,
      &SigningSettings::default(),
      lookup_from(&[
        (ENV_PARALLELISM, "7"),
        (ENV_CI, "true"),
        (ENV_BUILD_NUMBER, "42"),
        (ENV_GITHUB_TOKEN, "gh-token"),
      ]),
    )
    .unwrap();

    assert_eq!(config.parallelism, 7);
    assert_eq!(config.output_dir, PathBuf::from("/work/out"));
    assert!(config.ci);
    assert_eq!(config.build_number.as_deref(), Some("42"));
    assert_eq!(config.repository_token.as_deref(), Some("gh-token"));
  }

  #[test]
  fn explicit_token_wins_over_github_token() {
    let config = BuildConfig::resolve_with(
      Path::new("/work"),
      &BuildSettings::default(),
      &SigningSettings::default(),
      lookup_from(&[(ENV_GITHUB_TOKEN, "gh"), (ENV_REPOSITORY_TOKEN, "explicit")]),
    )
    .unwrap();
    assert_eq!(config.repository_token.as_deref(), Some("explicit"));
  }

  #[test]
  fn rejects_zero_parallelism() {
    let err = BuildConfig::resolve_with(
      Path::new("/work"),
      &BuildSettings::default(),
      &SigningSettings::default(),
      lookup_from(&[(ENV_PARALLELISM, "0")]),
    )
    .unwrap_err();
    assert!(matches!(err, ConfigError::InvalidParallelism { .. }));
  }

  #[test]
  fn signing_sources_are_kept_apart() {
    let signing = SigningSettings {
      key: Some("property-key".to_string()),
      ..Default::default()
    };
    let config = BuildConfig::resolve_with(
      Path::new("/work"),
      &BuildSettings::default(),
      &signing,
      lookup_from(&[(ENV_SIGNING_KEY, "env-key"), ("HOME", "/home/dev")]),
    )
    .unwrap();

    assert_eq!(config.signing.key_property.as_deref(), Some("property-key"));
    assert_eq!(config.signing.key_env.as_deref(), Some("env-key"));
    assert_eq!(
      config.signing.key_file,
      Some(PathBuf::from("/home/dev/.strata/signing-key.asc"))
    );
  }

  #[test]
  #[serial]
  fn resolve_reads_process_environment() {
    temp_env::with_vars([(ENV_CI, Some("true")), (ENV_PARALLELISM, Some("3"))], || {
      let config = BuildConfig::resolve(Path::new("/w"), &BuildSettings::default(), &SigningSettings::default())
        .unwrap();
      assert!(config.ci);
      assert_eq!(config.parallelism, 3);
    });
  }
}
