//! Artifact signing.
//!
//! [`resolve_signing`] decides whether a release is signed and with which
//! key; a [`Signer`] produces detached ASCII-armored signatures.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::SigningConfig;
use crate::util::fs::write_atomic;

/// Extension appended to a signed file's name.
pub const SIGNATURE_EXTENSION: &str = "asc";

/// A signing backend failed.
#[derive(Debug, Error)]
pub enum SignError {
  #[error("signing backend failed: {0}")]
  Backend(String),

  #[error("failed to run signing backend: {0}")]
  Io(#[from] io::Error),
}

/// Signing could not be configured or applied.
#[derive(Debug, Error)]
pub enum SigningError {
  #[error("signing is enabled but no key was found (checked property, {env}, and {key_file})")]
  MissingKey { env: &'static str, key_file: String },

  #[error("failed to read signing key file {path}: {source}")]
  ReadKeyFile {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("failed to sign {path}: {source}")]
  Sign {
    path: PathBuf,
    #[source]
    source: SignError,
  },

  #[error("failed to write signature {path}: {source}")]
  WriteSignature {
    path: PathBuf,
    #[source]
    source: io::Error,
  },
}

/// Produces a detached signature for a payload.
pub trait Signer: Send + Sync {
  fn sign(&self, payload: &[u8], key: &str, passphrase: Option<&str>) -> Result<Vec<u8>, SignError>;
}

/// Outcome of resolving signing configuration.
#[derive(Clone, PartialEq, Eq)]
pub enum SigningPolicy {
  Skip { reason: String },
  Sign { key: String, passphrase: Option<String> },
}

impl std::fmt::Debug for SigningPolicy {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      SigningPolicy::Skip { reason } => f.debug_struct("Skip").field("reason", reason).finish(),
      SigningPolicy::Sign { passphrase, .. } => f
        .debug_struct("Sign")
        .field("key", &"<redacted>")
        .field("passphrase", &passphrase.as_ref().map(|_| "<redacted>"))
        .finish(),
    }
  }
}

/// Decide whether to sign.
///
/// Signing defaults to on for final versions and off for snapshots. Keys are
/// taken from the build file property, then the environment, then the key
/// file. With no key, CI fails hard and a local build skips signing.
pub fn resolve_signing(config: &SigningConfig, ci: bool, snapshot: bool) -> Result<SigningPolicy, SigningError> {
  let enabled = config.enabled.unwrap_or(!snapshot);
  if !enabled {
    let reason = if config.enabled == Some(false) {
      "signing disabled in configuration"
    } else {
      "snapshot versions are not signed by default"
    };
    return Ok(SigningPolicy::Skip {
      reason: reason.to_string(),
    });
  }

  let key = match config.key_property.clone().or_else(|| config.key_env.clone()) {
    Some(key) => Some(key),
    None => read_key_file(config.key_file.as_deref())?,
  };
  let passphrase = config
    .passphrase_property
    .clone()
    .or_else(|| config.passphrase_env.clone());

  match key {
    Some(key) => Ok(SigningPolicy::Sign { key, passphrase }),
    None if ci => Err(SigningError::MissingKey {
      env: crate::config::ENV_SIGNING_KEY,
      key_file: config
        .key_file
        .as_ref()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "no key file".to_string()),
    }),
    None => {
      warn!("no signing key available; skipping signing outside CI");
      Ok(SigningPolicy::Skip {
        reason: "no signing key available".to_string(),
      })
    }
  }
}

fn read_key_file(path: Option<&Path>) -> Result<Option<String>, SigningError> {
  let Some(path) = path else {
    return Ok(None);
  };
  match fs::read_to_string(path) {
    Ok(content) if content.trim().is_empty() => Ok(None),
    Ok(content) => {
      debug!(path = %path.display(), "read signing key file");
      Ok(Some(content))
    }
    Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
    Err(source) => Err(SigningError::ReadKeyFile {
      path: path.to_path_buf(),
      source,
    }),
  }
}

/// `<file>.asc` next to `file`.
pub fn signature_path(file: &Path) -> PathBuf {
  let mut name = file.as_os_str().to_os_string();
  name.push(".");
  name.push(SIGNATURE_EXTENSION);
  PathBuf::from(name)
}

/// Sign each file, writing `<file>.asc` beside it. Returns the signature paths.
pub fn sign_files(
  signer: &dyn Signer,
  files: &[&Path],
  key: &str,
  passphrase: Option<&str>,
) -> Result<Vec<PathBuf>, SigningError> {
  let mut signatures = Vec::with_capacity(files.len());
  for file in files {
    let payload = fs::read(file).map_err(|e| SigningError::Sign {
      path: file.to_path_buf(),
      source: SignError::Io(e),
    })?;
    let signature = signer.sign(&payload, key, passphrase).map_err(|source| SigningError::Sign {
      path: file.to_path_buf(),
      source,
    })?;

    let dest = signature_path(file);
    write_atomic(&dest, &signature).map_err(|source| SigningError::WriteSignature {
      path: dest.clone(),
      source,
    })?;
    info!(file = %file.display(), "signed");
    signatures.push(dest);
  }
  Ok(signatures)
}

/// Signs with the `gpg` binary, importing the key into a throw-away home.
pub struct GpgSigner {
  program: String,
}

impl Default for GpgSigner {
  fn default() -> Self {
    Self {
      program: "gpg".to_string(),
    }
  }
}

impl GpgSigner {
  pub fn with_program(program: &str) -> Self {
    Self {
      program: program.to_string(),
    }
  }

  fn gpg(&self, home: &Path, args: &[&str], stdin: &[u8]) -> Result<(), SignError> {
    let mut child = Command::new(&self.program)
      .arg("--batch")
      .arg("--homedir")
      .arg(home)
      .args(args)
      .stdin(Stdio::piped())
      .stdout(Stdio::null())
      .stderr(Stdio::piped())
      .spawn()?;

    if let Some(mut input) = child.stdin.take() {
      input.write_all(stdin)?;
    }
    let output = child.wait_with_output()?;
    if !output.status.success() {
      let stderr = String::from_utf8_lossy(&output.stderr);
      return Err(SignError::Backend(format!(
        "{} {} exited with {}: {}",
        self.program,
        args.first().copied().unwrap_or_default(),
        output.status,
        stderr.trim()
      )));
    }
    Ok(())
  }
}

impl Signer for GpgSigner {
  fn sign(&self, payload: &[u8], key: &str, passphrase: Option<&str>) -> Result<Vec<u8>, SignError> {
    let home = tempfile::tempdir()?;
    #[cfg(unix)]
    {
      use std::os::unix::fs::PermissionsExt;
      fs::set_permissions(home.path(), fs::Permissions::from_mode(0o700))?;
    }

    self.gpg(home.path(), &["--import"], key.as_bytes())?;

    let payload_path = home.path().join("payload");
    let signature_path = home.path().join("payload.asc");
    fs::write(&payload_path, payload)?;

    let payload_arg = payload_path.to_string_lossy().into_owned();
    let signature_arg = signature_path.to_string_lossy().into_owned();
    let mut args = vec!["--detach-sign", "--armor", "--yes", "--output", signature_arg.as_str()];
    if passphrase.is_some() {
      args.extend(["--pinentry-mode", "loopback", "--passphrase-fd", "0"]);
    }
    args.push(payload_arg.as_str());

    let stdin = passphrase.map(|p| format!("{}\n", p)).unwrap_or_default();
    self.gpg(home.path(), &args, stdin.as_bytes())?;

    Ok(fs::read(&signature_path)?)
  }
}

#[cfg(test)]
pub(crate) mod tests {
  use super::*;
  use tempfile::tempdir;

  /// Deterministic signer that records the key it was handed.
  pub(crate) struct FakeSigner;

  impl Signer for FakeSigner {
    fn sign(&self, payload: &[u8], key: &str, _passphrase: Option<&str>) -> Result<Vec<u8>, SignError> {
      Ok(format!("signed {} bytes with {}", payload.len(), key).into_bytes())
    }
  }

  fn config() -> SigningConfig {
    SigningConfig::default()
  }

  #[test]
  fn snapshots_are_unsigned_by_default() {
    let policy = resolve_signing(&config(), false, true).unwrap();
    assert!(matches!(policy, SigningPolicy::Skip { .. }));
  }

  #[test]
  fn explicit_enable_signs_snapshots() {
    let cfg = SigningConfig {
      enabled: Some(true),
      key_env: Some("KEY".into()),
      ..config()
    };
    assert_eq!(
      resolve_signing(&cfg, false, true).unwrap(),
      SigningPolicy::Sign {
        key: "KEY".into(),
        passphrase: None
      }
    );
  }

  #[test]
  fn property_beats_environment_beats_file() {
    let temp = tempdir().unwrap();
    let key_file = temp.path().join("signing.key");
    fs::write(&key_file, "FILE").unwrap();

    let mut cfg = SigningConfig {
      key_property: Some("PROP".into()),
      key_env: Some("ENV".into()),
      passphrase_env: Some("pw".into()),
      key_file: Some(key_file),
      ..config()
    };
    let key = |cfg: &SigningConfig| match resolve_signing(cfg, false, false).unwrap() {
      SigningPolicy::Sign { key, .. } => key,
      other => panic!("expected signing, got {:?}", other),
    };

    assert_eq!(key(&cfg), "PROP");
    cfg.key_property = None;
    assert_eq!(key(&cfg), "ENV");
    cfg.key_env = None;
    assert_eq!(key(&cfg), "FILE");
  }

  #[test]
  fn missing_key_fails_in_ci() {
    let err = resolve_signing(&config(), true, false).unwrap_err();
    assert!(matches!(err, SigningError::MissingKey { .. }));
  }

  #[test]
  fn missing_key_skips_locally() {
    let temp = tempdir().unwrap();
    let cfg = SigningConfig {
      key_file: Some(temp.path().join("absent.key")),
      ..config()
    };
    let policy = resolve_signing(&cfg, false, false).unwrap();
    assert!(matches!(policy, SigningPolicy::Skip { .. }));
  }

  #[test]
  fn policy_debug_redacts_key() {
    let policy = SigningPolicy::Sign {
      key: "SECRET".into(),
      passphrase: Some("hunter2".into()),
    };
    let debug = format!("{:?}", policy);
    assert!(!debug.contains("SECRET"));
    assert!(!debug.contains("hunter2"));
  }

  #[test]
  fn sign_files_writes_asc_beside_each_file() {
    let temp = tempdir().unwrap();
    let zip = temp.path().join("xdk-0.4.3.zip");
    fs::write(&zip, b"zipdata").unwrap();

    let signatures = sign_files(&FakeSigner, &[zip.as_path()], "K", None).unwrap();
    assert_eq!(signatures, vec![temp.path().join("xdk-0.4.3.zip.asc")]);
    assert_eq!(fs::read_to_string(&signatures[0]).unwrap(), "signed 7 bytes with K");
  }

  #[test]
  fn missing_gpg_binary_is_an_io_error() {
    let signer = GpgSigner::with_program("strata-no-such-gpg");
    let err = signer.sign(b"payload", "key", None).unwrap_err();
    assert!(matches!(err, SignError::Io(_)));
  }
}
