//! Per-distribution release lock.
//!
//! The lock is a file created exclusively next to the release state. It
//! records who holds it so that a lock abandoned by a crashed run can be
//! recognised and reclaimed.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

const LOCK_FORMAT: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockMetadata {
  pub version: u32,
  pub pid: u32,
  pub host: String,
  pub started_at_unix: u64,
  pub command: String,
}

#[derive(Debug, Error)]
pub enum LockError {
  #[error(
    "release is locked by another process: {command} (PID {pid} on {host}, started {started_at})\n\
     If you're sure no strata process is running, remove the lock file:\n  {lock_path}"
  )]
  Contention {
    command: String,
    pid: u32,
    host: String,
    started_at: String,
    lock_path: PathBuf,
  },

  #[error(
    "release is locked (could not read lock metadata)\n\
     If you're sure no strata process is running, remove the lock file:\n  {lock_path}"
  )]
  ContentionUnknown { lock_path: PathBuf },

  #[error("failed to create lock directory: {0}")]
  CreateDir(#[source] io::Error),

  #[error("failed to create lock file: {0}")]
  OpenFile(#[source] io::Error),

  #[error("failed to write lock metadata: {0}")]
  WriteMetadata(#[source] io::Error),

  #[error("failed to remove stale lock: {0}")]
  Reclaim(#[source] io::Error),
}

/// Held for the duration of a pipeline run; the file is removed on drop.
#[derive(Debug)]
pub struct ReleaseLock {
  lock_path: PathBuf,
  metadata: LockMetadata,
}

impl ReleaseLock {
  /// Acquire the lock at `lock_path`, reclaiming it if its owner is gone.
  ///
  /// An owner on this host is checked for liveness; an owner on another host
  /// (or unreadable metadata) is presumed gone once older than `stale_after`.
  pub fn acquire(lock_path: &Path, command: &str, stale_after: Duration) -> Result<Self, LockError> {
    if let Some(parent) = lock_path.parent() {
      fs::create_dir_all(parent).map_err(LockError::CreateDir)?;
    }

    let metadata = LockMetadata {
      version: LOCK_FORMAT,
      pid: std::process::id(),
      host: current_host(),
      started_at_unix: now_unix(),
      command: command.to_string(),
    };

    // One reclaim attempt; a second collision means a live competitor won the race
    for attempt in 0..2 {
      match OpenOptions::new().write(true).create_new(true).open(lock_path) {
        Ok(mut file) => {
          let content = serde_json::to_vec_pretty(&metadata).map_err(|e| LockError::WriteMetadata(io::Error::other(e)))?;
          file.write_all(&content).map_err(LockError::WriteMetadata)?;
          file.sync_all().map_err(LockError::WriteMetadata)?;
          debug!(path = %lock_path.display(), "acquired release lock");
          return Ok(Self {
            lock_path: lock_path.to_path_buf(),
            metadata,
          });
        }
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
          let raw = fs::read(lock_path).ok();
          let existing = raw.as_deref().and_then(parse_metadata);
          if attempt == 0 && is_stale(lock_path, existing.as_ref(), stale_after, &metadata.host) {
            warn!(
              path = %lock_path.display(),
              owner_pid = existing.as_ref().map(|m| m.pid),
              "reclaiming stale release lock"
            );
            if reclaim(lock_path, raw.as_deref())? {
              continue;
            }
            return Err(contention_error(lock_path, read_metadata(lock_path)));
          }
          return Err(contention_error(lock_path, existing));
        }
        Err(e) => return Err(LockError::OpenFile(e)),
      }
    }

    Err(contention_error(lock_path, read_metadata(lock_path)))
  }

  pub fn lock_path(&self) -> &Path {
    &self.lock_path
  }

  pub fn metadata(&self) -> &LockMetadata {
    &self.metadata
  }

  /// Owner of the lock at `lock_path`, if one is held and readable.
  pub fn inspect(lock_path: &Path) -> Option<LockMetadata> {
    read_metadata(lock_path)
  }
}

impl Drop for ReleaseLock {
  fn drop(&mut self) {
    // Only remove the file if it is still ours
    if read_metadata(&self.lock_path).as_ref() == Some(&self.metadata) {
      if let Err(e) = fs::remove_file(&self.lock_path) {
        warn!(path = %self.lock_path.display(), error = %e, "failed to remove release lock");
      } else {
        debug!(path = %self.lock_path.display(), "released release lock");
      }
    }
  }
}

fn read_metadata(lock_path: &Path) -> Option<LockMetadata> {
  parse_metadata(&fs::read(lock_path).ok()?)
}

fn parse_metadata(contents: &[u8]) -> Option<LockMetadata> {
  serde_json::from_slice(contents).ok()
}

/// Move the lock judged stale out of the way.
///
/// The file is renamed to a unique sibling first and only deleted if it still
/// holds `judged`, the contents that were found stale. If a competitor
/// replaced the lock in between, its lock is linked back and `false` is
/// returned.
fn reclaim(lock_path: &Path, judged: Option<&[u8]>) -> Result<bool, LockError> {
  let nanos = SystemTime::now()
    .duration_since(UNIX_EPOCH)
    .unwrap_or_default()
    .as_nanos();
  let mut parked_name = lock_path.file_name().unwrap_or_default().to_os_string();
  parked_name.push(format!(".stale-{}-{}", std::process::id(), nanos));
  let parked = lock_path.with_file_name(parked_name);

  match fs::rename(lock_path, &parked) {
    Ok(()) => {}
    // Someone else reclaimed it first; racing for `create_new` decides
    Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(true),
    Err(e) => return Err(LockError::Reclaim(e)),
  }

  let moved = fs::read(&parked).ok();
  if moved.as_deref() == judged {
    fs::remove_file(&parked).map_err(LockError::Reclaim)?;
    return Ok(true);
  }

  // A live lock was moved; put it back without clobbering a newer one
  match fs::hard_link(&parked, lock_path) {
    Ok(()) => debug!(path = %lock_path.display(), "restored lock replaced during reclaim"),
    Err(e) => warn!(path = %lock_path.display(), error = %e, "failed to restore lock replaced during reclaim"),
  }
  if let Err(e) = fs::remove_file(&parked) {
    warn!(path = %parked.display(), error = %e, "failed to remove parked lock file");
  }
  Ok(false)
}

fn is_stale(lock_path: &Path, metadata: Option<&LockMetadata>, stale_after: Duration, host: &str) -> bool {
  let now = now_unix();
  match metadata {
    Some(meta) => {
      let age = Duration::from_secs(now.saturating_sub(meta.started_at_unix));
      // Same host: liveness alone decides; age only when it cannot be checked
      if meta.host == host
        && let Some(alive) = process_alive(meta.pid)
      {
        return !alive;
      }
      age > stale_after
    }
    // Unreadable metadata may be a lock being written right now; go by file age
    None => fs::metadata(lock_path)
      .and_then(|m| m.modified())
      .ok()
      .and_then(|t| SystemTime::now().duration_since(t).ok())
      .is_some_and(|age| age > stale_after),
  }
}

fn contention_error(lock_path: &Path, metadata: Option<LockMetadata>) -> LockError {
  match metadata {
    Some(meta) => LockError::Contention {
      command: meta.command,
      pid: meta.pid,
      host: meta.host,
      started_at: format_started(meta.started_at_unix),
      lock_path: lock_path.to_path_buf(),
    },
    None => LockError::ContentionUnknown {
      lock_path: lock_path.to_path_buf(),
    },
  }
}

fn format_started(secs: u64) -> String {
  humantime::format_rfc3339_seconds(UNIX_EPOCH + Duration::from_secs(secs)).to_string()
}

fn now_unix() -> u64 {
  SystemTime::now()
    .duration_since(UNIX_EPOCH)
    .unwrap_or_default()
    .as_secs()
}

#[cfg(unix)]
fn current_host() -> String {
  rustix::system::uname().nodename().to_string_lossy().into_owned()
}

#[cfg(not(unix))]
fn current_host() -> String {
  std::env::var("COMPUTERNAME").unwrap_or_else(|_| "localhost".to_string())
}

/// `None` when liveness cannot be determined on this platform.
#[cfg(unix)]
fn process_alive(pid: u32) -> Option<bool> {
  use rustix::io::Errno;
  use rustix::process::{Pid, test_kill_process};

  let Some(pid) = i32::try_from(pid).ok().and_then(Pid::from_raw) else {
    return Some(false);
  };
  match test_kill_process(pid) {
    Ok(()) => Some(true),
    // Exists but belongs to someone else
    Err(Errno::PERM) => Some(true),
    Err(_) => Some(false),
  }
}

#[cfg(not(unix))]
fn process_alive(_pid: u32) -> Option<bool> {
  None
}

#[cfg(test)]
mod tests {
  use super::*;
  use tempfile::tempdir;
  use tracing_test::traced_test;

  const HOUR: Duration = Duration::from_secs(3600);

  const OTHER_HOST: &str = "build-agent-7.invalid";

  fn write_lock(path: &Path, pid: u32, host: &str, started_at_unix: u64) {
    let meta = LockMetadata {
      version: LOCK_FORMAT,
      pid,
      host: host.to_string(),
      started_at_unix,
      command: "strata publish".to_string(),
    };
    fs::write(path, serde_json::to_vec(&meta).unwrap()).unwrap();
  }

  fn write_foreign_lock(path: &Path, pid: u32, started_at_unix: u64) {
    write_lock(path, pid, &current_host(), started_at_unix);
  }

  #[test]
  fn acquire_writes_metadata_and_releases_on_drop() {
    let temp = tempdir().unwrap();
    let path = temp.path().join("release/xdk.lock");
    {
      let lock = ReleaseLock::acquire(&path, "strata publish", HOUR).unwrap();
      let on_disk = ReleaseLock::inspect(&path).unwrap();
      assert_eq!(&on_disk, lock.metadata());
      assert_eq!(on_disk.pid, std::process::id());
      assert_eq!(on_disk.command, "strata publish");
    }
    assert!(!path.exists());
    assert!(ReleaseLock::inspect(&path).is_none());
  }

  #[test]
  fn live_holder_blocks_acquisition() {
    let temp = tempdir().unwrap();
    let path = temp.path().join("xdk.lock");
    let _held = ReleaseLock::acquire(&path, "first", HOUR).unwrap();

    let err = ReleaseLock::acquire(&path, "second", HOUR).unwrap_err();
    match err {
      LockError::Contention { command, pid, .. } => {
        assert_eq!(command, "first");
        assert_eq!(pid, std::process::id());
      }
      other => panic!("expected contention, got {other:?}"),
    }
  }

  #[test]
  #[traced_test]
  fn old_lock_from_other_host_is_reclaimed() {
    let temp = tempdir().unwrap();
    let path = temp.path().join("xdk.lock");
    write_lock(&path, std::process::id(), OTHER_HOST, now_unix() - 2 * 3600);

    let lock = ReleaseLock::acquire(&path, "strata publish", HOUR).unwrap();
    assert_eq!(lock.metadata().command, "strata publish");
    assert!(logs_contain("reclaiming stale release lock"));
  }

  #[test]
  fn recent_lock_from_other_host_is_contention() {
    let temp = tempdir().unwrap();
    let path = temp.path().join("xdk.lock");
    write_lock(&path, 4242, OTHER_HOST, now_unix());

    let err = ReleaseLock::acquire(&path, "strata publish", HOUR).unwrap_err();
    assert!(matches!(err, LockError::Contention { ref host, .. } if host == OTHER_HOST));
  }

  #[cfg(unix)]
  #[test]
  fn old_lock_of_live_process_on_this_host_is_contention() {
    let temp = tempdir().unwrap();
    let path = temp.path().join("xdk.lock");
    let _held = ReleaseLock::acquire(&path, "first", Duration::ZERO).unwrap();
    std::thread::sleep(Duration::from_millis(1100));

    let err = ReleaseLock::acquire(&path, "second", Duration::ZERO).unwrap_err();
    assert!(matches!(err, LockError::Contention { ref command, .. } if command == "first"));
    assert_eq!(ReleaseLock::inspect(&path).unwrap().command, "first");
  }

  #[test]
  fn reclaim_removes_the_lock_judged_stale() {
    let temp = tempdir().unwrap();
    let path = temp.path().join("xdk.lock");
    write_lock(&path, 4242, OTHER_HOST, 0);
    let judged = fs::read(&path).unwrap();

    assert!(reclaim(&path, Some(judged.as_slice())).unwrap());
    assert!(!path.exists());
    assert_eq!(fs::read_dir(temp.path()).unwrap().count(), 0);
  }

  #[test]
  fn reclaim_restores_a_lock_replaced_by_a_competitor() {
    let temp = tempdir().unwrap();
    let path = temp.path().join("xdk.lock");
    write_lock(&path, 4242, OTHER_HOST, 0);
    let judged = fs::read(&path).unwrap();

    // Another process reclaimed first and now holds a fresh lock
    fs::remove_file(&path).unwrap();
    let winner = ReleaseLock::acquire(&path, "winner", HOUR).unwrap();

    assert!(!reclaim(&path, Some(judged.as_slice())).unwrap());
    assert_eq!(ReleaseLock::inspect(&path).as_ref(), Some(winner.metadata()));
    assert_eq!(fs::read_dir(temp.path()).unwrap().count(), 1);
  }

  #[cfg(unix)]
  #[test]
  fn lock_of_dead_process_is_reclaimed() {
    let temp = tempdir().unwrap();
    let path = temp.path().join("xdk.lock");

    let mut child = std::process::Command::new("true").spawn().unwrap();
    let dead_pid = child.id();
    child.wait().unwrap();
    write_foreign_lock(&path, dead_pid, now_unix());

    assert!(ReleaseLock::acquire(&path, "strata publish", HOUR).is_ok());
  }

  #[test]
  fn unreadable_recent_lock_is_contention() {
    let temp = tempdir().unwrap();
    let path = temp.path().join("xdk.lock");
    fs::write(&path, "garbage").unwrap();

    let err = ReleaseLock::acquire(&path, "strata publish", HOUR).unwrap_err();
    assert!(matches!(err, LockError::ContentionUnknown { .. }));
  }

  #[test]
  fn drop_leaves_foreign_lock_alone() {
    let temp = tempdir().unwrap();
    let path = temp.path().join("xdk.lock");
    let lock = ReleaseLock::acquire(&path, "mine", HOUR).unwrap();

    write_foreign_lock(&path, 1, now_unix());
    drop(lock);
    assert!(path.exists());
  }
}
