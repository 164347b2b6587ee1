//! Reproducible zip and tar.gz archives of a staged distribution.
//!
//! Both formats hold the same entries under one root directory, in sorted
//! order, with normalized timestamps and ownership.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use flate2::Compression;
use flate2::write::GzEncoder;
use walkdir::WalkDir;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, DateTime, ZipWriter};

use super::DistributionError;
use crate::util::hash::hash_file;

/// One file or directory in an archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveEntry {
  /// `/`-separated path inside the archive, including the root directory.
  pub name: String,
  pub source: PathBuf,
  pub is_dir: bool,
  pub mode: u32,
}

/// List the contents of `staging_dir` as archive entries under `root_name/`.
pub fn collect_entries(staging_dir: &Path, root_name: &str) -> Result<Vec<ArchiveEntry>, DistributionError> {
  let mut entries = Vec::new();

  for entry in WalkDir::new(staging_dir).sort_by_file_name() {
    let entry = entry.map_err(|e| DistributionError::Io {
      path: staging_dir.to_path_buf(),
      source: e.into(),
    })?;
    let rel = entry
      .path()
      .strip_prefix(staging_dir)
      .unwrap_or(entry.path())
      .to_string_lossy()
      .replace('\\', "/");
    let name = if rel.is_empty() {
      root_name.to_string()
    } else {
      format!("{}/{}", root_name, rel)
    };

    let is_dir = entry.file_type().is_dir();
    entries.push(ArchiveEntry {
      name,
      source: entry.path().to_path_buf(),
      is_dir,
      mode: entry_mode(entry.path(), is_dir),
    });
  }

  entries.sort_by(|a, b| a.name.cmp(&b.name));
  Ok(entries)
}

#[cfg(unix)]
fn entry_mode(path: &Path, is_dir: bool) -> u32 {
  use std::os::unix::fs::PermissionsExt;
  if is_dir {
    return 0o755;
  }
  match std::fs::metadata(path) {
    Ok(meta) if meta.permissions().mode() & 0o111 != 0 => 0o755,
    _ => 0o644,
  }
}

#[cfg(not(unix))]
fn entry_mode(_path: &Path, is_dir: bool) -> u32 {
  if is_dir { 0o755 } else { 0o644 }
}

fn io_err(path: &Path) -> impl FnOnce(io::Error) -> DistributionError + '_ {
  move |source| DistributionError::Io {
    path: path.to_path_buf(),
    source,
  }
}

pub fn write_zip(entries: &[ArchiveEntry], dest: &Path) -> Result<(), DistributionError> {
  let file = File::create(dest).map_err(io_err(dest))?;
  let mut zip = ZipWriter::new(BufWriter::new(file));
  let zip_err = |e: zip::result::ZipError| DistributionError::Archive {
    path: dest.to_path_buf(),
    message: e.to_string(),
  };

  for entry in entries {
    let options = SimpleFileOptions::default()
      .compression_method(CompressionMethod::Deflated)
      .last_modified_time(DateTime::default())
      .unix_permissions(entry.mode);

    if entry.is_dir {
      zip.add_directory(format!("{}/", entry.name), options).map_err(zip_err)?;
    } else {
      zip.start_file(entry.name.clone(), options).map_err(zip_err)?;
      let mut source = File::open(&entry.source).map_err(io_err(&entry.source))?;
      io::copy(&mut source, &mut zip).map_err(io_err(dest))?;
    }
  }

  let mut writer = zip.finish().map_err(zip_err)?;
  writer.flush().map_err(io_err(dest))?;
  Ok(())
}

pub fn write_tar_gz(entries: &[ArchiveEntry], dest: &Path) -> Result<(), DistributionError> {
  let file = File::create(dest).map_err(io_err(dest))?;
  let encoder = GzEncoder::new(BufWriter::new(file), Compression::default());
  let mut builder = tar::Builder::new(encoder);

  for entry in entries {
    let mut header = tar::Header::new_gnu();
    header.set_mtime(0);
    header.set_uid(0);
    header.set_gid(0);
    header.set_mode(entry.mode);

    if entry.is_dir {
      header.set_entry_type(tar::EntryType::Directory);
      header.set_size(0);
      builder
        .append_data(&mut header, format!("{}/", entry.name), io::empty())
        .map_err(io_err(dest))?;
    } else {
      let source = File::open(&entry.source).map_err(io_err(&entry.source))?;
      let len = source.metadata().map_err(io_err(&entry.source))?.len();
      header.set_entry_type(tar::EntryType::Regular);
      header.set_size(len);
      builder
        .append_data(&mut header, &entry.name, source)
        .map_err(io_err(dest))?;
    }
  }

  let encoder = builder.into_inner().map_err(io_err(dest))?;
  let mut writer = encoder.finish().map_err(io_err(dest))?;
  writer.flush().map_err(io_err(dest))?;
  Ok(())
}

/// `sha256sum`-style listing of `archives`.
pub fn write_checksums(archives: &[&Path], dest: &Path) -> Result<(), DistributionError> {
  let mut listing = String::new();
  for archive in archives {
    let hash = hash_file(archive).map_err(|e| DistributionError::Archive {
      path: archive.to_path_buf(),
      message: e.to_string(),
    })?;
    let name = archive.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
    listing.push_str(&format!("{}  {}\n", hash.0, name));
  }
  crate::util::fs::write_atomic(dest, listing.as_bytes()).map_err(io_err(dest))
}
