//! Release tags in the workspace's git repository.

use std::path::{Path, PathBuf};

use gix::refs::transaction::PreviousValue;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum TagError {
  #[error("failed to open repository at '{path}': {source}")]
  Open {
    path: PathBuf,
    #[source]
    source: Box<gix::discover::Error>,
  },

  #[error("failed to resolve HEAD: {0}")]
  ResolveHead(String),

  #[error("failed to look up tag '{tag}': {message}")]
  Lookup { tag: String, message: String },

  #[error("failed to create tag '{tag}': {message}")]
  Create { tag: String, message: String },

  #[error("failed to delete tag '{tag}': {message}")]
  Delete { tag: String, message: String },

  #[error("tag '{tag}' already exists at {commit}; final releases are never re-tagged")]
  AlreadyExists { tag: String, commit: String },
}

/// The source-control operations a release needs.
pub trait SourceControl {
  /// Commit id HEAD points at.
  fn head_commit(&self) -> Result<String, TagError>;

  /// Commit id `tag` points at, if the tag exists.
  fn tag_target(&self, tag: &str) -> Result<Option<String>, TagError>;

  fn create_tag(&self, tag: &str, commit: &str) -> Result<(), TagError>;

  fn delete_tag(&self, tag: &str) -> Result<(), TagError>;
}

/// What [`apply_tag`] did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TagOutcome {
  Created { commit: String },
  Moved { from: String, to: String },
  /// A snapshot tag already pointed at HEAD.
  Unchanged { commit: String },
}

/// Point `tag` at HEAD.
///
/// Snapshot tags float: an existing one is moved to HEAD. Final tags are
/// immutable, so an existing one is an error even if it already points at
/// HEAD.
pub fn apply_tag(scm: &dyn SourceControl, tag: &str, snapshot: bool) -> Result<TagOutcome, TagError> {
  let head = scm.head_commit()?;

  let existing = scm.tag_target(tag)?;
  match existing {
    None => {
      scm.create_tag(tag, &head)?;
      info!(tag, commit = %head, "created tag");
      Ok(TagOutcome::Created { commit: head })
    }
    Some(commit) if !snapshot => Err(TagError::AlreadyExists {
      tag: tag.to_string(),
      commit,
    }),
    Some(commit) if commit == head => {
      debug!(tag, commit = %head, "snapshot tag already at HEAD");
      Ok(TagOutcome::Unchanged { commit })
    }
    Some(previous) => {
      scm.delete_tag(tag)?;
      scm.create_tag(tag, &head)?;
      info!(tag, from = %previous, to = %head, "moved snapshot tag");
      Ok(TagOutcome::Moved {
        from: previous,
        to: head,
      })
    }
  }
}

/// A git repository discovered from a workspace directory.
pub struct GitRepository {
  repo: gix::Repository,
}

impl GitRepository {
  pub fn discover(path: &Path) -> Result<Self, TagError> {
    let repo = gix::discover(path).map_err(|e| TagError::Open {
      path: path.to_path_buf(),
      source: Box::new(e),
    })?;
    debug!(path = %path.display(), "opened git repository");
    Ok(Self { repo })
  }
}

fn tag_ref(tag: &str) -> String {
  format!("refs/tags/{}", tag)
}

impl SourceControl for GitRepository {
  fn head_commit(&self) -> Result<String, TagError> {
    let mut head = self.repo.head().map_err(|e| TagError::ResolveHead(e.to_string()))?;
    let commit = head
      .peel_to_commit()
      .map_err(|e| TagError::ResolveHead(e.to_string()))?;
    Ok(commit.id.to_string())
  }

  fn tag_target(&self, tag: &str) -> Result<Option<String>, TagError> {
    let lookup = |message: String| TagError::Lookup {
      tag: tag.to_string(),
      message,
    };

    let reference = self
      .repo
      .try_find_reference(tag_ref(tag).as_str())
      .map_err(|e| lookup(e.to_string()))?;
    if reference.is_none() {
      return Ok(None);
    }

    // Annotated tags point at a tag object; peel through it.
    let spec = format!("{}^{{commit}}", tag_ref(tag));
    let id = self
      .repo
      .rev_parse_single(spec.as_str())
      .map_err(|e| lookup(e.to_string()))?;
    Ok(Some(id.to_string()))
  }

  fn create_tag(&self, tag: &str, commit: &str) -> Result<(), TagError> {
    let create = |message: String| TagError::Create {
      tag: tag.to_string(),
      message,
    };

    let id = gix::ObjectId::from_hex(commit.as_bytes()).map_err(|e| create(e.to_string()))?;
    self
      .repo
      .tag_reference(tag, id, PreviousValue::MustNotExist)
      .map_err(|e| create(e.to_string()))?;
    Ok(())
  }

  fn delete_tag(&self, tag: &str) -> Result<(), TagError> {
    let delete = |message: String| TagError::Delete {
      tag: tag.to_string(),
      message,
    };

    let reference = self
      .repo
      .find_reference(tag_ref(tag).as_str())
      .map_err(|e| delete(e.to_string()))?;
    reference.delete().map_err(|e| delete(e.to_string()))?;
    Ok(())
  }
}
