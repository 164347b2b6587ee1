//! HTTP(S) repository in Maven layout.
//!
//! `HEAD` probes, `GET` downloads and `PUT` uploads, via the blocking
//! `reqwest` client.

use std::path::Path;
use std::time::Duration;

use reqwest::StatusCode;
use reqwest::blocking::{Client, RequestBuilder, Response};
use tracing::{debug, info, warn};

use super::{ArtifactMetadata, RepositoryClient, RepositoryError, publication_files};
use crate::project::ArtifactCoordinate;
use crate::util::fs::write_atomic;
use crate::util::hash::hash_bytes;

const USER_AGENT: &str = concat!("strata/", env!("CARGO_PKG_VERSION"));

/// Credentials sent with every request.
#[derive(Clone, Default)]
pub enum RemoteAuth {
  #[default]
  None,
  Basic {
    username: String,
    password: String,
  },
  Bearer(String),
}

impl std::fmt::Debug for RemoteAuth {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      RemoteAuth::None => write!(f, "None"),
      RemoteAuth::Basic { username, .. } => write!(f, "Basic({username}, ***)"),
      RemoteAuth::Bearer(_) => write!(f, "Bearer(***)"),
    }
  }
}

#[derive(Debug, Clone)]
pub struct RemoteRepository {
  name: String,
  base_url: String,
  auth: RemoteAuth,
  client: Client,
  exclude_groups: Vec<String>,
}

impl RemoteRepository {
  pub fn new(name: &str, base_url: &str, auth: RemoteAuth) -> Result<Self, RepositoryError> {
    let client = Client::builder()
      .user_agent(USER_AGENT)
      .timeout(Duration::from_secs(300))
      .build()
      .map_err(|e| RepositoryError::Transport {
        url: base_url.to_string(),
        message: e.to_string(),
      })?;

    Ok(Self {
      name: name.to_string(),
      base_url: base_url.trim_end_matches('/').to_string(),
      auth,
      client,
      exclude_groups: Vec::new(),
    })
  }

  /// Groups this repository is never asked about.
  pub fn with_excluded_groups(mut self, groups: Vec<String>) -> Self {
    self.exclude_groups = groups;
    self
  }

  pub fn excludes(&self, group: &str) -> bool {
    self.exclude_groups.iter().any(|g| g == group)
  }

  pub fn url_for(&self, relative: &str) -> String {
    format!("{}/{}", self.base_url, relative)
  }

  fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
    match &self.auth {
      RemoteAuth::None => request,
      RemoteAuth::Basic { username, password } => request.basic_auth(username, Some(password)),
      RemoteAuth::Bearer(token) => request.bearer_auth(token),
    }
  }

  fn send(&self, request: RequestBuilder, url: &str) -> Result<Response, RepositoryError> {
    self.authorize(request).send().map_err(|e| RepositoryError::Transport {
      url: url.to_string(),
      message: e.to_string(),
    })
  }

  /// The published `.sha256` for `url`, or `None` when the repository has none.
  fn expected_checksum(&self, url: &str) -> Result<Option<String>, RepositoryError> {
    let checksum_url = format!("{}.sha256", url);
    let response = self.send(self.client.get(&checksum_url), &checksum_url)?;
    match response.status() {
      s if s.is_success() => {}
      StatusCode::NOT_FOUND => return Ok(None),
      s => return Err(status_error(&checksum_url, s)),
    }
    let body = response.text().map_err(|e| RepositoryError::Transport {
      url: checksum_url.clone(),
      message: e.to_string(),
    })?;
    // Either a bare digest or `<digest>  <file name>`
    Ok(body.split_whitespace().next().map(str::to_ascii_lowercase))
  }
}

fn status_error(url: &str, status: StatusCode) -> RepositoryError {
  match status {
    StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => RepositoryError::Unauthorized {
      url: url.to_string(),
      status: status.as_u16(),
    },
    _ => RepositoryError::Status {
      url: url.to_string(),
      status: status.as_u16(),
    },
  }
}

impl RepositoryClient for RemoteRepository {
  fn name(&self) -> &str {
    &self.name
  }

  fn contains(&self, coordinate: &ArtifactCoordinate) -> Result<bool, RepositoryError> {
    if self.excludes(&coordinate.group) {
      debug!(repository = %self.name, group = %coordinate.group, "group excluded from repository");
      return Ok(false);
    }

    let url = self.url_for(&coordinate.repository_path());
    let response = self.send(self.client.head(&url), &url)?;
    match response.status() {
      s if s.is_success() => Ok(true),
      StatusCode::NOT_FOUND => Ok(false),
      s => Err(status_error(&url, s)),
    }
  }

  fn push(
    &self,
    coordinate: &ArtifactCoordinate,
    file: &Path,
    metadata: &ArtifactMetadata,
  ) -> Result<(), RepositoryError> {
    for (relative, bytes) in publication_files(coordinate, file, metadata)? {
      let url = self.url_for(&relative);
      let size = bytes.len();
      let response = self.send(self.client.put(&url).body(bytes), &url)?;
      if !response.status().is_success() {
        return Err(status_error(&url, response.status()));
      }
      debug!(url = %url, size, "uploaded");
    }
    info!(repository = %self.name, artifact = %coordinate, "pushed artifact");
    Ok(())
  }

  fn pull(&self, coordinate: &ArtifactCoordinate, dest: &Path) -> Result<(), RepositoryError> {
    let url = self.url_for(&coordinate.repository_path());
    info!(url = %url, "fetching artifact");

    let response = self.send(self.client.get(&url), &url)?;
    match response.status() {
      s if s.is_success() => {}
      StatusCode::NOT_FOUND => {
        return Err(RepositoryError::NotFound {
          repository: self.name.clone(),
          coordinate: coordinate.to_string(),
        });
      }
      s => return Err(status_error(&url, s)),
    }

    let bytes = response.bytes().map_err(|e| RepositoryError::Transport {
      url: url.clone(),
      message: e.to_string(),
    })?;

    let actual = hash_bytes(&bytes).0;
    match self.expected_checksum(&url)? {
      Some(expected) if expected != actual => {
        return Err(RepositoryError::ChecksumMismatch { url, expected, actual });
      }
      Some(_) => debug!(url = %url, "checksum verified"),
      None => warn!(url = %url, "no published checksum; artifact not verified"),
    }

    write_atomic(dest, &bytes).map_err(|source| RepositoryError::Io {
      path: dest.to_path_buf(),
      source,
    })?;
    info!(path = %dest.display(), size = bytes.len(), "download complete");
    Ok(())
  }
}
