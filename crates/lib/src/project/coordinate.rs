//! Artifact coordinates in Maven notation.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Extension assumed when a coordinate does not name one.
pub const DEFAULT_EXTENSION: &str = "jar";

/// Uniquely identifies a producible or consumable artifact.
///
/// Equality is structural over all five parts.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ArtifactCoordinate {
  pub group: String,
  pub name: String,
  pub version: String,
  pub classifier: Option<String>,
  pub extension: String,
}

/// The part of a coordinate that identifies *what* is produced, regardless
/// of version. Local substitution matches on this key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModuleKey {
  pub group: String,
  pub name: String,
  pub classifier: Option<String>,
  pub extension: String,
}

impl fmt::Display for ModuleKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}:{}", self.group, self.name)?;
    if let Some(classifier) = &self.classifier {
      write!(f, ":{}", classifier)?;
    }
    write!(f, "@{}", self.extension)
  }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CoordinateError {
  #[error("invalid coordinate {spec:?}: {reason}")]
  Invalid { spec: String, reason: &'static str },
}

impl ArtifactCoordinate {
  pub fn new(group: &str, name: &str, version: &str) -> Self {
    Self {
      group: group.to_string(),
      name: name.to_string(),
      version: version.to_string(),
      classifier: None,
      extension: DEFAULT_EXTENSION.to_string(),
    }
  }

  /// Parse `group:name[:version[:classifier]][@extension]`.
  ///
  /// A missing version is filled with `default_version`, the workspace
  /// version, since all modules of one build share it unless overridden.
  pub fn parse(spec: &str, default_version: &str) -> Result<Self, CoordinateError> {
    let invalid = |reason| CoordinateError::Invalid {
      spec: spec.to_string(),
      reason,
    };

    let (body, extension) = match spec.rsplit_once('@') {
      Some((body, ext)) if !ext.is_empty() => (body, ext.to_string()),
      Some(_) => return Err(invalid("empty extension")),
      None => (spec, DEFAULT_EXTENSION.to_string()),
    };

    let parts: Vec<&str> = body.split(':').collect();
    if parts.iter().any(|p| p.trim().is_empty()) {
      return Err(invalid("empty component"));
    }

    let (group, name, version, classifier) = match parts.as_slice() {
      [group, name] => (*group, *name, default_version, None),
      [group, name, version] => (*group, *name, *version, None),
      [group, name, version, classifier] => (*group, *name, *version, Some(classifier.to_string())),
      _ => return Err(invalid("expected group:name[:version[:classifier]]")),
    };

    if version.is_empty() {
      return Err(invalid("no version given and no default available"));
    }

    Ok(Self {
      group: group.to_string(),
      name: name.to_string(),
      version: version.to_string(),
      classifier,
      extension,
    })
  }

  pub fn with_classifier(mut self, classifier: Option<&str>) -> Self {
    self.classifier = classifier.map(str::to_string);
    self
  }

  pub fn with_extension(mut self, extension: &str) -> Self {
    self.extension = extension.to_string();
    self
  }

  pub fn module_key(&self) -> ModuleKey {
    ModuleKey {
      group: self.group.clone(),
      name: self.name.clone(),
      classifier: self.classifier.clone(),
      extension: self.extension.clone(),
    }
  }

  /// `name-version[-classifier].extension`
  pub fn file_name(&self) -> String {
    match &self.classifier {
      Some(classifier) => format!("{}-{}-{}.{}", self.name, self.version, classifier, self.extension),
      None => format!("{}-{}.{}", self.name, self.version, self.extension),
    }
  }

  /// Directory of this artifact in a Maven-layout repository.
  pub fn repository_dir(&self) -> String {
    format!("{}/{}/{}", self.group.replace('.', "/"), self.name, self.version)
  }

  /// Path of this artifact relative to the root of a Maven-layout repository.
  pub fn repository_path(&self) -> String {
    format!("{}/{}", self.repository_dir(), self.file_name())
  }

  /// Coordinate of the POM describing this artifact's module.
  pub fn pom(&self) -> Self {
    Self {
      classifier: None,
      extension: "pom".to_string(),
      ..self.clone()
    }
  }
}

impl fmt::Display for ArtifactCoordinate {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}:{}:{}", self.group, self.name, self.version)?;
    if let Some(classifier) = &self.classifier {
      write!(f, ":{}", classifier)?;
    }
    if self.extension != DEFAULT_EXTENSION {
      write!(f, "@{}", self.extension)?;
    }
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn parse_fills_default_version() {
    let coord = ArtifactCoordinate::parse("org.xtclang:javatools", "0.4.3").unwrap();
    assert_eq!(coord, ArtifactCoordinate::new("org.xtclang", "javatools", "0.4.3"));
  }

  #[test]
  fn parse_full_form() {
    let coord = ArtifactCoordinate::parse("org.xtclang:xdk:1.0:linux-x86_64@zip", "0.1").unwrap();
    assert_eq!(coord.version, "1.0");
    assert_eq!(coord.classifier.as_deref(), Some("linux-x86_64"));
    assert_eq!(coord.extension, "zip");
    assert_eq!(coord.to_string(), "org.xtclang:xdk:1.0:linux-x86_64@zip");
  }

  #[test]
  fn parse_rejects_malformed() {
    assert!(ArtifactCoordinate::parse("justname", "1").is_err());
    assert!(ArtifactCoordinate::parse("a::b", "1").is_err());
    assert!(ArtifactCoordinate::parse("a:b@", "1").is_err());
    assert!(ArtifactCoordinate::parse("a:b:c:d:e", "1").is_err());
  }

  #[test]
  fn repository_layout() {
    let coord = ArtifactCoordinate::new("org.xtclang", "xdk", "0.4.3").with_extension("tar.gz");
    assert_eq!(coord.repository_path(), "org/xtclang/xdk/0.4.3/xdk-0.4.3.tar.gz");

    let classified = coord.clone().with_classifier(Some("sources"));
    assert_eq!(classified.file_name(), "xdk-0.4.3-sources.tar.gz");
    assert_eq!(classified.pom().file_name(), "xdk-0.4.3.pom");
  }

  #[test]
  fn module_key_ignores_version() {
    let a = ArtifactCoordinate::new("g", "n", "1.0");
    let b = ArtifactCoordinate::new("g", "n", "2.0");
    assert_ne!(a, b);
    assert_eq!(a.module_key(), b.module_key());
  }
}
