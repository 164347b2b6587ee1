//! Build file loading.
//!
//! [`load_workspace`] reads `strata.toml` and produces a fully configured
//! [`Workspace`]: resolved configuration, the project tree, the task graph
//! (cycle-checked), the coordinate resolver and the distribution. Every
//! configuration problem surfaces here, before any task runs.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use semver::Version;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::{BuildConfig, BuildSettings, ConfigError, SigningSettings};
use crate::consts::{ASSEMBLE_TASK, BUILD_FILE_NAME};
use crate::distribution::{Distribution, DistributionEntry, EntryKind};
use crate::execute::actions::command_action;
use crate::graph::{
  ActionError, GraphBuilder, GraphError, TaskAction, TaskGraph, TaskId, TaskSpec, produces_input,
};
use crate::graph::overlap::normalize;
use crate::project::{ArtifactCoordinate, CoordinateError, Project, ProjectTree, ROOT_PATH, normalize_path};
use crate::repository::{
  ArtifactMetadata, LocalRepository, RemoteAuth, RemoteRepository, RepositoryClient, RepositoryError,
};
use crate::resolve::{CoordinateResolver, Resolution, ResolveError};

/// Directory, relative to a project, that fetched dependencies land in.
const DEPENDENCIES_DIR: &str = "build/dependencies";

#[derive(Debug, Error)]
pub enum LoadError {
  #[error("no {name} found in {start} or any parent directory")]
  NotFound { name: &'static str, start: PathBuf },

  #[error("failed to read {path}: {source}")]
  Read {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("failed to parse {path}: {message}")]
  Parse { path: PathBuf, message: String },

  #[error("invalid version {version:?}: {source}")]
  Version {
    version: String,
    #[source]
    source: semver::Error,
  },

  #[error(transparent)]
  Config(#[from] ConfigError),

  #[error(transparent)]
  Coordinate(#[from] CoordinateError),

  #[error(transparent)]
  Resolve(#[from] ResolveError),

  #[error(transparent)]
  Graph(#[from] GraphError),

  #[error(transparent)]
  Repository(#[from] RepositoryError),

  #[error("project '{0}' is declared more than once")]
  DuplicateProject(String),

  #[error("no project at path '{0}'")]
  UnknownProject(String),

  #[error("project '{project}' has no task named '{task}'")]
  UnknownTask { project: String, task: String },

  #[error("invalid task reference {0:?}")]
  InvalidTaskReference(String),

  #[error("repository '{name}': {message}")]
  InvalidRepository { name: String, message: String },

  #[error("publish target '{0}' is not a declared repository")]
  UnknownRepository(String),

  #[error("distribution entry #{index}: {message}")]
  InvalidContent { index: usize, message: String },
}

/// The parsed `strata.toml`.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BuildFile {
  pub workspace: WorkspaceDecl,
  #[serde(default)]
  pub build: BuildSettings,
  #[serde(default)]
  pub signing: SigningSettings,
  #[serde(default)]
  pub repositories: Vec<RepositoryDecl>,
  pub publish: Option<PublishDecl>,
  #[serde(default)]
  pub projects: Vec<ProjectDecl>,
  pub distribution: Option<DistributionDecl>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WorkspaceDecl {
  pub name: String,
  pub group: String,
  pub version: String,
  pub description: Option<String>,
}

/// A repository is either remote (`url`) or a local directory (`path`).
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RepositoryDecl {
  pub name: String,
  pub url: Option<String>,
  pub path: Option<PathBuf>,
  /// Sends the repository token as a Basic password for this user.
  pub username: Option<String>,
  #[serde(default)]
  pub exclude_groups: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PublishDecl {
  pub repository: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProjectDecl {
  pub path: String,
  pub name: Option<String>,
  /// Defaults to the project path below the workspace root.
  pub dir: Option<PathBuf>,
  pub group: Option<String>,
  pub version: Option<String>,
  #[serde(default)]
  pub tasks: Vec<TaskDecl>,
  #[serde(default)]
  pub artifacts: Vec<ArtifactDecl>,
  #[serde(default)]
  pub dependencies: Vec<DependencyDecl>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TaskDecl {
  pub name: String,
  #[serde(default)]
  pub inputs: Vec<PathBuf>,
  #[serde(default)]
  pub outputs: Vec<PathBuf>,
  /// Shell command; a task without one only aggregates its dependencies.
  pub run: Option<String>,
  pub shell: Option<String>,
  #[serde(default)]
  pub depends_on: Vec<String>,
  #[serde(default)]
  pub env: BTreeMap<String, String>,
  #[serde(default)]
  pub properties: BTreeMap<String, String>,
  #[serde(default = "default_true")]
  pub cache: bool,
  pub timeout_secs: Option<u64>,
}

fn default_true() -> bool {
  true
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ArtifactDecl {
  pub task: String,
  pub path: PathBuf,
  /// Defaults to the project name.
  pub name: Option<String>,
  pub classifier: Option<String>,
  pub extension: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DependencyDecl {
  pub coordinate: String,
  /// The consuming task in this project.
  pub task: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DistributionDecl {
  pub name: Option<String>,
  #[serde(default)]
  pub launcher_names: Vec<String>,
  #[serde(default)]
  pub contents: Vec<ContentDecl>,
}

/// One distribution entry; exactly one of `coordinate`, `task` or `path`.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ContentDecl {
  pub coordinate: Option<String>,
  pub task: Option<String>,
  pub path: Option<PathBuf>,
  pub kind: Option<EntryKind>,
  pub rename: Option<String>,
}

/// A loaded workspace, ready to execute or release.
pub struct Workspace {
  pub build_file: PathBuf,
  pub config: BuildConfig,
  pub name: String,
  pub group: String,
  pub version: Version,
  pub description: Option<String>,
  pub projects: ProjectTree,
  pub graph: Arc<TaskGraph>,
  pub resolver: CoordinateResolver,
  pub distribution: Option<Distribution>,
  /// Repository the release pipeline publishes to.
  pub publish_repository: Option<String>,
}

impl Workspace {
  /// The distribution assembly task, when a distribution is declared.
  pub fn assemble_task(&self) -> Option<TaskId> {
    self
      .distribution
      .as_ref()
      .map(|_| TaskId::new(ROOT_PATH, ASSEMBLE_TASK))
  }

  /// Publication metadata for the distribution archives.
  pub fn distribution_metadata(&self) -> ArtifactMetadata {
    ArtifactMetadata {
      description: self.description.clone(),
      packaging: "zip".to_string(),
    }
  }

  /// Declared outputs that are safe to delete, deduplicated and normalized.
  ///
  /// Only strict descendants of the workspace root qualify, and never a path
  /// that is or contains the build file or a project directory.
  pub fn declared_outputs(&self) -> Vec<PathBuf> {
    let root = normalize(&self.config.root_dir);
    let protected: Vec<PathBuf> = std::iter::once(normalize(&self.build_file))
      .chain(self.projects.iter().map(|p| normalize(&p.dir)))
      .collect();

    let mut outputs = BTreeSet::new();
    for id in self.graph.task_ids() {
      let Some(spec) = self.graph.task(&id) else {
        continue;
      };
      for output in spec.outputs.iter().map(|p| normalize(p)) {
        if output == root || !output.starts_with(&root) {
          continue;
        }
        if protected.iter().any(|p| p.starts_with(&output)) {
          warn!(task = %id, output = %output.display(), "output contains workspace sources; not treating it as removable");
          continue;
        }
        outputs.insert(output);
      }
    }
    outputs.into_iter().collect()
  }
}

impl std::fmt::Debug for Workspace {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Workspace")
      .field("build_file", &self.build_file)
      .field("name", &self.name)
      .field("version", &self.version.to_string())
      .field("projects", &self.projects.len())
      .field("tasks", &self.graph.len())
      .finish()
  }
}

/// Find the build file in `start` or the nearest parent directory.
pub fn find_build_file(start: &Path) -> Result<PathBuf, LoadError> {
  start
    .ancestors()
    .map(|dir| dir.join(BUILD_FILE_NAME))
    .find(|candidate| candidate.is_file())
    .ok_or_else(|| LoadError::NotFound {
      name: BUILD_FILE_NAME,
      start: start.to_path_buf(),
    })
}

/// Load a workspace from its build file.
///
/// This function:
/// 1. Parses the build file and resolves [`BuildConfig`] against the environment
/// 2. Creates the project tree (the root project is the workspace itself)
/// 3. Registers every task and every locally produced artifact
/// 4. Resolves declared dependencies, adding `fetch-<name>` tasks for remote ones
/// 5. Adds the `:assembleDist` task when a distribution is declared
/// 6. Builds the task graph, which infers edges and rejects cycles
pub fn load_workspace(path: &Path) -> Result<Workspace, LoadError> {
  let content = fs::read_to_string(path).map_err(|source| LoadError::Read {
    path: path.to_path_buf(),
    source,
  })?;
  let file: BuildFile = toml::from_str(&content).map_err(|e| LoadError::Parse {
    path: path.to_path_buf(),
    message: e.to_string(),
  })?;

  let root_dir = match path.parent() {
    Some(dir) if !dir.as_os_str().is_empty() => dunce::canonicalize(dir).map_err(|source| LoadError::Read {
      path: dir.to_path_buf(),
      source,
    })?,
    _ => std::env::current_dir().map_err(|source| LoadError::Read {
      path: PathBuf::from("."),
      source,
    })?,
  };
  let config = BuildConfig::resolve(&root_dir, &file.build, &file.signing)?;

  load_with_config(path, file, config)
}

/// Load from an already parsed build file and resolved configuration.
pub fn load_with_config(path: &Path, file: BuildFile, config: BuildConfig) -> Result<Workspace, LoadError> {
  let version = parse_version(&file.workspace.version)?;
  let root_dir = config.root_dir.clone();

  let mut projects = ProjectTree::new(Project {
    path: ROOT_PATH.to_string(),
    name: file.workspace.name.clone(),
    dir: root_dir.clone(),
    group: file.workspace.group.clone(),
    version: version.clone(),
  });
  for decl in &file.projects {
    let project = project_from_decl(decl, &file.workspace, &version, &root_dir)?;
    if project.is_root() {
      continue;
    }
    let path = project.path.clone();
    if !projects.insert(project) {
      return Err(LoadError::DuplicateProject(path));
    }
  }

  let remotes = repositories(&file.repositories, &config, &root_dir)?;
  if let Some(publish) = &file.publish
    && !remotes.iter().any(|r| r.name() == publish.repository)
  {
    return Err(LoadError::UnknownRepository(publish.repository.clone()));
  }

  let mut builder = GraphBuilder::new();
  let mut resolver = CoordinateResolver::new(remotes);

  // Tasks first, so artifacts and dependencies can refer to them
  for decl in &file.projects {
    let project = project_for(&projects, &decl.path)?;
    for task in &decl.tasks {
      builder.add_task(task_from_decl(task, project)?)?;
    }
  }

  for decl in &file.projects {
    let project = project_for(&projects, &decl.path)?;
    for artifact in &decl.artifacts {
      let task = TaskId::new(&project.path, &artifact.task);
      if !builder.contains(&task) {
        return Err(LoadError::UnknownTask {
          project: project.path.clone(),
          task: artifact.task.clone(),
        });
      }
      let coordinate = ArtifactCoordinate::new(
        &project.group,
        artifact.name.as_deref().unwrap_or(&project.name),
        &project.version.to_string(),
      )
      .with_classifier(artifact.classifier.as_deref())
      .with_extension(artifact.extension.as_deref().unwrap_or(crate::project::DEFAULT_EXTENSION));
      resolver.register_local(coordinate, &project.path, task, project.resolve_path(&artifact.path))?;
    }
  }

  for decl in &file.projects {
    let project = project_for(&projects, &decl.path)?;
    for dependency in &decl.dependencies {
      let consumer = TaskId::new(&project.path, &dependency.task);
      if !builder.contains(&consumer) {
        return Err(LoadError::UnknownTask {
          project: project.path.clone(),
          task: dependency.task.clone(),
        });
      }
      let coordinate = ArtifactCoordinate::parse(&dependency.coordinate, &project.version.to_string())?;
      let (path, producer) = provide(&mut builder, &resolver, project, &coordinate)?;
      wire_input(&mut builder, &consumer, path, producer);
    }
  }

  let distribution = match &file.distribution {
    Some(decl) => {
      let root = project_for(&projects, ROOT_PATH)?;
      let entries = distribution_entries(decl, &mut builder, &resolver, root)?;
      let distribution = Distribution {
        name: decl.name.clone().unwrap_or_else(|| file.workspace.name.clone()),
        version: version.to_string(),
        build_number: config.build_number.clone(),
        entries,
        launcher_names: decl.launcher_names.clone(),
        output_dir: config.distributions_dir(),
      };
      builder.add_task(distribution.clone().into_task(ROOT_PATH))?;
      Some(distribution)
    }
    None => None,
  };

  let graph = builder.build()?;
  info!(
    build_file = %path.display(),
    projects = projects.len(),
    tasks = graph.len(),
    "loaded workspace"
  );

  Ok(Workspace {
    build_file: path.to_path_buf(),
    config,
    name: file.workspace.name,
    group: file.workspace.group,
    version,
    description: file.workspace.description,
    projects,
    graph: Arc::new(graph),
    resolver,
    distribution,
    publish_repository: file.publish.map(|p| p.repository),
  })
}

fn parse_version(raw: &str) -> Result<Version, LoadError> {
  Version::parse(raw.trim()).map_err(|source| LoadError::Version {
    version: raw.to_string(),
    source,
  })
}

fn project_from_decl(
  decl: &ProjectDecl,
  workspace: &WorkspaceDecl,
  version: &Version,
  root_dir: &Path,
) -> Result<Project, LoadError> {
  let path = normalize_path(&decl.path);
  let default_name = path.rsplit(':').next().unwrap_or_default().to_string();
  let dir = match &decl.dir {
    Some(dir) if dir.is_absolute() => dir.clone(),
    Some(dir) => root_dir.join(dir),
    None => root_dir.join(path.trim_start_matches(':').replace(':', "/")),
  };
  let version = match &decl.version {
    Some(raw) => parse_version(raw)?,
    None => version.clone(),
  };

  Ok(Project {
    name: decl
      .name
      .clone()
      .unwrap_or_else(|| if default_name.is_empty() { workspace.name.clone() } else { default_name }),
    path,
    dir,
    group: decl.group.clone().unwrap_or_else(|| workspace.group.clone()),
    version,
  })
}

fn project_for<'a>(projects: &'a ProjectTree, path: &str) -> Result<&'a Project, LoadError> {
  let normalized = normalize_path(path);
  projects.get(&normalized).ok_or(LoadError::UnknownProject(normalized))
}

fn repositories(
  decls: &[RepositoryDecl],
  config: &BuildConfig,
  root_dir: &Path,
) -> Result<Vec<Arc<dyn RepositoryClient>>, LoadError> {
  let mut remotes: Vec<Arc<dyn RepositoryClient>> = Vec::with_capacity(decls.len());
  for decl in decls {
    let invalid = |message: &str| LoadError::InvalidRepository {
      name: decl.name.clone(),
      message: message.to_string(),
    };
    if remotes.iter().any(|r| r.name() == decl.name) {
      return Err(invalid("declared more than once"));
    }

    let client: Arc<dyn RepositoryClient> = match (&decl.url, &decl.path) {
      (Some(url), None) => {
        let auth = match (&decl.username, &config.repository_token) {
          (Some(username), Some(token)) => RemoteAuth::Basic {
            username: username.clone(),
            password: token.clone(),
          },
          (None, Some(token)) => RemoteAuth::Bearer(token.clone()),
          (_, None) => RemoteAuth::None,
        };
        Arc::new(RemoteRepository::new(&decl.name, url, auth)?.with_excluded_groups(decl.exclude_groups.clone()))
      }
      (None, Some(path)) => {
        if !decl.exclude_groups.is_empty() {
          return Err(invalid("exclude_groups applies to remote repositories only"));
        }
        let root = if path.is_absolute() {
          path.clone()
        } else {
          root_dir.join(path)
        };
        Arc::new(LocalRepository::new(&decl.name, &root))
      }
      _ => return Err(invalid("exactly one of `url` or `path` is required")),
    };
    debug!(repository = %decl.name, "configured repository");
    remotes.push(client);
  }
  Ok(remotes)
}

fn task_from_decl(decl: &TaskDecl, project: &Project) -> Result<TaskSpec, LoadError> {
  let action = match &decl.run {
    Some(run) => command_action(run, decl.env.clone(), decl.shell.clone()),
    None => TaskAction::noop(),
  };

  let mut spec = TaskSpec::new(TaskId::new(&project.path, &decl.name), action).working_dir(project.dir.clone());
  for input in &decl.inputs {
    spec = spec.input(project.resolve_path(input));
  }
  for output in &decl.outputs {
    spec = spec.output(project.resolve_path(output));
  }
  for (key, value) in &decl.properties {
    spec = spec.property(key, value);
  }
  for dep in &decl.depends_on {
    spec = spec.depends_on(task_reference(dep, project)?);
  }
  if !decl.cache {
    spec = spec.never_up_to_date();
  }
  if let Some(secs) = decl.timeout_secs {
    spec = spec.timeout(Duration::from_secs(secs));
  }
  Ok(spec)
}

/// `name` refers to a task in `project`; anything with a colon is a full task path.
fn task_reference(raw: &str, project: &Project) -> Result<TaskId, LoadError> {
  if raw.contains(':') {
    TaskId::parse(raw).ok_or_else(|| LoadError::InvalidTaskReference(raw.to_string()))
  } else if raw.trim().is_empty() {
    Err(LoadError::InvalidTaskReference(raw.to_string()))
  } else {
    Ok(TaskId::new(&project.path, raw.trim()))
  }
}

/// Where `coordinate` will be on disk for `project`, and the task producing it.
///
/// Local artifacts are consumed in place. Remote ones get a `fetch-<name>`
/// task on `project` that pulls them into its dependencies directory.
fn provide(
  builder: &mut GraphBuilder,
  resolver: &CoordinateResolver,
  project: &Project,
  coordinate: &ArtifactCoordinate,
) -> Result<(PathBuf, TaskId), LoadError> {
  match resolver.resolve(coordinate)? {
    Resolution::Local(artifact) => Ok((artifact.path, artifact.task)),
    Resolution::Remote { coordinate, repository } => {
      let name = match &coordinate.classifier {
        Some(classifier) => format!("fetch-{}-{}", coordinate.name, classifier),
        None => format!("fetch-{}", coordinate.name),
      };
      let id = TaskId::new(&project.path, &name);
      let dest = project.dir.join(DEPENDENCIES_DIR).join(coordinate.file_name());
      if builder.contains(&id) {
        return Ok((dest, id));
      }

      let client = resolver
        .repository(&repository)
        .ok_or_else(|| LoadError::UnknownRepository(repository.clone()))?;
      let target = dest.clone();
      let pulled = coordinate.clone();
      let action = TaskAction::new(format!("fetch {} from {}", coordinate, repository), move |_| {
        client
          .pull(&pulled, &target)
          .map_err(|e| ActionError::Failed(e.to_string()))
      });
      builder.add_task(
        TaskSpec::new(id.clone(), action)
          .working_dir(project.dir.clone())
          .output(dest.clone()),
      )?;
      debug!(task = %id, artifact = %coordinate, "added fetch task for remote dependency");
      Ok((dest, id))
    }
  }
}

/// Make `consumer` read `path`. The edge to `producer` is inferred from the
/// declared paths; an explicit one is added only when the producer does not
/// declare the path among its outputs.
fn wire_input(builder: &mut GraphBuilder, consumer: &TaskId, path: PathBuf, producer: TaskId) {
  let inferred = builder
    .task_mut(&producer)
    .is_some_and(|p| produces_input(&p.outputs, std::slice::from_ref(&path)));
  if let Some(spec) = builder.task_mut(consumer) {
    if !spec.inputs.contains(&path) {
      spec.inputs.push(path);
    }
    if !inferred && producer != *consumer && !spec.depends_on.contains(&producer) {
      spec.depends_on.push(producer);
    }
  }
}

fn distribution_entries(
  decl: &DistributionDecl,
  builder: &mut GraphBuilder,
  resolver: &CoordinateResolver,
  root: &Project,
) -> Result<Vec<DistributionEntry>, LoadError> {
  let mut entries = Vec::new();
  for (index, content) in decl.contents.iter().enumerate() {
    let invalid = |message: String| LoadError::InvalidContent { index, message };

    match (&content.coordinate, &content.task, &content.path) {
      (Some(raw), None, None) => {
        let coordinate = ArtifactCoordinate::parse(raw, &root.version.to_string())?;
        let (path, _) = provide(builder, resolver, root, &coordinate)?;
        let name = content
          .rename
          .clone()
          .unwrap_or_else(|| format!("{}.{}", coordinate.name, coordinate.extension));
        entries.push(DistributionEntry::new(path, content.kind, Some(name)));
      }
      (None, Some(raw), None) => {
        let id = task_reference(raw, root)?;
        let outputs = builder
          .task_mut(&id)
          .map(|spec| spec.outputs.clone())
          .ok_or_else(|| invalid(format!("unknown task {}", id)))?;
        if outputs.is_empty() {
          return Err(invalid(format!("task {} declares no outputs", id)));
        }
        if content.rename.is_some() && outputs.len() > 1 {
          return Err(invalid(format!("cannot rename the {} outputs of {}", outputs.len(), id)));
        }
        for output in outputs {
          entries.push(DistributionEntry::new(output, content.kind, content.rename.clone()));
        }
      }
      (None, None, Some(path)) => {
        entries.push(DistributionEntry::new(
          root.resolve_path(path),
          content.kind,
          content.rename.clone(),
        ));
      }
      _ => return Err(invalid("exactly one of `coordinate`, `task` or `path` is required".to_string())),
    }
  }
  Ok(entries)
}
