//! Task graph construction and ordering.
//!
//! Tasks are registered on a [`GraphBuilder`]; [`GraphBuilder::build`] adds
//! explicit edges, infers producer/consumer edges from declared paths, and
//! rejects cycles with the full cycle path. The resulting [`TaskGraph`] is
//! immutable and provides:
//! - Parallel execution waves (groups of mutually independent tasks)
//! - Dependency and dependent queries
//! - Target selection and dependency closure

pub mod overlap;
pub mod task;

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Arc;

use petgraph::Direction;
use petgraph::graph::{DiGraph, NodeIndex};
use thiserror::Error;
use tracing::debug;

pub use overlap::produces_input;
pub use task::{ActionContext, ActionError, CachePolicy, TaskAction, TaskId, TaskSpec};

/// How an edge came to exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeKind {
  /// Declared with `depends_on`.
  Explicit,
  /// Inferred from an output of the source overlapping an input of the target.
  Inferred,
}

/// Configuration errors in the declared task set.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum GraphError {
  #[error("task {0} is declared more than once")]
  DuplicateTask(TaskId),

  #[error("task {task} depends on unknown task {dependency}")]
  UnknownDependency { task: TaskId, dependency: TaskId },

  /// The first member is repeated at the end to close the loop.
  #[error("dependency cycle detected: {}", format_cycle(.cycle))]
  CyclicDependency { cycle: Vec<TaskId> },

  #[error("no task matches '{0}'")]
  NoMatchingTask(String),

  #[error("task handle for {0} was not issued by this builder")]
  ForeignHandle(TaskId),
}

fn format_cycle(cycle: &[TaskId]) -> String {
  cycle.iter().map(ToString::to_string).collect::<Vec<_>>().join(" -> ")
}

/// Returned by [`GraphBuilder::add_task`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TaskHandle {
  index: usize,
  id: TaskId,
}

impl TaskHandle {
  pub fn id(&self) -> &TaskId {
    &self.id
  }
}

/// Collects task declarations prior to graph construction.
#[derive(Debug, Default)]
pub struct GraphBuilder {
  specs: Vec<TaskSpec>,
  by_id: HashMap<TaskId, usize>,
}

impl GraphBuilder {
  pub fn new() -> Self {
    Self::default()
  }

  /// Register a task.
  pub fn add_task(&mut self, spec: TaskSpec) -> Result<TaskHandle, GraphError> {
    if self.by_id.contains_key(&spec.id) {
      return Err(GraphError::DuplicateTask(spec.id));
    }
    let index = self.specs.len();
    let id = spec.id.clone();
    self.by_id.insert(id.clone(), index);
    self.specs.push(spec);
    Ok(TaskHandle { index, id })
  }

  /// Add an explicit dependency of `task` on `on`.
  ///
  /// `task` must come from this builder. `on` is recorded by id, so an
  /// unregistered one surfaces as `UnknownDependency` from [`build`](Self::build).
  pub fn add_dependency(&mut self, task: &TaskHandle, on: &TaskHandle) -> Result<(), GraphError> {
    let spec = match self.by_id.get(&task.id) {
      Some(&index) if index == task.index => self.specs.get_mut(index),
      _ => None,
    };
    let Some(spec) = spec else {
      return Err(GraphError::ForeignHandle(task.id.clone()));
    };
    if !spec.depends_on.contains(&on.id) {
      spec.depends_on.push(on.id.clone());
    }
    Ok(())
  }

  pub fn contains(&self, id: &TaskId) -> bool {
    self.by_id.contains_key(id)
  }

  /// Mutable access to a registered task, for late additions such as inputs
  /// discovered while resolving dependencies.
  pub fn task_mut(&mut self, id: &TaskId) -> Option<&mut TaskSpec> {
    self.by_id.get(id).map(|&i| &mut self.specs[i])
  }

  /// Build the graph: explicit edges, inferred edges, then cycle detection.
  ///
  /// # Errors
  ///
  /// - `UnknownDependency` if an explicit dependency names no registered task
  /// - `CyclicDependency` with the ordered cycle members if the relation is cyclic
  pub fn build(self) -> Result<TaskGraph, GraphError> {
    let mut graph: DiGraph<TaskId, EdgeKind> = DiGraph::new();
    let mut nodes: HashMap<TaskId, NodeIndex> = HashMap::new();

    for spec in &self.specs {
      let idx = graph.add_node(spec.id.clone());
      nodes.insert(spec.id.clone(), idx);
    }

    // Explicit edges: dependency -> dependent
    for spec in &self.specs {
      let dependent = nodes[&spec.id];
      for dep in &spec.depends_on {
        let Some(&dep_idx) = nodes.get(dep) else {
          return Err(GraphError::UnknownDependency {
            task: spec.id.clone(),
            dependency: dep.clone(),
          });
        };
        if graph.find_edge(dep_idx, dependent).is_none() {
          graph.add_edge(dep_idx, dependent, EdgeKind::Explicit);
        }
      }
    }

    // Inferred edges: producer -> consumer
    for producer in &self.specs {
      if producer.outputs.is_empty() {
        continue;
      }
      for consumer in &self.specs {
        if producer.id == consumer.id || !produces_input(&producer.outputs, &consumer.inputs) {
          continue;
        }
        let (from, to) = (nodes[&producer.id], nodes[&consumer.id]);
        if graph.find_edge(from, to).is_none() {
          debug!(producer = %producer.id, consumer = %consumer.id, "inferred dependency from declared paths");
          graph.add_edge(from, to, EdgeKind::Inferred);
        }
      }
    }

    if let Some(cycle) = find_cycle(&graph) {
      return Err(GraphError::CyclicDependency { cycle });
    }

    let specs = self
      .specs
      .into_iter()
      .map(|spec| (spec.id.clone(), Arc::new(spec)))
      .collect();

    Ok(TaskGraph { graph, nodes, specs })
  }
}

/// Depth-first search with an explicit recursion stack.
///
/// Returns the first cycle found, as the path from the re-entered node back
/// to itself. Nodes and neighbours are visited in `TaskId` order so the
/// reported cycle is deterministic.
fn find_cycle(graph: &DiGraph<TaskId, EdgeKind>) -> Option<Vec<TaskId>> {
  fn visit(
    graph: &DiGraph<TaskId, EdgeKind>,
    node: NodeIndex,
    done: &mut HashSet<NodeIndex>,
    stack: &mut Vec<NodeIndex>,
    on_stack: &mut HashSet<NodeIndex>,
  ) -> Option<Vec<TaskId>> {
    stack.push(node);
    on_stack.insert(node);

    let mut next: Vec<NodeIndex> = graph.neighbors_directed(node, Direction::Outgoing).collect();
    next.sort_by(|a, b| graph[*a].cmp(&graph[*b]));
    next.dedup();

    for neighbor in next {
      if on_stack.contains(&neighbor) {
        let start = stack.iter().position(|&n| n == neighbor).unwrap_or(0);
        let mut cycle: Vec<TaskId> = stack[start..].iter().map(|&n| graph[n].clone()).collect();
        cycle.push(graph[neighbor].clone());
        return Some(cycle);
      }
      if !done.contains(&neighbor)
        && let Some(cycle) = visit(graph, neighbor, done, stack, on_stack)
      {
        return Some(cycle);
      }
    }

    stack.pop();
    on_stack.remove(&node);
    done.insert(node);
    None
  }

  let mut roots: Vec<NodeIndex> = graph.node_indices().collect();
  roots.sort_by(|a, b| graph[*a].cmp(&graph[*b]));

  let mut done = HashSet::new();
  for root in roots {
    if done.contains(&root) {
      continue;
    }
    let mut stack = Vec::new();
    let mut on_stack = HashSet::new();
    if let Some(cycle) = visit(graph, root, &mut done, &mut stack, &mut on_stack) {
      return Some(cycle);
    }
  }
  None
}

/// The immutable, acyclic task graph.
pub struct TaskGraph {
  graph: DiGraph<TaskId, EdgeKind>,
  nodes: HashMap<TaskId, NodeIndex>,
  specs: HashMap<TaskId, Arc<TaskSpec>>,
}

impl TaskGraph {
  pub fn len(&self) -> usize {
    self.specs.len()
  }

  pub fn is_empty(&self) -> bool {
    self.specs.is_empty()
  }

  pub fn task(&self, id: &TaskId) -> Option<&Arc<TaskSpec>> {
    self.specs.get(id)
  }

  /// All task ids, sorted.
  pub fn task_ids(&self) -> Vec<TaskId> {
    let mut ids: Vec<TaskId> = self.specs.keys().cloned().collect();
    ids.sort();
    ids
  }

  /// Direct dependencies of a task, sorted.
  pub fn dependencies(&self, id: &TaskId) -> Vec<TaskId> {
    self.neighbors(id, Direction::Incoming)
  }

  /// Tasks that directly depend on `id`, sorted.
  pub fn dependents(&self, id: &TaskId) -> Vec<TaskId> {
    self.neighbors(id, Direction::Outgoing)
  }

  fn neighbors(&self, id: &TaskId, direction: Direction) -> Vec<TaskId> {
    let Some(&idx) = self.nodes.get(id) else {
      return Vec::new();
    };
    let mut out: Vec<TaskId> = self
      .graph
      .neighbors_directed(idx, direction)
      .map(|n| self.graph[n].clone())
      .collect();
    out.sort();
    out.dedup();
    out
  }

  /// All edges as `(dependency, dependent, kind)`, sorted.
  pub fn edges(&self) -> Vec<(TaskId, TaskId, EdgeKind)> {
    let mut edges: Vec<_> = self
      .graph
      .edge_indices()
      .filter_map(|e| {
        let (a, b) = self.graph.edge_endpoints(e)?;
        Some((self.graph[a].clone(), self.graph[b].clone(), self.graph[e]))
      })
      .collect();
    edges.sort_by(|a, b| (&a.0, &a.1).cmp(&(&b.0, &b.1)));
    edges
  }

  /// Resolve a selector to task ids.
  ///
  /// `:project:task` (or `:task` for the root) selects one task; a bare name
  /// selects the task of that name in every project.
  pub fn select(&self, selector: &str) -> Result<Vec<TaskId>, GraphError> {
    let matches: Vec<TaskId> = if selector.contains(':') {
      TaskId::parse(selector)
        .filter(|id| self.specs.contains_key(id))
        .into_iter()
        .collect()
    } else {
      self.task_ids().into_iter().filter(|id| id.name == selector).collect()
    };

    if matches.is_empty() {
      return Err(GraphError::NoMatchingTask(selector.to_string()));
    }
    Ok(matches)
  }

  /// Targets plus everything they transitively depend on.
  pub fn closure(&self, targets: &[TaskId]) -> BTreeSet<TaskId> {
    let mut seen = BTreeSet::new();
    let mut queue: VecDeque<TaskId> = targets.iter().cloned().collect();
    while let Some(id) = queue.pop_front() {
      if !self.specs.contains_key(&id) || !seen.insert(id.clone()) {
        continue;
      }
      queue.extend(self.dependencies(&id));
    }
    seen
  }

  /// Tasks that transitively depend on `id` (not including `id`).
  pub fn transitive_dependents(&self, id: &TaskId) -> BTreeSet<TaskId> {
    let mut seen = BTreeSet::new();
    let mut queue: VecDeque<TaskId> = self.dependents(id).into();
    while let Some(next) = queue.pop_front() {
      if seen.insert(next.clone()) {
        queue.extend(self.dependents(&next));
      }
    }
    seen
  }

  /// Every task organized into waves.
  ///
  /// Each wave contains tasks whose dependencies all sit in earlier waves, so
  /// the tasks of one wave may run in parallel. Within a wave, ids are sorted.
  pub fn topological_order(&self) -> Vec<Vec<TaskId>> {
    let all: BTreeSet<TaskId> = self.specs.keys().cloned().collect();
    self.waves_of(&all)
  }

  /// Waves restricted to `subset`; edges leaving the subset are ignored.
  pub fn waves_of(&self, subset: &BTreeSet<TaskId>) -> Vec<Vec<TaskId>> {
    // Kahn's algorithm, one level at a time
    let mut in_degree: HashMap<&TaskId, usize> = subset
      .iter()
      .map(|id| {
        let count = self.dependencies(id).iter().filter(|d| subset.contains(*d)).count();
        (id, count)
      })
      .collect();

    let mut remaining: BTreeSet<&TaskId> = subset.iter().collect();
    let mut waves = Vec::new();

    while !remaining.is_empty() {
      let ready: Vec<&TaskId> = remaining.iter().filter(|id| in_degree[*id] == 0).copied().collect();
      if ready.is_empty() {
        // Unreachable for a graph that passed cycle detection.
        break;
      }

      for id in &ready {
        remaining.remove(*id);
        for dependent in self.dependents(id) {
          if let Some(deg) = in_degree.get_mut(&dependent) {
            *deg = deg.saturating_sub(1);
          }
        }
      }

      waves.push(ready.into_iter().cloned().collect());
    }

    waves
  }
}

impl std::fmt::Debug for TaskGraph {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("TaskGraph")
      .field("tasks", &self.specs.len())
      .field("edges", &self.graph.edge_count())
      .finish()
  }
}
