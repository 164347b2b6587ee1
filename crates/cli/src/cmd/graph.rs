//! `strata graph`: execution waves without running anything.

use std::collections::BTreeSet;

use anyhow::Result;
use owo_colors::{OwoColorize, Stream};

use strata_lib::graph::{EdgeKind, TaskId};

use super::{GlobalOptions, load, select};
use crate::output::symbols;

pub fn cmd_graph(opts: &GlobalOptions, selectors: &[String]) -> Result<()> {
  let workspace = load(opts)?;
  let graph = &workspace.graph;

  let waves = if selectors.is_empty() {
    graph.topological_order()
  } else {
    let targets = select(&workspace, selectors)?;
    graph.waves_of(&graph.closure(&targets))
  };

  let inferred: BTreeSet<(TaskId, TaskId)> = graph
    .edges()
    .into_iter()
    .filter(|(_, _, kind)| *kind == EdgeKind::Inferred)
    .map(|(dependency, dependent, _)| (dependency, dependent))
    .collect();

  for (index, wave) in waves.iter().enumerate() {
    println!(
      "{}",
      format!("Wave {}", index + 1).if_supports_color(Stream::Stdout, |s| s.bold())
    );
    for id in wave {
      println!("  {} {}", symbols::INFO, id);
      if !opts.verbose {
        continue;
      }
      for dep in graph.dependencies(id) {
        let marker = if inferred.contains(&(dep.clone(), id.clone())) {
          " (inferred)"
        } else {
          ""
        };
        println!(
          "      {} {}{}",
          symbols::ARROW,
          dep,
          marker.if_supports_color(Stream::Stdout, |s| s.dimmed())
        );
      }
    }
  }
  Ok(())
}
