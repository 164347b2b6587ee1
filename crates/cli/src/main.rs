mod cmd;
mod output;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use cmd::{cmd_assemble, cmd_clean, cmd_graph, cmd_publish, cmd_run, cmd_status, cmd_test};
use output::{OutputFormat, print_error};

/// Environment variable holding the log filter; `RUST_LOG` is the fallback.
const LOG_ENV: &str = "STRATA_LOG";

/// strata - incremental builds and releases for multi-project workspaces
#[derive(Parser)]
#[command(name = "strata")]
#[command(author, version, about, long_about = None)]
struct Cli {
  /// Run as if started in this directory
  #[arg(short = 'C', long = "dir", global = true, value_name = "DIR")]
  dir: Option<PathBuf>,

  /// Enable verbose output
  #[arg(short, long, global = true)]
  verbose: bool,

  /// Maximum number of tasks running at once
  #[arg(short, long, global = true, value_name = "N")]
  jobs: Option<usize>,

  #[command(subcommand)]
  command: Commands,
}

#[derive(Subcommand)]
enum Commands {
  /// Build the distribution archives
  Assemble,

  /// Run every task named `test`
  Test,

  /// Run the selected tasks and their dependencies
  Run {
    /// Task selectors: `:project:task`, `:task` for the root, or a bare task name
    #[arg(required = true)]
    selectors: Vec<String>,
  },

  /// Release the distribution: assemble, sign, stage, publish and tag
  Publish,

  /// Show the release state of the current version
  Status {
    #[arg(short, long, value_enum, default_value_t = OutputFormat::Text)]
    output: OutputFormat,
  },

  /// Print the execution waves without running anything
  Graph {
    /// Restrict to these selectors and their dependencies
    selectors: Vec<String>,
  },

  /// Delete declared outputs and the incremental cache
  Clean,
}

fn init_logging(verbose: bool) {
  let default = if verbose { "debug" } else { "warn" };
  let filter = EnvFilter::try_from_env(LOG_ENV)
    .or_else(|_| EnvFilter::try_from_default_env())
    .unwrap_or_else(|_| EnvFilter::new(default));

  tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_writer(std::io::stderr)
    .without_time()
    .init();
}

fn main() {
  let cli = Cli::parse();
  init_logging(cli.verbose);

  let opts = cmd::GlobalOptions {
    dir: cli.dir,
    verbose: cli.verbose,
    jobs: cli.jobs,
  };

  let result: Result<()> = match cli.command {
    Commands::Assemble => cmd_assemble(&opts),
    Commands::Test => cmd_test(&opts),
    Commands::Run { selectors } => cmd_run(&opts, &selectors),
    Commands::Publish => cmd_publish(&opts),
    Commands::Status { output } => cmd_status(&opts, output),
    Commands::Graph { selectors } => cmd_graph(&opts, &selectors),
    Commands::Clean => cmd_clean(&opts),
  };

  if let Err(e) = result {
    print_error(&format!("{:#}", e));
    std::process::exit(1);
  }
}
