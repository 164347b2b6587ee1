//! CLI output formatting utilities.
//!
//! Colored status lines, durations, and the per-task run report.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::Context;
use clap::ValueEnum;
use owo_colors::{OwoColorize, Stream};

use strata_lib::execute::{RunReport, TaskOutcome};

#[derive(Debug, Clone, Copy, Default, ValueEnum)]
pub enum OutputFormat {
  #[default]
  Text,
  Json,
}

impl OutputFormat {
  pub fn is_json(self) -> bool {
    matches!(self, OutputFormat::Json)
  }
}

pub mod symbols {
  pub const SUCCESS: &str = "✓";
  pub const ERROR: &str = "✗";
  pub const WARNING: &str = "⚠";
  pub const INFO: &str = "•";
  pub const ARROW: &str = "→";
  pub const SKIPPED: &str = "-";
  pub const NOT_RUN: &str = "~";
}

/// Milliseconds are the finest unit worth printing for a task.
pub fn format_duration(duration: Duration) -> String {
  let rounded = Duration::from_millis(duration.as_millis().min(u64::MAX as u128) as u64);
  if rounded.is_zero() {
    return "0ms".to_string();
  }
  humantime::format_duration(rounded).to_string()
}

pub fn format_unix(secs: u64) -> String {
  humantime::format_rfc3339_seconds(UNIX_EPOCH + Duration::from_secs(secs)).to_string()
}

/// Time since `secs`, for "started 3m ago" style output.
pub fn format_age(secs: u64) -> String {
  let then = UNIX_EPOCH + Duration::from_secs(secs);
  let age = SystemTime::now().duration_since(then).unwrap_or_default();
  humantime::format_duration(Duration::from_secs(age.as_secs())).to_string()
}

pub fn print_success(message: &str) {
  println!(
    "{} {}",
    symbols::SUCCESS.if_supports_color(Stream::Stdout, |s| s.green()),
    message
  );
}

pub fn print_error(message: &str) {
  eprintln!(
    "{} {}",
    symbols::ERROR.if_supports_color(Stream::Stderr, |s| s.red()),
    message.if_supports_color(Stream::Stderr, |s| s.red())
  );
}

pub fn print_warning(message: &str) {
  eprintln!(
    "{} {}",
    symbols::WARNING.if_supports_color(Stream::Stderr, |s| s.yellow()),
    message.if_supports_color(Stream::Stderr, |s| s.yellow())
  );
}

pub fn print_info(message: &str) {
  println!(
    "{} {}",
    symbols::INFO.if_supports_color(Stream::Stdout, |s| s.blue()),
    message
  );
}

pub fn print_stat(label: &str, value: &str) {
  println!(
    "  {}: {}",
    label.if_supports_color(Stream::Stdout, |s| s.dimmed()),
    value
  );
}

pub fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
  let json = serde_json::to_string_pretty(value).context("Failed to serialize to JSON")?;
  println!("{}", json);
  Ok(())
}

/// One line per task, then the totals; failures and their skipped
/// dependents go to stderr.
pub fn print_report(report: &RunReport, verbose: bool) {
  for (id, outcome) in &report.outcomes {
    match outcome {
      TaskOutcome::Executed { duration } => println!(
        "  {} {} {}",
        symbols::SUCCESS.if_supports_color(Stream::Stdout, |s| s.green()),
        id,
        format!("({})", format_duration(*duration)).if_supports_color(Stream::Stdout, |s| s.dimmed())
      ),
      TaskOutcome::UpToDate if verbose => println!(
        "  {} {} {}",
        symbols::INFO.if_supports_color(Stream::Stdout, |s| s.blue()),
        id,
        "up-to-date".if_supports_color(Stream::Stdout, |s| s.dimmed())
      ),
      TaskOutcome::UpToDate => {}
      TaskOutcome::Failed { error, .. } => eprintln!(
        "  {} {} {}",
        symbols::ERROR.if_supports_color(Stream::Stderr, |s| s.red()),
        id,
        error.if_supports_color(Stream::Stderr, |s| s.red())
      ),
      TaskOutcome::Skipped { via, .. } => eprintln!(
        "  {} {} skipped {} {}",
        symbols::SKIPPED.if_supports_color(Stream::Stderr, |s| s.yellow()),
        id,
        symbols::ARROW,
        via
      ),
      TaskOutcome::NotRun => eprintln!(
        "  {} {} not run",
        symbols::NOT_RUN.if_supports_color(Stream::Stderr, |s| s.yellow()),
        id
      ),
    }
  }

  println!();
  print_stat("Executed", &report.count("executed").to_string());
  print_stat("Up-to-date", &report.count("up-to-date").to_string());
  print_stat("Elapsed", &format_duration(report.elapsed));

  if !report.is_success() {
    eprintln!();
    eprint!("{}", report.summary());
  }
}
