//! CLI smoke tests for strata.
//!
//! These tests drive the binary against small workspaces in temp
//! directories and check exit codes and the printed report.

use std::fs;
use std::path::Path;

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use tempfile::TempDir;

/// Get a Command for the strata binary, isolated from the caller's environment.
fn strata_cmd(dir: &Path) -> Command {
  let mut cmd = cargo_bin_cmd!("strata");
  cmd
    .current_dir(dir)
    .env_remove("STRATA_OUTPUT_DIR")
    .env_remove("STRATA_PARALLELISM")
    .env_remove("STRATA_LOG")
    .env_remove("RUST_LOG")
    .env_remove("CI");
  cmd
}

/// Create a workspace with `strata.toml` and the given project directories.
fn workspace(build_file: &str, projects: &[&str]) -> TempDir {
  let temp = TempDir::new().unwrap();
  fs::write(temp.path().join("strata.toml"), build_file).unwrap();
  for project in projects {
    fs::create_dir_all(temp.path().join(project)).unwrap();
  }
  temp
}

const HEADER: &str = r#"
[workspace]
name = "demo"
group = "org.example"
version = "1.0.0"
"#;

/// `compile` writes an output that `package` reads; the edge is inferred.
fn pipeline_build_file() -> String {
  format!(
    r#"{HEADER}
[[projects]]
path = "app"

[[projects.tasks]]
name = "compile"
inputs = ["src"]
outputs = ["build/classes.txt"]
run = "cat src/Main.x > build/classes.txt"

[[projects.tasks]]
name = "package"
inputs = ["build/classes.txt"]
outputs = ["build/app.jar"]
run = "cp build/classes.txt build/app.jar"

[[projects.tasks]]
name = "test"
depends_on = ["compile"]
run = "test -f build/classes.txt"
"#
  )
}

fn pipeline_workspace() -> TempDir {
  let temp = workspace(&pipeline_build_file(), &["app/src"]);
  fs::write(temp.path().join("app/src/Main.x"), "module Main {}\n").unwrap();
  temp
}

// =============================================================================
// Help & Version
// =============================================================================

#[test]
fn help_flag_works() {
  let temp = TempDir::new().unwrap();
  strata_cmd(temp.path())
    .arg("--help")
    .assert()
    .success()
    .stdout(predicate::str::contains("Usage"));
}

#[test]
fn version_flag_works() {
  let temp = TempDir::new().unwrap();
  strata_cmd(temp.path())
    .arg("--version")
    .assert()
    .success()
    .stdout(predicate::str::contains("strata"));
}

#[test]
fn subcommand_help_works() {
  let temp = TempDir::new().unwrap();
  for subcommand in ["assemble", "test", "run", "publish", "status", "graph", "clean"] {
    strata_cmd(temp.path())
      .args([subcommand, "--help"])
      .assert()
      .success()
      .stdout(predicate::str::contains("Usage"));
  }
}

// =============================================================================
// Workspace discovery
// =============================================================================

#[test]
fn missing_build_file_fails() {
  let temp = TempDir::new().unwrap();
  strata_cmd(temp.path())
    .arg("graph")
    .assert()
    .failure()
    .stderr(predicate::str::contains("strata.toml"));
}

#[test]
fn malformed_build_file_fails() {
  let temp = workspace("[workspace]\nname = \"demo\"\n", &[]);
  strata_cmd(temp.path())
    .arg("graph")
    .assert()
    .failure()
    .stderr(predicate::str::contains("Failed to load"));
}

#[test]
fn dir_flag_selects_workspace() {
  let temp = pipeline_workspace();
  let elsewhere = TempDir::new().unwrap();
  strata_cmd(elsewhere.path())
    .arg("-C")
    .arg(temp.path())
    .arg("graph")
    .assert()
    .success()
    .stdout(predicate::str::contains(":app:compile"));
}

// =============================================================================
// Graph
// =============================================================================

#[test]
fn graph_prints_waves_in_dependency_order() {
  let temp = pipeline_workspace();
  strata_cmd(temp.path())
    .arg("graph")
    .assert()
    .success()
    .stdout(predicate::str::contains("Wave 1").and(predicate::str::contains("Wave 2")))
    .stdout(predicate::str::is_match(r"(?s)Wave 1.*:app:compile.*Wave 2.*:app:package").unwrap());
}

#[test]
fn graph_verbose_marks_inferred_edges() {
  let temp = pipeline_workspace();
  strata_cmd(temp.path())
    .args(["graph", "-v", ":app:package"])
    .assert()
    .success()
    .stdout(predicate::str::contains(":app:compile (inferred)"))
    .stdout(predicate::str::contains(":app:test").not());
}

#[test]
fn graph_rejects_cycles() {
  let build_file = format!(
    r#"{HEADER}
[[projects]]
path = "app"

[[projects.tasks]]
name = "a"
depends_on = ["b"]

[[projects.tasks]]
name = "b"
depends_on = ["a"]
"#
  );
  let temp = workspace(&build_file, &["app"]);
  strata_cmd(temp.path())
    .arg("graph")
    .assert()
    .failure()
    .stderr(predicate::str::contains("dependency cycle detected"));
}

// =============================================================================
// Run, test & clean
// =============================================================================

#[test]
#[cfg(unix)]
fn run_executes_then_reports_up_to_date() {
  let temp = pipeline_workspace();

  strata_cmd(temp.path())
    .args(["run", "package"])
    .assert()
    .success()
    .stdout(predicate::str::contains("Executed: 2"));
  assert_eq!(
    fs::read_to_string(temp.path().join("app/build/app.jar")).unwrap(),
    "module Main {}\n"
  );

  strata_cmd(temp.path())
    .args(["run", "package"])
    .assert()
    .success()
    .stdout(predicate::str::contains("Executed: 0"))
    .stdout(predicate::str::contains("Up-to-date: 2"));
}

#[test]
#[cfg(unix)]
fn changed_input_reruns_only_affected_tasks() {
  let temp = pipeline_workspace();
  strata_cmd(temp.path()).args(["run", "package"]).assert().success();

  fs::write(temp.path().join("app/src/Main.x"), "module Main { void run() {} }\n").unwrap();
  strata_cmd(temp.path())
    .args(["run", "package"])
    .assert()
    .success()
    .stdout(predicate::str::contains("Executed: 2"));
}

#[test]
#[cfg(unix)]
fn test_command_runs_test_tasks() {
  let temp = pipeline_workspace();
  strata_cmd(temp.path())
    .args(["-j", "1", "test"])
    .assert()
    .success()
    .stdout(predicate::str::contains(":app:test"));
}

#[test]
fn run_unknown_selector_fails() {
  let temp = pipeline_workspace();
  strata_cmd(temp.path())
    .args(["run", ":app:deploy"])
    .assert()
    .failure()
    .stderr(predicate::str::contains("no task matches"));
}

#[test]
#[cfg(unix)]
fn failing_task_skips_dependents_and_exits_nonzero() {
  let build_file = format!(
    r#"{HEADER}
[[projects]]
path = "app"

[[projects.tasks]]
name = "compile"
run = "exit 3"

[[projects.tasks]]
name = "package"
depends_on = ["compile"]
run = "true"
"#
  );
  let temp = workspace(&build_file, &["app"]);
  strata_cmd(temp.path())
    .args(["run", "package"])
    .assert()
    .failure()
    .stderr(predicate::str::contains("task :app:compile failed"))
    .stderr(predicate::str::contains("skipped :app:package (depends on :app:compile)"))
    .stderr(predicate::str::contains("Build failed"));
}

#[test]
#[cfg(unix)]
fn clean_removes_outputs_and_forces_rerun() {
  let temp = pipeline_workspace();
  strata_cmd(temp.path()).args(["run", "package"]).assert().success();
  assert!(temp.path().join("app/build/app.jar").exists());

  strata_cmd(temp.path())
    .arg("clean")
    .assert()
    .success()
    .stdout(predicate::str::contains("Outputs removed: 2"));
  assert!(!temp.path().join("app/build/app.jar").exists());
  assert!(!temp.path().join("app/build/classes.txt").exists());

  strata_cmd(temp.path())
    .args(["run", "package"])
    .assert()
    .success()
    .stdout(predicate::str::contains("Executed: 2"));
}

#[test]
fn clean_never_removes_workspace_sources() {
  let build_file = format!(
    r#"{HEADER}
[[projects]]
path = "app"

[[projects.tasks]]
name = "everything"
outputs = [".", "..", "build/out.txt"]
"#
  );
  let temp = workspace(&build_file, &["app/src", "app/build"]);
  fs::write(temp.path().join("app/src/Main.x"), "module Main {}\n").unwrap();
  fs::write(temp.path().join("app/build/out.txt"), "generated").unwrap();

  strata_cmd(temp.path())
    .arg("clean")
    .assert()
    .success()
    .stdout(predicate::str::contains("Outputs removed: 1"));
  assert!(temp.path().join("strata.toml").exists());
  assert!(temp.path().join("app/src/Main.x").exists());
  assert!(!temp.path().join("app/build/out.txt").exists());
}

// =============================================================================
// Release commands
// =============================================================================

#[test]
fn assemble_without_distribution_fails() {
  let temp = pipeline_workspace();
  strata_cmd(temp.path())
    .arg("assemble")
    .assert()
    .failure()
    .stderr(predicate::str::contains("No [distribution] declared"));
}

#[test]
fn publish_without_distribution_fails() {
  let temp = pipeline_workspace();
  strata_cmd(temp.path())
    .arg("publish")
    .assert()
    .failure()
    .stderr(predicate::str::contains("No [distribution] declared"));
}

fn distribution_workspace() -> TempDir {
  let build_file = format!(
    r#"{HEADER}
[[projects]]
path = "app"

[[projects.tasks]]
name = "jar"
outputs = ["build/app.jar"]
run = "echo jar > build/app.jar"

[[projects.artifacts]]
task = "jar"
path = "build/app.jar"

[distribution]
[[distribution.contents]]
coordinate = "org.example:app"

[[distribution.contents]]
path = "README.md"
"#
  );
  let temp = workspace(&build_file, &["app"]);
  fs::write(temp.path().join("README.md"), "# demo\n").unwrap();
  temp
}

#[test]
fn status_before_first_release() {
  let temp = distribution_workspace();
  strata_cmd(temp.path())
    .arg("status")
    .assert()
    .success()
    .stdout(predicate::str::contains("has not been released"));
}

#[test]
fn status_json_output() {
  let temp = distribution_workspace();
  let output = strata_cmd(temp.path()).args(["status", "--output", "json"]).output().unwrap();
  assert!(output.status.success());

  let json: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
  assert_eq!(json["version"], "1.0.0");
  assert!(json["state"].is_null());
  assert!(json["lock"].is_null());
}

#[test]
#[cfg(unix)]
fn assemble_writes_archives() {
  let temp = distribution_workspace();
  strata_cmd(temp.path())
    .arg("assemble")
    .assert()
    .success()
    .stdout(predicate::str::contains("Assembled demo-1.0.0"));

  let dist = temp.path().join("build/distributions");
  assert!(dist.join("demo-1.0.0.zip").is_file());
  assert!(dist.join("demo-1.0.0.tar.gz").is_file());
  assert!(dist.join("demo-1.0.0-checksums.txt").is_file());
}
