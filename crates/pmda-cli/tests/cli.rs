use assert_cmd::Command;
use predicates::prelude::*;
use std::path::Path;

fn write_duckdb_config(dir: &Path) -> std::path::PathBuf {
    let config_path = dir.join("config.yaml");
    let yaml = format!(
        r#"
database:
  type: duckdb
  path: "{db}"
  state_schema: main
datasets:
  approvals:
    kind: approvals
    schema_name: pmda
    load_mode: merge
    primary_key:
      - approval_id
"#,
        db = dir.join("pmda.duckdb").display(),
    );
    std::fs::write(&config_path, yaml).unwrap();
    config_path
}

#[test]
fn test_check_config_accepts_valid_file() {
    let dir = tempfile::tempdir().unwrap();
    let config_path = write_duckdb_config(dir.path());

    Command::cargo_bin("pmda-load")
        .unwrap()
        .args(["--config", config_path.to_str().unwrap(), "check-config"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Configuration OK"));
}

#[test]
fn test_missing_config_file_fails() {
    Command::cargo_bin("pmda-load")
        .unwrap()
        .args(["--config", "/nonexistent/config.yaml", "check-config"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("configuration file not found"));
}

#[test]
fn test_run_with_unknown_dataset_fails() {
    let dir = tempfile::tempdir().unwrap();
    let config_path = write_duckdb_config(dir.path());

    Command::cargo_bin("pmda-load")
        .unwrap()
        .args([
            "--config",
            config_path.to_str().unwrap(),
            "run",
            "--dataset",
            "nonexistent",
        ])
        .assert()
        .failure()
        .stderr(predicate::str::contains("nonexistent"));
}

#[test]
fn test_status_on_fresh_database_prints_empty_table() {
    let dir = tempfile::tempdir().unwrap();
    let config_path = write_duckdb_config(dir.path());

    Command::cargo_bin("pmda-load")
        .unwrap()
        .args(["--config", config_path.to_str().unwrap(), "status"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Dataset"));
}
