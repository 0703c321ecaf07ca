//! Command-line tests for the pgcr-ingest binary

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

fn pgcr_ingest(cwd: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("pgcr-ingest").unwrap();
    cmd.current_dir(cwd.path())
        .env_remove("PGCR_DIRECTORY")
        .env_remove("PGCR_BATCH_SIZE")
        .env_remove("PGCR_WORKERS")
        .env_remove("LOG_OUTPUT");
    cmd
}

#[test]
fn test_help() {
    let dir = TempDir::new().unwrap();
    pgcr_ingest(&dir)
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("--batch-size"))
        .stdout(predicate::str::contains("--dry-run"));
}

#[test]
fn test_dry_run_reads_every_file() {
    let dir = TempDir::new().unwrap();
    let data = dir.path().join("data");
    std::fs::create_dir_all(data.join("2021")).unwrap();

    let lines = (0..3)
        .map(|i| format!(r#"{{"activityDetails":{{"instanceId":"{i}"}}}}"#))
        .collect::<Vec<_>>()
        .join("\n");
    std::fs::write(
        data.join("2021/part-0.zst"),
        zstd::encode_all(lines.as_bytes(), 3).unwrap(),
    )
    .unwrap();

    pgcr_ingest(&dir)
        .args(["--dry-run", "--config", "absent.yml", "--workers", "2", "--batch-size", "2"])
        .arg("--directory")
        .arg(&data)
        .assert()
        .success();
}

#[test]
fn test_rejects_zero_batch_size() {
    let dir = TempDir::new().unwrap();
    pgcr_ingest(&dir)
        .args(["--dry-run", "--config", "absent.yml", "--batch-size", "0"])
        .arg("--directory")
        .arg(dir.path())
        .assert()
        .failure()
        .stderr(predicate::str::contains("Batch size cannot be zero or negative"));
}

#[test]
fn test_rejects_missing_directory() {
    let dir = TempDir::new().unwrap();
    pgcr_ingest(&dir)
        .args(["--dry-run", "--config", "absent.yml", "--directory", "does-not-exist"])
        .assert()
        .failure();
}
