use predicates::prelude::*;
use tempfile::tempdir;

fn cmd(home: &std::path::Path) -> assert_cmd::Command {
    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("gnss-ingest");
    cmd.current_dir(home)
        .env("GNSS_INGEST_HOME", home)
        .env_remove("GNSS_INGEST_CONFIG_PATH");
    cmd
}

#[test]
fn epochs_lists_hourly_intervals() {
    let tmp = tempdir().expect("tempdir");
    cmd(tmp.path())
        .arg("epochs")
        .arg("--start")
        .arg("2024-01-01 00:30")
        .arg("--end")
        .arg("2024-01-01 02:10")
        .arg("--period")
        .arg("1h")
        .assert()
        .success()
        .stdout(predicate::str::contains("count=3"))
        .stdout(predicate::str::contains("2024-01-01T00:00:00Z 2024-01-01T00:59:59Z"))
        .stdout(predicate::str::contains("2024-01-01T02:00:00Z 2024-01-01T02:59:59Z"));
}

#[test]
fn bad_period_exits_with_config_error() {
    let tmp = tempdir().expect("tempdir");
    cmd(tmp.path())
        .arg("epochs")
        .arg("--start")
        .arg("2024-01-01")
        .arg("--end")
        .arg("2024-01-02")
        .arg("--period")
        .arg("3 fortnights")
        .assert()
        .code(1)
        .stderr(predicate::str::contains("error:"))
        .stderr(predicate::str::contains("invalid period"));
}

#[test]
fn status_reports_paths_and_active_overrides() {
    let tmp = tempdir().expect("tempdir");
    cmd(tmp.path())
        .env("GNSS_INGEST_CONVERT_WORKERS", "3")
        .arg("status")
        .assert()
        .success()
        .stdout(predicate::str::contains(format!("home={}", tmp.path().display())))
        .stdout(predicate::str::contains("config.convert.workers=3"))
        .stdout(predicate::str::contains("GNSS_INGEST_CONVERT_WORKERS"));
}
