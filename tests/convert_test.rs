use std::fs;
use std::path::{Path, PathBuf};
use tempfile::tempdir;

fn write_fake_converter(bin_path: &Path, calls: &Path) {
    let script = format!(
        "#!/bin/sh\necho x >> {}\nstem=$(basename \"$1\" .raw)\nprintf 'RINEX %s\\n' \"$stem\" > \"$2/$stem.obs\"\n",
        calls.display()
    );
    fs::write(bin_path, script).expect("write fake converter");
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = fs::metadata(bin_path).expect("metadata").permissions();
        perms.set_mode(0o755);
        fs::set_permissions(bin_path, perms).expect("chmod");
    }
}

fn write_config(path: &Path, program: &Path) {
    let config = format!(
        r#"[convert]
discovery_window_secs = 1

[[converters]]
name = "fake"
program = "{}"
args = ["{{input}}", "{{outdir}}"]
extensions = ["raw"]
primary = '^{{stem}}\.obs$'
"#,
        program.display()
    );
    fs::write(path, config).expect("write config");
}

fn raw_inputs(dir: &Path) -> Vec<PathBuf> {
    fs::create_dir_all(dir).expect("mkdir raw");
    ["mlvl0010.raw", "mlvl0020.raw", "mlvl0030.raw"]
        .iter()
        .map(|name| {
            let path = dir.join(name);
            fs::write(&path, b"binary").expect("write raw");
            path
        })
        .collect()
}

fn convert_cmd(root: &Path) -> assert_cmd::Command {
    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("gnss-ingest");
    cmd.current_dir(root)
        .env("GNSS_INGEST_HOME", root.join("home"))
        .env("GNSS_INGEST_CONFIG_PATH", root.join("config.toml"))
        .arg("convert")
        .arg("--out")
        .arg(format!("{}/rinex/<SITE_ID4>", root.display()))
        .arg("--inp")
        .arg(root.join("raw"));
    cmd
}

fn calls(path: &Path) -> usize {
    fs::read_to_string(path)
        .map(|s| s.lines().count())
        .unwrap_or(0)
}

#[test]
fn convert_uses_registered_converter_and_skips_done_files() {
    let tmp = tempdir().expect("tempdir");
    let bin = tmp.path().join("fakeconv");
    let counter = tmp.path().join("calls");
    write_fake_converter(&bin, &counter);
    write_config(&tmp.path().join("config.toml"), &bin);
    raw_inputs(&tmp.path().join("raw"));

    convert_cmd(tmp.path())
        .arg("--workers")
        .arg("2")
        .assert()
        .success()
        .stdout(predicates::str::contains("workers=2"));
    assert_eq!(calls(&counter), 3);
    assert_eq!(
        fs::read_to_string(tmp.path().join("rinex/MLVL/mlvl0020.obs")).expect("obs"),
        "RINEX mlvl0020\n"
    );

    convert_cmd(tmp.path()).assert().success();
    assert_eq!(calls(&counter), 3);
}

#[test]
fn unknown_converter_is_a_config_error() {
    let tmp = tempdir().expect("tempdir");
    let bin = tmp.path().join("fakeconv");
    write_fake_converter(&bin, &tmp.path().join("calls"));
    write_config(&tmp.path().join("config.toml"), &bin);
    raw_inputs(&tmp.path().join("raw"));

    convert_cmd(tmp.path())
        .arg("--converter")
        .arg("nope")
        .assert()
        .code(1)
        .stderr(predicates::str::contains("no converter registered for `nope`"));
}

#[test]
fn json_report_carries_exit_code() {
    let tmp = tempdir().expect("tempdir");
    let bin = tmp.path().join("fakeconv");
    write_fake_converter(&bin, &tmp.path().join("calls"));
    write_config(&tmp.path().join("config.toml"), &bin);
    raw_inputs(&tmp.path().join("raw"));

    let output = convert_cmd(tmp.path())
        .arg("--json")
        .output()
        .expect("run convert");
    assert!(output.status.success());
    let report: serde_json::Value = serde_json::from_slice(&output.stdout).expect("json report");
    assert_eq!(report["command"], "convert");
    assert_eq!(report["exit_code"], 0);
    assert_eq!(report["ok"], true);
}
