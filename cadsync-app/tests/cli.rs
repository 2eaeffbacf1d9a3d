use std::path::{Path, PathBuf};

use assert_cmd::Command;
use predicates::prelude::*;
use serde_json::Value;

fn fixture(name: &str) -> PathBuf {
    let mut path = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    path.push("../cadsync-io/tests/data");
    path.push(name);
    path
}

fn cadsync(workdir: &Path) -> Command {
    let mut cmd = Command::cargo_bin("cadsync").expect("找不到 cadsync 可执行文件");
    cmd.current_dir(workdir)
        .env_remove("CADSYNC_CONFIG")
        .env("RUST_LOG", "warn")
        .arg("--database")
        .arg(workdir.join("cadsync.db"));
    cmd
}

fn json_output(cmd: &mut Command) -> Value {
    let output = cmd.assert().success().get_output().stdout.clone();
    serde_json::from_slice(&output).expect("输出应当是 JSON")
}

#[test]
fn empty_database_lists_no_drawings() {
    let dir = tempfile::tempdir().expect("创建临时目录失败");
    let listed = json_output(cadsync(dir.path()).arg("drawings"));
    assert_eq!(listed, Value::Array(Vec::new()));
}

#[test]
fn import_then_export_round_trip() {
    let dir = tempfile::tempdir().expect("创建临时目录失败");
    let imported = json_output(
        cadsync(dir.path())
            .arg("import")
            .arg(fixture("site_plan.dxf"))
            .args(["--name", "site", "--crs", "EPSG:2230"]),
    );
    assert_eq!(imported["counts"]["primitives"], 8);
    assert_eq!(imported["errors"].as_array().map(Vec::len), Some(1));
    let drawing = imported["drawing_id"].as_u64().expect("缺少图纸标识");

    let exported = json_output(
        cadsync(dir.path())
            .arg("export")
            .arg(drawing.to_string())
            .args(["--target", "R2010", "--output-dir"])
            .arg(dir.path().join("out")),
    );
    let location = exported["location"].as_str().expect("缺少输出路径");
    assert!(Path::new(location).exists());
    let job = exported["job_id"].as_u64().expect("缺少任务标识");

    let status = json_output(cadsync(dir.path()).args(["job", &job.to_string()]));
    assert_eq!(status["status"], "completed");
    assert_eq!(status["version"], "R2010");

    let listed = json_output(cadsync(dir.path()).arg("drawings"));
    assert_eq!(listed[0]["drawing"]["name"], "site");
    assert_eq!(listed[0]["counts"]["text"], 2);

    let registry = json_output(cadsync(dir.path()).args(["registry", "layer"]));
    assert!(
        registry
            .as_array()
            .is_some_and(|rows| rows.iter().any(|row| row["name"] == "WALLS"))
    );
}

#[test]
fn delete_removes_the_drawing() {
    let dir = tempfile::tempdir().expect("创建临时目录失败");
    let imported = json_output(
        cadsync(dir.path())
            .arg("import")
            .arg(fixture("legacy_r12.dxf")),
    );
    let drawing = imported["drawing_id"].as_u64().expect("缺少图纸标识");

    cadsync(dir.path())
        .args(["delete", &drawing.to_string()])
        .assert()
        .success();
    cadsync(dir.path())
        .args(["delete", &drawing.to_string()])
        .assert()
        .failure()
        .stderr(predicate::str::contains("not found"));
}

#[test]
fn unknown_job_and_category_fail() {
    let dir = tempfile::tempdir().expect("创建临时目录失败");
    cadsync(dir.path())
        .args(["job", "42"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("export job 42 not found"));
    cadsync(dir.path())
        .args(["registry", "colors"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("colors"));
}

#[test]
fn malformed_input_fails_without_writing() {
    let dir = tempfile::tempdir().expect("创建临时目录失败");
    cadsync(dir.path())
        .arg("import")
        .arg(fixture("truncated.dxf"))
        .assert()
        .failure()
        .stderr(predicate::str::contains("failed to decode interchange file"));
    let listed = json_output(cadsync(dir.path()).arg("drawings"));
    assert_eq!(listed, Value::Array(Vec::new()));
}

#[test]
fn config_file_supplies_database_path() {
    let dir = tempfile::tempdir().expect("创建临时目录失败");
    let config = dir.path().join("cadsync.toml");
    std::fs::write(
        &config,
        format!(
            "[logging]\nlevel = \"warn\"\n\n[storage]\ndatabase = {:?}\n",
            dir.path().join("configured.db").display().to_string()
        ),
    )
    .expect("写入配置失败");

    Command::cargo_bin("cadsync")
        .expect("找不到 cadsync 可执行文件")
        .current_dir(dir.path())
        .env_remove("CADSYNC_CONFIG")
        .arg("--config")
        .arg(&config)
        .arg("drawings")
        .assert()
        .success()
        .stdout(predicate::str::contains("[]"));
    assert!(dir.path().join("configured.db").exists());
}

#[test]
fn non_positive_tolerance_is_rejected() {
    let dir = tempfile::tempdir().expect("创建临时目录失败");
    for value in ["--tolerance=0", "--tolerance=-0.5", "--tolerance=NaN"] {
        cadsync(dir.path())
            .arg("import")
            .arg(fixture("site_plan.dxf"))
            .arg(value)
            .assert()
            .failure()
            .stderr(predicate::str::contains("--tolerance"));
    }
    let listed = json_output(cadsync(dir.path()).arg("drawings"));
    assert_eq!(listed, Value::Array(Vec::new()));
}
