use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use std::io::Write;

fn hutch(dir: &tempfile::TempDir) -> assert_cmd::Command {
    let mut cmd: assert_cmd::Command = cargo_bin_cmd!("hutch").into();
    cmd.env("HUTCH_DATA_DIR", dir.path().join("data"));
    cmd.env("HUTCH_CACHE_DIR", dir.path().join("cache"));
    cmd
}

fn write_workload(dir: &tempfile::TempDir, name: &str, body: &str) {
    let workloads = dir.path().join("data").join("workloads");
    std::fs::create_dir_all(&workloads).unwrap();
    let mut f = std::fs::File::create(workloads.join(format!("{name}.toml"))).unwrap();
    write!(f, "{body}").unwrap();
}

#[test]
fn help_works() {
    let dir = tempfile::tempdir().unwrap();
    hutch(&dir)
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("Ephemeral development VMs"));
}

#[test]
fn create_rejects_unknown_workload() {
    let dir = tempfile::tempdir().unwrap();
    // The error renderer wraps long paths across lines, so assert on the
    // leading message fragment rather than the workload filename.
    hutch(&dir)
        .args(["create", "dev1", "--workload", "no-such-workload"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("reading workload definition"));
}

#[test]
fn create_rejects_oversized_memory_and_leaves_no_state() {
    let dir = tempfile::tempdir().unwrap();
    write_workload(
        &dir,
        "big",
        r#"
base_image_url = "/nonexistent/base.img"

[vm]
mem_mib = 900000
cpus = 2
"#,
    );

    hutch(&dir)
        .args(["create", "dev1", "--workload", "big"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("MiB"));

    assert!(!dir.path().join("data/instances/dev1").exists());
}

#[test]
fn create_rejects_bad_mount_flag() {
    let dir = tempfile::tempdir().unwrap();
    hutch(&dir)
        .args(["create", "dev1", "--mount", "no-separator"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("tag:path"));
}

#[test]
fn status_fails_for_unknown_instance() {
    let dir = tempfile::tempdir().unwrap();
    hutch(&dir)
        .args(["status", "ghost"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("ghost"));
}

#[test]
fn start_fails_for_unknown_instance() {
    let dir = tempfile::tempdir().unwrap();
    hutch(&dir)
        .args(["start", "ghost"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("ghost"));
}

#[test]
fn delete_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    hutch(&dir)
        .args(["delete", "never-existed"])
        .assert()
        .success()
        .stdout(predicate::str::contains("deleted"));

    std::fs::create_dir_all(dir.path().join("data/instances/dev1")).unwrap();
    hutch(&dir).args(["delete", "dev1"]).assert().success();
    assert!(!dir.path().join("data/instances/dev1").exists());

    hutch(&dir).args(["delete", "dev1"]).assert().success();
}
