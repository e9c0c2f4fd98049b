//! Behavioural smoke tests for the CLI entrypoint.
//!
//! Store-touching subcommands are pointed at temporary directories through
//! the `TRANSIENT_STORE_*` environment layer so no test writes outside its
//! sandbox and none requires QEMU to be installed.

use std::os::unix::fs::PermissionsExt;

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

fn transient() -> Command {
    Command::cargo_bin("transient").unwrap_or_else(|err| panic!("locate binary: {err}"))
}

/// Writes a stand-in for `qemu-img` that just creates its final argument.
fn fake_qemu_img(tmp: &TempDir) -> std::path::PathBuf {
    let path = tmp.path().join("fake-qemu-img");
    std::fs::write(&path, "#!/bin/sh\nfor last; do :; done\n: > \"$last\"\n")
        .unwrap_or_else(|err| panic!("write fake qemu-img: {err}"));
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
        .unwrap_or_else(|err| panic!("chmod fake qemu-img: {err}"));
    path
}

fn store_env(cmd: &mut Command, tmp: &TempDir) {
    let root = tmp.path();
    cmd.env(
        "TRANSIENT_STORE_BACKEND_DIR",
        root.join("backend").as_os_str(),
    )
    .env(
        "TRANSIENT_STORE_FRONTEND_DIR",
        root.join("frontend").as_os_str(),
    );
}

#[test]
fn no_arguments_prints_usage_and_fails() {
    transient()
        .assert()
        .failure()
        .stderr(predicate::str::contains("Usage"));
}

#[test]
fn help_lists_all_subcommands() {
    transient()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("run"))
        .stdout(predicate::str::contains("list"))
        .stdout(predicate::str::contains("delete"));
}

#[test]
fn run_requires_an_image() {
    transient()
        .args(["run", "--name", "vm"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("--image"));
}

#[test]
fn list_on_an_empty_store_prints_nothing() {
    let tmp = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
    let mut cmd = transient();
    store_env(&mut cmd, &tmp);
    cmd.arg("list").assert().success().stdout("");
}

#[test]
fn delete_without_filters_is_an_error() {
    let tmp = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
    let mut cmd = transient();
    store_env(&mut cmd, &tmp);
    cmd.arg("delete")
        .assert()
        .failure()
        .stderr(predicate::str::contains("--name and/or --image"));
}

#[test]
fn prepare_only_run_creates_store_entries() {
    let tmp = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
    let backend_dir = tmp.path().join("backend");
    std::fs::create_dir_all(&backend_dir).unwrap_or_else(|err| panic!("mkdir: {err}"));
    std::fs::write(backend_dir.join("alpine.qcow2"), b"qcow2-bytes")
        .unwrap_or_else(|err| panic!("seed backend: {err}"));

    let mut prepare = transient();
    store_env(&mut prepare, &tmp);
    prepare
        .env("TRANSIENT_STORE_QEMU_IMG_BIN", fake_qemu_img(&tmp))
        .args([
            "run",
            "--name",
            "smoke",
            "--image",
            "alpine",
            "--prepare-only",
        ])
        .assert()
        .success();

    let mut list = transient();
    store_env(&mut list, &tmp);
    list.arg("list")
        .assert()
        .success()
        .stdout(predicate::str::contains("smoke"))
        .stdout(predicate::str::contains("alpine"));
}

#[test]
fn delete_by_vm_name_removes_listed_frontends() {
    let tmp = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
    let frontend_dir = tmp.path().join("frontend");
    std::fs::create_dir_all(&frontend_dir).unwrap_or_else(|err| panic!("mkdir: {err}"));
    std::fs::write(frontend_dir.join("smoke-0.qcow2"), b"overlay")
        .unwrap_or_else(|err| panic!("seed frontend: {err}"));
    std::fs::write(
        frontend_dir.join("smoke-0.json"),
        "{\"vm_name\":\"smoke\",\"image\":\"alpine\"}",
    )
    .unwrap_or_else(|err| panic!("seed manifest: {err}"));

    let mut delete = transient();
    store_env(&mut delete, &tmp);
    delete
        .args(["delete", "--name", "smoke"])
        .assert()
        .success()
        .stdout(predicate::str::contains("deleted"));

    let mut list = transient();
    store_env(&mut list, &tmp);
    list.arg("list").assert().success().stdout("");
}
