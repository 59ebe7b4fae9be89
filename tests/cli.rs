use assert_cmd::prelude::*;
use predicates::prelude::*;
use std::process::Command;

fn podman_debug() -> Command {
    let mut cmd = Command::cargo_bin("podman-debug").unwrap();
    // keep the rootless re-exec from swallowing the test invocation
    cmd.env("_PODMAN_DEBUG_UNSHARED", "1");
    cmd
}

#[test]
fn no_args_is_a_usage_error() {
    podman_debug()
        .assert()
        .code(1)
        .stderr(predicate::str::contains("Usage"));
}

#[test]
fn help_exits_zero() {
    podman_debug()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("--writable"))
        .stdout(predicate::str::contains("--pull"));
}

#[test]
fn version_exits_zero() {
    podman_debug().arg("--version").assert().success();
}

#[test]
fn unknown_flag_is_a_usage_error() {
    podman_debug()
        .arg("--bogus")
        .arg("web")
        .assert()
        .code(1)
        .stderr(predicate::str::contains("--bogus"));
}
