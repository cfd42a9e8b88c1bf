//! End-to-end CLI exit-code tests driving the compiled `dbt` binary.
//!
//! SPDX-License-Identifier: GPL-3.0-or-later

use assert_cmd::Command;
use predicates::str::contains;

fn dbt_cmd(home: &std::path::Path) -> Command {
    let mut cmd = Command::cargo_bin("dbt").unwrap();
    cmd.env("HOME", home);
    cmd.env_remove("RUST_LOG");
    cmd.env_remove("DBT_SERVER");
    cmd
}

#[test]
fn no_tool_prints_help_and_exits_zero() {
    let dir = tempfile::tempdir().unwrap();
    dbt_cmd(dir.path()).assert().success();
}

#[test]
fn version_flag_prints_version_and_exits_zero() {
    let dir = tempfile::tempdir().unwrap();
    dbt_cmd(dir.path())
        .arg("--version")
        .assert()
        .success()
        .stdout(contains("dbt"));
}

#[test]
fn offline_with_no_config_and_a_tool_fails_with_config_error() {
    let dir = tempfile::tempdir().unwrap();
    dbt_cmd(dir.path())
        .args(["-o", "--", "foo"])
        .assert()
        .failure()
        .code(2);
}

#[test]
fn invalid_version_pin_is_rejected_before_any_network_activity() {
    let dir = tempfile::tempdir().unwrap();
    dbt_cmd(dir.path())
        .args(["-v", "not-a-version", "-o", "--", "foo"])
        .assert()
        .failure()
        .code(2);
}
