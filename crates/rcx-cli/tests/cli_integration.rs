// SPDX-License-Identifier: MIT OR Apache-2.0
//! End-to-end CLI integration tests against the built `rcx` binary.

use assert_cmd::Command;
use predicates::prelude::*;
use std::io::Write;

fn rcx() -> Command {
    Command::cargo_bin("rcx").expect("binary `rcx` should be built")
}

fn payload_file(dir: &std::path::Path, name: &str, json: &serde_json::Value) -> std::path::PathBuf {
    let path = dir.join(name);
    let mut file = std::fs::File::create(&path).unwrap();
    write!(file, "{json}").unwrap();
    path
}

#[test]
fn help_exits_zero_and_contains_expected_text() {
    rcx()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("Rule engine job orchestration command line"))
        .stdout(predicate::str::contains("Usage"));
}

#[test]
fn version_shows_version_string() {
    rcx()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains(env!("CARGO_PKG_VERSION")));
}

#[test]
fn unknown_command_exits_with_runtime_error() {
    let dir = tempfile::tempdir().unwrap();
    rcx()
        .args(["nope", "nope"])
        .arg("--data-dir")
        .arg(dir.path())
        .write_stdin("")
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("unknown command"));
}

#[test]
fn malformed_command_path_exits_with_usage_error() {
    let dir = tempfile::tempdir().unwrap();
    rcx()
        .arg("job")
        .arg("--data-dir")
        .arg(dir.path())
        .write_stdin("")
        .assert()
        .failure()
        .code(2);
}

#[test]
fn whoami_reports_the_development_identity() {
    let dir = tempfile::tempdir().unwrap();
    rcx()
        .args(["meta", "whoami"])
        .arg("--data-dir")
        .arg(dir.path())
        .write_stdin("")
        .assert()
        .success()
        .stdout(predicate::str::contains("license_key"));
}

#[test]
fn health_check_reports_ok_on_a_fresh_data_dir() {
    let dir = tempfile::tempdir().unwrap();
    rcx()
        .args(["meta", "health_check"])
        .arg("--data-dir")
        .arg(dir.path())
        .write_stdin("")
        .assert()
        .success()
        .stdout(predicate::str::contains("\"ok\""));
}

#[test]
fn meta_commands_lists_the_registered_verbs_without_opening_a_store() {
    rcx()
        .args(["meta", "commands"])
        .write_stdin("")
        .assert()
        .success()
        .stdout(predicate::str::contains("ruleset compile"));
}

#[test]
fn tenant_create_then_show_round_trips_across_invocations() {
    let dir = tempfile::tempdir().unwrap();
    let create_payload = payload_file(
        dir.path(),
        "create.json",
        &serde_json::json!({
            "customer_id": "acme",
            "tenant_name": "prod",
            "cloud": "aws",
            "native_account_id": "111122223333",
            "activated_regions": ["us-east-1"],
            "display_name": "Acme Prod"
        }),
    );
    rcx()
        .args(["tenant", "create"])
        .arg("--data-dir")
        .arg(dir.path())
        .arg("--payload")
        .arg(&create_payload)
        .assert()
        .success();

    let show_payload = payload_file(
        dir.path(),
        "show.json",
        &serde_json::json!({ "customer_id": "acme", "tenant_name": "prod" }),
    );
    rcx()
        .args(["tenant", "show"])
        .arg("--data-dir")
        .arg(dir.path())
        .arg("--payload")
        .arg(&show_payload)
        .assert()
        .success()
        .stdout(predicate::str::contains("Acme Prod"));
}

#[test]
fn job_submit_without_a_tenant_surfaces_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let payload = payload_file(
        dir.path(),
        "submit.json",
        &serde_json::json!({
            "customer_id": "ghost",
            "tenant_name": "none",
            "cloud": "aws",
            "regions": ["us-east-1"],
            "selector": {"form": "explicit", "value": ["rule-1"]},
            "submitter": "operator"
        }),
    );
    rcx()
        .args(["job", "submit"])
        .arg("--data-dir")
        .arg(dir.path())
        .arg("--payload")
        .arg(&payload)
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("not found"));
}
