use assert_cmd::Command;
use predicates::prelude::*;

use crate::common::TestProject;

fn load_and_validate(project: &TestProject) -> bool {
    let (config, source) = workspaced::config::load_config(&project.config_path).unwrap();
    workspaced::config::validate::validate(&config, &source, "workspaced.toml").is_ok()
}

#[test]
fn validate_accepts_full_config() {
    let project = TestProject::new(
        r#"
        [server]
        port = 9000

        [proxy]
        base_domain = "ws.example.com"

        [provisioner]
        binary = "devpod"
        setup = [["devpod", "provider", "add", "aws"]]

        [provisioner.provider_options]
        AWS_REGION = "eu-west-1"

        [ports]
        base = 21000
        window = 500

        [queue]
        concurrency = 4
        unique_ttl = "2m"
    "#,
    );
    assert!(load_and_validate(&project));
}

#[test]
fn validate_rejects_bad_durations_and_window() {
    let project = TestProject::new(
        r#"
        [ports]
        window = 0

        [hub]
        ping_period = "90s"
        pong_wait = "60s"
    "#,
    );
    assert!(!load_and_validate(&project));
}

#[test]
fn unknown_section_fails_to_parse() {
    let project = TestProject::new("[billing]\nplan = \"pro\"\n");
    assert!(workspaced::config::load_config(&project.config_path).is_err());
}

#[test]
fn cli_validate_reports_success() {
    let project = TestProject::new("[queue]\nconcurrency = 2\n");
    Command::new(env!("CARGO_BIN_EXE_workspaced"))
        .args(["-f", project.config_path.to_str().unwrap(), "validate"])
        .assert()
        .success()
        .stdout(predicate::str::contains("workspaced.toml is valid"))
        .stdout(predicate::str::contains("2 workers"));
}

#[test]
fn cli_validate_fails_on_errors() {
    let project = TestProject::new("[queue]\nconcurrency = 0\n");
    Command::new(env!("CARGO_BIN_EXE_workspaced"))
        .args(["-f", project.config_path.to_str().unwrap(), "validate"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("configuration error"));
}

#[test]
fn cli_parse_log_classifies_lines() {
    let project = TestProject::new("");
    let log = project.dir.path().join("up.log");
    std::fs::write(
        &log,
        "10:00:01 info Create machine 'ws-9'\n10:00:02 fatal no capacity\n10:00:03 info skipped\n",
    )
    .unwrap();

    Command::new(env!("CARGO_BIN_EXE_workspaced"))
        .args(["parse-log", log.to_str().unwrap()])
        .assert()
        .success()
        .stdout(predicate::str::contains("machine=ws-9"))
        .stdout(predicate::str::contains("no capacity"))
        .stdout(predicate::str::contains("skipped").not());
}

#[test]
fn cli_lists_only_runnable_commands() {
    Command::new(env!("CARGO_BIN_EXE_workspaced"))
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("serve"))
        .stdout(predicate::str::contains("parse-log"))
        .stdout(predicate::str::contains("Run the fingerprint proxy only").not());

    Command::new(env!("CARGO_BIN_EXE_workspaced"))
        .arg("proxy")
        .assert()
        .failure()
        .stderr(predicate::str::contains("unrecognized subcommand"));
}
