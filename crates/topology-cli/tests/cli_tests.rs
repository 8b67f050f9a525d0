//! Integration tests for the topology command-line interface
//!
//! Only commands that never reach Docker are exercised here.

use assert_cmd::Command;
use predicates::prelude::*;
use std::io::Write;

/// Helper function to create a command instance for the topology binary
fn cli_command() -> Command {
    let mut cmd = Command::cargo_bin("topology").expect("Failed to find topology binary");
    cmd.env_remove("TOPOLOGY_DOCKER_CONFIG");
    cmd
}

fn topology_file(contents: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file
}

const SWITCH_AND_HOST: &str = r#"{
    "nodes": [
        { "id": "s1", "ports": ["1", "2", "3"] },
        { "id": "h1", "type": "host", "image": "alpine", "ports": ["eth0"] }
    ],
    "links": [
        { "a": { "node": "s1", "port": "1" }, "b": { "node": "h1", "port": "eth0" } }
    ]
}"#;

#[test]
fn test_cli_help() {
    let mut cmd = cli_command();
    cmd.arg("--help");

    cmd.assert()
        .success()
        .stdout(predicate::str::contains(
            "CLI tool for building container network topologies",
        ))
        .stdout(predicate::str::contains("up"))
        .stdout(predicate::str::contains("validate"))
        .stdout(predicate::str::contains("exec"));
}

#[test]
fn test_cli_version() {
    let mut cmd = cli_command();
    cmd.arg("--version");

    cmd.assert()
        .success()
        .stdout(predicate::str::contains("topology"));
}

#[test]
fn test_cli_invalid_command() {
    let mut cmd = cli_command();
    cmd.arg("invalid-command");

    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("unrecognized subcommand"));
}

#[test]
fn test_validate_lists_nodes_and_links() {
    let file = topology_file(SWITCH_AND_HOST);
    let mut cmd = cli_command();
    cmd.arg("validate").arg(file.path());

    cmd.assert()
        .success()
        .stdout(predicate::str::contains("Topology is valid: 2 node(s), 1 link(s)"))
        .stdout(predicate::str::contains("s1 (switch, ubuntu): 1, 2, 3"))
        .stdout(predicate::str::contains("h1 (host, alpine): eth0"))
        .stdout(predicate::str::contains("s1.1 <-> h1.eth0"));
}

#[test]
fn test_validate_uses_config_default_image() {
    let file = topology_file(SWITCH_AND_HOST);
    let config = topology_file(r#"{"default_image": "frr-lab"}"#);
    let mut cmd = cli_command();
    cmd.arg("validate")
        .arg(file.path())
        .arg("--config")
        .arg(config.path());

    cmd.assert()
        .success()
        .stdout(predicate::str::contains("s1 (switch, frr-lab)"));
}

#[test]
fn test_validate_json_output() {
    let file = topology_file(SWITCH_AND_HOST);
    let mut cmd = cli_command();
    cmd.arg("validate").arg("--json").arg(file.path());

    cmd.assert()
        .success()
        .stdout(predicate::str::contains("\"id\": \"s1\""))
        .stdout(predicate::str::contains("\"type\": \"host\""));
}

#[test]
fn test_validate_rejects_unknown_kind() {
    let file = topology_file(r#"{"nodes": [{"id": "r1", "type": "router"}]}"#);
    let mut cmd = cli_command();
    cmd.arg("validate").arg(file.path());

    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("unsupported node kind 'router'"));
}

#[test]
fn test_validate_rejects_reused_port() {
    let file = topology_file(
        r#"{
            "nodes": [
                { "id": "a", "ports": ["p1"] },
                { "id": "b", "ports": ["p1", "p2"] }
            ],
            "links": [
                { "a": { "node": "a", "port": "p1" }, "b": { "node": "b", "port": "p1" } },
                { "a": { "node": "a", "port": "p1" }, "b": { "node": "b", "port": "p2" } }
            ]
        }"#,
    );
    let mut cmd = cli_command();
    cmd.arg("validate").arg(file.path());

    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("more than one link"));
}

#[test]
fn test_missing_topology_file() {
    let mut cmd = cli_command();
    cmd.arg("validate").arg("/nonexistent/topology.json");

    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("cannot read"));
}

#[test]
fn test_up_rejects_bad_config_before_building() {
    let file = topology_file(SWITCH_AND_HOST);
    let config = topology_file(r#"{"session_timeout_ms": 0}"#);
    let mut cmd = cli_command();
    cmd.arg("up")
        .arg(file.path())
        .arg("--hold")
        .arg("0")
        .env("TOPOLOGY_DOCKER_CONFIG", config.path());

    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("timeouts must be greater than zero"));
}

#[test]
fn test_exec_rejects_unknown_shell() {
    let file = topology_file(SWITCH_AND_HOST);
    let mut cmd = cli_command();
    cmd.arg("exec")
        .arg(file.path())
        .arg("s1")
        .arg("show version")
        .arg("--shell")
        .arg("zsh");

    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("unknown shell kind"));
}
