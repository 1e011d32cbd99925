//! End-to-end runs against the bundled loopback-peer shim.

use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use assert_cmd::Command;
use shimrunner::{Harness, HarnessError, HarnessOptions, Implementation, ShimConfig, TestCase};

fn peer(role: &str) -> Implementation {
    Implementation {
        path: PathBuf::from(env!("CARGO_BIN_EXE_loopback-peer")),
        args: vec![role.to_string()],
    }
}

fn shims() -> ShimConfig {
    ShimConfig {
        client: peer("client"),
        server: peer("server"),
    }
}

fn case(name: &str, client_args: &[&str], server_args: &[&str]) -> TestCase {
    TestCase {
        name: name.to_string(),
        client_args: client_args.iter().map(|s| s.to_string()).collect(),
        server_args: server_args.iter().map(|s| s.to_string()).collect(),
    }
}

fn options() -> HarnessOptions {
    HarnessOptions {
        case_timeout: Some(Duration::from_secs(20)),
        ..HarnessOptions::default()
    }
}

#[tokio::test]
async fn test_ping_pong_succeeds() {
    let harness = Harness::new(shims(), options());
    let status = harness
        .run_all(&[case("ping-pong", &[], &[])], |_| {})
        .await
        .expect("run should complete");

    assert_eq!((status.ran, status.succeeded, status.failed), (1, 1, 0));
    assert!(status.failures.is_empty());
}

#[tokio::test]
async fn test_payload_mismatch_fails_client() {
    let harness = Harness::new(shims(), options());
    let result = harness
        .run_case(&case("wrong-reply", &[], &["--reply", "NOPE"]))
        .await
        .expect("case should run");

    assert!(!result.passed());
    let report = result.failure().expect("failure report");
    assert_eq!(report.test_case, "wrong-reply");
    assert!(report.client_error.is_some());
}

#[tokio::test]
async fn test_server_crash_before_traffic() {
    let harness = Harness::new(shims(), options());
    let result = harness
        .run_case(&case("server-crash", &["--wait-ms", "10000"], &["--exit-code", "3"]))
        .await
        .expect("case should run");

    assert!(!result.passed());
    assert!(!result.outcome.timed_out);
    let report = result.failure().expect("failure report");
    assert!(report.server_error.is_some());
    assert!(report.client_error.is_none());
}

#[tokio::test]
async fn test_failure_then_success_totals() {
    let harness = Harness::new(shims(), options());
    let cases = [
        case("crashes", &[], &["--exit-code", "1"]),
        case("works", &[], &[]),
    ];
    let status = harness.run_all(&cases, |_| {}).await.expect("run should complete");

    assert_eq!((status.ran, status.succeeded, status.failed), (2, 1, 1));
    assert_eq!(status.failures.len(), 1);
    assert_eq!(status.failures[0].test_case, "crashes");
}

#[tokio::test]
async fn test_bad_port_announcement_aborts() {
    let harness = Harness::new(shims(), options());
    let cases = [
        case("garbled", &[], &["--announce", "listening"]),
        case("never-run", &[], &[]),
    ];
    let mut ran = Vec::new();
    let err = harness
        .run_all(&cases, |r| ran.push(r.name.clone()))
        .await
        .unwrap_err();

    assert!(matches!(err, HarnessError::InvalidPort { .. }));
    assert!(ran.is_empty());
}

#[test]
fn test_cli_reports_and_sets_exit_code() {
    let client = env!("CARGO_BIN_EXE_loopback-peer");
    let mut shim_file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
    write!(
        shim_file,
        r#"{{"Client": {{"Path": {client:?}, "Args": ["client"]}},
            "Server": {{"Path": {client:?}, "Args": ["server"]}}}}"#
    )
    .unwrap();

    let mut cases_file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
    write!(
        cases_file,
        r#"
        [[cases]]
        name = "crashes"
        server_args = ["--exit-code", "4"]

        [[cases]]
        name = "works"
        "#
    )
    .unwrap();

    Command::cargo_bin("shimrunner")
        .unwrap()
        .arg("run")
        .arg("--shims")
        .arg(shim_file.path())
        .arg("--cases")
        .arg(cases_file.path())
        .assert()
        .code(1)
        .stdout(predicates::str::contains("FAILED: crashes"))
        .stdout(predicates::str::contains("Ran=2 Success=1 Failure=1"));
}

#[test]
fn test_cli_json_lines_per_case() {
    let peer = env!("CARGO_BIN_EXE_loopback-peer");
    let mut shim_file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
    write!(
        shim_file,
        r#"{{"Client": {{"Path": {peer:?}, "Args": ["client"]}},
            "Server": {{"Path": {peer:?}, "Args": ["server"]}}}}"#
    )
    .unwrap();
    let mut cases_file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
    write!(cases_file, r#"{{"Cases": [{{"Name": "works"}}]}}"#).unwrap();

    let output = Command::cargo_bin("shimrunner")
        .unwrap()
        .arg("run")
        .arg("--json")
        .arg("--shims")
        .arg(shim_file.path())
        .arg("--cases")
        .arg(cases_file.path())
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(0));

    let stdout = String::from_utf8(output.stdout).unwrap();
    let lines: Vec<serde_json::Value> = stdout
        .lines()
        .map(|l| serde_json::from_str(l).expect("each line is JSON"))
        .collect();
    assert_eq!(lines.len(), 2);
    assert_eq!(lines[0]["name"], "works");
    assert!(lines[0]["run_id"].is_string());
    assert_eq!(lines[0]["outcome"]["client"]["status"], "success");
    assert_eq!(lines[0]["outcome"]["server"]["status"], "success");
    assert_eq!(lines[1]["ran"], 1);
    assert_eq!(lines[1]["succeeded"], 1);
}
