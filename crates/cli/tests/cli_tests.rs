//! CLI integration tests

use mockito::{Matcher, Server};
use std::process::{Command, Output};

fn ovc(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_ovc"))
        .args(args)
        .env("NO_COLOR", "1")
        .env_remove("OVERLAY_PROMETHEUS_URL")
        .output()
        .expect("Failed to execute ovc")
}

fn vector(results: &str) -> String {
    format!(
        r#"{{"status":"success","data":{{"resultType":"vector","result":[{}]}}}}"#,
        results
    )
}

/// Test that the CLI shows help
#[test]
fn test_cli_help() {
    let output = ovc(&["--help"]);
    let stdout = String::from_utf8_lossy(&output.stdout);

    assert!(output.status.success(), "CLI help should succeed");
    assert!(stdout.contains("Capacity Overlay"), "Should show app name");
    assert!(stdout.contains("lint"), "Should show lint command");
    assert!(stdout.contains("analyze"), "Should show analyze command");
    assert!(stdout.contains("overlays"), "Should show overlays command");
}

/// Test that the CLI shows version
#[test]
fn test_cli_version() {
    let output = ovc(&["--version"]);
    let stdout = String::from_utf8_lossy(&output.stdout);

    assert!(output.status.success(), "CLI version should succeed");
    assert!(stdout.contains("ovc"), "Should show binary name");
}

#[test]
fn test_lint_valid_annotations() {
    let output = ovc(&[
        "lint",
        "--nodepool",
        "general",
        "preference.1=karpenter.k8s.aws/instance-family=m7i,m7a adjust=-10%",
        "capacity-overlay.dev/preference.2=kubernetes.io/arch=arm64 adjust=+5%",
    ]);
    let stdout = String::from_utf8_lossy(&output.stdout);

    assert!(output.status.success(), "Valid annotations should pass lint");
    assert!(stdout.contains("general-preference-1"));
    assert!(stdout.contains("general-preference-2"));
    assert!(stdout.contains("-10%"));
}

#[test]
fn test_lint_json_output() {
    let output = ovc(&[
        "lint",
        "--format",
        "json",
        "preference.3=karpenter.k8s.aws/instance-cpu<16 adjust=0%",
    ]);
    assert!(output.status.success());

    let report: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(report["nodepool"], "default");
    assert_eq!(report["errors"].as_array().unwrap().len(), 0);

    let overlay = &report["preferences"][0]["overlay"];
    assert_eq!(overlay["name"], "default-preference-3");
    assert_eq!(overlay["weight"], 3);
    assert_eq!(overlay["price_adjustment"], "0%");
}

#[test]
fn test_lint_fails_on_parse_errors() {
    let output = ovc(&[
        "lint",
        "--format",
        "json",
        "preference.1=kubernetes.io/arch=arm64 adjust=-20%",
        "preference.2=karpenter.k8s.aws/instance-cpu>=4 adjust=-5%",
    ]);

    assert!(!output.status.success(), "Parse errors should fail lint");
    let report: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(report["preferences"].as_array().unwrap().len(), 1);
    assert_eq!(report["errors"].as_array().unwrap().len(), 1);
}

#[test]
fn test_lint_requires_annotations() {
    let output = ovc(&["lint"]);
    assert!(!output.status.success());
}

#[test]
fn test_analyze_requires_prometheus_url() {
    let output = ovc(&["analyze"]);
    let stderr = String::from_utf8_lossy(&output.stderr);

    assert!(!output.status.success());
    assert!(stderr.contains("--prometheus-url"));
}

#[test]
fn test_analyze_reports_decisions() {
    let mut server = Server::new();
    let _freshness = server
        .mock("GET", "/api/v1/query")
        .match_query(Matcher::Regex("data_freshness_seconds".into()))
        .with_body(vector(r#"{"metric":{},"value":[1700000000,"60"]}"#))
        .create();
    let _savings_plans = server
        .mock("GET", "/api/v1/query")
        .match_query(Matcher::Regex("savings_plan_".into()))
        .with_body(vector(""))
        .create();
    let _reserved = server
        .mock("GET", "/api/v1/query")
        .match_query(Matcher::Regex("ec2_reserved_instance_count".into()))
        .with_body(vector(
            r#"{"metric":{"instance_type":"m5.xlarge","region":"us-east-1"},"value":[1700000000,"2"]}"#,
        ))
        .create();

    let output = ovc(&[
        "analyze",
        "--prometheus-url",
        &server.url(),
        "--format",
        "json",
    ]);
    assert!(
        output.status.success(),
        "analyze failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );

    let report: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(report["skipped"].as_array().unwrap().len(), 0);
    assert_eq!(report["analyzed"].as_array().unwrap().len(), 3);

    let decisions = report["decisions"].as_array().unwrap();
    assert_eq!(decisions.len(), 1);
    assert_eq!(decisions[0]["should_exist"], true);
    assert!(decisions[0]["name"]
        .as_str()
        .unwrap()
        .starts_with("reserved-instance-m5"));
}

#[test]
fn test_analyze_skips_stale_data() {
    let mut server = Server::new();
    let _freshness = server
        .mock("GET", "/api/v1/query")
        .match_query(Matcher::Regex("data_freshness_seconds".into()))
        .with_body(vector(r#"{"metric":{},"value":[1700000000,"90000"]}"#))
        .create();

    let output = ovc(&[
        "analyze",
        "--prometheus-url",
        &server.url(),
        "--format",
        "json",
    ]);
    assert!(output.status.success());

    let report: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(report["decisions"].as_array().unwrap().len(), 0);

    let skipped = report["skipped"].as_array().unwrap();
    assert_eq!(skipped.len(), 2);
    assert!(skipped[0]["reason"].as_str().unwrap().contains("exceeds maximum"));
}

#[test]
fn test_overlays_rejects_nodepool_with_decision_origin() {
    let output = ovc(&["overlays", "--origin", "decision", "--nodepool", "general"]);
    let stderr = String::from_utf8_lossy(&output.stderr);

    assert!(!output.status.success());
    assert!(stderr.contains("--nodepool only applies to preference overlays"));
}

#[test]
fn test_overlays_help() {
    let output = ovc(&["overlays", "--help"]);
    let stdout = String::from_utf8_lossy(&output.stdout);

    assert!(output.status.success());
    assert!(stdout.contains("--origin"));
    assert!(stdout.contains("--nodepool"));
}
