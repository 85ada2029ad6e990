use assert_cmd::Command;
use predicates::prelude::*;
use serde_json::{Value, json};
use std::path::{Path, PathBuf};
use tempfile::TempDir;

fn fixture(name: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("tests/fixtures")
        .join(name)
}

fn agentcost() -> Command {
    let mut cmd = Command::new(assert_cmd::cargo::cargo_bin!("agentcost"));
    cmd.env_remove("AGENTCOST_SESSIONS_DIR")
        .env_remove("AGENTCOST_SNAPSHOT_DIR")
        .env_remove("RUST_LOG");
    cmd
}

fn run_json(args: &[&str]) -> Value {
    let output = agentcost()
        .args(args)
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    serde_json::from_slice(&output).expect("valid json output")
}

fn sessions() -> String {
    fixture("sessions").display().to_string()
}

fn snapshots() -> String {
    fixture("snapshots").display().to_string()
}

#[test]
fn single_day_sums_that_day_only() {
    let dir = sessions();
    let v = run_json(&["cost", "--sessions-dir", dir.as_str(), "--date", "2026-01-29", "--json"]);
    let rows = v["rows"].as_array().unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["key"], "2026-01-29");
    assert_eq!(rows[0]["records"], json!(2));
    assert_eq!(v["total"]["costUsd"], json!(0.15));
    assert_eq!(v["provenance"], "measured");
    assert_eq!(v["groupBy"], "date");
}

#[test]
fn unfiltered_report_lists_every_date() {
    let dir = sessions();
    let v = run_json(&["cost", "--sessions-dir", dir.as_str(), "--json"]);
    let rows = v["rows"].as_array().unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0]["key"], "2026-01-29");
    assert_eq!(rows[0]["costUsd"], json!(0.15));
    assert_eq!(rows[1]["key"], "2026-01-30");
    assert_eq!(rows[1]["costUsd"], json!(0.2));
    assert_eq!(v["total"]["costUsd"], json!(0.35));
    assert_eq!(v["total"]["records"], json!(3));
    assert_eq!(v["scan"]["files"], json!(2));
    assert_eq!(v["scan"]["malformed"], json!(2));
}

#[test]
fn cost_is_the_default_command() {
    agentcost()
        .args(["--json"])
        .env("AGENTCOST_SESSIONS_DIR", sessions())
        .assert()
        .success()
        .stdout(predicate::str::contains("\"costUsd\": 0.35"));
}

#[test]
fn text_table_shows_rows_total_and_skips() {
    let dir = sessions();
    agentcost()
        .args(["cost", "--sessions-dir", dir.as_str()])
        .assert()
        .success()
        .stdout(predicate::str::contains("[measured]"))
        .stdout(predicate::str::contains("2026-01-29"))
        .stdout(predicate::str::contains("$0.15"))
        .stdout(predicate::str::contains("$0.35"))
        .stdout(predicate::str::contains("Skipped 2 unparseable usage line(s)."));
}

#[test]
fn by_model_covers_all_dates_most_expensive_first() {
    let dir = sessions();
    let v = run_json(&["cost", "--sessions-dir", dir.as_str(), "--by-model", "--json"]);
    let keys: Vec<&str> = v["rows"]
        .as_array()
        .unwrap()
        .iter()
        .map(|r| r["key"].as_str().unwrap())
        .collect();
    assert_eq!(keys, ["unknown", "claude-opus-4", "claude-sonnet-4"]);
    assert_eq!(v["groupBy"], "model");
    assert_eq!(v["total"]["costUsd"], json!(0.35));
}

#[test]
fn month_without_usage_is_an_empty_report() {
    let dir = sessions();
    let v = run_json(&["cost", "--sessions-dir", dir.as_str(), "--month-of", "2026-02", "--json"]);
    assert_eq!(v["rows"].as_array().unwrap().len(), 0);
    assert_eq!(v["total"]["costUsd"], json!(0.0));
}

#[test]
fn empty_sessions_dir_reports_zero() {
    let tmp = TempDir::new().unwrap();
    agentcost()
        .args(["cost", "--sessions-dir"])
        .arg(tmp.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("Total: $0.00"));
}

#[test]
fn missing_sessions_dir_fails_with_data_error() {
    let tmp = TempDir::new().unwrap();
    agentcost()
        .args(["cost", "--sessions-dir"])
        .arg(tmp.path().join("nope"))
        .assert()
        .code(1)
        .stdout(predicate::str::is_empty())
        .stderr(predicate::str::contains("sessions directory not found"));
}

#[test]
fn usage_errors_exit_2() {
    agentcost().args(["cost", "--bogus"]).assert().code(2);
    agentcost()
        .args(["cost", "--by-model", "--date", "2026-01-29"])
        .assert()
        .code(2);
    agentcost()
        .args(["cost", "--week", "--month"])
        .assert()
        .code(2);
    agentcost()
        .args(["cost", "--sessions-dir", sessions().as_str(), "--date", "29/01/2026"])
        .assert()
        .code(2);
}

#[test]
fn snapshot_from_stdin_is_written_and_reported() {
    let tmp = TempDir::new().unwrap();
    let listing = r#"{"sessions": [
        {"key": "agent:main:main", "model": "claude-sonnet-4", "totalTokens": 5000, "channel": "telegram"},
        {"key": "agent:main:cron", "totalTokens": 1000}
    ]}"#;
    agentcost()
        .args(["snapshot", "--date", "2026-01-30", "--snapshot-dir"])
        .arg(tmp.path())
        .write_stdin(listing)
        .assert()
        .success()
        .stdout(predicate::str::contains("Wrote"));

    let written = std::fs::read_to_string(tmp.path().join("2026-01-30.json")).unwrap();
    let v: Value = serde_json::from_str(&written).unwrap();
    assert_eq!(v["date"], "2026-01-30");
    assert_eq!(v["summary"]["totalTokens"], json!(6000));
    assert_eq!(v["summary"]["byModel"]["claude-sonnet-4"], json!(5000));
    assert_eq!(v["summary"]["byModel"]["unknown"], json!(1000));
    assert_eq!(v["sessions"]["agent:main:main"]["channel"], "telegram");
    assert!(v["estimatedCost"]["total"].as_f64().unwrap() > 0.0);
}

#[test]
fn snapshot_from_input_file_prints_json() {
    let tmp = TempDir::new().unwrap();
    let input = tmp.path().join("listing.json");
    std::fs::write(&input, r#"[{"key": "s1", "model": "claude-sonnet-4", "totalTokens": 3000}]"#)
        .unwrap();
    let snaps = tmp.path().join("snaps");
    let output = agentcost()
        .args(["snapshot", "--date", "2026-01-29", "--json", "--input"])
        .arg(&input)
        .arg("--snapshot-dir")
        .arg(&snaps)
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let v: Value = serde_json::from_slice(&output).unwrap();
    assert_eq!(v["estimatedCost"]["total"], json!(0.0342));
    assert!(snaps.join("2026-01-29.json").exists());
}

#[test]
fn empty_payload_is_a_usage_error_and_writes_nothing() {
    let tmp = TempDir::new().unwrap();
    agentcost()
        .args(["snapshot", "--date", "2026-01-30", "--snapshot-dir"])
        .arg(tmp.path())
        .write_stdin("")
        .assert()
        .code(2);
    assert!(!tmp.path().join("2026-01-30.json").exists());
}

#[test]
fn malformed_payload_fails_and_writes_nothing() {
    let tmp = TempDir::new().unwrap();
    agentcost()
        .args(["snapshot", "--date", "2026-01-30", "--snapshot-dir"])
        .arg(tmp.path())
        .write_stdin("{\"sessions\": [")
        .assert()
        .code(1)
        .stderr(predicate::str::contains("session listing"));
    assert!(!tmp.path().join("2026-01-30.json").exists());
}

#[test]
fn out_of_range_token_counts_fail_and_write_nothing() {
    let tmp = TempDir::new().unwrap();
    agentcost()
        .args(["snapshot", "--date", "2026-01-30", "--snapshot-dir"])
        .arg(tmp.path())
        .write_stdin(
            r#"[{"key": "a", "model": "m", "totalTokens": 18446744073709551615},
                {"key": "b", "model": "m", "totalTokens": 1}]"#,
        )
        .assert()
        .code(1)
        .stderr(predicate::str::contains("out of range"));
    assert!(!tmp.path().join("2026-01-30.json").exists());
    assert!(!tmp.path().join("2026-01-30.json.tmp").exists());
}

#[test]
fn estimate_prices_only_positive_deltas() {
    let dir = snapshots();
    let v = run_json(&["estimate", "--snapshot-dir", dir.as_str(), "--date", "2026-01-30", "--json"]);
    assert_eq!(v["mode"], "delta");
    assert_eq!(v["cumulative"], json!(false));
    assert_eq!(v["provenance"], "estimated");
    assert_eq!(v["comparisonDate"], "2026-01-29");
    assert_eq!(v["tokens"]["delta"], json!(0));
    assert_eq!(v["models"]["claude-sonnet-4"]["delta"], json!(3000));
    assert_eq!(v["models"]["modelX"]["delta"], json!(-3000));
    assert_eq!(v["models"]["modelX"]["estimatedUsd"], json!(0.0));
    assert_eq!(v["cost"]["estimatedUsd"], json!(0.03));
}

#[test]
fn estimate_text_is_labelled_estimated() {
    let dir = snapshots();
    agentcost()
        .args(["estimate", "--snapshot-dir", dir.as_str(), "--date", "2026-01-30"])
        .assert()
        .success()
        .stdout(predicate::str::contains("[estimated]"))
        .stdout(predicate::str::contains("$0.03"));
}

#[test]
fn estimate_without_previous_day_is_cumulative() {
    let dir = snapshots();
    let v = run_json(&["estimate", "--snapshot-dir", dir.as_str(), "--date", "2026-01-29", "--json"]);
    assert_eq!(v["mode"], "cumulative");
    assert_eq!(v["cumulative"], json!(true));
    assert_eq!(v["comparisonDate"], Value::Null);
    assert_eq!(v["tokens"]["today"], json!(6000));
    assert!(v["summary"].as_str().unwrap().contains("cumulative"));
}

#[test]
fn estimate_without_snapshot_points_at_snapshot_command() {
    let dir = snapshots();
    agentcost()
        .args(["estimate", "--snapshot-dir", dir.as_str(), "--date", "2026-02-15"])
        .assert()
        .code(1)
        .stdout(predicate::str::is_empty())
        .stderr(predicate::str::contains("no snapshot for 2026-02-15"))
        .stderr(predicate::str::contains("agentcost snapshot"));
}
