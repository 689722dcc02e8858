//! CLI integration tests
//!
//! End-to-end tests for the annex-batch command-line interface, run
//! against the fake annex through a project `.annex-batch.toml`.
#![cfg(unix)]

mod common;

use assert_cmd::Command;
use predicates::prelude::*;
use serial_test::serial;
use tempfile::TempDir;

use common::{FakeAnnex, FOO_KEY, ORPHAN_KEY};

/// Get a Command for the annex-batch binary
fn annex_batch() -> Command {
    #[allow(deprecated)]
    Command::cargo_bin("annex-batch").expect("Failed to find annex-batch binary")
}

fn fake_project() -> FakeAnnex {
    let fake = FakeAnnex::new();
    fake.write_project_config();
    fake
}

fn json_lines(stdout: &[u8]) -> Vec<serde_json::Value> {
    String::from_utf8_lossy(stdout)
        .lines()
        .map(|l| serde_json::from_str(l).expect("stdout line is JSON"))
        .collect()
}

#[test]
fn test_help_output() {
    annex_batch()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("git-annex metadata"));
}

#[test]
fn test_version_flag() {
    annex_batch()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("annex-batch"));
}

#[test]
fn test_missing_repository() {
    annex_batch()
        .args(["-C", "/nonexistent/annex/repo", "keys"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("not in a git repository"));
}

#[test]
#[serial]
fn test_not_a_repo_from_tool() {
    let dir = TempDir::new().unwrap();
    let fake = FakeAnnex::with_script(
        "#!/bin/sh\necho 'git-annex: Not in a git repository.' >&2\nexit 1\n",
    );
    fake.write_project_config();
    annex_batch()
        .current_dir(dir.path())
        .args(["-C", fake.repo.to_str().unwrap(), "lookupkey", "foo"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("not in a git repository"));
}

#[test]
#[serial]
fn test_lookupkey() {
    let fake = fake_project();
    let output = annex_batch()
        .args(["-C", fake.repo.to_str().unwrap(), "lookupkey", "foo"])
        .output()
        .unwrap();
    assert!(output.status.success());
    let lines = json_lines(&output.stdout);
    assert_eq!(lines[0]["key"], FOO_KEY);
    assert_eq!(lines[0]["file"], "foo");
}

#[test]
#[serial]
fn test_repo_detected_from_subdirectory() {
    let fake = fake_project();
    let sub = fake.repo.join("sub/dir");
    std::fs::create_dir_all(&sub).unwrap();
    annex_batch()
        .current_dir(&sub)
        .args(["lookupkey", "foo"])
        .assert()
        .success()
        .stdout(predicate::str::contains(FOO_KEY));
}

#[test]
#[serial]
fn test_meta_set_and_delete() {
    let fake = fake_project();
    let output = annex_batch()
        .args([
            "-C",
            fake.repo.to_str().unwrap(),
            "meta",
            "--key",
            FOO_KEY,
            "--set",
            "numbers=0,2",
            "--delete",
            "author",
        ])
        .output()
        .unwrap();
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    let lines = json_lines(&output.stdout);
    assert_eq!(lines[0]["key"], FOO_KEY);
    assert_eq!(lines[0]["fields"], serde_json::json!({"numbers": ["0", "2"]}));
}

#[test]
#[serial]
fn test_meta_reserved_field() {
    let fake = fake_project();
    annex_batch()
        .args(["-C", fake.repo.to_str().unwrap(), "meta", "foo", "--set", "lastchanged=x"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("reserved"));
}

#[test]
#[serial]
fn test_keys_absent() {
    let fake = fake_project();
    let output = annex_batch()
        .args(["-C", fake.repo.to_str().unwrap(), "keys", "--absent"])
        .output()
        .unwrap();
    assert!(output.status.success());
    assert_eq!(json_lines(&output.stdout)[0]["keys"], serde_json::json!([ORPHAN_KEY]));
}

#[test]
#[serial]
fn test_version_command() {
    let fake = fake_project();
    let output = annex_batch()
        .args(["-C", fake.repo.to_str().unwrap(), "version"])
        .output()
        .unwrap();
    assert!(output.status.success());
    let v = &json_lines(&output.stdout)[0];
    assert_eq!(v["version"], "8.20210223");
    assert_eq!(v["supported"], true);
}

#[test]
#[serial]
fn test_old_annex_refused_but_version_reported() {
    let fake = FakeAnnex::with_script(&common::version_script("5.20150731"));
    fake.write_project_config();
    let output = annex_batch()
        .args(["-C", fake.repo.to_str().unwrap(), "version"])
        .output()
        .unwrap();
    assert!(output.status.success());
    let v = &json_lines(&output.stdout)[0];
    assert_eq!(v["version"], "5.20150731");
    assert_eq!(v["supported"], false);

    annex_batch()
        .args(["-C", fake.repo.to_str().unwrap(), "keys"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("older than the required 6.20170101"));
}

#[test]
#[serial]
fn test_find_and_fromkey() {
    let fake = fake_project();
    let output = annex_batch()
        .args(["-C", fake.repo.to_str().unwrap(), "find", "--match", "--in=here"])
        .output()
        .unwrap();
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    assert_eq!(json_lines(&output.stdout)[0]["found"][0]["key"], FOO_KEY);

    annex_batch()
        .args(["-C", fake.repo.to_str().unwrap(), "fromkey", ORPHAN_KEY, "orphan"])
        .assert()
        .success()
        .stdout(predicate::str::contains(ORPHAN_KEY));
}

#[test]
#[serial]
fn test_batch_session() {
    let fake = fake_project();
    let input = "\
# comment lines are skipped
lookupkey foo

lookupkey 'not annexed'
location SHA256E-s3--foo --absolute
fields
invalidate
frobnicate
meta --key SHA256E-s3--foo --set 'tag=a b'
quit
lookupkey foo
";
    let output = annex_batch()
        .args(["-C", fake.repo.to_str().unwrap(), "batch"])
        .write_stdin(input)
        .output()
        .unwrap();
    assert!(output.status.success());
    let lines = json_lines(&output.stdout);
    assert_eq!(lines.len(), 7, "{lines:?}");
    assert_eq!(lines[0]["key"], FOO_KEY);
    assert!(lines[1]["key"].is_null());
    assert!(lines[2]["location"]
        .as_str()
        .unwrap()
        .ends_with(&format!("{FOO_KEY}/{FOO_KEY}")));
    assert_eq!(lines[3]["fields"], serde_json::json!(["author", "numbers"]));
    assert_eq!(lines[4]["invalidated"], true);
    assert!(lines[5]["error"].is_string());
    assert_eq!(lines[6]["fields"], serde_json::json!({"tag": ["a b"]}));
}

#[test]
#[serial]
fn test_batch_parse_error_continues() {
    let fake = fake_project();
    let output = annex_batch()
        .args(["-C", fake.repo.to_str().unwrap(), "batch"])
        .write_stdin("lookupkey 'unterminated\nlookupkey foo\n")
        .output()
        .unwrap();
    let lines = json_lines(&output.stdout);
    assert_eq!(lines.len(), 2);
    assert!(lines[0]["error"].as_str().unwrap().contains("Parse error"));
    assert_eq!(lines[1]["key"], FOO_KEY);
}
