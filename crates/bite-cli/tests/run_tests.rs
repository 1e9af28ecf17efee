//! Integration tests for `bite <path>`

use assert_cmd::Command;
use predicates::str::contains;
use std::fs;
use tempfile::TempDir;

fn write_source(source: &str) -> (TempDir, std::path::PathBuf) {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("test.bite");
    fs::write(&path, source).unwrap();
    (dir, path)
}

#[test]
fn prints_the_final_expression_value_and_exits_zero() {
    let (_dir, path) = write_source("1 + 2");
    Command::cargo_bin("bite")
        .unwrap()
        .arg(&path)
        .assert()
        .success()
        .stdout(contains("3"));
}

#[test]
fn parse_error_exits_65_with_diagnostic_on_stderr() {
    let (_dir, path) = write_source("let = ;");
    Command::cargo_bin("bite")
        .unwrap()
        .arg(&path)
        .assert()
        .code(65)
        .stderr(contains("error"));
}

#[test]
fn runtime_error_exits_70() {
    let (_dir, path) = write_source("1 / 0");
    Command::cargo_bin("bite")
        .unwrap()
        .arg(&path)
        .assert()
        .code(70);
}

#[test]
fn missing_file_exits_70_with_message() {
    Command::cargo_bin("bite")
        .unwrap()
        .arg("/no/such/file.bite")
        .assert()
        .code(70)
        .stderr(contains("cannot read"));
}
