use assert_cmd::Command;
use std::time::Duration;

#[test]
fn runs_a_pipeline_to_completion() {
    Command::cargo_bin("datumchain")
        .unwrap()
        .arg("tests/fixtures/pipeline.json")
        .timeout(Duration::from_secs(30))
        .assert()
        .success();
}

#[test]
fn a_broken_pipeline_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("pipeline.json");
    std::fs::write(&path, "{ this is not json").unwrap();

    Command::cargo_bin("datumchain")
        .unwrap()
        .arg(path)
        .timeout(Duration::from_secs(30))
        .assert()
        .failure();
}

#[test]
fn a_missing_pipeline_is_an_error() {
    Command::cargo_bin("datumchain")
        .unwrap()
        .arg("tests/fixtures/does-not-exist.json")
        .timeout(Duration::from_secs(30))
        .assert()
        .failure();
}
