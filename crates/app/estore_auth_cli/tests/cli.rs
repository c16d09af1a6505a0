use assert_cmd::Command;
use predicates::prelude::*;

fn estore_auth() -> Command {
    Command::cargo_bin("estore-auth").unwrap()
}

#[test]
fn version_prints_package_versions() {
    estore_auth()
        .arg("version")
        .assert()
        .success()
        .stdout(predicate::str::contains(env!("CARGO_PKG_VERSION")))
        .stdout(predicate::str::contains("estore_auth"));
}

#[test]
fn help_lists_commands() {
    estore_auth()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("migrate"))
        .stdout(predicate::str::contains("sweep"))
        .stdout(predicate::str::contains("gen-secret"));
}

#[test]
fn gen_secret_prints_alphanumeric_secret() {
    let output = estore_auth()
        .args(["gen-secret", "--length", "48"])
        .output()
        .unwrap();
    assert!(output.status.success());

    let secret = String::from_utf8(output.stdout).unwrap();
    let secret = secret.trim();
    assert_eq!(secret.len(), 48);
    assert!(secret.chars().all(|c| c.is_ascii_alphanumeric()));
}

#[test]
fn gen_secret_rejects_short_length() {
    estore_auth()
        .args(["gen-secret", "--length", "8"])
        .assert()
        .failure();
}

#[test]
fn gen_secret_persist_writes_secret_file() {
    let dir = tempfile::tempdir().unwrap();
    let output = estore_auth()
        .env("ESTORE_DATA_DIR", dir.path())
        .args(["gen-secret", "--persist"])
        .output()
        .unwrap();
    assert!(output.status.success());

    let printed = String::from_utf8(output.stdout).unwrap();
    let stored = std::fs::read_to_string(dir.path().join("jwt-secret")).unwrap();
    assert_eq!(printed.trim(), stored);
}

#[test]
fn unknown_command_fails() {
    estore_auth().arg("frobnicate").assert().failure();
}
