use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::tempdir;

fn demo() -> Command {
    let mut cmd = Command::cargo_bin("seamless-demo").unwrap();
    cmd.env_remove("SEAMLESS");
    cmd
}

#[test]
fn help_lists_restart_flags() {
    demo()
        .arg("--help")
        .assert()
        .success()
        .stdout(
            predicate::str::contains("--pid-file")
                .and(predicate::str::contains("--drain-timeout"))
                .and(predicate::str::contains("--handoff-timeout"))
                .and(predicate::str::contains("--graceful-timeout"))
                .and(predicate::str::contains("--shutdown-request-delay")),
        );
}

#[test]
fn invalid_duration_is_rejected() {
    demo()
        .args(["--drain-timeout", "eventually"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Invalid duration value"));
}

#[test]
fn missing_config_file_fails_before_launching() {
    let dir = tempdir().unwrap();
    let missing = dir.path().join("absent.yaml");

    demo()
        .arg("--config")
        .arg(&missing)
        .assert()
        .failure()
        .stderr(predicate::str::contains("NotFound"));
}

#[test]
fn undefined_variable_in_config_is_reported() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("seamless.yaml");
    std::fs::write(&path, "pid_file: \"${SEAMLESS_DEMO_UNSET_DIR}/r.pid\"\n").unwrap();

    demo()
        .arg("--config")
        .arg(&path)
        .env_remove("SEAMLESS_DEMO_UNSET_DIR")
        .assert()
        .failure()
        .stderr(predicate::str::contains("SEAMLESS_DEMO_UNSET_DIR"));
}
