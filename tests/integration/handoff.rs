mod common;

use std::time::{Duration, Instant};

use common::{
    Demo, is_process_alive, kill_quietly, parent_of, query, send, wait_for_exit,
    wait_for_pid_file, wait_for_process_exit, wait_for_server,
};
use nix::sys::signal::Signal;
use tempfile::tempdir;

const EXIT_TIMEOUT: Duration = Duration::from_secs(15);

#[test]
fn new_generation_replaces_previous_one() {
    let dir = tempdir().unwrap();
    let demo = Demo::in_dir(dir.path());

    let mut launcher_a = demo.spawn(&["--drain-timeout", "10s"]);
    let launcher_a_pid = launcher_a.id();
    let body_a = wait_for_pid_file(&demo.pid_file, |pid| pid != launcher_a_pid);
    assert_eq!(parent_of(body_a), Some(launcher_a_pid));
    assert_eq!(wait_for_server(&demo.socket), body_a);

    // The supervisor stops generation A: only its launcher exits.
    send(launcher_a_pid, Signal::SIGTERM);
    let status = wait_for_exit(&mut launcher_a, EXIT_TIMEOUT);
    assert!(status.success(), "launcher A exited with {status:?}");
    assert!(is_process_alive(body_a), "body A must survive its launcher");
    assert_eq!(query(&demo.socket), Some(body_a));

    // The supervisor starts generation B, which retires A once it serves.
    let mut launcher_b = demo.spawn(&["--drain-timeout", "10s"]);
    let launcher_b_pid = launcher_b.id();
    let body_b = wait_for_pid_file(&demo.pid_file, |pid| {
        pid != body_a && pid != launcher_b_pid
    });
    assert_eq!(parent_of(body_b), Some(launcher_b_pid));

    wait_for_process_exit(body_a, EXIT_TIMEOUT);
    assert_eq!(wait_for_server(&demo.socket), body_b);

    send(launcher_b_pid, Signal::SIGKILL);
    let _ = wait_for_exit(&mut launcher_b, EXIT_TIMEOUT);
    kill_quietly(body_b);
}

#[test]
fn detached_body_exits_after_drain_deadline() {
    let dir = tempdir().unwrap();
    let demo = Demo::in_dir(dir.path());

    let mut launcher = demo.spawn(&["--drain-timeout", "1s"]);
    let launcher_pid = launcher.id();
    let body = wait_for_pid_file(&demo.pid_file, |pid| pid != launcher_pid);
    wait_for_server(&demo.socket);

    send(launcher_pid, Signal::SIGTERM);
    assert!(wait_for_exit(&mut launcher, EXIT_TIMEOUT).success());

    // No replacement ever sends TERM.
    wait_for_process_exit(body, EXIT_TIMEOUT);
}

#[test]
fn launcher_terminates_body_that_misses_handoff_deadline() {
    let dir = tempdir().unwrap();
    let demo = Demo::in_dir(dir.path());

    let mut launcher = demo.spawn(&[
        "--handoff-timeout",
        "500ms",
        "--shutdown-request-delay",
        "4s",
        "--drain-timeout",
        "60s",
    ]);
    let launcher_pid = launcher.id();
    let body = wait_for_pid_file(&demo.pid_file, |pid| pid != launcher_pid);
    wait_for_server(&demo.socket);

    let stopped = Instant::now();
    send(launcher_pid, Signal::SIGTERM);
    let status = wait_for_exit(&mut launcher, EXIT_TIMEOUT);
    assert!(status.success(), "launcher exited with {status:?}");
    assert!(
        stopped.elapsed() < Duration::from_secs(3),
        "launcher must give up at its deadline, not wait for the acknowledgement"
    );

    // The TERM sent at the deadline ends the body long before its drain
    // deadline would.
    wait_for_process_exit(body, EXIT_TIMEOUT);
    assert!(stopped.elapsed() < Duration::from_secs(30));
}

#[test]
fn launcher_forwards_other_signals_to_body() {
    let dir = tempdir().unwrap();
    let demo = Demo::in_dir(dir.path());

    let mut launcher = demo.spawn(&[]);
    let launcher_pid = launcher.id();
    let body = wait_for_pid_file(&demo.pid_file, |pid| pid != launcher_pid);
    wait_for_server(&demo.socket);

    // HUP terminates the body, whose exit ends the launcher.
    send(launcher_pid, Signal::SIGHUP);
    let status = wait_for_exit(&mut launcher, EXIT_TIMEOUT);
    assert!(status.success(), "launcher exited with {status:?}");
    wait_for_process_exit(body, EXIT_TIMEOUT);
}

#[test]
fn empty_pid_file_disables_restart() {
    let dir = tempdir().unwrap();
    let demo = Demo {
        pid_file: "".into(),
        socket: dir.path().join("demo.sock"),
    };

    let mut daemon = demo.spawn(&[]);
    let pid = daemon.id();

    // No launcher: the started process serves by itself.
    assert_eq!(wait_for_server(&demo.socket), pid);

    // Default TERM disposition is left untouched.
    send(pid, Signal::SIGTERM);
    let status = wait_for_exit(&mut daemon, EXIT_TIMEOUT);
    assert!(!status.success());
}
