#![allow(dead_code)]

use std::{
    fs,
    io::{BufRead, BufReader, Write},
    os::unix::net::UnixStream,
    path::{Path, PathBuf},
    process::{Child, Command, ExitStatus, Stdio},
    thread,
    time::{Duration, Instant},
};

use nix::{
    sys::signal::{self, Signal},
    unistd::Pid,
};
use sysinfo::{Pid as SysPid, ProcessStatus, ProcessesToUpdate, System};

/// Paths and flags for one demo daemon deployment.
pub struct Demo {
    pub pid_file: PathBuf,
    pub socket: PathBuf,
}

impl Demo {
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            pid_file: dir.join("r.pid"),
            socket: dir.join("demo.sock"),
        }
    }

    /// Starts the demo the way a supervisor would: no marker in the
    /// environment, so the process becomes a launcher.
    pub fn spawn(&self, extra: &[&str]) -> Child {
        Command::new(env!("CARGO_BIN_EXE_seamless-demo"))
            .arg("--pid-file")
            .arg(&self.pid_file)
            .arg("--socket")
            .arg(&self.socket)
            .arg("--graceful-timeout")
            .arg("1s")
            .args(extra)
            .env_remove("SEAMLESS")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .spawn()
            .expect("failed to spawn seamless-demo")
    }
}

pub fn send(pid: u32, sig: Signal) {
    signal::kill(Pid::from_raw(pid as i32), sig).expect("failed to send signal");
}

/// Waits until the rendezvous file holds a PID accepted by `accept`.
pub fn wait_for_pid_file(path: &Path, accept: impl Fn(u32) -> bool) -> u32 {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        if let Ok(content) = fs::read_to_string(path)
            && let Ok(pid) = content.trim().parse::<u32>()
            && accept(pid)
        {
            return pid;
        }

        if Instant::now() >= deadline {
            panic!("Timed out waiting for PID in {:?}", path);
        }

        thread::sleep(Duration::from_millis(50));
    }
}

/// Waits for a child of the test process to exit.
pub fn wait_for_exit(child: &mut Child, timeout: Duration) -> ExitStatus {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(status) = child.try_wait().expect("try_wait failed") {
            return status;
        }

        if Instant::now() >= deadline {
            let _ = child.kill();
            panic!("Timed out waiting for PID {} to exit", child.id());
        }

        thread::sleep(Duration::from_millis(50));
    }
}

fn process_state(pid: u32) -> Option<(Option<u32>, ProcessStatus)> {
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::All, true);
    system
        .process(SysPid::from_u32(pid))
        .map(|process| (process.parent().map(|p| p.as_u32()), process.status()))
}

/// A process counts as alive while it exists and is not a zombie.
pub fn is_process_alive(pid: u32) -> bool {
    matches!(
        process_state(pid),
        Some((_, status)) if !matches!(status, ProcessStatus::Zombie | ProcessStatus::Dead)
    )
}

pub fn parent_of(pid: u32) -> Option<u32> {
    process_state(pid).and_then(|(parent, _)| parent)
}

/// Waits for a process that is not our child (and may never be reaped by a
/// minimal init) to exit.
pub fn wait_for_process_exit(pid: u32, timeout: Duration) {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if !is_process_alive(pid) {
            return;
        }
        thread::sleep(Duration::from_millis(100));
    }
    panic!("Timed out waiting for PID {} to exit", pid);
}

/// Asks the demo daemon behind `socket` which PID serves it.
pub fn query(socket: &Path) -> Option<u32> {
    let mut stream = UnixStream::connect(socket).ok()?;
    stream.set_read_timeout(Some(Duration::from_secs(5))).ok()?;
    stream.write_all(b"\n").ok()?;

    let mut line = String::new();
    BufReader::new(stream).read_line(&mut line).ok()?;
    line.trim().strip_prefix("Server pid: ")?.parse().ok()
}

/// Retries [`query`] until it answers.
pub fn wait_for_server(socket: &Path) -> u32 {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        if let Some(pid) = query(socket) {
            return pid;
        }
        if Instant::now() >= deadline {
            panic!("Timed out waiting for server on {:?}", socket);
        }
        thread::sleep(Duration::from_millis(50));
    }
}

/// Kills a stray process left over by a test.
pub fn kill_quietly(pid: u32) {
    let _ = signal::kill(Pid::from_raw(pid as i32), Signal::SIGKILL);
}
