//! The launcher standing between the service supervisor and the daemon body.
//!
//! The launcher re-executes the current program as its only child and relays
//! every signal to it, with two exceptions:
//!
//! * the first TERM is translated into USR2, asking the child to prepare its
//!   replacement, and starts the handoff deadline;
//! * a CHLD received after that TERM makes the launcher exit 0 right away,
//!   leaving the child orphaned and still serving while the supervisor starts
//!   the next generation.
//!
//! If the child does not answer before the deadline it is sent TERM and the
//! launcher exits. If the child exits on its own the launcher exits 0 as well.
use std::{
    env,
    ffi::OsString,
    os::unix::process::CommandExt,
    path::Path,
    process::{self, Child, Command, Stdio},
    sync::{Arc, mpsc::RecvTimeoutError},
    thread,
    time::{Duration, Instant},
};

use nix::sys::signal::Signal;

use crate::{
    config::Config,
    constants::launcher_signals,
    error::SeamlessError,
    logs::Log,
    relay::{self, Process, Signaler, Subscription},
};

/// Callback run in the launcher with the daemon body's PID, right after the
/// fork and before any signal is processed.
pub type LaunchHook = Box<dyn FnOnce(u32) + Send>;

/// Progress of the handoff with the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandoffState {
    /// Blindly forwarding signals to the child.
    Relaying,
    /// TERM was received and USR2 sent; waiting for CHLD.
    Requested,
    /// The child acknowledged; the launcher detaches.
    Completed,
    /// The child did not acknowledge in time.
    TimedOut,
}

/// What the relay loop must do in response to an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Forward the signal to the child unchanged.
    Forward(Signal),
    /// Send USR2 to the child.
    RequestDrain,
    /// Drop the event.
    Ignore,
    /// Exit, leaving the child running.
    Detach,
    /// Send TERM to the child, then exit.
    ForceTerminate,
}

/// How the relay loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchOutcome {
    /// CHLD arrived after the drain request.
    Detached,
    /// The handoff deadline elapsed and the child was sent TERM.
    TimedOut,
    /// The signal subscription went away.
    RelayClosed,
}

/// Launcher state machine, free of any I/O.
#[derive(Debug, Clone)]
pub struct Handoff {
    state: HandoffState,
    timeout: Duration,
    deadline: Option<Instant>,
}

impl Handoff {
    /// Creates a handoff in the relaying state.
    pub fn new(timeout: Duration) -> Self {
        Self {
            state: HandoffState::Relaying,
            timeout,
            deadline: None,
        }
    }

    /// Current state.
    pub fn state(&self) -> HandoffState {
        self.state
    }

    /// Instant at which the pending drain request expires, if one is pending.
    pub fn deadline(&self) -> Option<Instant> {
        match self.state {
            HandoffState::Requested => self.deadline,
            _ => None,
        }
    }

    /// Decides what to do with a signal received at `now`.
    pub fn on_signal(&mut self, sig: Signal, now: Instant) -> Action {
        match (self.state, sig) {
            (HandoffState::Completed | HandoffState::TimedOut, _) => Action::Ignore,
            (HandoffState::Relaying, Signal::SIGTERM) => {
                self.state = HandoffState::Requested;
                self.deadline = Some(now + self.timeout);
                Action::RequestDrain
            }
            (HandoffState::Relaying, Signal::SIGCHLD) => Action::Ignore,
            (HandoffState::Requested, Signal::SIGCHLD) => {
                self.state = HandoffState::Completed;
                Action::Detach
            }
            (HandoffState::Requested, _) if self.expired(now) => self.on_deadline(),
            (HandoffState::Requested, Signal::SIGTERM) => Action::Ignore,
            (_, other) => Action::Forward(other),
        }
    }

    /// Decides what to do once the deadline elapsed.
    pub fn on_deadline(&mut self) -> Action {
        match self.state {
            HandoffState::Requested => {
                self.state = HandoffState::TimedOut;
                Action::ForceTerminate
            }
            _ => Action::Ignore,
        }
    }

    fn expired(&self, now: Instant) -> bool {
        self.deadline.is_some_and(|deadline| now >= deadline)
    }
}

/// Drives `handoff` from the signals of `subscription`, acting on `child`.
///
/// Delivery failures are logged and never stop the loop.
pub fn relay_loop(
    subscription: &Subscription,
    handoff: &mut Handoff,
    child: &dyn Signaler,
    log: &dyn Log,
) -> LaunchOutcome {
    loop {
        let received = match handoff.deadline() {
            Some(deadline) => {
                match subscription.recv_timeout(deadline.saturating_duration_since(Instant::now()))
                {
                    Ok(sig) => Some(sig),
                    Err(RecvTimeoutError::Timeout) => None,
                    Err(RecvTimeoutError::Disconnected) => return LaunchOutcome::RelayClosed,
                }
            }
            None => match subscription.recv() {
                Some(sig) => Some(sig),
                None => return LaunchOutcome::RelayClosed,
            },
        };

        let action = match received {
            Some(sig) => handoff.on_signal(sig, Instant::now()),
            None => handoff.on_deadline(),
        };

        match action {
            Action::Forward(sig) => {
                if let Err(err) = child.send(sig) {
                    log.error(&format!("Error forwarding {} signal", sig.as_str()), Some(&err));
                }
            }
            Action::RequestDrain => {
                log.message("Shutdown requested by supervisor, asking daemon to prepare");
                if let Err(err) = child.send(Signal::SIGUSR2) {
                    log.error("Could not send USR2 signal", Some(&err));
                }
            }
            Action::Detach => {
                log.message("Daemon ready to be replaced, detaching");
                return LaunchOutcome::Detached;
            }
            Action::ForceTerminate => {
                log.error("Child timeout, terminating", None);
                if let Err(err) = child.send(Signal::SIGTERM) {
                    log.error("Error sending TERM signal", Some(&err));
                }
                return LaunchOutcome::TimedOut;
            }
            Action::Ignore => {}
        }
    }
}

/// Turns the calling process into a launcher. Never returns.
///
/// Fatal startup errors are logged and the process exits with status 1; the
/// supervisor is expected to restart it.
pub(crate) fn launch(config: &Config, hooks: Vec<LaunchHook>, log: Arc<dyn Log>) -> ! {
    match run(config, hooks, Arc::clone(&log)) {
        Ok(()) => process::exit(0),
        Err(err) => {
            log.error("Launcher failed", Some(&err));
            process::exit(1);
        }
    }
}

fn run(config: &Config, hooks: Vec<LaunchHook>, log: Arc<dyn Log>) -> Result<(), SeamlessError> {
    let executable = env::current_exe().map_err(SeamlessError::ExecutablePath)?;

    // Subscribe before forking so a TERM racing the spawn is queued rather
    // than killing the launcher with the default action.
    let subscription =
        relay::subscribe(&launcher_signals()).map_err(SeamlessError::Subscribe)?;

    let command = child_command(&executable, env::args_os(), &config.env_marker);
    let mut child = start_child(command, hooks, log.as_ref())?;
    let child_pid = child.id();

    let timeout = config.handoff_timeout;
    let relay_log = Arc::clone(&log);
    thread::Builder::new()
        .name("seamless-launcher".to_string())
        .spawn(move || {
            let target = Process::from_raw(child_pid as i32);
            let mut handoff = Handoff::new(timeout);
            match relay_loop(&subscription, &mut handoff, &target, relay_log.as_ref()) {
                LaunchOutcome::Detached | LaunchOutcome::TimedOut => process::exit(0),
                LaunchOutcome::RelayClosed => {
                    relay_log.error("Signal relay stopped unexpectedly", None);
                }
            }
        })
        .map_err(SeamlessError::Thread)?;

    match child.wait() {
        Ok(status) => log.message(&format!("Daemon process {child_pid} exited: {status}")),
        Err(err) => log.error("Could not wait for daemon process", Some(&err)),
    }
    Ok(())
}

/// Command re-executing `executable` with the current argument vector, marked
/// as forked by this process.
fn child_command(
    executable: &Path,
    mut args: impl Iterator<Item = OsString>,
    marker: &str,
) -> Command {
    let mut command = Command::new(executable);
    if let Some(arg0) = args.next() {
        command.arg0(arg0);
    }
    command
        .args(args)
        .env(marker, process::id().to_string())
        .stdin(Stdio::inherit())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit());
    command
}

/// Spawns the daemon body and runs every post-fork hook with its PID.
fn start_child(
    mut command: Command,
    hooks: Vec<LaunchHook>,
    log: &dyn Log,
) -> Result<Child, SeamlessError> {
    log.message("Starting child process");
    let child = command.spawn().map_err(SeamlessError::Spawn)?;
    let child_pid = child.id();

    for hook in hooks {
        hook(child_pid);
    }
    Ok(child)
}
