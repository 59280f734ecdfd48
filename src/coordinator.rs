//! The per-process restart coordinator.
//!
//! Every daemon generation runs through three stages:
//!
//! 1. wait for USR2 from the launcher, run the shutdown-request callback and
//!    answer with CHLD so the launcher detaches;
//! 2. (in the *next* generation) [`Seamless::started`] reads the rendezvous
//!    file and sends TERM to the generation it names;
//! 3. wait for that TERM, bounded by the drain deadline, run the shutdown
//!    callback and release [`Seamless::wait`].
use std::{
    env,
    process,
    sync::{
        Arc, Condvar, Mutex, PoisonError,
        atomic::{AtomicBool, Ordering},
        mpsc::RecvTimeoutError,
    },
    thread,
    time::Duration,
};

use nix::{errno::Errno, sys::signal::Signal, unistd};

use crate::{
    config::Config,
    error::{RendezvousError, SeamlessError},
    launcher::{self, LaunchHook},
    logs::{Log, TracingLog},
    relay::{self, OnClose, Process, Signaler, Subscription},
    rendezvous::Rendezvous,
};

static INITIALIZED: AtomicBool = AtomicBool::new(false);

type Callback = Box<dyn FnOnce() + Send>;

/// What the current process does in the restart protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// No rendezvous path configured; every operation is a no-op.
    Disabled,
    /// The forked daemon body of a generation.
    Daemon,
}

struct Shared {
    rendezvous: Option<Rendezvous>,
    drain_timeout: Duration,
    log: Arc<dyn Log>,
    shutdown_request: Mutex<Option<Callback>>,
    shutdown: Mutex<Option<Callback>>,
    done: Mutex<bool>,
    done_cv: Condvar,
}

/// Handle on the process-wide restart coordinator, returned by [`init`].
///
/// Cloning is cheap; every clone refers to the same coordinator.
#[derive(Clone)]
pub struct Seamless {
    shared: Arc<Shared>,
}

/// Collects everything [`Builder::init`] needs.
pub struct Builder {
    config: Config,
    hooks: Vec<LaunchHook>,
    log: Arc<dyn Log>,
}

impl Builder {
    /// Starts from `config` with the default `tracing` diagnostics.
    pub fn new(config: Config) -> Self {
        Self {
            config,
            hooks: Vec::new(),
            log: Arc::new(TracingLog),
        }
    }

    /// Registers a callback run in the launcher right after the daemon body
    /// was forked, with the body's PID.
    pub fn on_child_launch<F>(mut self, hook: F) -> Self
    where
        F: FnOnce(u32) + Send + 'static,
    {
        self.hooks.push(Box::new(hook));
        self
    }

    /// Redirects protocol diagnostics.
    pub fn logger(mut self, log: Arc<dyn Log>) -> Self {
        self.log = log;
        self
    }

    /// Initializes seamless for this process.
    ///
    /// Must be called once, as early as possible and before other threads are
    /// started. When the process was started directly (not by a launcher) it
    /// becomes the launcher and this call never returns. Otherwise the stage 1
    /// listener is installed and control returns to the caller.
    ///
    /// # Panics
    ///
    /// Panics when called a second time in the same process.
    pub fn init(self) -> Seamless {
        if INITIALIZED.swap(true, Ordering::SeqCst) {
            panic!("seamless::init already called");
        }

        let launcher = launcher_pid(&self.config.env_marker);
        self.start(launcher)
    }

    /// Picks the role of this process given the PID of the launcher that
    /// forked it, if any.
    fn start(self, launcher: Option<i32>) -> Seamless {
        let Some(path) = self.config.rendezvous_path() else {
            return Seamless::disabled(self.log);
        };

        let Some(launcher_pid) = launcher else {
            launcher::launch(&self.config, self.hooks, self.log);
        };

        let seamless = Seamless::daemon(Rendezvous::new(path), self.config.drain_timeout, self.log);
        seamless.spawn_stages(Process::from_raw(launcher_pid));
        seamless
    }
}

/// Initializes seamless with the default logger. See [`Builder::init`].
pub fn init(config: Config) -> Seamless {
    Builder::new(config).init()
}

/// PID of the launcher, if this process is the daemon body it forked.
fn launcher_pid(marker: &str) -> Option<i32> {
    let parent = unistd::getppid().as_raw();
    env::var(marker)
        .ok()
        .and_then(|value| value.trim().parse::<i32>().ok())
        .filter(|pid| *pid == parent)
}

impl Seamless {
    fn new(rendezvous: Option<Rendezvous>, drain_timeout: Duration, log: Arc<dyn Log>) -> Self {
        Self {
            shared: Arc::new(Shared {
                rendezvous,
                drain_timeout,
                log,
                shutdown_request: Mutex::new(None),
                shutdown: Mutex::new(None),
                done: Mutex::new(false),
                done_cv: Condvar::new(),
            }),
        }
    }

    fn disabled(log: Arc<dyn Log>) -> Self {
        Self::new(None, Duration::ZERO, log)
    }

    pub(crate) fn daemon(rendezvous: Rendezvous, drain_timeout: Duration, log: Arc<dyn Log>) -> Self {
        Self::new(Some(rendezvous), drain_timeout, log)
    }

    /// Role of this process.
    pub fn role(&self) -> Role {
        if self.is_disabled() {
            Role::Disabled
        } else {
            Role::Daemon
        }
    }

    /// Whether seamless restart is turned off for this process.
    pub fn is_disabled(&self) -> bool {
        self.shared.rendezvous.is_none()
    }

    /// Sets `f` to be called when a graceful shutdown is requested, before the
    /// launcher is told it may detach.
    ///
    /// Use it to release resources the next generation needs to start, such
    /// as an exclusively bound socket. The daemon is still expected to serve
    /// requests at this point. Register before traffic starts; the last
    /// registration wins.
    pub fn on_shutdown_request<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if !self.is_disabled() {
            *lock(&self.shared.shutdown_request) = Some(Box::new(f));
        }
    }

    /// Sets `f` to be called when the graceful shutdown is engaged. Once `f`
    /// returns the shutdown is done and [`Seamless::wait`] unblocks.
    pub fn on_shutdown<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if !self.is_disabled() {
            *lock(&self.shared.shutdown) = Some(Box::new(f));
        }
    }

    /// Announces that this generation is ready to serve.
    ///
    /// Call it once, after a successful listen. If the rendezvous file names a
    /// previous generation, the file is removed and that process is sent TERM.
    /// This process's PID is then written to the file in every case, so
    /// failures to notify never affect later generations.
    pub fn started(&self) {
        let Some(rendezvous) = &self.shared.rendezvous else {
            return;
        };
        let own_pid = process::id() as i32;

        self.notify_previous(rendezvous, own_pid);

        if let Err(err) = rendezvous.write(own_pid) {
            self.shared.log.error("Could not create PID file", Some(&err));
        }
    }

    fn notify_previous(&self, rendezvous: &Rendezvous, own_pid: i32) {
        let log = &self.shared.log;
        let previous = match rendezvous.read() {
            Ok(None) => return,
            Ok(Some(pid)) => Some(pid),
            Err(err @ RendezvousError::InvalidPid(_)) => {
                log.error("Notification error", Some(&err));
                None
            }
            Err(err) => {
                log.error("Notification error", Some(&err));
                return;
            }
        };

        log.message("Notifying old process");
        if let Err(err) = rendezvous.delete() {
            log.error("Could not remove old PID file", Some(&err));
        }

        let Some(pid) = previous else {
            return;
        };
        if pid == own_pid {
            log.message("PID file already names this process, nothing to notify");
            return;
        }

        let old = Process::from_raw(pid);
        match old.send(Signal::SIGTERM) {
            Ok(()) => {}
            Err(Errno::ESRCH) => log.error(
                "Could not find old process",
                Some(&signal_error(Signal::SIGTERM, pid, Errno::ESRCH)),
            ),
            Err(errno) => log.error(
                "Could not send SIGTERM to old process",
                Some(&signal_error(Signal::SIGTERM, pid, errno)),
            ),
        }
    }

    /// Blocks until the graceful shutdown completed, i.e. until the
    /// [`Seamless::on_shutdown`] callback returned. Returns immediately when
    /// seamless is disabled, or once the shutdown listener failed to start.
    pub fn wait(&self) {
        if self.is_disabled() {
            return;
        }
        let mut done = lock(&self.shared.done);
        while !*done {
            done = self
                .shared
                .done_cv
                .wait(done)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Whether the graceful shutdown completed.
    pub fn is_done(&self) -> bool {
        *lock(&self.shared.done)
    }

    fn spawn_stages(&self, launcher: Process) {
        // Installed before returning to the caller: USR2 would otherwise kill
        // the daemon with its default action.
        let trigger = match relay::subscribe(&[libc::SIGUSR2]) {
            Ok(trigger) => trigger,
            Err(err) => {
                self.abandon("Could not listen for USR2", SeamlessError::Subscribe(err));
                return;
            }
        };

        let this = self.clone();
        let spawned = thread::Builder::new()
            .name("seamless-stages".to_string())
            .spawn(move || this.run_stages(trigger, launcher));
        if let Err(err) = spawned {
            self.abandon("Could not start shutdown listener", SeamlessError::Thread(err));
        }
    }

    /// The stages cannot run: nothing will ever release [`Seamless::wait`],
    /// so release it now. The shutdown callback is not run.
    fn abandon(&self, msg: &str, err: SeamlessError) {
        self.shared.log.error(msg, Some(&err));
        self.release();
    }

    fn run_stages(&self, trigger: Subscription, launcher: Process) {
        if !self.await_drain_trigger(trigger) {
            return;
        }

        // Listen for the replacement's TERM before letting the launcher go.
        // Any earlier TERM handling is reset and comes back as the default
        // action once the drain is over.
        let term = relay::subscribe_with(&[libc::SIGTERM], OnClose::Reset);
        self.prepare_handoff(&launcher);

        match term {
            Ok(term) => self.drain(term),
            Err(err) => {
                self.shared
                    .log
                    .error("Could not listen for TERM", Some(&SeamlessError::Subscribe(err)));
                self.finish();
            }
        }
    }

    /// Stage 1: blocks until USR2. Returns `false` if the subscription closed
    /// first.
    pub(crate) fn await_drain_trigger(&self, mut trigger: Subscription) -> bool {
        let received = trigger.recv().is_some();
        trigger.close();
        received
    }

    /// Stage 1, once triggered: runs the shutdown-request callback, then tells
    /// the launcher it may exit.
    pub(crate) fn prepare_handoff(&self, parent: &dyn Signaler) {
        let log = &self.shared.log;
        log.message("Shutdown requested");

        let callback = lock(&self.shared.shutdown_request).take();
        if let Some(callback) = callback {
            callback();
        }

        if let Err(errno) = parent.send(Signal::SIGCHLD) {
            // The launcher may be gone already; the supervisor restarts the
            // program regardless.
            let err = signal_error(Signal::SIGCHLD, parent.pid(), errno);
            log.error("Could not send SIGCHLD to parent process", Some(&err));
        }
    }

    /// Stage 3: waits for TERM or the drain deadline, whichever comes first,
    /// then shuts down.
    pub(crate) fn drain(&self, mut term: Subscription) {
        let log = &self.shared.log;
        log.message("Ready, waiting for TERM signal");

        match term.recv_timeout(self.shared.drain_timeout) {
            Ok(_) => {}
            Err(RecvTimeoutError::Timeout) => {
                log.message("No TERM received before drain deadline, shutting down anyway")
            }
            Err(RecvTimeoutError::Disconnected) => {}
        }
        term.close();

        self.finish();
    }

    fn finish(&self) {
        let log = &self.shared.log;
        log.message("Graceful shutdown started");
        let callback = lock(&self.shared.shutdown).take();
        if let Some(callback) = callback {
            callback();
        }
        log.message("Graceful shutdown completed");
        self.release();
    }

    fn release(&self) {
        let mut done = lock(&self.shared.done);
        *done = true;
        self.shared.done_cv.notify_all();
    }
}

fn signal_error(signal: Signal, pid: i32, source: Errno) -> SeamlessError {
    SeamlessError::Signal {
        signal: signal.as_str(),
        pid,
        source,
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
