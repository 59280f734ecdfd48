//! Signal subscription and delivery.
//!
//! Handlers never run protocol logic: every received signal is handed to a
//! background thread which pushes it into a channel owned by a
//! [`Subscription`]. Callers then block on that channel, optionally with a
//! deadline.
use std::{
    collections::{HashMap, hash_map::Entry},
    io::{self, Read, Write},
    mem,
    net::Shutdown,
    os::unix::net::UnixStream,
    ptr,
    sync::{
        Arc, Mutex, OnceLock, PoisonError,
        mpsc::{self, Receiver, RecvTimeoutError, Sender},
    },
    thread,
    time::Duration,
};

use libc::c_int;
use nix::{
    sys::signal::{self, Signal},
    unistd::Pid,
};
use signal_hook::{
    consts::FORBIDDEN,
    iterator::{Handle, Signals},
};
use signal_hook_registry::SigId;
use tracing::debug;

/// OS-level handler `signal-hook` installed for each signal, captured the first
/// time the signal is subscribed. The registry only installs its handler once
/// per signal, so it is put back by hand after a closed subscription restored
/// another disposition.
static HOOK_HANDLERS: OnceLock<Mutex<HashMap<c_int, Disposition>>> = OnceLock::new();

#[derive(Clone, Copy)]
struct Disposition(libc::sigaction);

/// What happens to a signal's disposition once its subscription is closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnClose {
    /// Put back the disposition found when subscribing.
    Restore,
    /// Reset to the default action. The default is also installed before
    /// subscribing, so a handler set outside `signal-hook` is not chained.
    Reset,
}

/// Stream of signals received by this process.
pub struct Subscription {
    rx: Receiver<Signal>,
    handle: Option<Handle>,
    fault_ids: Vec<SigId>,
    fault_reader: Option<UnixStream>,
    restore: Vec<(c_int, Disposition)>,
}

impl Subscription {
    /// Blocks until the next signal. Returns `None` once the subscription is
    /// closed.
    pub fn recv(&self) -> Option<Signal> {
        self.rx.recv().ok()
    }

    /// Blocks until the next signal or until `timeout` elapses.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<Signal, RecvTimeoutError> {
        self.rx.recv_timeout(timeout)
    }

    /// Stops listening and hands every subscribed signal back to the
    /// disposition chosen by [`OnClose`].
    pub fn close(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.close();
        }
        for id in self.fault_ids.drain(..) {
            signal_hook_registry::unregister(id);
        }
        if let Some(reader) = self.fault_reader.take() {
            let _ = reader.shutdown(Shutdown::Both);
        }
        for (sig, Disposition(action)) in self.restore.drain(..).rev() {
            if let Err(err) = install(sig, &action) {
                debug!("Could not restore disposition of signal {sig}: {err}");
            }
        }
    }

    /// Builds a subscription fed by hand instead of by signal handlers.
    #[cfg(test)]
    pub(crate) fn manual() -> (Sender<Signal>, Self) {
        let (tx, rx) = mpsc::channel();
        let subscription = Self {
            rx,
            handle: None,
            fault_ids: Vec::new(),
            fault_reader: None,
            restore: Vec::new(),
        };
        (tx, subscription)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.close();
    }
}

/// Subscribes to `signals`, returning a stream of every delivery. Closing the
/// subscription restores the dispositions found here.
///
/// Signal identity is preserved: the subscription yields exactly the signal
/// numbers the process received.
pub fn subscribe(signals: &[c_int]) -> io::Result<Subscription> {
    subscribe_with(signals, OnClose::Restore)
}

/// Like [`subscribe`], with an explicit disposition for when the
/// subscription closes.
pub fn subscribe_with(signals: &[c_int], on_close: OnClose) -> io::Result<Subscription> {
    let (tx, rx) = mpsc::channel();
    let (faults, regular): (Vec<c_int>, Vec<c_int>) =
        signals.iter().copied().partition(|sig| FORBIDDEN.contains(sig));

    let mut subscription = Subscription {
        rx,
        handle: None,
        fault_ids: Vec::new(),
        fault_reader: None,
        restore: Vec::with_capacity(signals.len()),
    };

    for &sig in signals {
        let previous = match on_close {
            OnClose::Restore => disposition(sig)?,
            OnClose::Reset => {
                let default = default_action();
                install(sig, &default)?;
                default
            }
        };
        subscription.restore.push((sig, Disposition(previous)));
    }

    if !regular.is_empty() {
        let mut iterator = Signals::new(&regular)?;
        subscription.handle = Some(iterator.handle());
        let tx = tx.clone();
        thread::Builder::new()
            .name("seamless-signals".to_string())
            .spawn(move || {
                for raw in iterator.forever() {
                    if !forward_raw(&tx, raw) {
                        break;
                    }
                }
            })?;
    }

    if !faults.is_empty() {
        subscribe_faults(&faults, tx, &mut subscription)?;
    }

    reinstate_hook_handlers(signals)?;
    Ok(subscription)
}

fn reinstate_hook_handlers(signals: &[c_int]) -> io::Result<()> {
    let mut handlers = HOOK_HANDLERS
        .get_or_init(Default::default)
        .lock()
        .unwrap_or_else(PoisonError::into_inner);
    for &sig in signals {
        match handlers.entry(sig) {
            Entry::Occupied(entry) => install(sig, &entry.get().0)?,
            Entry::Vacant(entry) => {
                entry.insert(Disposition(disposition(sig)?));
            }
        }
    }
    Ok(())
}

/// Current OS-level action for `sig`.
pub(crate) fn disposition(sig: c_int) -> io::Result<libc::sigaction> {
    let mut current: libc::sigaction = unsafe { mem::zeroed() };
    // A null new action only queries.
    if unsafe { libc::sigaction(sig, ptr::null(), &mut current) } == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(current)
}

fn install(sig: c_int, action: &libc::sigaction) -> io::Result<()> {
    if unsafe { libc::sigaction(sig, action, ptr::null_mut()) } == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn default_action() -> libc::sigaction {
    let mut action: libc::sigaction = unsafe { mem::zeroed() };
    action.sa_sigaction = libc::SIG_DFL;
    unsafe {
        libc::sigemptyset(&mut action.sa_mask);
    }
    action
}

/// Installs handlers for SEGV, ILL and FPE.
///
/// Only signals sent by another process (`si_code <= 0`) are relayed. A
/// kernel-raised fault restores the default disposition so that returning from
/// the handler re-executes the faulting instruction and the process dies as
/// usual.
fn subscribe_faults(
    faults: &[c_int],
    tx: Sender<Signal>,
    subscription: &mut Subscription,
) -> io::Result<()> {
    let (mut reader, writer) = UnixStream::pair()?;
    writer.set_nonblocking(true)?;
    let writer = Arc::new(writer);

    for &sig in faults {
        let writer = Arc::clone(&writer);
        let handler = move |info: &libc::siginfo_t| {
            if info.si_code > 0 {
                unsafe {
                    libc::signal(sig, libc::SIG_DFL);
                }
                return;
            }
            // Signal numbers fit in a byte on every supported platform.
            let _ = (&*writer).write(&[sig as u8]);
        };
        let id = unsafe { signal_hook_registry::register_unchecked(sig, handler) }?;
        subscription.fault_ids.push(id);
    }

    subscription.fault_reader = Some(reader.try_clone()?);
    thread::Builder::new()
        .name("seamless-fault-signals".to_string())
        .spawn(move || {
            let mut buf = [0u8; 16];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        if !buf[..n].iter().all(|&raw| forward_raw(&tx, c_int::from(raw))) {
                            break;
                        }
                    }
                    Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                    Err(_) => break,
                }
            }
        })?;

    Ok(())
}

/// Pushes a raw signal number into the channel. Returns `false` once the
/// receiving side is gone.
fn forward_raw(tx: &Sender<Signal>, raw: c_int) -> bool {
    match Signal::try_from(raw) {
        Ok(sig) => tx.send(sig).is_ok(),
        Err(_) => {
            debug!("Ignoring unknown signal number {raw}");
            true
        }
    }
}

/// A process that can receive signals.
pub trait Signaler {
    /// PID of the target, used for diagnostics.
    fn pid(&self) -> i32;

    /// Delivers `signal` to the target.
    fn send(&self, signal: Signal) -> nix::Result<()>;
}

/// An OS process addressed by PID.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Process(pub Pid);

impl Process {
    /// Wraps a raw PID.
    pub fn from_raw(pid: i32) -> Self {
        Self(Pid::from_raw(pid))
    }
}

impl Signaler for Process {
    fn pid(&self) -> i32 {
        self.0.as_raw()
    }

    fn send(&self, sig: Signal) -> nix::Result<()> {
        signal::kill(self.0, sig)
    }
}
