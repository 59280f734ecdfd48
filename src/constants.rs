//! Constants shared by the launcher, the coordinator and the rendezvous file.
//!
//! This module centralizes timing values, signal sets and naming used across
//! the restart protocol.

use std::time::Duration;

use libc::c_int;

// ============================================================================
// Process Marker
// ============================================================================

/// Environment variable carrying the launcher's PID into the forked daemon.
///
/// A process whose marker equals its parent PID is the daemon body; any other
/// value (or none) makes the process a launcher.
pub const DEFAULT_ENV_MARKER: &str = "SEAMLESS";

// ============================================================================
// Protocol Timing
// ============================================================================

/// Time given to the daemon body to acknowledge USR2 with CHLD before the
/// launcher forcibly sends TERM and exits.
pub const HANDOFF_TIMEOUT: Duration = Duration::from_secs(10);

/// Time an outgoing generation waits for the TERM sent by its replacement
/// before running the shutdown callback anyway.
pub const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

// ============================================================================
// File System Constants
// ============================================================================

/// File mode used when writing the rendezvous PID file.
pub const RENDEZVOUS_FILE_MODE: u32 = 0o644;

// ============================================================================
// Signal Sets
// ============================================================================

/// Signals the launcher subscribes to through `signal-hook` iterators.
///
/// SIGIOT is an alias of SIGABRT on every supported platform and is covered by
/// it.
pub const RELAYED_SIGNALS: &[c_int] = &[
    libc::SIGABRT,
    libc::SIGALRM,
    libc::SIGBUS,
    libc::SIGCHLD,
    libc::SIGCONT,
    libc::SIGHUP,
    libc::SIGINT,
    libc::SIGIO,
    libc::SIGPIPE,
    libc::SIGPROF,
    libc::SIGQUIT,
    libc::SIGSYS,
    libc::SIGTERM,
    libc::SIGTRAP,
    libc::SIGTSTP,
    libc::SIGTTIN,
    libc::SIGTTOU,
    libc::SIGURG,
    libc::SIGUSR1,
    libc::SIGUSR2,
    libc::SIGVTALRM,
    libc::SIGWINCH,
    libc::SIGXCPU,
    libc::SIGXFSZ,
];

/// Synchronous fault signals. `signal-hook` refuses to register them through
/// its safe API, so the relay installs a dedicated handler which only forwards
/// them when another process sent them.
pub const FAULT_SIGNALS: &[c_int] = &[libc::SIGSEGV, libc::SIGILL, libc::SIGFPE];

/// Every signal the launcher relays to its child.
pub fn launcher_signals() -> Vec<c_int> {
    RELAYED_SIGNALS
        .iter()
        .chain(FAULT_SIGNALS.iter())
        .copied()
        .collect()
}
