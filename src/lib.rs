//! Seamless restart for daemons supervised by service managers expecting
//! non-forking processes, such as daemontools, runit or systemd.
//!
//! At startup the daemon is duplicated to establish a
//! `supervisor -> launcher -> daemon` relationship. The launcher acts as a
//! circuit breaker: when the supervisor sends TERM, the launcher asks the
//! daemon to prepare (USR2), waits for its acknowledgement (CHLD) and exits,
//! leaving the daemon running, detached and unsupervised. The supervisor then
//! restarts the program; the new generation calls [`Seamless::started`] once
//! it serves traffic, which sends TERM to the previous generation through the
//! rendezvous PID file. The previous generation then runs its
//! [`Seamless::on_shutdown`] callback and exits.
//!
//! Socket migration and the graceful shutdown of the server itself are left
//! to the caller.
//!
//! ```no_run
//! let seamless = seamless::init(seamless::Config::new("/run/app/seamless.pid"));
//! seamless.on_shutdown(|| { /* drain in-flight requests */ });
//! // bind listeners ...
//! seamless.started();
//! // serve until the listener is closed ...
//! seamless.wait();
//! ```

/// CLI interface of the demo daemon.
pub mod cli;

/// Configuration management.
pub mod config;

/// Protocol constants.
pub mod constants;

/// The per-process restart coordinator.
pub mod coordinator;

/// Error handling.
pub mod error;

/// The launcher process.
pub mod launcher;

/// Diagnostic hooks.
pub mod logs;

/// Signal subscription and delivery.
pub mod relay;

/// The rendezvous PID file.
pub mod rendezvous;

#[cfg(test)]
mod test_utils;

pub use config::{Config, load_config};
pub use coordinator::{Builder, Role, Seamless, init};
pub use error::SeamlessError;
pub use logs::{Log, TracingLog};
