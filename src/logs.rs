//! Diagnostic hooks used by the restart protocol.
//!
//! Every failure inside seamless is reported through a [`Log`] rather than
//! surfaced to the caller, so daemons can redirect those diagnostics wherever
//! they keep their own logs.
use std::error::Error;

use tracing::{error, info};

/// Sink for protocol diagnostics.
pub trait Log: Send + Sync {
    /// Records a plain progress message.
    fn message(&self, msg: &str);

    /// Records a failure, optionally with the error that caused it.
    fn error(&self, msg: &str, err: Option<&dyn Error>);
}

/// Default sink forwarding to `tracing` under the `seamless` target.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingLog;

impl Log for TracingLog {
    fn message(&self, msg: &str) {
        info!(target: "seamless", "{msg}");
    }

    fn error(&self, msg: &str, err: Option<&dyn Error>) {
        match err {
            Some(err) => error!(target: "seamless", "{msg}: {err}"),
            None => error!(target: "seamless", "{msg}"),
        }
    }
}
