//! Error handling for seamless.
use std::{io, path::PathBuf};

use thiserror::Error;

/// Errors raised while running the restart protocol.
#[derive(Debug, Error)]
pub enum SeamlessError {
    /// The path of the running executable could not be resolved.
    #[error("Could not determine executable path: {0}")]
    ExecutablePath(#[source] io::Error),

    /// The daemon body could not be spawned.
    #[error("Could not fork: {0}")]
    Spawn(#[source] io::Error),

    /// A background thread could not be started.
    #[error("Could not start background thread: {0}")]
    Thread(#[source] io::Error),

    /// Signal handlers could not be installed.
    #[error("Could not subscribe to signals: {0}")]
    Subscribe(#[source] io::Error),

    /// A signal could not be delivered to a process.
    #[error("Could not send {signal} to PID {pid}: {source}")]
    Signal {
        /// Name of the signal being sent.
        signal: &'static str,
        /// Target process.
        pid: i32,
        /// The underlying errno.
        #[source]
        source: nix::errno::Errno,
    },

    /// Error for rendezvous file.
    #[error("Rendezvous file error: {0}")]
    Rendezvous(#[from] RendezvousError),

    /// Error for configuration.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

/// Error type for rendezvous PID file operations.
#[derive(Debug, Error)]
pub enum RendezvousError {
    /// Error reading, writing or removing the PID file.
    #[error("Rendezvous file I/O failed for {path:?}: {source}")]
    Io {
        /// Path of the rendezvous file.
        path: PathBuf,
        /// The underlying error that occurred.
        #[source]
        source: io::Error,
    },

    /// The PID file does not contain a decimal PID.
    #[error("Invalid PID file content: {0:?}")]
    InvalidPid(String),
}

/// Error type for configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Error reading or accessing a configuration file.
    #[error("Failed to read config file: {0}")]
    Read(#[from] io::Error),

    /// Error parsing YAML configuration.
    #[error("Invalid YAML format: {0}")]
    Parse(#[from] serde_yaml::Error),

    /// A `${VAR}` reference names an unset variable.
    #[error("Missing environment variable: {0}")]
    MissingVariable(String),

    /// A duration string could not be parsed.
    #[error("Invalid duration value: '{0}'")]
    InvalidDuration(String),
}
