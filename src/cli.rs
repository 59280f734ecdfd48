//! Command-line interface of the demo daemon.
use std::{path::PathBuf, str::FromStr, time::Duration};

use clap::Parser;
use tracing::level_filters::LevelFilter;

use crate::{
    config::{Config, load_config, parse_duration},
    error::ConfigError,
};

/// Rendezvous file used when neither a flag nor a config file names one.
pub const DEFAULT_PID_FILE: &str = "/tmp/seamless-demo.pid";

/// Wrapper around `LevelFilter` so clap can parse log levels from either
/// string names ("info", "debug", etc.) or numeric shorthands (0-5).
#[derive(Clone, Copy, Debug)]
pub struct LogLevelArg(LevelFilter);

impl LogLevelArg {
    /// String representation suitable for `RUST_LOG`.
    pub fn as_str(&self) -> &'static str {
        match self.0 {
            LevelFilter::OFF => "off",
            LevelFilter::ERROR => "error",
            LevelFilter::WARN => "warn",
            LevelFilter::INFO => "info",
            LevelFilter::DEBUG => "debug",
            LevelFilter::TRACE => "trace",
        }
    }
}

impl FromStr for LogLevelArg {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Err("log level cannot be empty".into());
        }

        if let Ok(number) = trimmed.parse::<u8>() {
            let level = match number {
                0 => LevelFilter::OFF,
                1 => LevelFilter::ERROR,
                2 => LevelFilter::WARN,
                3 => LevelFilter::INFO,
                4 => LevelFilter::DEBUG,
                5 => LevelFilter::TRACE,
                _ => {
                    return Err(format!(
                        "unsupported log level number '{number}' (expected 0-5)"
                    ));
                }
            };

            return Ok(LogLevelArg(level));
        }

        let lowercase = trimmed.to_ascii_lowercase();
        let level = match lowercase.as_str() {
            "off" => Some(LevelFilter::OFF),
            "error" | "err" => Some(LevelFilter::ERROR),
            "warn" | "warning" => Some(LevelFilter::WARN),
            "info" | "information" => Some(LevelFilter::INFO),
            "debug" => Some(LevelFilter::DEBUG),
            "trace" => Some(LevelFilter::TRACE),
            _ => None,
        }
        .ok_or_else(|| format!("invalid log level '{trimmed}'"))?;

        Ok(LogLevelArg(level))
    }
}

fn duration_arg(raw: &str) -> Result<Duration, String> {
    parse_duration(raw).map_err(|err| err.to_string())
}

/// Demo daemon serving its PID over a unix socket, restartable without
/// downtime.
#[derive(Parser, Debug)]
#[command(name = "seamless-demo", version)]
#[command(about = "Unix socket daemon restarted seamlessly under a supervisor", long_about = None)]
pub struct Cli {
    /// Override the logging verbosity.
    #[arg(long, value_name = "LEVEL")]
    pub log_level: Option<LogLevelArg>,

    /// YAML file holding the seamless settings.
    #[arg(short, long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Seamless restart PID file. An empty value disables seamless restart.
    #[arg(long, value_name = "PATH")]
    pub pid_file: Option<String>,

    /// Unix socket to listen on.
    #[arg(long, value_name = "PATH", default_value = "/tmp/seamless-demo.sock")]
    pub socket: PathBuf,

    /// Maximum time to wait for in-flight connections during shutdown.
    #[arg(long, value_name = "DURATION", default_value = "60s", value_parser = duration_arg)]
    pub graceful_timeout: Duration,

    /// Time to wait for the next generation before shutting down anyway.
    #[arg(long, value_name = "DURATION", value_parser = duration_arg)]
    pub drain_timeout: Option<Duration>,

    /// Time the launcher waits for the daemon to acknowledge a restart.
    #[arg(long, value_name = "DURATION", value_parser = duration_arg)]
    pub handoff_timeout: Option<Duration>,

    /// Delay the daemon takes before acknowledging a restart request.
    #[arg(long, value_name = "DURATION", value_parser = duration_arg)]
    pub shutdown_request_delay: Option<Duration>,
}

impl Cli {
    /// Builds the seamless configuration, flags taking precedence over the
    /// config file.
    pub fn seamless_config(&self) -> Result<Config, ConfigError> {
        let mut config = match &self.config {
            Some(path) => load_config(path)?,
            None => Config::new(DEFAULT_PID_FILE),
        };

        if let Some(pid_file) = &self.pid_file {
            config.pid_file = Some(PathBuf::from(pid_file));
        }
        if let Some(timeout) = self.drain_timeout {
            config = config.with_drain_timeout(timeout);
        }
        if let Some(timeout) = self.handoff_timeout {
            config = config.with_handoff_timeout(timeout);
        }

        Ok(config)
    }
}

/// Parses command-line arguments and returns a `Cli` struct.
pub fn parse_args() -> Cli {
    Cli::parse()
}
